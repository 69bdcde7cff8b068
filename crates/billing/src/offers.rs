//! Offer resolution.
//!
//! Maps a provider-specific offer identifier (or, failing that, a
//! free-text plan name) to an internal plan tier, and classifies test
//! purchases so they never provision a real plan.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::events::CanonicalEvent;
use crate::payload::PayloadScanner;

/// Internal plan tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanTier {
    Free,
    Basic,
    Standard,
    Professional,
}

impl PlanTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanTier::Free => "free",
            PlanTier::Basic => "basic",
            PlanTier::Standard => "standard",
            PlanTier::Professional => "professional",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "free" => Some(PlanTier::Free),
            "basic" => Some(PlanTier::Basic),
            "standard" => Some(PlanTier::Standard),
            "professional" | "pro" => Some(PlanTier::Professional),
            _ => None,
        }
    }

    pub fn is_paid(&self) -> bool {
        !matches!(self, PlanTier::Free)
    }
}

impl std::fmt::Display for PlanTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Outcome of offer resolution for one payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedOffer {
    /// `None` with a cancellation-class event is legal; `None` with an
    /// approval means "ignore, no valid commercial offer".
    pub plan_tier: Option<PlanTier>,
    /// Sandbox/demo purchase; must never provision a paid plan.
    pub is_test_offer: bool,
    /// The offer identifier that resolved, when one did.
    pub offer_id: Option<String>,
}

impl ResolvedOffer {
    fn none() -> Self {
        Self {
            plan_tier: None,
            is_test_offer: false,
            offer_id: None,
        }
    }

    fn test(offer_id: Option<String>) -> Self {
        Self {
            plan_tier: None,
            is_test_offer: true,
            offer_id,
        }
    }
}

/// Known commercial offer identifiers and the tier each one provisions.
#[derive(Debug, Clone)]
pub struct OfferCatalog {
    offers: HashMap<String, PlanTier>,
}

impl Default for OfferCatalog {
    fn default() -> Self {
        let mut offers = HashMap::new();
        // Live offer codes as registered with the payment providers.
        offers.insert("k7jd9s2p".to_string(), PlanTier::Basic);
        offers.insert("b9mfz41q".to_string(), PlanTier::Basic);
        offers.insert("tpfhcllk".to_string(), PlanTier::Standard);
        offers.insert("qn8vw2rd".to_string(), PlanTier::Standard);
        offers.insert("w3xplqa0".to_string(), PlanTier::Professional);
        offers.insert("x0prvt7d".to_string(), PlanTier::Professional);
        Self { offers }
    }
}

impl OfferCatalog {
    pub fn empty() -> Self {
        Self {
            offers: HashMap::new(),
        }
    }

    pub fn with_offer(mut self, offer_id: &str, tier: PlanTier) -> Self {
        self.offers.insert(offer_id.to_lowercase(), tier);
        self
    }

    pub fn tier_for(&self, offer_id: &str) -> Option<PlanTier> {
        self.offers.get(&offer_id.to_lowercase()).copied()
    }

    pub fn known_ids(&self) -> HashSet<String> {
        self.offers.keys().cloned().collect()
    }
}

/// Payload locations checked first, before any recursive search.
const DIRECT_OFFER_POINTERS: &[&str] = &[
    "/off",
    "/offer/off",
    "/offer/code",
    "/purchase/offer/off",
    "/data/purchase/offer/off",
    "/data/offer/code",
];

/// Free-text fields that may carry a plan or offer name.
const OFFER_NAME_FIELDS: &[&str] = &["offer_name", "product_name", "plan_name", "plan", "offer"];

const TEST_MARKERS: &[&str] = &["teste", "test"];

/// Resolves offers from webhook payloads.
#[derive(Debug, Clone)]
pub struct OfferResolver {
    catalog: OfferCatalog,
}

impl OfferResolver {
    pub fn new(catalog: OfferCatalog) -> Self {
        Self { catalog }
    }

    pub fn catalog(&self) -> &OfferCatalog {
        &self.catalog
    }

    /// Resolve the commercial offer carried by a payload.
    ///
    /// Resolution order: well-known direct locations, `off=<id>` URL
    /// parameter extraction, generic deep search, and finally free-text
    /// plan-name keywords. A test marker in the offer/plan name vetoes
    /// any identifier match.
    pub fn resolve(
        &self,
        payload: &Value,
        event: &CanonicalEvent,
        scanner: &PayloadScanner,
    ) -> ResolvedOffer {
        let known = self.catalog.known_ids();

        // Test purchases are rejected before any identifier can win.
        let offer_name = scanner.find_named_text(payload, OFFER_NAME_FIELDS);
        if let Some(name) = &offer_name {
            let lowered = name.to_lowercase();
            if TEST_MARKERS.iter().any(|marker| lowered.contains(marker)) {
                tracing::info!(
                    event = %event,
                    offer_name = %name,
                    "Test offer detected, refusing to provision a plan"
                );
                return ResolvedOffer::test(self.find_offer_identifier(payload, scanner, &known));
            }
        }

        if let Some(offer_id) = self.find_offer_identifier(payload, scanner, &known) {
            let tier = self.catalog.tier_for(&offer_id);
            return ResolvedOffer {
                plan_tier: tier,
                is_test_offer: false,
                offer_id: Some(offer_id),
            };
        }

        // Last resort: keyword heuristics on the free-text name.
        if let Some(name) = &offer_name {
            if let Some(tier) = tier_from_keywords(name) {
                tracing::debug!(
                    event = %event,
                    offer_name = %name,
                    tier = %tier,
                    "Resolved plan tier from offer name keywords"
                );
                return ResolvedOffer {
                    plan_tier: Some(tier),
                    is_test_offer: false,
                    offer_id: None,
                };
            }
        }

        ResolvedOffer::none()
    }

    /// Steps 1-3 of resolution: direct locations, then URL parameter, then
    /// the scanner's generic search.
    fn find_offer_identifier(
        &self,
        payload: &Value,
        scanner: &PayloadScanner,
        known: &HashSet<String>,
    ) -> Option<String> {
        for pointer in DIRECT_OFFER_POINTERS {
            if let Some(Value::String(s)) = payload.pointer(pointer) {
                let candidate = s.trim().to_lowercase();
                if known.contains(&candidate) {
                    return Some(candidate);
                }
            }
        }
        scanner.find_offer_id(payload, known)
    }
}

/// Keyword heuristics for free-text plan names, including regional forms.
fn tier_from_keywords(name: &str) -> Option<PlanTier> {
    let lowered = name.to_lowercase();
    if lowered.contains("professional") || lowered.contains("profissional") || lowered.contains("pro")
    {
        return Some(PlanTier::Professional);
    }
    if lowered.contains("standard") || lowered.contains("padrão") || lowered.contains("padrao") {
        return Some(PlanTier::Standard);
    }
    if lowered.contains("basic") || lowered.contains("básico") || lowered.contains("basico") {
        return Some(PlanTier::Basic);
    }
    None
}
