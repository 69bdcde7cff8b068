//! Deep payload scanner.
//!
//! Payment providers deliver the same logical event in dozens of payload
//! shapes; nothing beyond "valid JSON" can be assumed about key names or
//! nesting. The scanner locates customer identity and offer information
//! anywhere in such a payload with a depth-bounded, depth-first walk.
//!
//! Lookup order is observable behavior and must stay fixed: at each object
//! node the prioritized known field names are tried first (case-insensitive
//! exact match), then the node's entries are visited in declaration order,
//! applying a value-shape heuristic to strings and recursing into nested
//! containers. The first hit wins. When a payload carries several
//! email-shaped strings this picks one deterministically; downstream code
//! tolerates occasional misattribution.

use std::collections::HashSet;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

static EMAIL_RE: Lazy<Regex> = Lazy::new(|| {
    #[allow(clippy::unwrap_used)] // pattern is a compile-time constant
    Regex::new(r"(?i)^[a-z0-9._%+\-]+@[a-z0-9.\-]+\.[a-z]{2,}$").unwrap()
});

static OFFER_PARAM_RE: Lazy<Regex> = Lazy::new(|| {
    #[allow(clippy::unwrap_used)] // pattern is a compile-time constant
    Regex::new(r"(?:^|[?&/])off=([A-Za-z0-9_\-]+)").unwrap()
});

/// Field names checked, in priority order, for each search target.
const EMAIL_FIELDS: &[&str] = &[
    "email",
    "buyer_email",
    "customer_email",
    "user_email",
    "contact_email",
    "subscriber_email",
];

const PHONE_FIELDS: &[&str] = &[
    "phone",
    "phone_number",
    "mobile",
    "cellphone",
    "whatsapp",
    "telefone",
    "checkout_phone",
];

const NAME_FIELDS: &[&str] = &[
    "name",
    "buyer_name",
    "customer_name",
    "full_name",
    "client_name",
    "nome",
];

const OFFER_FIELDS: &[&str] = &["off", "offer", "offer_id", "offer_code", "price_id", "plan_id"];

const EVENT_FIELDS: &[&str] = &["event", "event_type", "type", "evento"];

const TRANSACTION_FIELDS: &[&str] = &[
    "transaction",
    "transaction_id",
    "transaction_code",
    "purchase_transaction",
    "txn_id",
];

/// Recursive key/value search over untyped webhook payloads.
#[derive(Debug, Clone)]
pub struct PayloadScanner {
    depth_limit: usize,
}

impl PayloadScanner {
    pub fn new(depth_limit: usize) -> Self {
        Self { depth_limit }
    }

    /// Find the customer email anywhere in the payload.
    ///
    /// Results are trimmed and lowercased; identity comparisons elsewhere
    /// in the engine are case-insensitive.
    pub fn find_email(&self, payload: &Value) -> Option<String> {
        self.scan(payload, 0, EMAIL_FIELDS, &extract_email, true)
    }

    /// Find a phone-like string (eight or more digits) in the payload.
    pub fn find_phone(&self, payload: &Value) -> Option<String> {
        self.scan(payload, 0, PHONE_FIELDS, &extract_phone, true)
    }

    /// Find the customer name. Named fields only; there is no usable
    /// shape heuristic for a person's name.
    pub fn find_customer_name(&self, payload: &Value) -> Option<String> {
        self.scan(payload, 0, NAME_FIELDS, &extract_name, false)
    }

    /// Find a known offer identifier, either as a field value or embedded
    /// in an `off=<id>` URL parameter.
    pub fn find_offer_id(&self, payload: &Value, known: &HashSet<String>) -> Option<String> {
        let extract = |s: &str| extract_offer_id(s, known);
        self.scan(payload, 0, OFFER_FIELDS, &extract, true)
    }

    /// Find the raw provider event name.
    pub fn find_event_name(&self, payload: &Value) -> Option<String> {
        self.scan(payload, 0, EVENT_FIELDS, &extract_non_empty, false)
    }

    /// Find a transaction identifier for idempotency keying.
    pub fn find_transaction_id(&self, payload: &Value) -> Option<String> {
        self.scan(payload, 0, TRANSACTION_FIELDS, &extract_identifier, false)
    }

    /// Find the first non-empty string stored under any of the given
    /// field names, anywhere in the payload. Named fields only.
    pub fn find_named_text(&self, payload: &Value, fields: &[&str]) -> Option<String> {
        self.scan(payload, 0, fields, &extract_non_empty, false)
    }

    /// Depth-first walk. Never errors; absence is `None`.
    fn scan(
        &self,
        value: &Value,
        depth: usize,
        fields: &[&str],
        extract: &dyn Fn(&str) -> Option<String>,
        shape_fallback: bool,
    ) -> Option<String> {
        if depth > self.depth_limit {
            return None;
        }

        match value {
            Value::Object(map) => {
                // Named fields first, in priority order.
                for field in fields {
                    let named = map
                        .iter()
                        .find(|(k, _)| k.eq_ignore_ascii_case(field))
                        .map(|(_, v)| v);
                    if let Some(Value::String(s)) = named {
                        if let Some(hit) = extract(s) {
                            return Some(hit);
                        }
                    }
                }

                // Then every entry in declaration order: shape-check
                // strings, recurse into containers.
                for (_key, child) in map {
                    match child {
                        Value::String(s) if shape_fallback => {
                            if let Some(hit) = extract(s) {
                                return Some(hit);
                            }
                        }
                        Value::Object(_) | Value::Array(_) => {
                            if let Some(hit) =
                                self.scan(child, depth + 1, fields, extract, shape_fallback)
                            {
                                return Some(hit);
                            }
                        }
                        _ => {}
                    }
                }
                None
            }
            Value::Array(items) => items
                .iter()
                .find_map(|item| self.scan(item, depth + 1, fields, extract, shape_fallback)),
            Value::String(s) if shape_fallback => extract(s),
            _ => None,
        }
    }
}

fn extract_email(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if EMAIL_RE.is_match(trimmed) {
        Some(trimmed.to_lowercase())
    } else {
        None
    }
}

fn extract_phone(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let mut digits = 0usize;
    for c in trimmed.chars() {
        match c {
            '0'..='9' => digits += 1,
            '+' | '-' | '(' | ')' | '.' | ' ' => {}
            _ => return None,
        }
    }
    if digits >= 8 {
        Some(trimmed.to_string())
    } else {
        None
    }
}

fn extract_name(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.len() > 200 || trimmed.contains('@') {
        return None;
    }
    if trimmed.chars().any(|c| c.is_alphabetic()) {
        Some(trimmed.to_string())
    } else {
        None
    }
}

fn extract_offer_id(raw: &str, known: &HashSet<String>) -> Option<String> {
    let trimmed = raw.trim();
    let direct = trimmed.to_lowercase();
    if known.contains(&direct) {
        return Some(direct);
    }
    // URL-like strings may carry the offer as an `off=` parameter.
    if let Some(captures) = OFFER_PARAM_RE.captures(trimmed) {
        let candidate = captures.get(1)?.as_str().to_lowercase();
        if known.contains(&candidate) {
            return Some(candidate);
        }
    }
    None
}

fn extract_non_empty(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn extract_identifier(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.len() >= 4 && trimmed.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
        Some(trimmed.to_string())
    } else {
        None
    }
}
