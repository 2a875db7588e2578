//! Subscription pattern grammar and record matching.
//!
//! ```text
//! block
//! transaction[/<addr-or-*>[/<addr-or-*>]]
//! event[/<addr-or-*>[/<topic-or-*>[/<topic-or-*>[/<topic-or-*>[/<topic-or-*>]]]]]
//! ```
//!
//! An address is `0x` followed by 40 hex digits, a log topic `0x` followed by
//! 64 hex digits. A `*` segment and an omitted segment both match anything.
//! Literal filters compare case-insensitively.

use serde::{Deserialize, Serialize};

use crate::error::SubscriptionError;
use crate::models::{Block, Event, Topic, Transaction};

/// Hex digits in an address literal.
pub const ADDRESS_HEX_LEN: usize = 40;

/// Hex digits in a log topic literal.
pub const LOG_TOPIC_HEX_LEN: usize = 64;

/// Positional log topic filters an event pattern may carry.
pub const MAX_EVENT_TOPICS: usize = 4;

const WILDCARD: &str = "*";

// =============================================================================
// Request
// =============================================================================

/// Raw subscription request as sent by a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionRequest {
    /// Subscription pattern, also the subscriber's identity within a topic.
    pub name: String,
    /// Declared topic class.
    #[serde(rename = "type")]
    pub class: String,
}

impl SubscriptionRequest {
    pub fn new(name: impl Into<String>, class: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            class: class.into(),
        }
    }

    /// Topic class selected by the `type` field, if any.
    pub fn topic(&self) -> Option<Topic> {
        Topic::from_class(&self.class)
    }

    /// Validate the request and decompose its pattern into filters.
    pub fn parse(&self) -> Result<Subscription, SubscriptionError> {
        let declared = self
            .topic()
            .ok_or_else(|| SubscriptionError::UnknownTopic(self.class.clone()))?;

        let (topic, filter) = parse_pattern(&self.name)?;
        if topic != declared {
            return Err(SubscriptionError::TopicMismatch {
                pattern: topic.to_string(),
                declared: self.class.clone(),
            });
        }

        Ok(Subscription {
            name: self.name.clone(),
            topic,
            filter,
        })
    }

    pub fn is_valid(&self) -> bool {
        self.parse().is_ok()
    }
}

/// A validated subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub name: String,
    pub topic: Topic,
    pub filter: Filter,
}

// =============================================================================
// Filters
// =============================================================================

/// One filter position of a pattern.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum FieldFilter {
    /// `*` or omitted.
    #[default]
    Any,
    /// Literal value, compared case-insensitively.
    Exact(String),
}

impl FieldFilter {
    pub fn matches(&self, candidate: &str) -> bool {
        match self {
            FieldFilter::Any => true,
            FieldFilter::Exact(value) => value.eq_ignore_ascii_case(candidate),
        }
    }

    /// Match against a position the record may not have. A missing
    /// candidate only satisfies a wildcard.
    fn matches_optional(&self, candidate: Option<&str>) -> bool {
        match candidate {
            Some(value) => self.matches(value),
            None => *self == FieldFilter::Any,
        }
    }
}

/// Decomposed pattern of a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    Block,
    Transaction {
        from: FieldFilter,
        to: FieldFilter,
    },
    Event {
        origin: FieldFilter,
        topics: [FieldFilter; MAX_EVENT_TOPICS],
    },
}

impl Filter {
    pub fn matches_block(&self, _block: &Block) -> bool {
        matches!(self, Filter::Block)
    }

    pub fn matches_transaction(&self, tx: &Transaction) -> bool {
        match self {
            Filter::Transaction { from, to } => from.matches(&tx.from) && to.matches(&tx.to),
            _ => false,
        }
    }

    /// The origin filter is checked before the positional topic filters.
    pub fn matches_event(&self, event: &Event) -> bool {
        match self {
            Filter::Event { origin, topics } => {
                origin.matches(&event.origin)
                    && topics.iter().enumerate().all(|(i, filter)| {
                        filter.matches_optional(event.topics.get(i).map(String::as_str))
                    })
            }
            _ => false,
        }
    }
}

// =============================================================================
// Parser
// =============================================================================

/// Parse a subscription pattern into its topic class and filters.
pub fn parse_pattern(pattern: &str) -> Result<(Topic, Filter), SubscriptionError> {
    let invalid = || SubscriptionError::InvalidPattern(pattern.to_string());

    let mut segments = pattern.split('/');
    let head = segments.next().unwrap_or_default();
    let rest: Vec<&str> = segments.collect();

    let topic = Topic::from_name(head).ok_or_else(invalid)?;

    let filter = match topic {
        Topic::Block => {
            if !rest.is_empty() {
                return Err(invalid());
            }
            Filter::Block
        }
        Topic::Transaction => {
            if rest.len() > 2 {
                return Err(invalid());
            }
            Filter::Transaction {
                from: parse_segment(rest.first().copied(), ADDRESS_HEX_LEN).ok_or_else(invalid)?,
                to: parse_segment(rest.get(1).copied(), ADDRESS_HEX_LEN).ok_or_else(invalid)?,
            }
        }
        Topic::Event => {
            if rest.len() > 1 + MAX_EVENT_TOPICS {
                return Err(invalid());
            }
            let origin =
                parse_segment(rest.first().copied(), ADDRESS_HEX_LEN).ok_or_else(invalid)?;
            let mut topics: [FieldFilter; MAX_EVENT_TOPICS] = Default::default();
            for (i, slot) in topics.iter_mut().enumerate() {
                *slot = parse_segment(rest.get(i + 1).copied(), LOG_TOPIC_HEX_LEN)
                    .ok_or_else(invalid)?;
            }
            Filter::Event { origin, topics }
        }
    };

    Ok((topic, filter))
}

/// `None` when the segment is present but malformed (including empty).
fn parse_segment(segment: Option<&str>, hex_len: usize) -> Option<FieldFilter> {
    match segment {
        None | Some(WILDCARD) => Some(FieldFilter::Any),
        Some(value) if is_hex_literal(value, hex_len) => Some(FieldFilter::Exact(value.to_string())),
        Some(_) => None,
    }
}

fn is_hex_literal(value: &str, hex_len: usize) -> bool {
    value
        .strip_prefix("0x")
        .is_some_and(|digits| digits.len() == hex_len && digits.bytes().all(|b| b.is_ascii_hexdigit()))
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(byte: &str) -> String {
        format!("0x{}", byte.repeat(20))
    }

    fn word(byte: &str) -> String {
        format!("0x{}", byte.repeat(32))
    }

    fn event(origin: &str, topics: &[String]) -> Event {
        Event {
            origin: origin.to_string(),
            index: 0,
            topics: topics.to_vec(),
            data: vec![],
            transaction_hash: word("01"),
            block_hash: word("02"),
            block_number: 1,
            timestamp: 0,
        }
    }

    fn transaction(from: &str, to: &str) -> Transaction {
        Transaction {
            hash: word("03"),
            from: from.to_string(),
            to: to.to_string(),
            contract_address: String::new(),
            value: "0".into(),
            data: vec![],
            gas: 21_000,
            gas_price: "1".into(),
            cost: "21000".into(),
            nonce: 0,
            state: 1,
            block_hash: word("02"),
            block_number: 1,
            timestamp: 0,
        }
    }

    #[test]
    fn test_accepts_grammar() {
        let valid = [
            "block".to_string(),
            "transaction".to_string(),
            "transaction/*".to_string(),
            format!("transaction/{}", addr("ab")),
            format!("transaction/*/{}", addr("AB")),
            "event".to_string(),
            "event/*".to_string(),
            format!("event/{}/{}", addr("aa"), word("bb")),
            format!("event/*/*/*/*/{}", word("cc")),
        ];
        for name in valid {
            assert!(parse_pattern(&name).is_ok(), "{name} should be valid");
        }
    }

    #[test]
    fn test_rejects_malformed_patterns() {
        let invalid = [
            "".to_string(),
            "blocks".to_string(),
            "block/*".to_string(),
            "receipt".to_string(),
            "transaction/".to_string(),
            "transaction//*".to_string(),
            "transaction/0x1234".to_string(),
            format!("transaction/{}/*/*", addr("ab")),
            format!("transaction/{}", word("ab")),
            format!("transaction/0x{}", "zz".repeat(20)),
            format!("event/{}", word("aa")),
            format!("event/*/{}", addr("aa")),
            "event/*/*/*/*/*/*".to_string(),
            format!("{}/event", addr("aa")),
        ];
        for name in invalid {
            assert!(
                matches!(parse_pattern(&name), Err(SubscriptionError::InvalidPattern(_))),
                "{name} should be rejected"
            );
        }
    }

    #[test]
    fn test_omitted_segment_equals_wildcard() {
        assert_eq!(parse_pattern("event").unwrap(), parse_pattern("event/*/*/*/*/*").unwrap());
        assert_eq!(
            parse_pattern("transaction").unwrap(),
            parse_pattern("transaction/*/*").unwrap()
        );
    }

    #[test]
    fn test_event_wildcard_matches_everything() {
        let (_, filter) = parse_pattern("event/*").unwrap();
        assert!(filter.matches_event(&event(&addr("11"), &[])));
        assert!(filter.matches_event(&event(&addr("22"), &[word("33"), word("44")])));
    }

    #[test]
    fn test_event_origin_is_case_insensitive() {
        let (_, filter) = parse_pattern(&format!("event/{}/*", addr("AA"))).unwrap();
        assert!(filter.matches_event(&event(&addr("aa"), &[word("01")])));
        assert!(filter.matches_event(&event(&addr("Aa"), &[])));
        assert!(!filter.matches_event(&event(&addr("ab"), &[word("01")])));
    }

    #[test]
    fn test_event_topic_positions() {
        let (_, filter) = parse_pattern(&format!("event/*/*/{}", word("BB"))).unwrap();
        assert!(filter.matches_event(&event(&addr("11"), &[word("aa"), word("bb")])));
        assert!(!filter.matches_event(&event(&addr("11"), &[word("bb"), word("aa")])));
        // A literal filter beyond the record's topics never matches.
        assert!(!filter.matches_event(&event(&addr("11"), &[word("aa")])));
    }

    #[test]
    fn test_transaction_filters() {
        let dead = format!("0x{}", "dead".repeat(10));
        let (_, filter) = parse_pattern(&format!("transaction/{dead}/*")).unwrap();

        let shouting = format!("0x{}", "DEAD".repeat(10));
        assert!(filter.matches_transaction(&transaction(&shouting, &addr("01"))));
        assert!(filter.matches_transaction(&transaction(&dead, "")));
        assert!(!filter.matches_transaction(&transaction(&addr("be"), &dead)));

        let (_, to_only) = parse_pattern(&format!("transaction/*/{dead}")).unwrap();
        assert!(to_only.matches_transaction(&transaction(&addr("be"), &dead)));
        assert!(!to_only.matches_transaction(&transaction(&dead, "")));
    }

    #[test]
    fn test_filter_kind_must_match_record() {
        let (_, filter) = parse_pattern("event").unwrap();
        assert!(!filter.matches_transaction(&transaction(&addr("01"), &addr("02"))));
    }

    #[test]
    fn test_request_type_must_agree_with_pattern() {
        let request = SubscriptionRequest::new("block", "blocks");
        assert_eq!(request.parse().unwrap().topic, Topic::Block);

        assert_eq!(
            SubscriptionRequest::new("event/*", "transaction").parse(),
            Err(SubscriptionError::TopicMismatch {
                pattern: "event".into(),
                declared: "transaction".into(),
            })
        );
        assert_eq!(
            SubscriptionRequest::new("block", "receipt").parse(),
            Err(SubscriptionError::UnknownTopic("receipt".into()))
        );
        assert!(!SubscriptionRequest::new("block/x", "block").is_valid());
    }

    #[test]
    fn test_request_wire_shape() {
        let request: SubscriptionRequest =
            serde_json::from_str(r#"{"name":"event/*","type":"event"}"#).unwrap();
        assert_eq!(request, SubscriptionRequest::new("event/*", "event"));
    }
}
