//! Legacy transaction-result responses and their translation.
//!
//! Nodes from early sporks do not implement the modern access service and
//! answer transaction-result requests only through the legacy one. Its
//! response carries a numeric status enum and raw event fields; this module
//! turns it into the modern [`TransactionResult`].

use serde::{Deserialize, Serialize};

use flowindex_core::types::{Event, TransactionResult, TransactionStatus};

/// Event as returned by the legacy service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegacyEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    /// Hex-encoded transaction id; may be empty on very old nodes.
    #[serde(default)]
    pub transaction_id: String,
    pub transaction_index: u32,
    pub event_index: u32,
    /// Raw payload bytes.
    #[serde(default, with = "crate::http::base64_bytes")]
    pub payload: Vec<u8>,
}

/// Transaction result as returned by the legacy service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegacyTransactionResult {
    /// Numeric status enum (0 unknown, 1 pending, 2 finalized, 3 executed, 4 sealed, 5 expired).
    pub status: i32,
    #[serde(default)]
    pub status_code: u32,
    #[serde(default)]
    pub error_message: String,
    #[serde(default)]
    pub events: Vec<LegacyEvent>,
}

impl LegacyTransactionResult {
    /// Translate into the modern shape. Events with no transaction id are
    /// attributed to `transaction_id`.
    pub fn into_modern(self, transaction_id: &str) -> TransactionResult {
        let events = self
            .events
            .into_iter()
            .map(|e| Event {
                event_type: e.event_type,
                transaction_id: if e.transaction_id.is_empty() {
                    transaction_id.to_string()
                } else {
                    e.transaction_id
                },
                transaction_index: e.transaction_index,
                event_index: e.event_index,
                payload: e.payload,
            })
            .collect();
        TransactionResult {
            status: TransactionStatus::from_code(self.status),
            status_code: self.status_code,
            error_message: self.error_message,
            computation_used: 0,
            events,
        }
    }
}

/// A transaction result in whichever protocol shape the node answered with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResultPayload {
    Modern(TransactionResult),
    Legacy(LegacyTransactionResult),
}

impl ResultPayload {
    pub fn is_legacy(&self) -> bool {
        matches!(self, Self::Legacy(_))
    }

    pub fn into_result(self, transaction_id: &str) -> TransactionResult {
        match self {
            Self::Modern(r) => r,
            Self::Legacy(r) => r.into_modern(transaction_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> LegacyTransactionResult {
        LegacyTransactionResult {
            status: 3,
            status_code: 1,
            error_message: "boom".into(),
            events: vec![LegacyEvent {
                event_type: "A.01.Test".into(),
                transaction_id: "0102".into(),
                transaction_index: 3,
                event_index: 4,
                payload: br#"{"type":"Event"}"#.to_vec(),
            }],
        }
    }

    #[test]
    fn translates_status_code_message_and_events() {
        let out = sample().into_modern("aabb");
        assert_eq!(out.status, TransactionStatus::Executed);
        assert_eq!(out.status.to_string(), "EXECUTED");
        assert_eq!(out.status_code, 1);
        assert_eq!(out.error_message, "boom");
        assert_eq!(out.events.len(), 1);
        let ev = &out.events[0];
        assert_eq!(ev.event_type, "A.01.Test");
        assert_eq!(ev.transaction_id, "0102");
        assert_eq!(ev.transaction_index, 3);
        assert_eq!(ev.event_index, 4);
        assert_eq!(ev.payload, br#"{"type":"Event"}"#.to_vec());
    }

    #[test]
    fn legacy_status_enum() {
        let mut r = sample();
        r.status = 4;
        assert_eq!(r.clone().into_modern("x").status, TransactionStatus::Sealed);
        r.status = 0;
        assert_eq!(r.into_modern("x").status, TransactionStatus::Unknown);
    }

    #[test]
    fn event_order_preserved_and_missing_tx_id_filled() {
        let mut r = sample();
        r.events.push(LegacyEvent {
            event_type: "A.01.Test.Second".into(),
            transaction_id: String::new(),
            transaction_index: 3,
            event_index: 5,
            payload: vec![],
        });
        let out = ResultPayload::Legacy(r).into_result("aabb");
        let indexes: Vec<u32> = out.events.iter().map(|e| e.event_index).collect();
        assert_eq!(indexes, vec![4, 5]);
        assert_eq!(out.events[1].transaction_id, "aabb");
    }

    #[test]
    fn decodes_wire_json() {
        let raw = r#"{"status":4,"status_code":0,"events":[{"type":"flow.AccountCreated","transaction_id":"ff","transaction_index":0,"event_index":0,"payload":"e30="}]}"#;
        let r: LegacyTransactionResult = serde_json::from_str(raw).unwrap();
        assert_eq!(r.events[0].payload, b"{}".to_vec());
        assert_eq!(r.error_message, "");
    }
}
