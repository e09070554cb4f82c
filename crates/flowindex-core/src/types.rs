//! Ledger data model shared by the access client, the fetch workers and
//! the storage backends.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Address used as payer and proposer of protocol-issued system transactions.
pub const SYSTEM_ADDRESS: &str = "0000000000000000";

// ─── Blocks ───────────────────────────────────────────────────────────────────

/// Reference to a collection included in a block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionGuarantee {
    pub collection_id: String,
}

/// Sealed block header with its collection references.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub height: u64,
    /// Hex-encoded block id.
    pub id: String,
    /// Hex-encoded id of the parent block.
    pub parent_id: String,
    pub timestamp: DateTime<Utc>,
    pub collection_guarantees: Vec<CollectionGuarantee>,
}

impl BlockHeader {
    /// Returns `true` if `self` directly extends `parent` (height and id link).
    pub fn extends(&self, parent: &BlockHeader) -> bool {
        self.height == parent.height + 1 && self.parent_id == parent.id
    }
}

/// A collection resolved from a guarantee: an ordered list of transaction ids.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Collection {
    pub id: String,
    pub transaction_ids: Vec<String>,
}

// ─── Transactions ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposalKey {
    pub address: String,
    pub key_index: u32,
    pub sequence_number: u64,
}

/// A transaction body as submitted to the network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: String,
    /// Cadence source text.
    pub script: String,
    /// JSON-Cadence encoded arguments, one per entry.
    pub arguments: Vec<String>,
    pub reference_block_id: String,
    pub gas_limit: u64,
    pub proposal_key: ProposalKey,
    pub payer: String,
    pub authorizers: Vec<String>,
}

impl Transaction {
    /// Returns `true` for protocol-issued system transactions.
    pub fn is_system(&self) -> bool {
        self.payer == SYSTEM_ADDRESS && self.proposal_key.address == SYSTEM_ADDRESS
    }

    /// Payer, proposer and authorizers, deduplicated in first-seen order.
    pub fn participants(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::with_capacity(2 + self.authorizers.len());
        let all = std::iter::once(&self.payer)
            .chain(std::iter::once(&self.proposal_key.address))
            .chain(self.authorizers.iter());
        for addr in all {
            if !addr.is_empty() && !out.contains(addr) {
                out.push(addr.clone());
            }
        }
        out
    }
}

/// Execution status of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionStatus {
    Unknown,
    Pending,
    Finalized,
    Executed,
    Sealed,
    Expired,
}

impl TransactionStatus {
    /// Decode the numeric status enum used on the wire (0 = unknown … 5 = expired).
    pub fn from_code(code: i32) -> Self {
        match code {
            1 => Self::Pending,
            2 => Self::Finalized,
            3 => Self::Executed,
            4 => Self::Sealed,
            5 => Self::Expired,
            _ => Self::Unknown,
        }
    }

    /// Parse the textual status (`"Sealed"`, `"SEALED"`, …). Unrecognised input maps to `Unknown`.
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_uppercase().as_str() {
            "PENDING" => Self::Pending,
            "FINALIZED" => Self::Finalized,
            "EXECUTED" => Self::Executed,
            "SEALED" => Self::Sealed,
            "EXPIRED" => Self::Expired,
            _ => Self::Unknown,
        }
    }
}

impl std::fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unknown => write!(f, "UNKNOWN"),
            Self::Pending => write!(f, "PENDING"),
            Self::Finalized => write!(f, "FINALIZED"),
            Self::Executed => write!(f, "EXECUTED"),
            Self::Sealed => write!(f, "SEALED"),
            Self::Expired => write!(f, "EXPIRED"),
        }
    }
}

/// An event emitted during transaction execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Fully-qualified type, e.g. `A.1654653399040a61.FlowToken.TokensDeposited`.
    pub event_type: String,
    pub transaction_id: String,
    pub transaction_index: u32,
    pub event_index: u32,
    /// Raw JSON-Cadence payload bytes.
    pub payload: Vec<u8>,
}

/// Outcome of executing a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionResult {
    pub status: TransactionStatus,
    pub status_code: u32,
    pub error_message: String,
    pub computation_used: u64,
    pub events: Vec<Event>,
}

impl TransactionResult {
    /// Placeholder used when a node no longer holds the result for an old transaction.
    pub fn empty_sealed() -> Self {
        Self {
            status: TransactionStatus::Sealed,
            status_code: 0,
            error_message: String::new(),
            computation_used: 0,
            events: Vec::new(),
        }
    }

    pub fn is_failed(&self) -> bool {
        !self.error_message.is_empty() || self.status_code != 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub address: String,
    /// Balance in the smallest unit (1e-8 FLOW).
    pub balance: u64,
    /// Names of deployed contracts.
    pub contracts: Vec<String>,
}

// ─── Event type parsing ───────────────────────────────────────────────────────

/// Components of a fully-qualified event type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventType {
    pub address: String,
    pub contract: String,
    pub name: String,
}

impl EventType {
    /// Split `A.<address>.<contract>.<event>` or `flow.<event>`.
    ///
    /// Anything else is returned whole as the event name.
    pub fn parse(type_id: &str) -> Self {
        let parts: Vec<&str> = type_id.split('.').collect();
        match parts.as_slice() {
            ["A", address, contract, rest @ ..] if !rest.is_empty() => Self {
                address: (*address).to_string(),
                contract: (*contract).to_string(),
                name: rest.join("."),
            },
            ["flow", rest @ ..] if !rest.is_empty() => Self {
                address: String::new(),
                contract: "flow".to_string(),
                name: rest.join("."),
            },
            _ => Self {
                address: String::new(),
                contract: String::new(),
                name: type_id.to_string(),
            },
        }
    }
}

// ─── Fetch output ─────────────────────────────────────────────────────────────

/// A non-fatal problem met while assembling a block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchWarning {
    pub transaction_id: String,
    pub transaction_index: u32,
    pub message: String,
}

/// A transaction with its result and the signals derived at fetch time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexedTransaction {
    /// Position within the block, across all collections.
    pub index: u32,
    pub collection_id: String,
    pub transaction: Transaction,
    pub result: TransactionResult,
    /// Touches the EVM execution environment.
    pub is_evm: bool,
    /// Hex SHA-256 of the script text.
    pub script_hash: String,
    pub participants: Vec<String>,
}

/// Everything known about one height, self-contained and ready to commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchResult {
    pub header: BlockHeader,
    pub transactions: Vec<IndexedTransaction>,
    pub warnings: Vec<FetchWarning>,
}

impl FetchResult {
    pub fn height(&self) -> u64 {
        self.header.height
    }

    pub fn id(&self) -> &str {
        &self.header.id
    }

    pub fn event_count(&self) -> usize {
        self.transactions.iter().map(|t| t.result.events.len()).sum()
    }

    /// Transactions that are not protocol system transactions.
    pub fn user_transactions(&self) -> impl Iterator<Item = &IndexedTransaction> {
        self.transactions.iter().filter(|t| !t.transaction.is_system())
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    /// Deterministic block id for height `h` on fork `fork`.
    pub fn block_id(h: u64, fork: &str) -> String {
        format!("{fork}{h:08x}")
    }

    pub fn header(h: u64, fork: &str, parent_fork: &str) -> BlockHeader {
        BlockHeader {
            height: h,
            id: block_id(h, fork),
            parent_id: block_id(h.saturating_sub(1), parent_fork),
            timestamp: DateTime::<Utc>::from_timestamp(1_700_000_000 + h as i64, 0)
                .unwrap_or_default(),
            collection_guarantees: vec![],
        }
    }

    pub fn fetch_result(h: u64) -> FetchResult {
        FetchResult {
            header: header(h, "a", "a"),
            transactions: vec![],
            warnings: vec![],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    fn tx(payer: &str, proposer: &str, auth: &[&str]) -> Transaction {
        Transaction {
            id: "aa".into(),
            script: "transaction {}".into(),
            arguments: vec![],
            reference_block_id: "bb".into(),
            gas_limit: 9999,
            proposal_key: ProposalKey {
                address: proposer.into(),
                key_index: 0,
                sequence_number: 1,
            },
            payer: payer.into(),
            authorizers: auth.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn header_extends_parent() {
        let parent = header(10, "a", "a");
        let child = header(11, "a", "a");
        let fork_child = header(11, "b", "b");
        assert!(child.extends(&parent));
        assert!(!fork_child.extends(&parent));
    }

    #[test]
    fn status_codes_and_names() {
        assert_eq!(TransactionStatus::from_code(4), TransactionStatus::Sealed);
        assert_eq!(TransactionStatus::from_code(0), TransactionStatus::Unknown);
        assert_eq!(TransactionStatus::from_code(99), TransactionStatus::Unknown);
        assert_eq!(TransactionStatus::parse("Executed"), TransactionStatus::Executed);
        assert_eq!(TransactionStatus::Sealed.to_string(), "SEALED");
    }

    #[test]
    fn parse_contract_event_type() {
        let et = EventType::parse("A.1654653399040a61.FlowToken.TokensDeposited");
        assert_eq!(et.address, "1654653399040a61");
        assert_eq!(et.contract, "FlowToken");
        assert_eq!(et.name, "TokensDeposited");
    }

    #[test]
    fn parse_protocol_event_type() {
        let et = EventType::parse("flow.AccountCreated");
        assert_eq!(et.address, "");
        assert_eq!(et.contract, "flow");
        assert_eq!(et.name, "AccountCreated");

        let odd = EventType::parse("Weird");
        assert_eq!(odd.name, "Weird");
        assert!(odd.contract.is_empty());
    }

    #[test]
    fn system_transaction_detection() {
        assert!(tx(SYSTEM_ADDRESS, SYSTEM_ADDRESS, &[]).is_system());
        assert!(!tx(SYSTEM_ADDRESS, "f8d6e0586b0a20c7", &[]).is_system());
    }

    #[test]
    fn participants_are_deduplicated() {
        let t = tx("f1", "f2", &["f1", "f3"]);
        assert_eq!(t.participants(), vec!["f1", "f2", "f3"]);
    }
}
