//! Access-layer error types.

use thiserror::Error;

use flowindex_core::IndexerError;

/// Status class of a failed remote call, mirroring the access API status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RpcCode {
    ResourceExhausted,
    Unavailable,
    DeadlineExceeded,
    NotFound,
    Unimplemented,
    InvalidArgument,
    PermissionDenied,
    Internal,
    Unknown,
}

impl RpcCode {
    /// Map an HTTP status onto the access API status class.
    pub fn from_http_status(status: u16) -> Self {
        match status {
            429 => Self::ResourceExhausted,
            502 | 503 => Self::Unavailable,
            504 | 408 => Self::DeadlineExceeded,
            404 => Self::NotFound,
            501 => Self::Unimplemented,
            400 | 422 => Self::InvalidArgument,
            401 | 403 => Self::PermissionDenied,
            500 => Self::Internal,
            _ => Self::Unknown,
        }
    }
}

impl std::fmt::Display for RpcCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::ResourceExhausted => "ResourceExhausted",
            Self::Unavailable => "Unavailable",
            Self::DeadlineExceeded => "DeadlineExceeded",
            Self::NotFound => "NotFound",
            Self::Unimplemented => "Unimplemented",
            Self::InvalidArgument => "InvalidArgument",
            Self::PermissionDenied => "PermissionDenied",
            Self::Internal => "Internal",
            Self::Unknown => "Unknown",
        };
        f.write_str(s)
    }
}

/// Errors that can occur while talking to access nodes.
#[derive(Debug, Error)]
pub enum AccessError {
    /// The node answered with an error status.
    #[error("rpc error: code = {code} desc = {message}")]
    Rpc { code: RpcCode, message: String },

    /// Transient failures persisted through every attempt.
    #[error("{call} at height {height}: max retries reached after {attempts} attempts on {endpoint}: {source}")]
    MaxRetries {
        call: &'static str,
        height: u64,
        attempts: u32,
        endpoint: String,
        #[source]
        source: Box<AccessError>,
    },

    /// A collection referenced by a block could not be resolved.
    #[error("block at height {height}: collection {collection_id}: {source}")]
    Collection {
        height: u64,
        collection_id: String,
        #[source]
        source: Box<AccessError>,
    },

    #[error("no access node can serve height {height} (lowest known floor {lowest_floor})")]
    NoEndpointForHeight { height: u64, lowest_floor: u64 },

    #[error("no access nodes configured")]
    NoEndpoints,

    /// The response body could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("cancelled")]
    Cancelled,
}

impl AccessError {
    pub fn rpc(code: RpcCode, message: impl Into<String>) -> Self {
        Self::Rpc {
            code,
            message: message.into(),
        }
    }

    /// Status class of the innermost node error, if any.
    pub fn code(&self) -> Option<RpcCode> {
        match self {
            Self::Rpc { code, .. } => Some(*code),
            Self::MaxRetries { source, .. } | Self::Collection { source, .. } => source.code(),
            _ => None,
        }
    }

    /// Returns `true` for errors worth retrying on the same node.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Rpc {
                code: RpcCode::ResourceExhausted | RpcCode::Unavailable | RpcCode::DeadlineExceeded,
                ..
            }
        )
    }

    /// Returns `true` if the node does not implement the requested service.
    pub fn is_unknown_service(&self) -> bool {
        match self {
            Self::Rpc { code, message } => {
                let msg = message.to_ascii_lowercase();
                msg.contains("unknown service")
                    || (*code == RpcCode::Unimplemented && msg.contains("accessapi"))
            }
            _ => false,
        }
    }

    /// Returns `true` if the node's name resolution produced no addresses.
    pub fn is_resolver_failure(&self) -> bool {
        matches!(self, Self::Rpc { message, .. } if message.contains("produced zero addresses"))
    }

    /// Spork root height announced by a node that cannot serve older heights,
    /// parsed from `"... spork root block height <N> ..."`.
    pub fn spork_root_height(&self) -> Option<u64> {
        let Self::Rpc { message, .. } = self else {
            return None;
        };
        number_after(message, "spork root block height ")
    }

    /// Floor implied by a not-found `"failed to get block <N>"` answer: the
    /// node holds nothing at or below `N`.
    ///
    /// Only meaningful while descending through history; a lagging live node
    /// answers the same way for heights it has not sealed yet.
    pub fn missing_block_floor(&self) -> Option<u64> {
        let Self::Rpc { code, message } = self else {
            return None;
        };
        let not_found = *code == RpcCode::NotFound
            || message.contains("key not found")
            || message.contains("NotFound");
        if !not_found {
            return None;
        }
        number_after(message, "failed to get block ").and_then(|h| h.checked_add(1))
    }

    /// Convert into an ingestion error for the given height.
    pub fn into_indexer_error(self, height: u64) -> IndexerError {
        match self {
            Self::NoEndpointForHeight { height, lowest_floor } => IndexerError::HistoryFloor {
                height,
                floor: lowest_floor,
            },
            Self::Cancelled => IndexerError::Cancelled,
            other => match other.spork_root_height().or_else(|| other.missing_block_floor()) {
                Some(floor) if height < floor => IndexerError::HistoryFloor { height, floor },
                _ => IndexerError::fetch(height, other),
            },
        }
    }
}

/// Positive integer immediately following `needle` in `message`.
fn number_after(message: &str, needle: &str) -> Option<u64> {
    let start = message.find(needle)? + needle.len();
    let rest = &message[start..];
    let end = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
    rest[..end].parse::<u64>().ok().filter(|h| *h > 0)
}
