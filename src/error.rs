//! Error taxonomy for the consensus core.
//!
//! The core never surfaces these to the application layer except through
//! `submit_command` returning `false` (see `node::RaftNode::submit_command`).
//! Everything here is either logged and dropped (transient network /
//! protocol faults) or fatal at startup (configuration / bind failures).

use thiserror::Error;

pub type Result<T> = std::result::Result<T, RaftError>;

#[derive(Debug, Error)]
pub enum RaftError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("message codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("message of {size} bytes exceeds the {limit} byte frame limit")]
    MessageTooLarge { size: u32, limit: u32 },

    #[error("invalid cluster configuration: {0}")]
    InvalidClusterConfig(String),

    #[error("failed to bind listener on {addr}: {source}")]
    BindFailed {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}
