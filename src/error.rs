//! Error taxonomy. Fatal startup failures use [`CoreError`]; everything else
//! on the packet plane is absorbed into counters or a typed disposition
//! (see [`crate::blacklist::AddOutcome`]) rather than a `Result`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("failed to allocate flow table: {0}")]
    FlowTableInit(&'static str),

    #[error("failed to initialize DPI engine: {0}")]
    DpiInit(&'static str),

    #[error("failed to initialize PCAPNG dumper: {0}")]
    DumperInit(&'static str),
}

/// Per-line parse failure surfaced while loading a rule file. Distinct from
/// [`CoreError`] so callers can match on why a specific line was rejected
/// without conflating it with a fatal startup condition.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RuleParseError {
    #[error("empty or comment line")]
    Blank,
    #[error("line did not parse as an IP address or CIDR: {0}")]
    NotAnAddress(String),
    #[error("invalid prefix length {0} for address family")]
    InvalidPrefix(u8),
    #[error("domain already matched by an existing rule")]
    AlreadyMatched,
}
