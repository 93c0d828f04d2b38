//! Error types for each layer of the messaging core.
//!
//! Library code returns these typed errors so callers can tell a record that
//! was simply not addressed to them apart from one that is malformed. The CLI
//! wraps them in `anyhow` at the edge.

use crate::reservation::ReservationKind;

/// Failures converting between ISO-8601 strings and `(unix, tzid)` pairs.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TimeError {
    #[error("malformed timestamp: {0:?}")]
    MalformedTimestamp(String),
    #[error("invalid timezone: {0:?}")]
    InvalidTimezone(String),
    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(i64),
}

/// Proof-of-work search outcomes that did not produce a record.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PowError {
    /// The iteration budget ran out before the target was met.
    #[error("proof of work not reached: target {target}, best {best} after {iterations} iterations")]
    PowNotReached {
        target: u32,
        best: u32,
        iterations: u64,
    },
    /// The progress callback asked the search to stop.
    #[error("proof of work cancelled at nonce {nonce} (best {best})")]
    Cancelled { nonce: u64, best: u32 },
    /// The blocking worker panicked or was aborted.
    #[error("mining worker failed: {0}")]
    Worker(String),
}

/// Record-level failures: hashing, signing and signature checks.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EventError {
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),
    #[error("invalid secret key")]
    InvalidSecretKey,
    #[error("id mismatch: expected {expected}, got {actual}")]
    IdMismatch { expected: String, actual: String },
    #[error("invalid signature on {0}")]
    InvalidSignature(String),
}

/// Failures inside the symmetric encryption primitive.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CryptoError {
    #[error("invalid key material: {0}")]
    Key(String),
    #[error("encryption failed")]
    Encrypt,
    #[error("decryption failed: {0}")]
    Decrypt(String),
}

/// Errors raised while wrapping or unwrapping a privacy envelope.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EnvelopeError {
    /// The envelope was not addressed to this key or was tampered with.
    #[error("decryption failed at {stage}: {reason}")]
    DecryptionFailed { stage: &'static str, reason: String },
    #[error("unexpected {stage} kind: expected {expected}, got {actual}")]
    UnexpectedKind {
        stage: &'static str,
        expected: u32,
        actual: u32,
    },
    #[error("malformed {stage} payload: {reason}")]
    Malformed { stage: &'static str, reason: String },
    /// The inner record claims an author other than the seal signer.
    #[error("sender mismatch: seal signed by {seal}, inner record claims {inner}")]
    SenderMismatch { seal: String, inner: String },
    #[error(transparent)]
    Event(#[from] EventError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

impl EnvelopeError {
    /// True when the error only means "this envelope is not for me".
    pub fn is_not_mine(&self) -> bool {
        matches!(self, EnvelopeError::DecryptionFailed { .. })
    }
}

/// Thread marker construction errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ThreadError {
    #[error("reply marker {0} given without a root marker")]
    ReplyWithoutRoot(String),
}

/// Validation and structural errors for reservation messages.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("invalid {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },
    #[error("confirmed status requires both time and tzid")]
    ConfirmedRequiresTime,
    #[error("{0} requires a root thread marker")]
    MissingThreadRoot(ReservationKind),
    #[error("unexpected kind: expected {expected}, got {actual}")]
    UnexpectedKind { expected: u32, actual: u32 },
    #[error("missing required tag {0:?}")]
    MissingTag(&'static str),
    #[error("malformed tag {tag:?}: {value:?}")]
    MalformedTag { tag: &'static str, value: String },
    #[error("status {status:?} is not allowed for {kind}")]
    InvalidStatus {
        status: String,
        kind: ReservationKind,
    },
    #[error(transparent)]
    Thread(#[from] ThreadError),
    #[error(transparent)]
    Pow(#[from] PowError),
    #[error(transparent)]
    Time(#[from] TimeError),
}

/// Transport failures reported by a relay collaborator.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RelayError {
    #[error("connection to {relay} failed: {reason}")]
    Connect { relay: String, reason: String },
    #[error("relay {relay} rejected {id}: {reason}")]
    Rejected {
        relay: String,
        id: String,
        reason: String,
    },
    #[error("relay {relay} timed out")]
    Timeout { relay: String },
    #[error("no relays configured")]
    NoRelays,
    #[error("all relays failed: {0:?}")]
    AllFailed(Vec<RelayError>),
}

/// Errors from the dual-publish orchestration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PublishError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
    /// At least one of the two envelopes did not reach a relay.
    #[error("partial delivery of {inner_id}: recipient {to_recipient:?}, self {to_self:?}")]
    Partial {
        inner_id: String,
        to_recipient: Option<RelayError>,
        to_self: Option<RelayError>,
    },
    #[error("build worker failed: {0}")]
    Worker(String),
}
