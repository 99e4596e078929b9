//! Error types for CircleSync

use thiserror::Error;

/// Main error type for CircleSync operations
#[derive(Error, Debug)]
pub enum SyncError {
    /// A blob could not be fetched from the network or local store (retryable)
    #[error("Transport failure: {0}")]
    TransportFailure(String),

    /// No candidate key could authenticate the ciphertext (retryable once keys arrive)
    #[error("Decrypt failure: {0}")]
    DecryptFailure(String),

    /// Content decrypted but is not a well-formed object (poisoned, never retried)
    #[error("Parse failure: {0}")]
    ParseFailure(String),

    /// Announcement or message from a node we were never introduced to
    #[error("Unknown peer: {0}")]
    UnknownPeer(String),

    /// Signature verification failed
    #[error("Signature invalid: {0}")]
    SignatureInvalid(String),

    /// Requested row or key does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Configuration file could not be read or parsed
    #[error("Config error: {0}")]
    Config(String),

    /// Error during storage operations (redb)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Database creation/opening error
    #[error("Database error: {0}")]
    Database(#[from] redb::DatabaseError),

    /// Transaction error
    #[error("Transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    /// Table error
    #[error("Table error: {0}")]
    Table(#[from] redb::TableError),

    /// Storage operation error
    #[error("Storage operation error: {0}")]
    StorageOp(#[from] redb::StorageError),

    /// Commit error
    #[error("Commit error: {0}")]
    Commit(#[from] redb::CommitError),

    /// Error during serialization/deserialization of local rows
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Cryptographic operation failed
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Error during gossip protocol operations
    #[error("Gossip error: {0}")]
    Gossip(String),

    /// Network-related error
    #[error("Network error: {0}")]
    Network(String),

    /// Blob store error
    #[error("Blob error: {0}")]
    Blob(String),

    /// General I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid operation for current state
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

impl SyncError {
    /// Whether the failure is transient and the same work may succeed later.
    ///
    /// Transient failures keep a peer's `last_known_version` where it was so the
    /// next announcement re-runs the pass. Parse failures are poisoned instead.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::TransportFailure(_)
                | SyncError::DecryptFailure(_)
                | SyncError::SignatureInvalid(_)
                | SyncError::Network(_)
                | SyncError::Gossip(_)
        )
    }

    /// Whether the content is permanently unusable.
    pub fn is_poisoned(&self) -> bool {
        matches!(self, SyncError::ParseFailure(_))
    }
}

/// Result type alias using SyncError
pub type SyncResult<T> = Result<T, SyncError>;
