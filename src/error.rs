//! Error types for the order intake pipeline.

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Reference store errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl DatabaseError {
    /// The store itself cannot be reached; the whole run has to stop.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Pool(_) | Self::Migration(_))
    }

    /// A uniqueness violation, typically caused by a concurrent writer.
    pub fn is_constraint(&self) -> bool {
        matches!(self, Self::Constraint(_))
    }
}

/// Mail provider errors.
#[derive(Debug, thiserror::Error)]
pub enum MailboxError {
    #[error("Failed to connect to {host}: {reason}")]
    Connect { host: String, reason: String },

    #[error("Authentication failed for {user}")]
    Auth { user: String },

    #[error("Mailbox search failed: {0}")]
    Search(String),

    #[error("Failed to fetch message {handle}: {reason}")]
    Fetch { handle: String, reason: String },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures turning a message or document into order data.
#[derive(Debug, thiserror::Error)]
pub enum ExtractionError {
    #[error("Message {handle} has neither an HTML body nor an attachment")]
    NoContent { handle: String },

    #[error("Message {handle} could not be parsed as MIME")]
    Mime { handle: String },

    #[error("Unsupported payload type: {0}")]
    UnsupportedPayload(String),

    #[error("Failed to parse {format} document: {message}")]
    Parse { format: String, message: String },

    #[error("Required field missing: {field}")]
    FieldMissing { field: String },
}

/// Artifact archiving errors. Never fatal to order creation.
#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("Failed to write archive {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid origin code for archive file name: {0}")]
    InvalidName(String),
}

/// Per-candidate failures during commit.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Candidate rejected: {0}")]
    Rejected(String),

    #[error("Customer {tax_id} not found and creation is not authorized")]
    CustomerMissing { tax_id: String },

    #[error("Order {origin_code} already exists with different content")]
    DuplicateConflict { origin_code: String },

    #[error("No alternate code available for {origin_code} after {attempts} attempts")]
    AlternateCodeExhausted { origin_code: String, attempts: u32 },

    #[error("Persistence failed: {0}")]
    Persistence(#[from] DatabaseError),
}
