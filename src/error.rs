use thiserror::Error;

/// Discriminator used by callers that need to branch on error category
/// without string-matching a display message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Duplicate,
    NotFound,
    Database,
    Connectivity,
    RuleEvaluation,
    Cancelled,
    Decryption,
    InvalidKey,
    Other,
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("validation failed on field '{field}': {message}")]
    Validation { field: String, message: String },

    #[error("duplicate value for field '{field}'")]
    Duplicate { field: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("connectivity error: {0}")]
    Connectivity(String),

    #[error("no applicable rules for vendor '{0}'")]
    NoRulesForVendor(String),

    #[error("rule evaluation error: {0}")]
    RuleEvaluation(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("decryption failed: {0}")]
    Decryption(String),

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("SSH connection failed: {0}")]
    SshConnection(String),

    #[error("SSH authentication failed: {0}")]
    SshAuth(String),

    #[error("command execution failed: {0}")]
    CommandExecution(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("regex error: {0}")]
    Regex(#[from] regex::Error),

    #[error("SSH2 error: {0}")]
    Ssh2(#[from] ssh2::Error),

    #[error("database error: {0}")]
    Rusqlite(#[from] rusqlite::Error),

    #[error("toml error: {0}")]
    TomlDe(#[from] toml::de::Error),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Validation { .. } => ErrorKind::Validation,
            Error::Duplicate { .. } => ErrorKind::Duplicate,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::Database(_) | Error::Rusqlite(_) => ErrorKind::Database,
            Error::Connectivity(_)
            | Error::SshConnection(_)
            | Error::SshAuth(_)
            | Error::CommandExecution(_) => ErrorKind::Connectivity,
            Error::NoRulesForVendor(_) => ErrorKind::NotFound,
            Error::RuleEvaluation(_) | Error::Regex(_) => ErrorKind::RuleEvaluation,
            Error::Cancelled => ErrorKind::Cancelled,
            Error::Decryption(_) => ErrorKind::Decryption,
            Error::InvalidKey(_) => ErrorKind::InvalidKey,
            Error::Io(_) | Error::Csv(_) | Error::Ssh2(_) | Error::Config(_)
            | Error::TomlDe(_) => ErrorKind::Other,
        }
    }

    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn duplicate(field: impl Into<String>) -> Self {
        Error::Duplicate { field: field.into() }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
