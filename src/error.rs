use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum BridgeError {
    #[error("no {kind} mapping configured for source type {code}")]
    #[diagnostic(help("add the missing entry to the corresponding mapping file"))]
    UnmappedType { kind: String, code: String },

    #[error("keyword {keyword} matched more than one target node: {}", .candidates.join(", "))]
    #[diagnostic(help("remove the identifier from all but one node in SEEK, then rerun"))]
    AmbiguousMatch {
        keyword: String,
        candidates: Vec<String>,
    },

    #[error("openBIS request failed: {0}")]
    OpenbisHttp(String),

    #[error("openBIS returned status {status}: {message}")]
    OpenbisStatus { status: u16, message: String },

    #[error("openBIS rejected {method}: {message}")]
    OpenbisRpc { method: String, message: String },

    #[error("SEEK request failed: {0}")]
    SeekHttp(String),

    #[error("SEEK returned status {status}: {message}")]
    SeekStatus { status: u16, message: String },

    #[error("malformed response from {service}: {message}")]
    MalformedResponse { service: String, message: String },

    #[error("invalid code in blacklist {file}: {code}")]
    InvalidBlacklistCode { file: PathBuf, code: String },

    #[error("missing required configuration value: {0}")]
    MissingConfigValue(String),

    #[error("missing config file openbis-seek-bridge.json")]
    MissingConfig,

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("failed to read mapping file at {0}")]
    MappingRead(PathBuf),

    #[error("failed to parse mapping file {path}: {message}")]
    MappingParse { path: PathBuf, message: String },

    #[error("missing credential: set {0}")]
    MissingCredential(String),

    #[error("object not found in openBIS: {0}")]
    NotFound(String),

    #[error("{id} is a {kind}; only experiments can be transferred")]
    UnsupportedObject { id: String, kind: String },

    #[error("filesystem error: {0}")]
    Filesystem(String),
}

impl BridgeError {
    pub fn unmapped(kind: &str, code: &str) -> Self {
        BridgeError::UnmappedType {
            kind: kind.to_string(),
            code: code.to_string(),
        }
    }

    pub fn malformed(service: &str, message: impl Into<String>) -> Self {
        BridgeError::MalformedResponse {
            service: service.to_string(),
            message: message.into(),
        }
    }

    /// Whether the error came from talking to openBIS or SEEK.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            BridgeError::OpenbisHttp(_)
                | BridgeError::OpenbisStatus { .. }
                | BridgeError::OpenbisRpc { .. }
                | BridgeError::SeekHttp(_)
                | BridgeError::SeekStatus { .. }
                | BridgeError::MalformedResponse { .. }
        )
    }

    /// Whether the error is raised before any network call is attempted.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            BridgeError::InvalidBlacklistCode { .. }
                | BridgeError::MissingConfigValue(_)
                | BridgeError::MissingConfig
                | BridgeError::ConfigRead(_)
                | BridgeError::ConfigParse(_)
                | BridgeError::MappingRead(_)
                | BridgeError::MappingParse { .. }
                | BridgeError::MissingCredential(_)
        )
    }
}
