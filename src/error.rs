use std::fmt;

#[derive(Debug)]
pub enum AuditError {
    Io(std::io::Error),
    Json(serde_json::Error),
    Csv(csv::Error),
    Http { url: String, status: Option<u16>, message: String },
    MalformedRow { row: usize, reason: String },
    CrossCluster { left: String, right: String },
    Config(String),
    Ownership(String),
    CacheEncode(Box<bincode::error::EncodeError>),
    CacheDecode(Box<bincode::error::DecodeError>),
    Other(String),
}

impl AuditError {
    /// Shorthand for a row-level parse failure. Row numbers are filled in by the reader.
    pub fn malformed(reason: impl Into<String>) -> Self {
        AuditError::MalformedRow { row: 0, reason: reason.into() }
    }

    pub fn at_row(self, row: usize) -> Self {
        match self {
            AuditError::MalformedRow { reason, .. } => AuditError::MalformedRow { row, reason },
            other => other,
        }
    }

    pub fn is_malformed_row(&self) -> bool {
        matches!(self, AuditError::MalformedRow { .. })
    }
}

impl fmt::Display for AuditError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuditError::Io(e) => write!(f, "IO error: {}", e),
            AuditError::Json(e) => write!(f, "JSON error: {}", e),
            AuditError::Csv(e) => write!(f, "CSV error: {}", e),
            AuditError::Http { url, status: Some(status), message } => {
                write!(f, "HTTP error fetching {} (status {}): {}", url, status, message)
            }
            AuditError::Http { url, status: None, message } => {
                write!(f, "HTTP error fetching {}: {}", url, message)
            }
            AuditError::MalformedRow { row, reason } => write!(f, "Malformed row {}: {}", row, reason),
            AuditError::CrossCluster { left, right } => {
                write!(f, "Cannot compare records of different clusters ({} vs {})", left, right)
            }
            AuditError::Config(e) => write!(f, "Configuration error: {}", e),
            AuditError::Ownership(e) => write!(f, "Ownership error: {}", e),
            AuditError::CacheEncode(e) => write!(f, "Cache encode error: {}", e),
            AuditError::CacheDecode(e) => write!(f, "Cache decode error: {}", e),
            AuditError::Other(e) => write!(f, "Error: {}", e),
        }
    }
}

impl std::error::Error for AuditError {}

impl From<std::io::Error> for AuditError {
    fn from(err: std::io::Error) -> Self {
        AuditError::Io(err)
    }
}

impl From<serde_json::Error> for AuditError {
    fn from(err: serde_json::Error) -> Self {
        AuditError::Json(err)
    }
}

impl From<csv::Error> for AuditError {
    fn from(err: csv::Error) -> Self {
        AuditError::Csv(err)
    }
}

impl From<reqwest::Error> for AuditError {
    fn from(err: reqwest::Error) -> Self {
        AuditError::Http {
            url: err.url().map(|u| u.to_string()).unwrap_or_default(),
            status: err.status().map(|s| s.as_u16()),
            message: err.to_string(),
        }
    }
}

impl From<bincode::error::EncodeError> for AuditError {
    fn from(err: bincode::error::EncodeError) -> Self {
        AuditError::CacheEncode(Box::new(err))
    }
}

impl From<bincode::error::DecodeError> for AuditError {
    fn from(err: bincode::error::DecodeError) -> Self {
        AuditError::CacheDecode(Box::new(err))
    }
}

impl From<String> for AuditError {
    fn from(err: String) -> Self {
        AuditError::Other(err)
    }
}

impl From<&str> for AuditError {
    fn from(err: &str) -> Self {
        AuditError::Other(err.to_string())
    }
}
