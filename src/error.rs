use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(String),

    #[error("malformed report: {0}")]
    ReportFormat(String),

    #[error("report fetch failed: {0}")]
    TransientFetch(String),

    #[error("no report available for account {account_id} in {month}")]
    ReportNotFound { account_id: String, month: String },

    #[error("failed to create resources for linked account {account_id}: {reason}")]
    ResourceCreation { account_id: String, reason: String },

    #[error("{0} not found")]
    NotFound(String),

    #[error("{operation} timed out after {secs}s")]
    Timeout { operation: String, secs: u64 },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Sql(#[from] rusqlite::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Keyring(#[from] keyring::Error),

    #[error(transparent)]
    TomlDe(#[from] toml::de::Error),

    #[error(transparent)]
    TomlSer(#[from] toml::ser::Error),

    #[error(transparent)]
    Settings(#[from] ::config::ConfigError),
}

impl AppError {
    /// Whether a stage may retry the operation that produced this error.
    pub fn is_transient(&self) -> bool {
        match self {
            AppError::TransientFetch(_) | AppError::Timeout { .. } => true,
            AppError::Http(e) => {
                e.is_connect()
                    || e.is_timeout()
                    || e.status()
                        .map(|s| s.is_server_error() || s.as_u16() == 429)
                        .unwrap_or(false)
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_format_is_not_transient() {
        assert!(!AppError::ReportFormat("missing header".into()).is_transient());
        assert!(!AppError::ResourceCreation {
            account_id: "1".into(),
            reason: "boom".into()
        }
        .is_transient());
    }

    #[test]
    fn fetch_and_timeout_are_transient() {
        assert!(AppError::TransientFetch("reset".into()).is_transient());
        assert!(AppError::Timeout {
            operation: "download".into(),
            secs: 5
        }
        .is_transient());
    }
}
