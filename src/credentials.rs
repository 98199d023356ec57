use crate::config::{normalize_account_id, SERVICE_NAME};
use crate::error::AppError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub account_id: String,
    pub api_key: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("account_id", &self.account_id)
            .field("api_key", &"<redacted>")
            .finish()
    }
}

/// Source of stored billing credentials for a primary account.
#[async_trait]
pub trait CredentialSource: Send + Sync {
    async fn credentials(&self, account_id: &str) -> Result<Option<Credentials>, AppError>;
}

fn entry(account_id: &str) -> Result<keyring::Entry, AppError> {
    let normalized = normalize_account_id(account_id);
    Ok(keyring::Entry::new(
        SERVICE_NAME,
        &format!("account:{normalized}"),
    )?)
}

fn env_var_name(account_id: &str) -> String {
    format!(
        "BILL_METER_{}_API_KEY",
        normalize_account_id(account_id)
            .to_ascii_uppercase()
            .replace('-', "_")
    )
}

pub fn set_api_key(account_id: &str, key: &str) -> Result<(), AppError> {
    entry(account_id)?.set_password(key)?;
    Ok(())
}

/// Keyring lookup with an environment variable fallback.
pub struct KeyringCredentials;

#[async_trait]
impl CredentialSource for KeyringCredentials {
    async fn credentials(&self, account_id: &str) -> Result<Option<Credentials>, AppError> {
        let normalized = normalize_account_id(account_id);
        if let Ok(value) = entry(&normalized)?.get_password() {
            if !value.is_empty() {
                return Ok(Some(Credentials {
                    account_id: normalized,
                    api_key: value,
                }));
            }
        }

        if let Ok(value) = std::env::var(env_var_name(&normalized)) {
            if !value.is_empty() {
                return Ok(Some(Credentials {
                    account_id: normalized,
                    api_key: value,
                }));
            }
        }

        Ok(None)
    }
}

/// Fixed credential table.
#[cfg(test)]
#[derive(Debug, Default, Clone)]
pub struct StaticCredentials {
    keys: HashMap<String, String>,
}

#[cfg(test)]
impl StaticCredentials {
    pub fn with(mut self, account_id: &str, api_key: &str) -> Self {
        self.keys
            .insert(normalize_account_id(account_id), api_key.to_string());
        self
    }
}

#[cfg(test)]
#[async_trait]
impl CredentialSource for StaticCredentials {
    async fn credentials(&self, account_id: &str) -> Result<Option<Credentials>, AppError> {
        let normalized = normalize_account_id(account_id);
        Ok(self.keys.get(&normalized).map(|key| Credentials {
            account_id: normalized.clone(),
            api_key: key.clone(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_var_name_is_upper_snake() {
        assert_eq!(env_var_name(" acct-1 "), "BILL_METER_ACCT_1_API_KEY");
    }

    #[test]
    fn debug_output_redacts_key() {
        let creds = Credentials {
            account_id: "1".into(),
            api_key: "secret".into(),
        };
        let rendered = format!("{creds:?}");
        assert!(!rendered.contains("secret"));
    }

    #[tokio::test]
    async fn static_credentials_lookup_by_trimmed_id() {
        let source = StaticCredentials::default().with("123", "k");
        let found = source.credentials(" 123 ").await.expect("lookup");
        assert_eq!(found.map(|c| c.api_key), Some("k".to_string()));
        assert!(source.credentials("456").await.expect("lookup").is_none());
    }
}
