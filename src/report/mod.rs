use crate::config::ReportSourceSettings;
use crate::credentials::Credentials;
use crate::error::AppError;
use crate::models::BillingMonth;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use std::path::PathBuf;
use std::sync::Arc;

pub mod http;
pub mod local;
pub mod parser;

pub use http::HttpReportSource;
pub use local::LocalReportSource;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportMetadata {
    pub account_id: String,
    pub month: BillingMonth,
    pub generated_at: DateTime<Utc>,
    pub location: String,
}

#[derive(Debug, Clone)]
pub struct ReportArtifact {
    pub metadata: ReportMetadata,
    pub body: Vec<u8>,
}

/// Where cost reports for a primary account are published.
///
/// Fetch failures surface as `TransientFetch` or transport errors; the body is
/// never inspected here, so `ReportFormat` only comes from the parser.
#[async_trait]
pub trait ReportSource: Send + Sync {
    fn name(&self) -> &'static str;

    /// Metadata of the report currently published for `month`, if any.
    async fn latest_report(
        &self,
        account_id: &str,
        month: BillingMonth,
    ) -> Result<Option<ReportMetadata>, AppError>;

    async fn download(&self, metadata: &ReportMetadata) -> Result<ReportArtifact, AppError>;
}

/// Builds an authenticated report client for a primary account.
pub trait CostingClientFactory: Send + Sync {
    fn create(&self, credentials: Option<&Credentials>)
        -> Result<Arc<dyn ReportSource>, AppError>;
}

pub struct ConfiguredClientFactory {
    settings: ReportSourceSettings,
    default_dir: PathBuf,
    client: Client,
}

impl ConfiguredClientFactory {
    pub fn new(
        settings: ReportSourceSettings,
        default_dir: PathBuf,
        timeout: std::time::Duration,
    ) -> Result<Self, AppError> {
        let client = Client::builder()
            .connect_timeout(std::time::Duration::from_secs(10))
            .timeout(timeout)
            .build()?;
        Ok(Self {
            settings,
            default_dir,
            client,
        })
    }
}

impl CostingClientFactory for ConfiguredClientFactory {
    fn create(
        &self,
        credentials: Option<&Credentials>,
    ) -> Result<Arc<dyn ReportSource>, AppError> {
        match &self.settings {
            ReportSourceSettings::Local { dir } => Ok(Arc::new(LocalReportSource::new(
                dir.clone().unwrap_or_else(|| self.default_dir.clone()),
            ))),
            ReportSourceSettings::Http { base_url } => {
                let creds = credentials.ok_or_else(|| {
                    AppError::Config(
                        "No API key found for the billing account. Register one with --api-key or set the env var."
                            .into(),
                    )
                })?;
                Ok(Arc::new(HttpReportSource::new(
                    self.client.clone(),
                    base_url.clone(),
                    creds.api_key.clone(),
                )))
            }
        }
    }
}
