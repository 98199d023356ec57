use crate::error::AppError;
use crate::models::BillingMonth;
use crate::report::{ReportArtifact, ReportMetadata, ReportSource};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::LAST_MODIFIED;
use reqwest::{Client, Response, StatusCode};
use url::Url;

/// Reports served as `GET {base_url}/{account}/{YYYY-MM}`; the generation time
/// is the `Last-Modified` header.
pub struct HttpReportSource {
    client: Client,
    base_url: String,
    api_key: String,
}

impl HttpReportSource {
    pub fn new(client: Client, base_url: String, api_key: String) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        }
    }

    fn report_url(&self, account_id: &str, month: BillingMonth) -> Result<Url, AppError> {
        Url::parse(&format!("{}/{}/{}", self.base_url, account_id, month))
            .map_err(|e| AppError::Config(format!("Invalid report base URL '{}': {e}", self.base_url)))
    }

    fn parse_last_modified(response: &Response) -> Option<DateTime<Utc>> {
        let raw = response.headers().get(LAST_MODIFIED)?.to_str().ok()?;
        DateTime::parse_from_rfc2822(raw)
            .ok()
            .map(|d| d.with_timezone(&Utc))
    }

    fn check_status(response: Response) -> Result<Response, AppError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(AppError::Config(
                "Billing endpoint rejected credentials (unauthorized).".into(),
            ));
        }
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            return Err(AppError::TransientFetch(format!(
                "billing endpoint returned HTTP status {status}"
            )));
        }
        Err(AppError::Config(format!(
            "billing endpoint rejected the request with HTTP status {status}"
        )))
    }
}

#[async_trait]
impl ReportSource for HttpReportSource {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn latest_report(
        &self,
        account_id: &str,
        month: BillingMonth,
    ) -> Result<Option<ReportMetadata>, AppError> {
        let url = self.report_url(account_id, month)?;
        let response = self
            .client
            .head(url.clone())
            .bearer_auth(&self.api_key)
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = Self::check_status(response)?;
        let generated_at = Self::parse_last_modified(&response).ok_or_else(|| {
            AppError::ReportFormat(format!("{url} has no usable Last-Modified header"))
        })?;

        Ok(Some(ReportMetadata {
            account_id: account_id.to_string(),
            month,
            generated_at,
            location: url.to_string(),
        }))
    }

    async fn download(&self, metadata: &ReportMetadata) -> Result<ReportArtifact, AppError> {
        let response = self
            .client
            .get(&metadata.location)
            .bearer_auth(&self.api_key)
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(AppError::ReportNotFound {
                account_id: metadata.account_id.clone(),
                month: metadata.month.to_string(),
            });
        }
        let body = Self::check_status(response)?.bytes().await?;
        Ok(ReportArtifact {
            metadata: metadata.clone(),
            body: body.to_vec(),
        })
    }
}
