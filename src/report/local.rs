use crate::error::AppError;
use crate::models::BillingMonth;
use crate::report::{ReportArtifact, ReportMetadata, ReportSource};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::io::ErrorKind;
use std::path::PathBuf;

/// Reports dropped into a directory as `<account>-<YYYY-MM>.csv`.
pub struct LocalReportSource {
    dir: PathBuf,
}

impl LocalReportSource {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn file_name(account_id: &str, month: BillingMonth) -> String {
        format!("{account_id}-{month}.csv")
    }

    fn path_for(&self, account_id: &str, month: BillingMonth) -> PathBuf {
        self.dir.join(Self::file_name(account_id, month))
    }
}

#[async_trait]
impl ReportSource for LocalReportSource {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn latest_report(
        &self,
        account_id: &str,
        month: BillingMonth,
    ) -> Result<Option<ReportMetadata>, AppError> {
        let path = self.path_for(account_id, month);
        let meta = match tokio::fs::metadata(&path).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(AppError::TransientFetch(format!("{}: {e}", path.display()))),
        };

        Ok(Some(ReportMetadata {
            account_id: account_id.to_string(),
            month,
            generated_at: DateTime::<Utc>::from(meta.modified()?),
            location: path.display().to_string(),
        }))
    }

    async fn download(&self, metadata: &ReportMetadata) -> Result<ReportArtifact, AppError> {
        let body = tokio::fs::read(&metadata.location).await.map_err(|e| match e.kind() {
            ErrorKind::NotFound => AppError::ReportNotFound {
                account_id: metadata.account_id.clone(),
                month: metadata.month.to_string(),
            },
            _ => AppError::TransientFetch(format!("{}: {e}", metadata.location)),
        })?;
        Ok(ReportArtifact {
            metadata: metadata.clone(),
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn missing_report_is_none() {
        let tmp = TempDir::new().expect("tempdir");
        let source = LocalReportSource::new(tmp.path().to_path_buf());
        let month = BillingMonth::new(2024, 1).expect("month");
        assert!(source
            .latest_report("123", month)
            .await
            .expect("lookup")
            .is_none());
    }

    #[tokio::test]
    async fn present_report_is_downloaded() {
        let tmp = TempDir::new().expect("tempdir");
        let month = BillingMonth::new(2024, 1).expect("month");
        std::fs::write(
            tmp.path().join(LocalReportSource::file_name("123", month)),
            "LinkedAccountId\n123\n",
        )
        .expect("write report");

        let source = LocalReportSource::new(tmp.path().to_path_buf());
        let meta = source
            .latest_report("123", month)
            .await
            .expect("lookup")
            .expect("present");
        assert_eq!(meta.account_id, "123");
        assert!(meta.generated_at.timestamp() > 0);

        let artifact = source.download(&meta).await.expect("download");
        assert_eq!(artifact.body, b"LinkedAccountId\n123\n");
    }
}
