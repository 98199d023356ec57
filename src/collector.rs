use crate::error::AppError;
use crate::models::{StatsResponse, TaskFailure};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Serialize;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;
use url::Url;

/// Receives the single outcome message of a stats run.
#[async_trait]
pub trait StatsCollector: Send + Sync {
    async fn send_stats(&self, task_reference: &str, response: &StatsResponse)
        -> Result<(), AppError>;

    async fn send_failure(&self, task_reference: &str, failure: &TaskFailure)
        -> Result<(), AppError>;
}

/// Patches the task resource at `task_reference` with a JSON body.
pub struct HttpCollector {
    client: Client,
}

impl HttpCollector {
    pub fn new(timeout: Duration) -> Result<Self, AppError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(timeout)
            .build()?;
        Ok(Self { client })
    }

    async fn patch<T: Serialize + Sync>(
        &self,
        task_reference: &str,
        body: &T,
    ) -> Result<(), AppError> {
        let url = Url::parse(task_reference).map_err(|e| {
            AppError::Config(format!("Invalid task reference '{task_reference}': {e}"))
        })?;
        let response = self.client.patch(url).json(body).send().await?;
        let status = response.status();
        if status.is_success() {
            debug!(task_reference, %status, "task patched");
            return Ok(());
        }
        if status == StatusCode::NOT_FOUND {
            return Err(AppError::NotFound(format!("task {task_reference}")));
        }
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            return Err(AppError::TransientFetch(format!(
                "collector returned HTTP status {status}"
            )));
        }
        Err(AppError::Config(format!(
            "collector rejected the task update with HTTP status {status}"
        )))
    }
}

#[async_trait]
impl StatsCollector for HttpCollector {
    async fn send_stats(
        &self,
        task_reference: &str,
        response: &StatsResponse,
    ) -> Result<(), AppError> {
        self.patch(task_reference, response).await
    }

    async fn send_failure(
        &self,
        task_reference: &str,
        failure: &TaskFailure,
    ) -> Result<(), AppError> {
        self.patch(task_reference, failure).await
    }
}

/// Writes the message as pretty JSON to the file named by the task
/// reference, or to stdout for `-`.
pub struct FileCollector;

impl FileCollector {
    async fn write<T: Serialize + Sync>(
        &self,
        task_reference: &str,
        body: &T,
    ) -> Result<(), AppError> {
        let json = serde_json::to_string_pretty(body)?;
        if task_reference == "-" {
            let mut stdout = std::io::stdout().lock();
            writeln!(stdout, "{json}")?;
            return Ok(());
        }

        let path = PathBuf::from(task_reference);
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, format!("{json}\n")).await?;
        debug!(path = %path.display(), "task output written");
        Ok(())
    }
}

#[async_trait]
impl StatsCollector for FileCollector {
    async fn send_stats(
        &self,
        task_reference: &str,
        response: &StatsResponse,
    ) -> Result<(), AppError> {
        self.write(task_reference, response).await
    }

    async fn send_failure(
        &self,
        task_reference: &str,
        failure: &TaskFailure,
    ) -> Result<(), AppError> {
        self.write(task_reference, failure).await
    }
}

/// Sends to [`HttpCollector`] for http(s) task references and to
/// [`FileCollector`] for everything else.
pub struct TaskCollector {
    http: HttpCollector,
    file: FileCollector,
}

impl TaskCollector {
    pub fn new(timeout: Duration) -> Result<Self, AppError> {
        Ok(Self {
            http: HttpCollector::new(timeout)?,
            file: FileCollector,
        })
    }

    fn is_remote(task_reference: &str) -> bool {
        Url::parse(task_reference)
            .map(|u| matches!(u.scheme(), "http" | "https"))
            .unwrap_or(false)
    }
}

#[async_trait]
impl StatsCollector for TaskCollector {
    async fn send_stats(
        &self,
        task_reference: &str,
        response: &StatsResponse,
    ) -> Result<(), AppError> {
        if Self::is_remote(task_reference) {
            self.http.send_stats(task_reference, response).await
        } else {
            self.file.send_stats(task_reference, response).await
        }
    }

    async fn send_failure(
        &self,
        task_reference: &str,
        failure: &TaskFailure,
    ) -> Result<(), AppError> {
        if Self::is_remote(task_reference) {
            self.http.send_failure(task_reference, failure).await
        } else {
            self.file.send_failure(task_reference, failure).await
        }
    }
}
