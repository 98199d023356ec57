//! Test doubles: a store that counts writes and injects failures, and a
//! collector that records what it was sent.

use crate::collector::StatsCollector;
use crate::error::AppError;
use crate::models::{
    BillingWatermark, DescriptionRecord, NewDescription, NewResource, ResourceDescriptionKey,
    ResourceRecord, StatsResponse, TaskFailure, WatermarkClaim,
};
use crate::storage::{ResourceStore, SqliteStore};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

pub(crate) struct FlakyStore {
    inner: SqliteStore,
    description_creates: AtomicUsize,
    resource_creates: AtomicUsize,
    failing_accounts: HashSet<String>,
    failing_watermark: bool,
    create_delay: Duration,
}

impl FlakyStore {
    pub(crate) fn new(inner: SqliteStore) -> Self {
        Self {
            inner,
            description_creates: AtomicUsize::new(0),
            resource_creates: AtomicUsize::new(0),
            failing_accounts: HashSet::new(),
            failing_watermark: false,
            create_delay: Duration::from_millis(5),
        }
    }

    /// Account resource creation for `account_id` fails with a transport-style error.
    pub(crate) fn failing_for(mut self, account_id: &str) -> Self {
        self.failing_accounts.insert(account_id.to_string());
        self
    }

    /// Every watermark advance fails.
    pub(crate) fn failing_watermark(mut self) -> Self {
        self.failing_watermark = true;
        self
    }

    pub(crate) fn inner(&self) -> &SqliteStore {
        &self.inner
    }

    pub(crate) fn description_creates(&self) -> usize {
        self.description_creates.load(Ordering::SeqCst)
    }

    pub(crate) fn resource_creates(&self) -> usize {
        self.resource_creates.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ResourceStore for FlakyStore {
    async fn get_resource(&self, link: &str) -> Result<Option<ResourceRecord>, AppError> {
        self.inner.get_resource(link).await
    }

    async fn get_description(&self, link: &str) -> Result<Option<DescriptionRecord>, AppError> {
        self.inner.get_description(link).await
    }

    async fn find_account(&self, account_id: &str) -> Result<Option<ResourceRecord>, AppError> {
        self.inner.find_account(account_id).await
    }

    async fn list_linked_accounts(
        &self,
        parent_link: &str,
    ) -> Result<Vec<ResourceRecord>, AppError> {
        self.inner.list_linked_accounts(parent_link).await
    }

    async fn find_instance(&self, instance_id: &str) -> Result<Option<ResourceRecord>, AppError> {
        self.inner.find_instance(instance_id).await
    }

    async fn list_instances(&self, account_id: &str) -> Result<Vec<ResourceRecord>, AppError> {
        self.inner.list_instances(account_id).await
    }

    async fn find_description_by_key(
        &self,
        key: &ResourceDescriptionKey,
    ) -> Result<Option<DescriptionRecord>, AppError> {
        self.inner.find_description_by_key(key).await
    }

    async fn create_description(
        &self,
        new: NewDescription,
    ) -> Result<DescriptionRecord, AppError> {
        self.description_creates.fetch_add(1, Ordering::SeqCst);
        // widen the window between lookup and insert
        tokio::time::sleep(self.create_delay).await;
        self.inner.create_description(new).await
    }

    async fn create_resource(&self, new: NewResource) -> Result<ResourceRecord, AppError> {
        self.resource_creates.fetch_add(1, Ordering::SeqCst);
        if self.failing_accounts.contains(&new.account_id) {
            return Err(AppError::TransientFetch(format!(
                "store rejected account {}",
                new.account_id
            )));
        }
        self.inner.create_resource(new).await
    }

    async fn zone_inventory(&self) -> Result<HashMap<String, String>, AppError> {
        self.inner.zone_inventory().await
    }

    async fn get_watermark(
        &self,
        account_id: &str,
    ) -> Result<Option<BillingWatermark>, AppError> {
        self.inner.get_watermark(account_id).await
    }

    async fn advance_watermark(
        &self,
        account_id: &str,
        bill_millis: i64,
    ) -> Result<BillingWatermark, AppError> {
        if self.failing_watermark {
            return Err(AppError::Config(format!(
                "watermark table is read-only for account {account_id}"
            )));
        }
        self.inner.advance_watermark(account_id, bill_millis).await
    }

    async fn claim_watermark(
        &self,
        claim: &WatermarkClaim,
        lease: Duration,
    ) -> Result<bool, AppError> {
        self.inner.claim_watermark(claim, lease).await
    }

    async fn release_watermark_claim(&self, claim: &WatermarkClaim) -> Result<(), AppError> {
        self.inner.release_watermark_claim(claim).await
    }
}

#[derive(Debug, Clone)]
pub(crate) enum Sent {
    Stats(String, StatsResponse),
    Failure(String, TaskFailure),
}

#[derive(Default)]
pub(crate) struct RecordingCollector {
    sent: Mutex<Vec<Sent>>,
}

impl RecordingCollector {
    pub(crate) fn sent(&self) -> Vec<Sent> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub(crate) fn last_stats(&self) -> Option<StatsResponse> {
        self.sent().into_iter().rev().find_map(|s| match s {
            Sent::Stats(_, response) => Some(response),
            Sent::Failure(..) => None,
        })
    }

    pub(crate) fn last_failure(&self) -> Option<TaskFailure> {
        self.sent().into_iter().rev().find_map(|s| match s {
            Sent::Failure(_, failure) => Some(failure),
            Sent::Stats(..) => None,
        })
    }

    fn record(&self, sent: Sent) {
        if let Ok(mut all) = self.sent.lock() {
            all.push(sent);
        }
    }
}

#[async_trait]
impl StatsCollector for RecordingCollector {
    async fn send_stats(
        &self,
        task_reference: &str,
        response: &StatsResponse,
    ) -> Result<(), AppError> {
        self.record(Sent::Stats(task_reference.to_string(), response.clone()));
        Ok(())
    }

    async fn send_failure(
        &self,
        task_reference: &str,
        failure: &TaskFailure,
    ) -> Result<(), AppError> {
        self.record(Sent::Failure(task_reference.to_string(), failure.clone()));
        Ok(())
    }
}
