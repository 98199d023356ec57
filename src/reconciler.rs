//! Creates local account records for linked accounts that appear in a bill
//! but are not yet known to the resource store.

use crate::error::AppError;
use crate::models::{NewDescription, NewResource, ResourceKind, ResourceRecord};
use crate::storage::ResourceStore;
use futures::future::join_all;
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

#[derive(Debug, Default)]
pub struct ReconcileOutcome {
    pub created: Vec<ResourceRecord>,
    /// Ids that already had an account record.
    pub skipped: Vec<ResourceRecord>,
    pub failures: Vec<AppError>,
}

impl ReconcileOutcome {
    pub fn attempted(&self) -> usize {
        self.created.len() + self.failures.len()
    }

    /// More than half of the attempted creations failed.
    pub fn mostly_failed(&self) -> bool {
        self.failures.len() * 2 > self.attempted()
    }
}

enum Ensured {
    Existing(ResourceRecord),
    Created(ResourceRecord),
}

async fn ensure_account(
    store: &dyn ResourceStore,
    primary: &ResourceRecord,
    account_id: &str,
) -> Result<Ensured, AppError> {
    if let Some(existing) = store.find_account(account_id).await? {
        return Ok(Ensured::Existing(existing));
    }

    let description = store
        .create_description(NewDescription {
            account_id: Some(account_id.to_string()),
            endpoint_link: Some(primary.endpoint_link.clone()),
            ..NewDescription::default()
        })
        .await?;

    let record = store
        .create_resource(NewResource {
            kind: ResourceKind::Account,
            account_id: account_id.to_string(),
            instance_id: None,
            description_link: description.link,
            endpoint_link: primary.endpoint_link.clone(),
            resource_pool_link: primary.resource_pool_link.clone(),
            parent_link: Some(primary.link.clone()),
            live: true,
        })
        .await?;
    Ok(Ensured::Created(record))
}

/// Ensures an account record exists under `primary` for every id in
/// `account_ids`. Every id is attempted; failures are collected rather than
/// aborting the others.
pub async fn reconcile(
    store: &dyn ResourceStore,
    primary: &ResourceRecord,
    account_ids: &[String],
) -> ReconcileOutcome {
    let ids: BTreeSet<&str> = account_ids
        .iter()
        .map(|id| id.trim())
        .filter(|id| !id.is_empty())
        .collect();

    let results = join_all(ids.into_iter().map(|account_id| async move {
        let result = ensure_account(store, primary, account_id).await;
        (account_id, result)
    }))
    .await;

    let mut outcome = ReconcileOutcome::default();
    for (account_id, result) in results {
        match result {
            Ok(Ensured::Existing(record)) => {
                debug!(account_id, link = %record.link, "linked account already present");
                outcome.skipped.push(record);
            }
            Ok(Ensured::Created(record)) => {
                info!(account_id, link = %record.link, "created linked account");
                outcome.created.push(record);
            }
            Err(error) => {
                warn!(account_id, error = %error, "failed to create linked account");
                outcome.failures.push(AppError::ResourceCreation {
                    account_id: account_id.to_string(),
                    reason: error.to_string(),
                });
            }
        }
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::tests::seed_account;
    use crate::storage::SqliteStore;
    use crate::testing::FlakyStore;

    fn ids(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn creates_one_account_per_missing_id() {
        let store = SqliteStore::open_in_memory().expect("open");
        let primary = seed_account(&store, "100", None).await;

        let outcome = reconcile(&store, &primary, &ids(&["123456", "7891011"])).await;
        assert!(outcome.failures.is_empty());
        assert_eq!(outcome.created.len(), 2);

        let mut description_links = Vec::new();
        for record in &outcome.created {
            assert_eq!(record.endpoint_link, primary.endpoint_link);
            assert_eq!(record.resource_pool_link, primary.resource_pool_link);
            assert_eq!(record.parent_link.as_deref(), Some(primary.link.as_str()));
            assert_eq!(record.kind, ResourceKind::Account);

            let description = store
                .get_description(&record.description_link)
                .await
                .expect("get")
                .expect("present");
            assert_eq!(description.account_id.as_deref(), Some(record.account_id.as_str()));
            assert_eq!(description.endpoint_link.as_deref(), Some("/endpoints/e"));
            description_links.push(description.link);
        }
        assert_ne!(description_links[0], description_links[1]);

        let linked = store.list_linked_accounts(&primary.link).await.expect("linked");
        let mut linked_ids: Vec<_> = linked.into_iter().map(|r| r.account_id).collect();
        linked_ids.sort();
        assert_eq!(linked_ids, ids(&["123456", "7891011"]));
    }

    #[tokio::test]
    async fn repeated_reconciliation_creates_nothing_new() {
        let store = FlakyStore::new(SqliteStore::open_in_memory().expect("open"));
        let primary = seed_account(store.inner(), "100", None).await;

        let first = reconcile(&store, &primary, &ids(&["200", "300"])).await;
        assert_eq!(first.created.len(), 2);
        let creates_after_first = store.resource_creates();

        let second = reconcile(&store, &primary, &ids(&["300", "200", "200"])).await;
        assert!(second.created.is_empty());
        assert_eq!(second.skipped.len(), 2);
        assert_eq!(store.resource_creates(), creates_after_first);
    }

    #[tokio::test]
    async fn failures_are_collected_and_others_still_created() {
        let store =
            FlakyStore::new(SqliteStore::open_in_memory().expect("open")).failing_for("300");
        let primary = seed_account(store.inner(), "100", None).await;

        let outcome = reconcile(&store, &primary, &ids(&["200", "300", "400"])).await;
        assert_eq!(outcome.created.len(), 2);
        assert_eq!(outcome.failures.len(), 1);
        assert!(matches!(
            &outcome.failures[0],
            AppError::ResourceCreation { account_id, .. } if account_id == "300"
        ));
        assert!(!outcome.mostly_failed());
        assert!(store.find_account("300").await.expect("find").is_none());
    }

    #[test]
    fn mostly_failed_needs_more_than_half() {
        let mut outcome = ReconcileOutcome::default();
        assert!(!outcome.mostly_failed());
        outcome.failures.push(AppError::NotFound("a".into()));
        assert!(outcome.mostly_failed());
    }
}
