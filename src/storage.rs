use crate::error::AppError;
use crate::models::{
    BillingWatermark, DescriptionRecord, NewDescription, NewResource, ResourceDescriptionKey,
    ResourceKind, ResourceRecord, WatermarkClaim, COMPUTE_LINK_PREFIX, DESCRIPTION_LINK_PREFIX,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, types::Type, Connection, OptionalExtension, Row, TransactionBehavior};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use uuid::Uuid;

/// Record store for accounts, instances, descriptions and billing watermarks.
///
/// `create_*` calls are create-if-absent: an account resource is unique per
/// account id, an instance per instance id, a shared description per
/// `(region, zone, instance type)` and an account description per account id.
/// Creating an existing record returns the stored one.
#[async_trait]
pub trait ResourceStore: Send + Sync {
    async fn get_resource(&self, link: &str) -> Result<Option<ResourceRecord>, AppError>;

    async fn get_description(&self, link: &str) -> Result<Option<DescriptionRecord>, AppError>;

    async fn find_account(&self, account_id: &str) -> Result<Option<ResourceRecord>, AppError>;

    async fn list_linked_accounts(
        &self,
        parent_link: &str,
    ) -> Result<Vec<ResourceRecord>, AppError>;

    async fn find_instance(&self, instance_id: &str) -> Result<Option<ResourceRecord>, AppError>;

    async fn list_instances(&self, account_id: &str) -> Result<Vec<ResourceRecord>, AppError>;

    async fn find_description_by_key(
        &self,
        key: &ResourceDescriptionKey,
    ) -> Result<Option<DescriptionRecord>, AppError>;

    async fn create_description(&self, new: NewDescription)
        -> Result<DescriptionRecord, AppError>;

    async fn create_resource(&self, new: NewResource) -> Result<ResourceRecord, AppError>;

    /// Availability zone -> region.
    async fn zone_inventory(&self) -> Result<HashMap<String, String>, AppError>;

    async fn get_watermark(&self, account_id: &str)
        -> Result<Option<BillingWatermark>, AppError>;

    /// Stores `max(current, bill_millis)` and returns the stored value.
    async fn advance_watermark(
        &self,
        account_id: &str,
        bill_millis: i64,
    ) -> Result<BillingWatermark, AppError>;

    /// Atomically claims the report at `claim.bill_millis` for one run.
    ///
    /// Returns `false` when the watermark already covers the report, or when
    /// another run holds a claim younger than `lease` on the same or a newer
    /// report. Claiming again with the same run id succeeds.
    async fn claim_watermark(
        &self,
        claim: &WatermarkClaim,
        lease: Duration,
    ) -> Result<bool, AppError>;

    /// Drops the claim if `claim.run_id` still holds it.
    async fn release_watermark_claim(&self, claim: &WatermarkClaim) -> Result<(), AppError>;
}

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

const RESOURCE_COLUMNS: &str = "link, kind, account_id, instance_id, description_link, endpoint_link, resource_pool_link, parent_link, live, created_at";
const DESCRIPTION_COLUMNS: &str =
    "link, account_id, endpoint_link, region_id, zone_id, instance_type, created_at";

fn parse_ts(idx: usize, raw: String) -> rusqlite::Result<DateTime<Utc>> {
    chrono::DateTime::parse_from_rfc3339(&raw)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn resource_from_row(r: &Row<'_>) -> rusqlite::Result<ResourceRecord> {
    let kind: String = r.get(1)?;
    Ok(ResourceRecord {
        link: r.get(0)?,
        kind: ResourceKind::parse(&kind).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                1,
                Type::Text,
                format!("unknown resource kind '{kind}'").into(),
            )
        })?,
        account_id: r.get(2)?,
        instance_id: r.get(3)?,
        description_link: r.get(4)?,
        endpoint_link: r.get(5)?,
        resource_pool_link: r.get(6)?,
        parent_link: r.get(7)?,
        live: r.get(8)?,
        created_at: parse_ts(9, r.get(9)?)?,
    })
}

fn description_from_row(r: &Row<'_>) -> rusqlite::Result<DescriptionRecord> {
    Ok(DescriptionRecord {
        link: r.get(0)?,
        account_id: r.get(1)?,
        endpoint_link: r.get(2)?,
        region_id: r.get(3)?,
        zone_id: r.get(4)?,
        instance_type: r.get(5)?,
        created_at: parse_ts(6, r.get(6)?)?,
    })
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self, AppError> {
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, AppError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, AppError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS descriptions (
                link TEXT PRIMARY KEY,
                account_id TEXT,
                endpoint_link TEXT,
                region_id TEXT NOT NULL,
                zone_id TEXT NOT NULL,
                instance_type TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE UNIQUE INDEX IF NOT EXISTS descriptions_by_key
                ON descriptions (region_id, zone_id, instance_type) WHERE account_id IS NULL;
            CREATE UNIQUE INDEX IF NOT EXISTS descriptions_by_account
                ON descriptions (account_id) WHERE account_id IS NOT NULL;

            CREATE TABLE IF NOT EXISTS resources (
                link TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                account_id TEXT NOT NULL,
                instance_id TEXT,
                description_link TEXT NOT NULL REFERENCES descriptions (link),
                endpoint_link TEXT NOT NULL,
                resource_pool_link TEXT,
                parent_link TEXT,
                live INTEGER NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE UNIQUE INDEX IF NOT EXISTS resources_account
                ON resources (account_id) WHERE kind = 'account';
            CREATE UNIQUE INDEX IF NOT EXISTS resources_instance
                ON resources (instance_id) WHERE instance_id IS NOT NULL;
            CREATE INDEX IF NOT EXISTS resources_by_parent ON resources (parent_link);

            CREATE TABLE IF NOT EXISTS zones (
                zone_id TEXT PRIMARY KEY,
                region_id TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS watermarks (
                account_id TEXT PRIMARY KEY,
                last_processed_bill_millis INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS watermark_claims (
                account_id TEXT PRIMARY KEY,
                bill_millis INTEGER NOT NULL,
                run_id TEXT NOT NULL,
                claimed_at_millis INTEGER NOT NULL
            );
            "#,
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, AppError> {
        self.conn
            .lock()
            .map_err(|_| AppError::Config("resource store lock poisoned".into()))
    }

    pub fn put_zones(&self, zones: &HashMap<String, String>) -> Result<(), AppError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        {
            let mut upsert = tx.prepare(
                "INSERT INTO zones (zone_id, region_id) VALUES (?1, ?2)
                 ON CONFLICT (zone_id) DO UPDATE SET region_id = excluded.region_id",
            )?;
            for (zone, region) in zones {
                upsert.execute(params![zone, region])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn query_resource(
        &self,
        filter: &str,
        arg: &str,
    ) -> Result<Option<ResourceRecord>, AppError> {
        let conn = self.conn()?;
        let sql = format!("SELECT {RESOURCE_COLUMNS} FROM resources WHERE {filter}");
        Ok(conn
            .query_row(&sql, [arg], resource_from_row)
            .optional()?)
    }

    fn query_resources(&self, filter: &str, arg: &str) -> Result<Vec<ResourceRecord>, AppError> {
        let conn = self.conn()?;
        let sql = format!("SELECT {RESOURCE_COLUMNS} FROM resources WHERE {filter} ORDER BY link");
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map([arg], resource_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

#[async_trait]
impl ResourceStore for SqliteStore {
    async fn get_resource(&self, link: &str) -> Result<Option<ResourceRecord>, AppError> {
        self.query_resource("link = ?1", link)
    }

    async fn get_description(&self, link: &str) -> Result<Option<DescriptionRecord>, AppError> {
        let conn = self.conn()?;
        let sql = format!("SELECT {DESCRIPTION_COLUMNS} FROM descriptions WHERE link = ?1");
        Ok(conn
            .query_row(&sql, [link], description_from_row)
            .optional()?)
    }

    async fn find_account(&self, account_id: &str) -> Result<Option<ResourceRecord>, AppError> {
        self.query_resource("kind = 'account' AND account_id = ?1", account_id)
    }

    async fn list_linked_accounts(
        &self,
        parent_link: &str,
    ) -> Result<Vec<ResourceRecord>, AppError> {
        self.query_resources("kind = 'account' AND parent_link = ?1", parent_link)
    }

    async fn find_instance(&self, instance_id: &str) -> Result<Option<ResourceRecord>, AppError> {
        self.query_resource("instance_id = ?1", instance_id)
    }

    async fn list_instances(&self, account_id: &str) -> Result<Vec<ResourceRecord>, AppError> {
        self.query_resources("kind = 'instance' AND account_id = ?1", account_id)
    }

    async fn find_description_by_key(
        &self,
        key: &ResourceDescriptionKey,
    ) -> Result<Option<DescriptionRecord>, AppError> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {DESCRIPTION_COLUMNS} FROM descriptions
             WHERE account_id IS NULL AND region_id = ?1 AND zone_id = ?2 AND instance_type = ?3"
        );
        Ok(conn
            .query_row(
                &sql,
                params![key.region_id, key.zone_id, key.instance_type],
                description_from_row,
            )
            .optional()?)
    }

    async fn create_description(
        &self,
        new: NewDescription,
    ) -> Result<DescriptionRecord, AppError> {
        let conn = self.conn()?;
        let link = format!("{DESCRIPTION_LINK_PREFIX}/{}", Uuid::new_v4());
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO descriptions
             (link, account_id, endpoint_link, region_id, zone_id, instance_type, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                link,
                new.account_id,
                new.endpoint_link,
                new.region_id,
                new.zone_id,
                new.instance_type,
                Utc::now().to_rfc3339(),
            ],
        )? > 0;

        let stored = match (&new.account_id, inserted) {
            (_, true) => conn.query_row(
                &format!("SELECT {DESCRIPTION_COLUMNS} FROM descriptions WHERE link = ?1"),
                [&link],
                description_from_row,
            )?,
            (Some(account_id), false) => conn.query_row(
                &format!("SELECT {DESCRIPTION_COLUMNS} FROM descriptions WHERE account_id = ?1"),
                [account_id],
                description_from_row,
            )?,
            (None, false) => conn.query_row(
                &format!(
                    "SELECT {DESCRIPTION_COLUMNS} FROM descriptions
                     WHERE account_id IS NULL AND region_id = ?1 AND zone_id = ?2 AND instance_type = ?3"
                ),
                params![new.region_id, new.zone_id, new.instance_type],
                description_from_row,
            )?,
        };
        Ok(stored)
    }

    async fn create_resource(&self, new: NewResource) -> Result<ResourceRecord, AppError> {
        let conn = self.conn()?;
        let link = format!("{COMPUTE_LINK_PREFIX}/{}", Uuid::new_v4());
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO resources
             (link, kind, account_id, instance_id, description_link, endpoint_link,
              resource_pool_link, parent_link, live, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                link,
                new.kind.as_str(),
                new.account_id,
                new.instance_id,
                new.description_link,
                new.endpoint_link,
                new.resource_pool_link,
                new.parent_link,
                new.live,
                Utc::now().to_rfc3339(),
            ],
        )? > 0;

        let stored = match (new.kind, &new.instance_id, inserted) {
            (ResourceKind::Instance, Some(instance_id), false) => conn.query_row(
                &format!("SELECT {RESOURCE_COLUMNS} FROM resources WHERE instance_id = ?1"),
                [instance_id],
                resource_from_row,
            )?,
            (ResourceKind::Account, _, false) => conn.query_row(
                &format!(
                    "SELECT {RESOURCE_COLUMNS} FROM resources WHERE kind = 'account' AND account_id = ?1"
                ),
                [&new.account_id],
                resource_from_row,
            )?,
            _ => conn.query_row(
                &format!("SELECT {RESOURCE_COLUMNS} FROM resources WHERE link = ?1"),
                [&link],
                resource_from_row,
            )?,
        };
        Ok(stored)
    }

    async fn zone_inventory(&self) -> Result<HashMap<String, String>, AppError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT zone_id, region_id FROM zones")?;
        let zones = stmt
            .query_map([], |r| Ok((r.get(0)?, r.get(1)?)))?
            .collect::<Result<HashMap<String, String>, _>>()?;
        Ok(zones)
    }

    async fn get_watermark(
        &self,
        account_id: &str,
    ) -> Result<Option<BillingWatermark>, AppError> {
        let conn = self.conn()?;
        Ok(conn
            .query_row(
                "SELECT last_processed_bill_millis FROM watermarks WHERE account_id = ?1",
                [account_id],
                |r| {
                    Ok(BillingWatermark {
                        last_processed_bill_millis: r.get(0)?,
                    })
                },
            )
            .optional()?)
    }

    async fn advance_watermark(
        &self,
        account_id: &str,
        bill_millis: i64,
    ) -> Result<BillingWatermark, AppError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO watermarks (account_id, last_processed_bill_millis) VALUES (?1, ?2)
             ON CONFLICT (account_id) DO UPDATE SET last_processed_bill_millis =
                MAX(last_processed_bill_millis, excluded.last_processed_bill_millis)",
            params![account_id, bill_millis],
        )?;
        let last_processed_bill_millis = conn.query_row(
            "SELECT last_processed_bill_millis FROM watermarks WHERE account_id = ?1",
            [account_id],
            |r| r.get(0),
        )?;
        Ok(BillingWatermark {
            last_processed_bill_millis,
        })
    }

    async fn claim_watermark(
        &self,
        claim: &WatermarkClaim,
        lease: Duration,
    ) -> Result<bool, AppError> {
        let now = Utc::now().timestamp_millis();
        let expired_at = now.saturating_sub(i64::try_from(lease.as_millis()).unwrap_or(i64::MAX));

        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let processed: Option<i64> = tx
            .query_row(
                "SELECT last_processed_bill_millis FROM watermarks WHERE account_id = ?1",
                [&claim.account_id],
                |r| r.get(0),
            )
            .optional()?;
        if processed.is_some_and(|millis| claim.bill_millis <= millis) {
            return Ok(false);
        }

        let claimed = tx.execute(
            "INSERT INTO watermark_claims (account_id, bill_millis, run_id, claimed_at_millis)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (account_id) DO UPDATE SET
                bill_millis = excluded.bill_millis,
                run_id = excluded.run_id,
                claimed_at_millis = excluded.claimed_at_millis
             WHERE watermark_claims.run_id = excluded.run_id
                OR watermark_claims.bill_millis < excluded.bill_millis
                OR watermark_claims.claimed_at_millis <= ?5",
            params![claim.account_id, claim.bill_millis, claim.run_id, now, expired_at],
        )?;
        tx.commit()?;
        Ok(claimed == 1)
    }

    async fn release_watermark_claim(&self, claim: &WatermarkClaim) -> Result<(), AppError> {
        let conn = self.conn()?;
        conn.execute(
            "DELETE FROM watermark_claims WHERE account_id = ?1 AND run_id = ?2",
            params![claim.account_id, claim.run_id],
        )?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tempfile::TempDir;

    pub(crate) fn key(region: &str, zone: &str, instance_type: &str) -> ResourceDescriptionKey {
        ResourceDescriptionKey {
            region_id: region.into(),
            zone_id: zone.into(),
            instance_type: instance_type.into(),
        }
    }

    pub(crate) async fn seed_account(
        store: &SqliteStore,
        account_id: &str,
        parent_link: Option<&str>,
    ) -> ResourceRecord {
        let desc = store
            .create_description(NewDescription {
                account_id: Some(account_id.into()),
                endpoint_link: Some("/endpoints/e".into()),
                ..NewDescription::default()
            })
            .await
            .expect("account description");
        store
            .create_resource(NewResource {
                kind: ResourceKind::Account,
                account_id: account_id.into(),
                instance_id: None,
                description_link: desc.link,
                endpoint_link: "/endpoints/e".into(),
                resource_pool_link: Some("/pools/p".into()),
                parent_link: parent_link.map(str::to_string),
                live: true,
            })
            .await
            .expect("account resource")
    }

    pub(crate) async fn seed_instance(
        store: &SqliteStore,
        account_id: &str,
        instance_id: &str,
        live: bool,
    ) -> ResourceRecord {
        let desc = store
            .create_description(NewDescription::from_key(&key(
                "us-east-1",
                "us-east-1a",
                "t2.micro",
            )))
            .await
            .expect("shared description");
        store
            .create_resource(NewResource {
                kind: ResourceKind::Instance,
                account_id: account_id.into(),
                instance_id: Some(instance_id.into()),
                description_link: desc.link,
                endpoint_link: "/endpoints/e".into(),
                resource_pool_link: None,
                parent_link: None,
                live,
            })
            .await
            .expect("instance resource")
    }

    #[tokio::test]
    async fn create_resource_is_create_if_absent_per_account() {
        let store = SqliteStore::open_in_memory().expect("open");
        let first = seed_account(&store, "111", None).await;
        let second = seed_account(&store, "111", None).await;
        assert_eq!(first.link, second.link);
        assert_eq!(first.description_link, second.description_link);

        let found = store.find_account("111").await.expect("find").expect("present");
        assert_eq!(found.link, first.link);
        assert_eq!(found.resource_pool_link.as_deref(), Some("/pools/p"));
        assert!(store.find_account("222").await.expect("find").is_none());
    }

    #[tokio::test]
    async fn shared_description_is_unique_per_key() {
        let store = SqliteStore::open_in_memory().expect("open");
        let k = key("us-east-1", "us-east-1a", "m4.large");
        let a = store
            .create_description(NewDescription::from_key(&k))
            .await
            .expect("create");
        let b = store
            .create_description(NewDescription::from_key(&k))
            .await
            .expect("create again");
        assert_eq!(a.link, b.link);

        let found = store
            .find_description_by_key(&k)
            .await
            .expect("find")
            .expect("present");
        assert_eq!(found.link, a.link);
        assert!(found.link.starts_with(DESCRIPTION_LINK_PREFIX));
    }

    #[tokio::test]
    async fn instances_and_linked_accounts_are_listed() {
        let store = SqliteStore::open_in_memory().expect("open");
        let primary = seed_account(&store, "100", None).await;
        seed_account(&store, "200", Some(&primary.link)).await;
        seed_instance(&store, "200", "i-1", true).await;
        seed_instance(&store, "200", "i-2", false).await;

        let linked = store
            .list_linked_accounts(&primary.link)
            .await
            .expect("linked");
        assert_eq!(linked.len(), 1);
        assert_eq!(linked[0].account_id, "200");

        let instances = store.list_instances("200").await.expect("instances");
        assert_eq!(instances.len(), 2);
        let i2 = store.find_instance("i-2").await.expect("find").expect("present");
        assert!(!i2.live);
    }

    #[tokio::test]
    async fn watermark_only_moves_forward_and_survives_reopen() {
        let tmp = TempDir::new().expect("tempdir");
        let db = tmp.path().join("inventory.sqlite");
        {
            let store = SqliteStore::open(&db).expect("open");
            assert!(store.get_watermark("1").await.expect("get").is_none());
            store.advance_watermark("1", 500).await.expect("advance");
            let wm = store.advance_watermark("1", 200).await.expect("advance back");
            assert_eq!(wm.last_processed_bill_millis, 500);
        }

        let reopened = SqliteStore::open(&db).expect("reopen");
        let wm = reopened.get_watermark("1").await.expect("get").expect("present");
        assert_eq!(wm.last_processed_bill_millis, 500);
    }

    fn claim(run_id: &str, bill_millis: i64) -> WatermarkClaim {
        WatermarkClaim {
            account_id: "1".into(),
            bill_millis,
            run_id: run_id.into(),
        }
    }

    #[tokio::test]
    async fn only_one_run_can_claim_a_report() {
        let store = SqliteStore::open_in_memory().expect("open");
        let lease = Duration::from_secs(600);

        assert!(store.claim_watermark(&claim("a", 500), lease).await.expect("claim"));
        assert!(store.claim_watermark(&claim("a", 500), lease).await.expect("reclaim"));
        assert!(!store.claim_watermark(&claim("b", 500), lease).await.expect("contend"));
        assert!(!store.claim_watermark(&claim("b", 400), lease).await.expect("older"));

        store
            .release_watermark_claim(&claim("b", 500))
            .await
            .expect("release by non-holder");
        assert!(!store.claim_watermark(&claim("b", 500), lease).await.expect("still held"));

        store.advance_watermark("1", 500).await.expect("advance");
        store
            .release_watermark_claim(&claim("a", 500))
            .await
            .expect("release");
        assert!(!store.claim_watermark(&claim("b", 500), lease).await.expect("processed"));
        assert!(store.claim_watermark(&claim("b", 600), lease).await.expect("newer report"));
    }

    #[tokio::test]
    async fn newer_report_or_expired_lease_takes_over_a_claim() {
        let store = SqliteStore::open_in_memory().expect("open");
        let lease = Duration::from_secs(600);

        assert!(store.claim_watermark(&claim("a", 500), lease).await.expect("claim"));
        assert!(store.claim_watermark(&claim("b", 700), lease).await.expect("newer"));
        assert!(!store.claim_watermark(&claim("a", 500), lease).await.expect("lost"));

        assert!(store
            .claim_watermark(&claim("c", 700), Duration::ZERO)
            .await
            .expect("expired"));
    }

    #[tokio::test]
    async fn zone_inventory_round_trips() {
        let store = SqliteStore::open_in_memory().expect("open");
        store
            .put_zones(&HashMap::from([("us-west-2a".to_string(), "us-west-2".to_string())]))
            .expect("put zones");
        let zones = store.zone_inventory().await.expect("zones");
        assert_eq!(zones.get("us-west-2a").map(String::as_str), Some("us-west-2"));
    }
}
