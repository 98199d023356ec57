use crate::error::AppError;
use crate::models::{NewDescription, ResourceDescriptionKey, ResourceRecord};
use crate::storage::ResourceStore;
use dashmap::DashMap;
use futures::future::try_join_all;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::debug;

fn region_from_zone(zone: &str) -> String {
    let mut chars = zone.chars();
    match (chars.next_back(), chars.next_back()) {
        (Some(last), Some(prev)) if last.is_ascii_alphabetic() && prev.is_ascii_digit() => {
            zone[..zone.len() - 1].to_string()
        }
        _ => zone.to_string(),
    }
}

/// Builds the description key for a billed instance.
///
/// The region comes from `zone_index` when the zone is known. An unknown zone
/// still produces a key from the supplied strings.
pub fn resolve(
    instance_id: &str,
    region: &str,
    zone: &str,
    instance_type: &str,
    zone_index: &HashMap<String, String>,
) -> ResourceDescriptionKey {
    let zone = zone.trim().to_ascii_lowercase();
    let region_id = match zone_index.get(&zone) {
        Some(indexed) => indexed.clone(),
        None => {
            debug!(instance_id, zone = %zone, "zone not in inventory, keying on supplied zone");
            if region.trim().is_empty() {
                region_from_zone(&zone)
            } else {
                region.trim().to_ascii_lowercase()
            }
        }
    };

    ResourceDescriptionKey {
        region_id,
        zone_id: zone,
        instance_type: instance_type.trim().to_string(),
    }
}

async fn find_or_create_description(
    store: &dyn ResourceStore,
    key: &ResourceDescriptionKey,
) -> Result<String, AppError> {
    if let Some(existing) = store.find_description_by_key(key).await? {
        return Ok(existing.link);
    }
    let created = store
        .create_description(NewDescription::from_key(key))
        .await?;
    debug!(key = %key, link = %created.link, "created shared description");
    Ok(created.link)
}

/// Run-scoped mapping of description key -> shared description link.
///
/// The first caller for a key looks up or creates the record; concurrent
/// callers for the same key wait on that call instead of creating their own.
#[derive(Default)]
pub struct DescriptionIndex {
    cells: DashMap<ResourceDescriptionKey, Arc<OnceCell<String>>>,
}

impl DescriptionIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get_or_create(
        &self,
        key: &ResourceDescriptionKey,
        store: &dyn ResourceStore,
    ) -> Result<String, AppError> {
        let cell = self.cells.entry(key.clone()).or_default().clone();
        let link = cell
            .get_or_try_init(|| find_or_create_description(store, key))
            .await?;
        Ok(link.clone())
    }

    pub fn len(&self) -> usize {
        self.cells.iter().filter(|c| c.value().initialized()).count()
    }
}

#[derive(Debug, Default)]
pub struct InstanceResolution {
    pub resolved: HashMap<String, ResourceRecord>,
    pub unresolved: Vec<String>,
}

/// Maps billed instance ids to local resource records.
pub async fn resolve_instances(
    store: &dyn ResourceStore,
    instance_ids: &[String],
) -> Result<InstanceResolution, AppError> {
    let lookups = instance_ids.iter().map(|id| async move {
        let record = store.find_instance(id).await?;
        Ok::<_, AppError>((id.clone(), record))
    });

    let mut resolution = InstanceResolution::default();
    for (id, record) in try_join_all(lookups).await? {
        match record {
            Some(record) => {
                resolution.resolved.insert(id, record);
            }
            None => resolution.unresolved.push(id),
        }
    }
    resolution.unresolved.sort();
    Ok(resolution)
}
