mod burn_rate;
mod collector;
mod config;
mod credentials;
mod error;
mod logging;
mod models;
mod reconciler;
mod report;
mod resolver;
mod retry;
mod service;
mod stage;
mod storage;
#[cfg(test)]
mod testing;

use burn_rate::{average_burn_rate, current_burn_rate};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use collector::TaskCollector;
use config::{db_path, ensure_initialized, load_config, reports_dir};
use credentials::{set_api_key, KeyringCredentials};
use error::AppError;
use models::{
    BillingMonth, NewDescription, NewResource, ResourceKind, StatsRequest, UtilizationPoint,
};
use report::ConfiguredClientFactory;
use resolver::{resolve, DescriptionIndex};
use serde::Deserialize;
use service::{CostStatsService, RunOutcome};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use storage::{ResourceStore, SqliteStore};
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "bill-meter")]
#[command(about = "Billing report reconciliation and cost statistics")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    Init,
    /// Register a primary billing account and print its compute link.
    RegisterAccount {
        account_id: String,
        #[arg(long)]
        endpoint: String,
        #[arg(long)]
        resource_pool: Option<String>,
        #[arg(long)]
        api_key: Option<String>,
    },
    /// Add a compute instance to the local inventory of an account.
    AddInstance {
        account_id: String,
        instance_id: String,
        #[arg(long)]
        zone: String,
        #[arg(long)]
        instance_type: String,
        #[arg(long, default_value = "")]
        region: String,
        #[arg(long)]
        not_live: bool,
    },
    /// Reconcile the latest cost report of an account and send its stats.
    Run {
        account_link: String,
        /// http(s) URL to patch, a file path, or `-` for stdout.
        #[arg(long, default_value = "-")]
        task: String,
        /// Billing month as YYYY-MM; defaults to the current month.
        #[arg(long)]
        month: Option<String>,
        #[arg(long)]
        mock: bool,
    },
    Watermark {
        account_id: String,
    },
    /// Burn rates of a `timestamp,value` CSV series.
    BurnRate {
        csv: String,
    },
}

#[derive(Debug, Deserialize)]
struct SeriesRow {
    timestamp: String,
    value: f64,
}

fn read_series<R: std::io::Read>(reader: R) -> Result<Vec<UtilizationPoint>, AppError> {
    let mut rows = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(reader);
    let mut series = Vec::new();
    for row in rows.deserialize::<SeriesRow>() {
        let row = row?;
        let timestamp = DateTime::parse_from_rfc3339(&row.timestamp)
            .map_err(|_| {
                AppError::Config(format!(
                    "Unsupported timestamp '{}'. Use RFC 3339.",
                    row.timestamp
                ))
            })?
            .with_timezone(&Utc);
        series.push(UtilizationPoint {
            value: row.value,
            timestamp,
        });
    }
    Ok(series)
}

fn format_rate(rate: Option<f64>) -> String {
    rate.map(|r| format!("{r:.6} per hour"))
        .unwrap_or_else(|| "n/a".to_string())
}

fn open_store(zones: &HashMap<String, String>) -> Result<SqliteStore, AppError> {
    let store = SqliteStore::open(&db_path()?)?;
    store.put_zones(zones)?;
    Ok(store)
}

#[tokio::main]
async fn main() -> Result<(), AppError> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Init => {
            ensure_initialized()?;
            println!("Initialized bill-meter config and data directories.");
        }
        Commands::RegisterAccount {
            account_id,
            endpoint,
            resource_pool,
            api_key,
        } => {
            ensure_initialized()?;
            let cfg = load_config()?;
            logging::init(&cfg.log_level);
            let account_id = config::normalize_account_id(&account_id);
            let store = open_store(&cfg.zones)?;

            let description = store
                .create_description(NewDescription {
                    account_id: Some(account_id.clone()),
                    endpoint_link: Some(endpoint.clone()),
                    ..NewDescription::default()
                })
                .await?;
            let record = store
                .create_resource(NewResource {
                    kind: ResourceKind::Account,
                    account_id: account_id.clone(),
                    instance_id: None,
                    description_link: description.link,
                    endpoint_link: endpoint,
                    resource_pool_link: resource_pool,
                    parent_link: None,
                    live: true,
                })
                .await?;

            if let Some(key) = api_key {
                set_api_key(&account_id, &key)?;
            }
            println!("{}", record.link);
        }
        Commands::AddInstance {
            account_id,
            instance_id,
            zone,
            instance_type,
            region,
            not_live,
        } => {
            ensure_initialized()?;
            let cfg = load_config()?;
            logging::init(&cfg.log_level);
            let account_id = config::normalize_account_id(&account_id);
            let store = open_store(&cfg.zones)?;

            let account = store
                .find_account(&account_id)
                .await?
                .ok_or_else(|| AppError::NotFound(format!("account {account_id}")))?;
            let zones = store.zone_inventory().await?;
            let key = resolve(&instance_id, &region, &zone, &instance_type, &zones);
            let description_link = DescriptionIndex::new()
                .get_or_create(&key, &store)
                .await?;

            let record = store
                .create_resource(NewResource {
                    kind: ResourceKind::Instance,
                    account_id,
                    instance_id: Some(instance_id.trim().to_string()),
                    description_link,
                    endpoint_link: account.endpoint_link,
                    resource_pool_link: account.resource_pool_link,
                    parent_link: Some(account.link),
                    live: !not_live,
                })
                .await?;
            println!("{}", record.link);
        }
        Commands::Run {
            account_link,
            task,
            month,
            mock,
        } => {
            let billing_month = month
                .as_deref()
                .map(str::parse::<BillingMonth>)
                .transpose()?;
            ensure_initialized()?;
            let cfg = load_config()?;
            logging::init(&cfg.log_level);

            let store = open_store(&cfg.zones)?;
            let clients = ConfiguredClientFactory::new(
                cfg.report_source.clone(),
                reports_dir()?,
                cfg.request_timeout(),
            )?;
            let collector = TaskCollector::new(cfg.request_timeout())?;
            let service = CostStatsService::new(
                Arc::new(store),
                Arc::new(KeyringCredentials),
                Arc::new(clients),
                Arc::new(collector),
                cfg,
            );

            let request = StatsRequest {
                account_resource_reference: account_link,
                task_reference: task,
                next_stage_token: Uuid::new_v4().to_string(),
                is_mock_request: mock,
                billing_month,
            };
            match service.run(request).await {
                RunOutcome::Emitted { accounts, warnings } => {
                    eprintln!("Emitted stats for {accounts} account(s).");
                    for warning in warnings {
                        eprintln!("warning: {warning}");
                    }
                }
                RunOutcome::Skipped { reason } => {
                    eprintln!("Skipped: {reason}");
                }
                RunOutcome::Failed { stage, error } => {
                    eprintln!("Failed at {stage}.");
                    return Err(error);
                }
            }
        }
        Commands::Watermark { account_id } => {
            ensure_initialized()?;
            let cfg = load_config()?;
            let account_id = config::normalize_account_id(&account_id);
            let store = open_store(&cfg.zones)?;
            match store.get_watermark(&account_id).await? {
                Some(watermark) => {
                    let at = DateTime::<Utc>::from_timestamp_millis(
                        watermark.last_processed_bill_millis,
                    )
                    .map(|d| d.to_rfc3339())
                    .unwrap_or_default();
                    println!("{} {}", watermark.last_processed_bill_millis, at);
                }
                None => println!("No watermark recorded for account {account_id}."),
            }
        }
        Commands::BurnRate { csv } => {
            let file = std::fs::File::open(Path::new(&csv))?;
            let series = read_series(file)?;
            println!("Current burn rate: {}", format_rate(current_burn_rate(&series)));
            println!("Average burn rate: {}", format_rate(average_burn_rate(&series)));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_series_parses_rows() {
        let raw = "timestamp,value\n2024-01-01T00:00:00Z,1.0\n2024-01-01T02:00:00Z, 5.0\n";
        let series = read_series(raw.as_bytes()).expect("series");
        assert_eq!(series.len(), 2);
        assert_eq!(series[1].value, 5.0);
        assert_eq!(current_burn_rate(&series), Some(2.0));
    }

    #[test]
    fn read_series_rejects_bad_timestamps() {
        let err = read_series("timestamp,value\nyesterday,1.0\n".as_bytes())
            .expect_err("expected validation error");
        assert!(err.to_string().contains("Unsupported timestamp"));
    }

    #[test]
    fn format_rate_marks_missing_values() {
        assert_eq!(format_rate(None), "n/a");
        assert_eq!(format_rate(Some(2.0)), "2.000000 per hour");
    }
}
