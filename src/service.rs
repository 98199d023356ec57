use crate::burn_rate::{average_burn_rate, current_burn_rate};
use crate::collector::StatsCollector;
use crate::config::AppConfig;
use crate::credentials::{CredentialSource, Credentials};
use crate::error::AppError;
use crate::models::{
    service_metric_name, AccountCostSummary, BillingAccount, BillingMonth, CostCategory,
    ResourceDescriptionKey, ResourceKind, ResourceRecord, StatsRequest, StatsResponse,
    TaskFailure, UtilizationPoint, WatermarkClaim, AVERAGE_BURN_RATE, COST,
    CURRENT_BURN_RATE, DELETED_VM_COUNT, UNIT_COUNT, UNIT_USD, UNIT_USD_PER_HOUR,
};
use crate::reconciler::{reconcile, ReconcileOutcome};
use crate::report::parser::{parse_report, AccountDetail, ParsedReport};
use crate::report::{CostingClientFactory, ReportMetadata, ReportSource};
use crate::resolver::{resolve, resolve_instances, DescriptionIndex};
use crate::retry::with_retry;
use crate::stage::Stage;
use crate::storage::ResourceStore;
use chrono::NaiveDate;
use dashmap::DashMap;
use futures::future::{join_all, try_join_all};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug)]
pub enum RunOutcome {
    Emitted {
        accounts: usize,
        warnings: Vec<String>,
    },
    /// Nothing new to report; an empty stats message was still sent.
    Skipped { reason: String },
    Failed { stage: Stage, error: AppError },
}

enum Step {
    Continue,
    Skip(String),
}

/// State carried from one stage to the next within a single run.
struct RunContext {
    run_id: String,
    month: BillingMonth,
    primary: Option<ResourceRecord>,
    credentials: Option<Credentials>,
    source: Option<Arc<dyn ReportSource>>,
    watermark_guard: Option<OwnedMutexGuard<()>>,
    claim: Option<WatermarkClaim>,
    report: Option<ReportMetadata>,
    parsed: Option<ParsedReport>,
    /// billed instance id -> local record
    instances: HashMap<String, ResourceRecord>,
    /// account id -> local instance records
    local_instances: HashMap<String, Vec<ResourceRecord>>,
    /// account id -> account, primary included
    accounts: HashMap<String, BillingAccount>,
    descriptions: DescriptionIndex,
    emitted_accounts: usize,
    warnings: Vec<String>,
}

impl RunContext {
    fn new(month: BillingMonth) -> Self {
        Self {
            run_id: Uuid::new_v4().to_string(),
            month,
            primary: None,
            credentials: None,
            source: None,
            watermark_guard: None,
            claim: None,
            report: None,
            parsed: None,
            instances: HashMap::new(),
            local_instances: HashMap::new(),
            accounts: HashMap::new(),
            descriptions: DescriptionIndex::new(),
            emitted_accounts: 0,
            warnings: Vec::new(),
        }
    }
}

fn required<'a, T>(value: &'a Option<T>, what: &str) -> Result<&'a T, AppError> {
    value
        .as_ref()
        .ok_or_else(|| AppError::NotFound(format!("{what} for this run")))
}

pub struct CostStatsService {
    store: Arc<dyn ResourceStore>,
    credentials: Arc<dyn CredentialSource>,
    clients: Arc<dyn CostingClientFactory>,
    collector: Arc<dyn StatsCollector>,
    config: AppConfig,
    watermark_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl CostStatsService {
    pub fn new(
        store: Arc<dyn ResourceStore>,
        credentials: Arc<dyn CredentialSource>,
        clients: Arc<dyn CostingClientFactory>,
        collector: Arc<dyn StatsCollector>,
        config: AppConfig,
    ) -> Self {
        Self {
            store,
            credentials,
            clients,
            collector,
            config,
            watermark_locks: DashMap::new(),
        }
    }

    /// Runs every stage for one request. The requester always receives either
    /// a stats message or a failure notification at its task reference.
    pub async fn run(&self, request: StatsRequest) -> RunOutcome {
        if request.is_mock_request {
            info!(task_reference = %request.task_reference, "mock request, sending empty stats");
            return match self.emit(&request, Vec::new(), Vec::new()).await {
                Ok(()) => RunOutcome::Skipped {
                    reason: "mock request".into(),
                },
                Err(error) => self.fail(&request, Stage::FIRST, error).await,
            };
        }

        let month = request.billing_month.unwrap_or_else(BillingMonth::current);
        let mut ctx = RunContext::new(month);
        let mut stage = Stage::FIRST;
        while !stage.is_terminal() {
            debug!(
                stage = %stage,
                account = %request.account_resource_reference,
                "entering stage"
            );
            match self.execute(stage, &request, &mut ctx).await {
                Ok(Step::Continue) => stage = stage.next(),
                Ok(Step::Skip(reason)) => {
                    info!(stage = %stage, %reason, "nothing new to process");
                    self.release_claim(&mut ctx).await;
                    return match self.emit(&request, Vec::new(), Vec::new()).await {
                        Ok(()) => RunOutcome::Skipped { reason },
                        Err(error) => self.fail(&request, stage, error).await,
                    };
                }
                Err(error) => {
                    self.release_claim(&mut ctx).await;
                    return self.fail(&request, stage, error).await;
                }
            }
        }

        info!(
            month = %ctx.month,
            accounts = ctx.emitted_accounts,
            warnings = ctx.warnings.len(),
            "stats run complete"
        );
        RunOutcome::Emitted {
            accounts: ctx.emitted_accounts,
            warnings: ctx.warnings,
        }
    }

    async fn execute(
        &self,
        stage: Stage,
        request: &StatsRequest,
        ctx: &mut RunContext,
    ) -> Result<Step, AppError> {
        match stage {
            Stage::GetAccountDescription => {
                self.load_primary(&request.account_resource_reference, ctx)
                    .await
            }
            Stage::GetParentAuth => self.load_credentials(ctx).await,
            Stage::GetCostingClient => {
                ctx.source = Some(self.clients.create(ctx.credentials.as_ref())?);
                Ok(Step::Continue)
            }
            Stage::QueryBillWatermark => self.check_watermark(ctx).await,
            Stage::ScheduleDownloadAndParse => self.download_and_parse(ctx).await,
            Stage::QueryLocalInstances => self.query_local_instances(ctx).await,
            Stage::QueryLinkedAccounts => self.query_linked_accounts(ctx).await,
            Stage::AggregateAndEmitStats => self.aggregate_and_emit(request, ctx).await,
            Stage::UpdateWatermark => self.update_watermark(ctx).await,
            Stage::Done | Stage::Failed => Ok(Step::Continue),
        }
    }

    async fn retried<T, F, Fut>(&self, operation: &str, make_call: F) -> Result<T, AppError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, AppError>>,
    {
        with_retry(
            &self.config.retry,
            self.config.request_timeout(),
            operation,
            make_call,
        )
        .await
    }

    fn watermark_lock(&self, account_id: &str) -> Arc<Mutex<()>> {
        self.watermark_locks
            .entry(account_id.to_string())
            .or_default()
            .clone()
    }

    async fn release_claim(&self, ctx: &mut RunContext) {
        let Some(claim) = ctx.claim.take() else {
            return;
        };
        if let Err(error) = self
            .retried("release_watermark_claim", || {
                self.store.release_watermark_claim(&claim)
            })
            .await
        {
            warn!(
                account_id = %claim.account_id,
                error = %error,
                "could not release report claim; it lapses with its lease"
            );
        }
    }

    async fn load_primary(&self, link: &str, ctx: &mut RunContext) -> Result<Step, AppError> {
        let record = self
            .retried("get_resource", || self.store.get_resource(link))
            .await?
            .ok_or_else(|| AppError::NotFound(format!("compute resource {link}")))?;
        if record.kind != ResourceKind::Account {
            return Err(AppError::Config(format!(
                "{link} is not a billing account resource"
            )));
        }

        let description = self
            .retried("get_description", || {
                self.store.get_description(&record.description_link)
            })
            .await?
            .ok_or_else(|| AppError::NotFound(format!("description {}", record.description_link)))?;

        debug!(
            account_id = %record.account_id,
            description = %description.link,
            "loaded primary account"
        );
        ctx.primary = Some(record);
        Ok(Step::Continue)
    }

    async fn load_credentials(&self, ctx: &mut RunContext) -> Result<Step, AppError> {
        let account_id = required(&ctx.primary, "primary account")?.account_id.clone();
        let credentials = self
            .retried("get_credentials", || self.credentials.credentials(&account_id))
            .await?;
        if credentials.is_none() {
            debug!(account_id = %account_id, "no stored credentials for account");
        }
        ctx.credentials = credentials;
        Ok(Step::Continue)
    }

    async fn check_watermark(&self, ctx: &mut RunContext) -> Result<Step, AppError> {
        let account_id = required(&ctx.primary, "primary account")?.account_id.clone();
        let source = required(&ctx.source, "report client")?.clone();
        let month = ctx.month;

        // Serializes runs within this process; the store claim below covers
        // runs in other processes. Held until the watermark is advanced or the
        // run ends.
        ctx.watermark_guard = Some(self.watermark_lock(&account_id).lock_owned().await);

        let watermark = self
            .retried("get_watermark", || self.store.get_watermark(&account_id))
            .await?;
        let Some(report) = self
            .retried("latest_report", || source.latest_report(&account_id, month))
            .await?
        else {
            return Ok(Step::Skip(format!(
                "no report published for account {account_id} in {month}"
            )));
        };

        let generated_millis = report.generated_at.timestamp_millis();
        if let Some(watermark) = watermark.filter(|w| w.is_stale(generated_millis)) {
            return Ok(Step::Skip(format!(
                "report generated at {} is not newer than watermark {}",
                report.generated_at.to_rfc3339(),
                watermark.last_processed_bill_millis
            )));
        }

        let claim = WatermarkClaim {
            account_id: account_id.clone(),
            bill_millis: generated_millis,
            run_id: ctx.run_id.clone(),
        };
        let lease = self.config.claim_lease();
        let claimed = self
            .retried("claim_watermark", || self.store.claim_watermark(&claim, lease))
            .await?;
        if !claimed {
            return Ok(Step::Skip(format!(
                "report generated at {} is processed or claimed by another run",
                report.generated_at.to_rfc3339()
            )));
        }
        ctx.claim = Some(claim);

        debug!(
            source = source.name(),
            location = %report.location,
            generated_millis,
            run_id = %ctx.run_id,
            "claimed unprocessed report"
        );
        ctx.report = Some(report);
        Ok(Step::Continue)
    }

    async fn download_and_parse(&self, ctx: &mut RunContext) -> Result<Step, AppError> {
        let source = required(&ctx.source, "report client")?.clone();
        let report = required(&ctx.report, "report metadata")?.clone();

        let artifact = self
            .retried("download_report", || source.download(&report))
            .await?;
        let parsed = parse_report(
            &artifact,
            ctx.month,
            &self.config.ignorable_item_descriptions,
        )?;

        info!(
            accounts = parsed.accounts.len(),
            bill_processed_time_millis = parsed.bill_processed_time_millis,
            bytes = artifact.body.len(),
            skipped_rows = parsed.warnings.len(),
            "parsed report"
        );
        ctx.warnings.extend(
            parsed
                .warnings
                .iter()
                .map(|w| format!("report line {}: {}", w.line, w.reason)),
        );
        ctx.parsed = Some(parsed);
        Ok(Step::Continue)
    }

    async fn list_local_instances(
        &self,
        account_ids: &[String],
    ) -> Result<HashMap<String, Vec<ResourceRecord>>, AppError> {
        let listed = try_join_all(account_ids.iter().map(|id| async move {
            let records = self.store.list_instances(id).await?;
            Ok::<_, AppError>((id.clone(), records))
        }))
        .await?;
        Ok(listed.into_iter().collect())
    }

    async fn query_local_instances(&self, ctx: &mut RunContext) -> Result<Step, AppError> {
        let parsed = required(&ctx.parsed, "parsed report")?;
        let account_ids: Vec<String> = parsed.accounts.keys().cloned().collect();
        let billed: Vec<_> = parsed
            .accounts
            .values()
            .flat_map(|detail| detail.instances.values().cloned())
            .collect();
        let billed_ids: Vec<String> = billed
            .iter()
            .map(|i| i.instance_id.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let resolution = self
            .retried("resolve_instances", || {
                resolve_instances(self.store.as_ref(), &billed_ids)
            })
            .await?;
        for id in &resolution.unresolved {
            warn!(instance_id = %id, "billed instance not in local inventory");
            ctx.warnings
                .push(format!("instance {id} is not in the local inventory"));
        }
        ctx.instances = resolution.resolved;

        let zones = self
            .retried("zone_inventory", || self.store.zone_inventory())
            .await?;
        let keys: BTreeSet<ResourceDescriptionKey> = billed
            .iter()
            .filter_map(|i| {
                let zone = i.zone.as_deref()?;
                let instance_type = i.instance_type.as_deref()?;
                Some(resolve(&i.instance_id, "", zone, instance_type, &zones))
            })
            .collect();
        let store = self.store.as_ref();
        let timeout = self.config.request_timeout();
        tokio::time::timeout(
            timeout,
            try_join_all(
                keys.iter()
                    .map(|key| ctx.descriptions.get_or_create(key, store)),
            ),
        )
        .await
        .map_err(|_| AppError::Timeout {
            operation: "ensure_descriptions".into(),
            secs: timeout.as_secs(),
        })??;

        ctx.local_instances = self
            .retried("list_instances", || self.list_local_instances(&account_ids))
            .await?;

        debug!(
            billed = billed_ids.len(),
            resolved = ctx.instances.len(),
            descriptions = ctx.descriptions.len(),
            "resolved billed instances"
        );
        Ok(Step::Continue)
    }

    async fn query_linked_accounts(&self, ctx: &mut RunContext) -> Result<Step, AppError> {
        let primary = required(&ctx.primary, "primary account")?.clone();
        let linked = self
            .retried("list_linked_accounts", || {
                self.store.list_linked_accounts(&primary.link)
            })
            .await?;

        ctx.accounts.insert(
            primary.account_id.clone(),
            BillingAccount {
                account_id: primary.account_id.clone(),
                compute_link: primary.link.clone(),
                parent_account_id: None,
            },
        );
        for record in linked {
            ctx.accounts
                .insert(record.account_id.clone(), linked_account(&primary, record));
        }

        let parsed = required(&ctx.parsed, "parsed report")?;
        let mut missing: Vec<String> = parsed
            .accounts
            .keys()
            .filter(|id| !ctx.accounts.contains_key(*id))
            .cloned()
            .collect();
        if missing.is_empty() {
            return Ok(Step::Continue);
        }
        missing.sort();

        let timeout = self.config.request_timeout();
        let outcome = tokio::time::timeout(
            timeout,
            reconcile(self.store.as_ref(), &primary, &missing),
        )
        .await
        .map_err(|_| AppError::Timeout {
            operation: "reconcile_linked_accounts".into(),
            secs: timeout.as_secs(),
        })?;

        let mostly_failed = outcome.mostly_failed();
        let ReconcileOutcome {
            created,
            skipped,
            mut failures,
        } = outcome;
        if mostly_failed && !failures.is_empty() {
            warn!(
                failed = failures.len(),
                created = created.len(),
                "most linked account creations failed"
            );
            return Err(failures.swap_remove(0));
        }

        info!(
            created = created.len(),
            existing = skipped.len(),
            failed = failures.len(),
            "reconciled linked accounts"
        );
        for record in created.into_iter().chain(skipped) {
            ctx.accounts
                .insert(record.account_id.clone(), linked_account(&primary, record));
        }
        ctx.warnings
            .extend(failures.into_iter().map(|e| e.to_string()));
        Ok(Step::Continue)
    }

    async fn aggregate_and_emit(
        &self,
        request: &StatsRequest,
        ctx: &mut RunContext,
    ) -> Result<Step, AppError> {
        let parsed = required(&ctx.parsed, "parsed report")?;
        let mut details: Vec<&AccountDetail> = parsed.accounts.values().collect();
        details.sort_by(|a, b| a.account_id.cmp(&b.account_id));

        let mut unattributed = Vec::new();
        let mut jobs = Vec::new();
        for detail in details {
            match ctx.accounts.get(&detail.account_id) {
                Some(account) => jobs.push((account, detail)),
                None => unattributed.push(detail.account_id.clone()),
            }
        }
        let accounts = jobs.len();

        let local_instances = &ctx.local_instances;
        let instances = &ctx.instances;
        let bundles = join_all(jobs.into_iter().map(|(account, detail)| async move {
            let local = local_instances
                .get(&detail.account_id)
                .map(Vec::as_slice)
                .unwrap_or_default();
            let mut bundle = vec![account_stats(account, detail, local)];
            bundle.extend(instance_stats(detail, instances));
            bundle
        }))
        .await;
        let stats_list: Vec<AccountCostSummary> = bundles.into_iter().flatten().collect();

        for account_id in unattributed {
            warn!(account_id = %account_id, "no account record, costs not emitted");
            ctx.warnings
                .push(format!("account {account_id} has no resource record"));
        }

        self.emit(request, stats_list, ctx.warnings.clone()).await?;
        ctx.emitted_accounts = accounts;
        Ok(Step::Continue)
    }

    async fn update_watermark(&self, ctx: &mut RunContext) -> Result<Step, AppError> {
        let account_id = required(&ctx.primary, "primary account")?.account_id.clone();
        let bill_millis = required(&ctx.report, "report metadata")?
            .generated_at
            .timestamp_millis();

        // Stats are already delivered: no failure message from here on.
        match self
            .retried("advance_watermark", || {
                self.store.advance_watermark(&account_id, bill_millis)
            })
            .await
        {
            Ok(watermark) => info!(
                account_id = %account_id,
                watermark = watermark.last_processed_bill_millis,
                "watermark advanced"
            ),
            Err(error) => {
                warn!(account_id = %account_id, error = %error, "could not advance watermark");
                ctx.warnings.push(format!(
                    "watermark for account {account_id} not advanced: {error}"
                ));
            }
        }
        self.release_claim(ctx).await;
        // release the per-account lock
        ctx.watermark_guard.take();
        Ok(Step::Continue)
    }

    async fn emit(
        &self,
        request: &StatsRequest,
        stats_list: Vec<AccountCostSummary>,
        warnings: Vec<String>,
    ) -> Result<(), AppError> {
        let response = StatsResponse {
            stats_adapter_reference: self.config.adapter_reference.clone(),
            task_stage_token: request.next_stage_token.clone(),
            stats_list,
            warnings,
        };
        self.retried("send_stats", || {
            self.collector
                .send_stats(&request.task_reference, &response)
        })
        .await
    }

    async fn fail(&self, request: &StatsRequest, stage: Stage, error: AppError) -> RunOutcome {
        error!(stage = %stage, error = %error, "stats run failed");
        let failure = TaskFailure {
            task_stage: stage.to_string(),
            failure_message: error.to_string(),
        };
        if let Err(send_error) = self
            .retried("send_failure", || {
                self.collector
                    .send_failure(&request.task_reference, &failure)
            })
            .await
        {
            error!(error = %send_error, "could not deliver failure notification");
        }
        RunOutcome::Failed { stage, error }
    }
}

fn linked_account(primary: &ResourceRecord, record: ResourceRecord) -> BillingAccount {
    BillingAccount {
        parent_account_id: (record.account_id != primary.account_id)
            .then(|| primary.account_id.clone()),
        account_id: record.account_id,
        compute_link: record.link,
    }
}

fn to_f64(value: Decimal) -> f64 {
    value.to_f64().unwrap_or_default()
}

/// Local instances of the account that are gone from the bill and no longer live.
fn deleted_count(detail: &AccountDetail, local: &[ResourceRecord]) -> usize {
    local
        .iter()
        .filter(|r| !r.live)
        .filter(|r| {
            r.instance_id
                .as_deref()
                .map_or(true, |id| !detail.instances.contains_key(id))
        })
        .count()
}

/// Running cost total sampled at the end of each billed day.
fn cumulative_cost_series(daily_costs: &BTreeMap<NaiveDate, Decimal>) -> Vec<UtilizationPoint> {
    let mut running = Decimal::ZERO;
    daily_costs
        .iter()
        .filter_map(|(day, cost)| {
            running += *cost;
            let end_of_day = day.succ_opt()?.and_hms_opt(0, 0, 0)?.and_utc();
            Some(UtilizationPoint {
                value: to_f64(running),
                timestamp: end_of_day,
            })
        })
        .collect()
}

fn account_stats(
    account: &BillingAccount,
    detail: &AccountDetail,
    local: &[ResourceRecord],
) -> AccountCostSummary {
    let ts = detail.bill_processed_time_millis * 1_000;
    let mut stats = AccountCostSummary::new(account.compute_link.clone());
    stats.push(COST, to_f64(detail.total_cost), UNIT_USD, ts);
    stats.push(
        DELETED_VM_COUNT,
        deleted_count(detail, local) as f64,
        UNIT_COUNT,
        ts,
    );

    for service_code in detail.services.keys() {
        for category in CostCategory::ALL {
            stats.push(
                service_metric_name(service_code, category),
                to_f64(detail.service_cost(service_code, category)),
                UNIT_USD,
                ts,
            );
        }
    }

    let series = cumulative_cost_series(&detail.daily_costs);
    if let Some(rate) = current_burn_rate(&series) {
        stats.push(CURRENT_BURN_RATE, rate, UNIT_USD_PER_HOUR, ts);
    }
    if let Some(rate) = average_burn_rate(&series) {
        stats.push(AVERAGE_BURN_RATE, rate, UNIT_USD_PER_HOUR, ts);
    }
    stats
}

fn instance_stats(
    detail: &AccountDetail,
    resolved: &HashMap<String, ResourceRecord>,
) -> Vec<AccountCostSummary> {
    let ts = detail.bill_processed_time_millis * 1_000;
    let mut billed: Vec<_> = detail.instances.values().collect();
    billed.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
    billed
        .into_iter()
        .filter_map(|instance| {
            let record = resolved.get(&instance.instance_id)?;
            let mut stats = AccountCostSummary::new(record.link.clone());
            stats.push(COST, to_f64(instance.cost), UNIT_USD, ts);
            Some(stats)
        })
        .collect()
}
