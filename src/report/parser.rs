//! Detailed-billing CSV parsing.
//!
//! Columns are located by header name. A report without the required headers
//! is rejected as a whole; an individual row that cannot be read is skipped
//! and reported as a [`ParseWarning`].

use crate::error::AppError;
use crate::models::{BillingMonth, CostCategory, CostLineItem};
use crate::report::ReportArtifact;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use csv::{ReaderBuilder, StringRecord, Trim};
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::str::FromStr;
use tracing::{debug, warn};

const LINKED_ACCOUNT_ID: &str = "LinkedAccountId";
const PAYER_ACCOUNT_ID: &str = "PayerAccountId";
const RECORD_TYPE: &str = "RecordType";
const PRODUCT_NAME: &str = "ProductName";
const USAGE_TYPE: &str = "UsageType";
const AVAILABILITY_ZONE: &str = "AvailabilityZone";
const RESERVED_INSTANCE: &str = "ReservedInstance";
const ITEM_DESCRIPTION: &str = "ItemDescription";
const USAGE_START_DATE: &str = "UsageStartDate";
const BLENDED_COST: &str = "BlendedCost";
const RESOURCE_ID: &str = "ResourceId";

const REQUIRED_COLUMNS: [&str; 4] = [
    LINKED_ACCOUNT_ID,
    PRODUCT_NAME,
    USAGE_START_DATE,
    BLENDED_COST,
];
const SUMMARY_RECORD_TYPES: [&str; 3] = ["AccountTotal", "StatementTotal", "InvoiceTotal"];
const UNATTRIBUTED_SERVICE: &str = "Other";
const USAGE_DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseWarning {
    pub line: u64,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InstanceDetail {
    pub instance_id: String,
    pub zone: Option<String>,
    pub instance_type: Option<String>,
    pub cost: Decimal,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AccountDetail {
    pub account_id: String,
    pub total_cost: Decimal,
    pub bill_processed_time_millis: i64,
    /// service code -> category -> cost; every category is present for a seen service.
    pub services: BTreeMap<String, BTreeMap<CostCategory, Decimal>>,
    pub instances: HashMap<String, InstanceDetail>,
    pub daily_costs: BTreeMap<NaiveDate, Decimal>,
}

impl AccountDetail {
    fn new(account_id: &str, bill_processed_time_millis: i64) -> Self {
        Self {
            account_id: account_id.to_string(),
            total_cost: Decimal::ZERO,
            bill_processed_time_millis,
            services: BTreeMap::new(),
            instances: HashMap::new(),
            daily_costs: BTreeMap::new(),
        }
    }

    pub fn service_cost(&self, service_code: &str, category: CostCategory) -> Decimal {
        self.services
            .get(service_code)
            .and_then(|by_category| by_category.get(&category))
            .copied()
            .unwrap_or(Decimal::ZERO)
    }

    /// Adds one line item to the running sums. Every sum is checked before any
    /// of them changes, so an overflowing item leaves the detail untouched.
    fn add(&mut self, item: &CostLineItem, month: BillingMonth) -> Result<(), String> {
        let day = item
            .usage_start
            .map(|ts| ts.date_naive())
            .unwrap_or_else(|| month.start().date_naive());
        let instance_id = item
            .resource_id
            .as_deref()
            .filter(|id| id.starts_with("i-"));

        let total = self.total_cost.checked_add(item.cost);
        let service = self
            .service_cost(&item.service_code, item.category)
            .checked_add(item.cost);
        let daily = self
            .daily_costs
            .get(&day)
            .copied()
            .unwrap_or(Decimal::ZERO)
            .checked_add(item.cost);
        let instance = match instance_id {
            Some(id) => self
                .instances
                .get(id)
                .map_or(Decimal::ZERO, |i| i.cost)
                .checked_add(item.cost),
            None => Some(Decimal::ZERO),
        };
        let (Some(total), Some(service), Some(daily), Some(instance)) =
            (total, service, daily, instance)
        else {
            return Err(format!(
                "cost {} overflows the totals of account {}",
                item.cost, self.account_id
            ));
        };

        self.total_cost = total;
        self.services
            .entry(item.service_code.clone())
            .or_insert_with(|| {
                CostCategory::ALL
                    .iter()
                    .map(|c| (*c, Decimal::ZERO))
                    .collect()
            })
            .insert(item.category, service);
        self.daily_costs.insert(day, daily);

        if let Some(instance_id) = instance_id {
            let detail = self
                .instances
                .entry(instance_id.to_string())
                .or_insert_with(|| InstanceDetail {
                    instance_id: instance_id.to_string(),
                    zone: None,
                    instance_type: None,
                    cost: Decimal::ZERO,
                });
            detail.cost = instance;
            if detail.zone.is_none() {
                detail.zone = item.zone.clone();
            }
            if detail.instance_type.is_none() {
                detail.instance_type = item.instance_type.clone();
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct ParsedReport {
    pub accounts: HashMap<String, AccountDetail>,
    pub warnings: Vec<ParseWarning>,
    pub bill_processed_time_millis: i64,
}

struct Columns {
    index: HashMap<String, usize>,
}

impl Columns {
    fn from_headers(headers: &StringRecord) -> Result<Self, AppError> {
        let index: HashMap<String, usize> = headers
            .iter()
            .enumerate()
            .map(|(i, h)| (h.trim().to_string(), i))
            .collect();

        let missing: Vec<&str> = REQUIRED_COLUMNS
            .iter()
            .copied()
            .filter(|c| !index.contains_key(*c))
            .collect();
        if !missing.is_empty() {
            return Err(AppError::ReportFormat(format!(
                "missing required columns: {}",
                missing.join(", ")
            )));
        }
        Ok(Self { index })
    }

    fn get<'r>(&self, record: &'r StringRecord, column: &str) -> &'r str {
        self.index
            .get(column)
            .and_then(|i| record.get(*i))
            .map(str::trim)
            .unwrap_or("")
    }
}

/// Removes all whitespace so the code can be embedded in a metric name.
pub fn normalize_service_code(product_name: &str) -> String {
    product_name.split_whitespace().collect()
}

fn parse_cost(raw: &str) -> Option<Decimal> {
    if raw.is_empty() {
        return None;
    }
    Decimal::from_str(raw)
        .or_else(|_| Decimal::from_scientific(raw))
        .ok()
}

fn parse_usage_start(raw: &str) -> Result<Option<DateTime<Utc>>, String> {
    if raw.is_empty() {
        return Ok(None);
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, USAGE_DATE_FORMAT) {
        return Ok(Some(naive.and_utc()));
    }
    DateTime::parse_from_rfc3339(raw)
        .map(|d| Some(d.with_timezone(&Utc)))
        .map_err(|_| format!("unparseable usage start date '{raw}'"))
}

fn instance_type_of(usage_type: &str) -> Option<String> {
    usage_type
        .rsplit_once(':')
        .map(|(_, t)| t.trim())
        .filter(|t| !t.is_empty())
        .map(str::to_string)
}

fn categorize(
    reserved: &str,
    usage_type: &str,
    resource_id: Option<&str>,
    usage_start: Option<DateTime<Utc>>,
) -> CostCategory {
    if reserved.eq_ignore_ascii_case("Y") && usage_type.contains("HeavyUsage") {
        CostCategory::ReservedRecurring
    } else if resource_id.is_some() {
        CostCategory::Resource
    } else if usage_start.is_none() {
        CostCategory::MonthlyOtherCost
    } else {
        CostCategory::OtherCost
    }
}

enum RowOutcome {
    Item(CostLineItem),
    Skip,
}

fn read_row(
    columns: &Columns,
    record: &StringRecord,
    month: BillingMonth,
    ignorable: &HashSet<&str>,
) -> Result<RowOutcome, String> {
    let record_type = columns.get(record, RECORD_TYPE);
    if SUMMARY_RECORD_TYPES
        .iter()
        .any(|t| t.eq_ignore_ascii_case(record_type))
    {
        return Ok(RowOutcome::Skip);
    }

    let description = columns.get(record, ITEM_DESCRIPTION);
    if ignorable.contains(description) {
        return Ok(RowOutcome::Skip);
    }

    let account_id = match columns.get(record, LINKED_ACCOUNT_ID) {
        "" => columns.get(record, PAYER_ACCOUNT_ID),
        linked => linked,
    };
    if account_id.is_empty() {
        return Err("row has no account id".into());
    }

    let raw_cost = columns.get(record, BLENDED_COST);
    let cost = parse_cost(raw_cost).ok_or_else(|| format!("unparseable cost '{raw_cost}'"))?;

    let usage_start = parse_usage_start(columns.get(record, USAGE_START_DATE))?;
    if let Some(ts) = usage_start {
        if !month.contains(ts) {
            return Ok(RowOutcome::Skip);
        }
    }

    let service_code = match normalize_service_code(columns.get(record, PRODUCT_NAME)) {
        code if code.is_empty() => UNATTRIBUTED_SERVICE.to_string(),
        code => code,
    };
    let resource_id = Some(columns.get(record, RESOURCE_ID))
        .filter(|id| !id.is_empty())
        .map(str::to_string);
    let usage_type = columns.get(record, USAGE_TYPE);
    let category = categorize(
        columns.get(record, RESERVED_INSTANCE),
        usage_type,
        resource_id.as_deref(),
        usage_start,
    );
    let zone = Some(columns.get(record, AVAILABILITY_ZONE))
        .filter(|z| !z.is_empty())
        .map(str::to_string);

    Ok(RowOutcome::Item(CostLineItem {
        account_id: account_id.to_string(),
        resource_id,
        service_code,
        cost,
        category,
        usage_start,
        zone,
        instance_type: instance_type_of(usage_type),
    }))
}

/// Reads the billed line items of `month` from a report body, each with the
/// line it was read from.
pub fn read_line_items(
    body: &[u8],
    month: BillingMonth,
    ignorable_descriptions: &[String],
) -> Result<(Vec<(u64, CostLineItem)>, Vec<ParseWarning>), AppError> {
    let mut reader = ReaderBuilder::new()
        .flexible(true)
        .trim(Trim::All)
        .from_reader(body);

    let headers = reader
        .headers()
        .map_err(|e| AppError::ReportFormat(format!("unreadable header row: {e}")))?
        .clone();
    if headers.is_empty() {
        return Err(AppError::ReportFormat("report has no header row".into()));
    }
    let columns = Columns::from_headers(&headers)?;
    let ignorable: HashSet<&str> = ignorable_descriptions.iter().map(String::as_str).collect();

    let mut items = Vec::new();
    let mut warnings = Vec::new();
    let mut skipped = 0usize;
    let mut record = StringRecord::new();
    loop {
        let line = reader.position().line();
        match reader.read_record(&mut record) {
            Ok(false) => break,
            Ok(true) => match read_row(&columns, &record, month, &ignorable) {
                Ok(RowOutcome::Item(item)) => items.push((line, item)),
                Ok(RowOutcome::Skip) => skipped += 1,
                Err(reason) => {
                    warn!(line, %reason, "skipping unreadable report row");
                    warnings.push(ParseWarning { line, reason });
                }
            },
            Err(e) => {
                let reason = e.to_string();
                warn!(line, %reason, "skipping malformed report row");
                warnings.push(ParseWarning { line, reason });
                if e.is_io_error() {
                    break;
                }
            }
        }
    }

    debug!(items = items.len(), skipped, warnings = warnings.len(), "read report rows");
    Ok((items, warnings))
}

/// Parses a downloaded report into per-account cost details for `month`.
pub fn parse_report(
    artifact: &ReportArtifact,
    month: BillingMonth,
    ignorable_descriptions: &[String],
) -> Result<ParsedReport, AppError> {
    let bill_processed_time_millis = artifact.metadata.generated_at.timestamp_millis();
    let (items, mut warnings) = read_line_items(&artifact.body, month, ignorable_descriptions)?;

    let mut accounts: HashMap<String, AccountDetail> = HashMap::new();
    for (line, item) in &items {
        let added = accounts
            .entry(item.account_id.clone())
            .or_insert_with(|| AccountDetail::new(&item.account_id, bill_processed_time_millis))
            .add(item, month);
        if let Err(reason) = added {
            warn!(line, %reason, "skipping report row");
            warnings.push(ParseWarning {
                line: *line,
                reason,
            });
        }
    }

    Ok(ParsedReport {
        accounts,
        warnings,
        bill_processed_time_millis,
    })
}
