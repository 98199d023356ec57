use crate::error::AppError;
use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

pub const COST: &str = "Cost";
pub const DELETED_VM_COUNT: &str = "DeletedVmCount";
pub const CURRENT_BURN_RATE: &str = "CurrentBurnRatePerHour";
pub const AVERAGE_BURN_RATE: &str = "AverageBurnRatePerHour";

pub const UNIT_USD: &str = "USD";
pub const UNIT_COUNT: &str = "Count";
pub const UNIT_USD_PER_HOUR: &str = "USD/hour";

pub const COMPUTE_LINK_PREFIX: &str = "/resources/compute";
pub const DESCRIPTION_LINK_PREFIX: &str = "/resources/compute-descriptions";

/// Calendar month a cost report covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BillingMonth {
    pub year: i32,
    pub month: u32,
}

impl BillingMonth {
    pub fn new(year: i32, month: u32) -> Result<Self, AppError> {
        if !(1..=12).contains(&month) {
            return Err(AppError::Config(format!("invalid billing month {month}")));
        }
        Ok(Self { year, month })
    }

    pub fn of(ts: DateTime<Utc>) -> Self {
        Self {
            year: ts.year(),
            month: ts.month(),
        }
    }

    pub fn current() -> Self {
        Self::of(Utc::now())
    }

    pub fn start(self) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(self.year, self.month, 1, 0, 0, 0)
            .single()
            .unwrap_or_default()
    }

    pub fn next(self) -> Self {
        if self.month == 12 {
            Self {
                year: self.year + 1,
                month: 1,
            }
        } else {
            Self {
                year: self.year,
                month: self.month + 1,
            }
        }
    }

    pub fn contains(self, ts: DateTime<Utc>) -> bool {
        ts >= self.start() && ts < self.next().start()
    }
}

impl fmt::Display for BillingMonth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

impl FromStr for BillingMonth {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parsed = NaiveDate::parse_from_str(&format!("{}-01", s.trim()), "%Y-%m-%d")
            .map_err(|_| AppError::Config(format!("Unsupported month '{s}'. Use YYYY-MM.")))?;
        Self::new(parsed.year(), parsed.month())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CostCategory {
    Resource,
    OtherCost,
    MonthlyOtherCost,
    ReservedRecurring,
}

impl CostCategory {
    pub const ALL: [CostCategory; 4] = [
        CostCategory::Resource,
        CostCategory::OtherCost,
        CostCategory::MonthlyOtherCost,
        CostCategory::ReservedRecurring,
    ];

    pub fn metric_suffix(self) -> &'static str {
        match self {
            CostCategory::Resource => "ResourceCost",
            CostCategory::OtherCost => "OtherCost",
            CostCategory::MonthlyOtherCost => "MonthlyOtherCost",
            CostCategory::ReservedRecurring => "ReservedRecurringCost",
        }
    }
}

pub fn service_metric_name(service_code: &str, category: CostCategory) -> String {
    format!("Service.{service_code}.{}", category.metric_suffix())
}

/// One billed line of a cost report.
#[derive(Debug, Clone, PartialEq)]
pub struct CostLineItem {
    pub account_id: String,
    pub resource_id: Option<String>,
    pub service_code: String,
    pub cost: Decimal,
    pub category: CostCategory,
    pub usage_start: Option<DateTime<Utc>>,
    pub zone: Option<String>,
    pub instance_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceDescriptionKey {
    pub region_id: String,
    pub zone_id: String,
    pub instance_type: String,
}

impl fmt::Display for ResourceDescriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.region_id, self.zone_id, self.instance_type)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourceKind {
    Account,
    Instance,
}

impl ResourceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ResourceKind::Account => "account",
            ResourceKind::Instance => "instance",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "account" => Some(ResourceKind::Account),
            "instance" => Some(ResourceKind::Instance),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRecord {
    pub link: String,
    pub kind: ResourceKind,
    pub account_id: String,
    pub instance_id: Option<String>,
    pub description_link: String,
    pub endpoint_link: String,
    pub resource_pool_link: Option<String>,
    pub parent_link: Option<String>,
    pub live: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewResource {
    pub kind: ResourceKind,
    pub account_id: String,
    pub instance_id: Option<String>,
    pub description_link: String,
    pub endpoint_link: String,
    pub resource_pool_link: Option<String>,
    pub parent_link: Option<String>,
    pub live: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DescriptionRecord {
    pub link: String,
    pub account_id: Option<String>,
    pub endpoint_link: Option<String>,
    pub region_id: String,
    pub zone_id: String,
    pub instance_type: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct NewDescription {
    pub account_id: Option<String>,
    pub endpoint_link: Option<String>,
    pub region_id: String,
    pub zone_id: String,
    pub instance_type: String,
}

impl NewDescription {
    pub fn from_key(key: &ResourceDescriptionKey) -> Self {
        Self {
            region_id: key.region_id.clone(),
            zone_id: key.zone_id.clone(),
            instance_type: key.instance_type.clone(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillingAccount {
    pub account_id: String,
    pub compute_link: String,
    pub parent_account_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BillingWatermark {
    pub last_processed_bill_millis: i64,
}

impl BillingWatermark {
    pub fn is_stale(self, report_generated_millis: i64) -> bool {
        report_generated_millis <= self.last_processed_bill_millis
    }
}

/// A run's hold on processing the report generated at `bill_millis`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatermarkClaim {
    pub account_id: String,
    pub bill_millis: i64,
    pub run_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatSample {
    pub value: f64,
    pub unit: String,
    /// Microseconds since the Unix epoch.
    pub timestamp: i64,
}

/// Stats bundle for one compute resource, either an account or an instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountCostSummary {
    pub account_resource_reference: String,
    pub stat_values: BTreeMap<String, Vec<StatSample>>,
}

impl AccountCostSummary {
    pub fn new(reference: impl Into<String>) -> Self {
        Self {
            account_resource_reference: reference.into(),
            stat_values: BTreeMap::new(),
        }
    }

    pub fn push(&mut self, metric: impl Into<String>, value: f64, unit: &str, timestamp: i64) {
        self.stat_values
            .entry(metric.into())
            .or_default()
            .push(StatSample {
                value,
                unit: unit.to_string(),
                timestamp,
            });
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsRequest {
    pub account_resource_reference: String,
    pub task_reference: String,
    pub next_stage_token: String,
    #[serde(default)]
    pub is_mock_request: bool,
    #[serde(default)]
    pub billing_month: Option<BillingMonth>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsResponse {
    pub stats_adapter_reference: String,
    pub task_stage_token: String,
    pub stats_list: Vec<AccountCostSummary>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskFailure {
    pub task_stage: String,
    pub failure_message: String,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UtilizationPoint {
    pub value: f64,
    pub timestamp: DateTime<Utc>,
}
