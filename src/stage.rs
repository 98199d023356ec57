use serde::{Deserialize, Serialize};
use std::fmt;

/// Position of a stats run in its pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Stage {
    GetAccountDescription,
    GetParentAuth,
    GetCostingClient,
    QueryBillWatermark,
    ScheduleDownloadAndParse,
    QueryLocalInstances,
    QueryLinkedAccounts,
    AggregateAndEmitStats,
    UpdateWatermark,
    Done,
    Failed,
}

impl Stage {
    pub const FIRST: Stage = Stage::GetAccountDescription;

    /// Stage that follows this one on the happy path.
    pub fn next(self) -> Stage {
        match self {
            Stage::GetAccountDescription => Stage::GetParentAuth,
            Stage::GetParentAuth => Stage::GetCostingClient,
            Stage::GetCostingClient => Stage::QueryBillWatermark,
            Stage::QueryBillWatermark => Stage::ScheduleDownloadAndParse,
            Stage::ScheduleDownloadAndParse => Stage::QueryLocalInstances,
            Stage::QueryLocalInstances => Stage::QueryLinkedAccounts,
            Stage::QueryLinkedAccounts => Stage::AggregateAndEmitStats,
            Stage::AggregateAndEmitStats => Stage::UpdateWatermark,
            Stage::UpdateWatermark | Stage::Done => Stage::Done,
            Stage::Failed => Stage::Failed,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Stage::Done | Stage::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::GetAccountDescription => "GET_ACCOUNT_DESCRIPTION",
            Stage::GetParentAuth => "GET_PARENT_AUTH",
            Stage::GetCostingClient => "GET_COSTING_CLIENT",
            Stage::QueryBillWatermark => "QUERY_BILL_WATERMARK",
            Stage::ScheduleDownloadAndParse => "SCHEDULE_DOWNLOAD_AND_PARSE",
            Stage::QueryLocalInstances => "QUERY_LOCAL_INSTANCES",
            Stage::QueryLinkedAccounts => "QUERY_LINKED_ACCOUNTS",
            Stage::AggregateAndEmitStats => "AGGREGATE_AND_EMIT_STATS",
            Stage::UpdateWatermark => "UPDATE_WATERMARK",
            Stage::Done => "DONE",
            Stage::Failed => "FAILED",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
