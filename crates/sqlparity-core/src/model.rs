use chrono::{DateTime, Utc};

use crate::resultset::ResultSet;

pub const STATE_OK: &str = "OK";
pub const STATE_FAIL: &str = "FAIL";

/// One phase of a case run. Setup, test and teardown execute scripts; the
/// check phase diffs stored results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Setup,
    Test,
    Check,
    Teardown,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Setup => "SETUP",
            Stage::Test => "TEST",
            Stage::Check => "CHECK",
            Stage::Teardown => "TEARDOWN",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of one run of one case. `id` is the primary key for every stored
/// artifact; the store's setup rule is "id wins, rest loaded".
#[derive(Debug, Clone)]
pub struct TaskInfo {
    pub id: String,
    pub name: String,
    pub meta: Vec<u8>,
    pub time: DateTime<Utc>,
}

/// Outcome of a single captured statement execution on one endpoint.
#[derive(Debug, Clone)]
pub struct QueryResult {
    pub time: DateTime<Utc>,
    pub duration: f64,
    pub key: String,
    pub sql: String,
    pub version: String,
    pub result_set: ResultSet,
}
