use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;

use crate::endpoint::SqlDriver;
use crate::engine;
use crate::model::{Stage, TaskInfo};
use crate::resultset::{Checker, ValueAssertion};
use crate::storage::ResultStore;

pub const ASSERTION_RAW_BYTES: &str = "RawBytes";
pub const ASSERTION_FLOAT: &str = "Float";

const DEFAULT_FLOAT_DELTA: f64 = 1.0;
const DEFAULT_FLOAT_TYPE_NAMES: [&str; 3] = ["DECIMAL", "FLOAT", "DOUBLE"];

/// One test case: a run identity, per-key checkers, and the three script
/// stages. [`run`](crate::run::run) sequences implementations of this trait.
#[async_trait]
pub trait Case: Send + Sync {
    fn new_task(&self) -> TaskInfo;
    fn checkers(&self) -> &HashMap<String, Checker>;
    async fn setup(&self) -> anyhow::Result<()>;
    async fn test(&self, store: &ResultStore) -> anyhow::Result<()>;
    async fn teardown(&self) -> anyhow::Result<()>;
}

#[derive(Debug, Deserialize)]
struct RawCase {
    name: String,
    /// Opaque JSON, kept verbatim as bytes.
    #[serde(default)]
    meta: Option<Box<serde_json::value::RawValue>>,
    stages: RawStages,
    #[serde(default)]
    checkers: HashMap<String, RawChecker>,
}

#[derive(Debug, Deserialize)]
struct RawStages {
    #[serde(default)]
    setup: Vec<String>,
    #[serde(default)]
    test: Vec<String>,
    #[serde(default)]
    teardown: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RawChecker {
    check_schema: Option<bool>,
    check_precision: Option<bool>,
    fail_fast: Option<bool>,
    assertions: Option<Vec<RawAssertion>>,
}

#[derive(Debug, Deserialize)]
struct RawAssertion {
    name: String,
    delta: Option<f64>,
    columns: Option<Vec<usize>>,
}

fn resolve_checker(raw: RawChecker) -> anyhow::Result<Checker> {
    let mut checker = Checker {
        check_schema: raw.check_schema.unwrap_or(false),
        check_precision: raw.check_precision.unwrap_or(false),
        fail_fast: raw.fail_fast.unwrap_or(true),
        assertions: Vec::new(),
    };
    match raw.assertions {
        None => checker.assertions.push(ValueAssertion::RawBytes),
        Some(list) => {
            for a in list {
                match a.name.as_str() {
                    ASSERTION_RAW_BYTES => checker.assertions.push(ValueAssertion::RawBytes),
                    ASSERTION_FLOAT => {
                        let delta = a.delta.unwrap_or(DEFAULT_FLOAT_DELTA);
                        // An explicit column list (even an empty one)
                        // disables type-based availability.
                        let (columns, type_names) = match a.columns {
                            Some(columns) => (columns, Vec::new()),
                            None => (
                                Vec::new(),
                                DEFAULT_FLOAT_TYPE_NAMES
                                    .iter()
                                    .map(|s| s.to_string())
                                    .collect(),
                            ),
                        };
                        checker.assertions.push(ValueAssertion::FloatTolerance {
                            columns,
                            type_names,
                            delta,
                        });
                    }
                    other => bail!("unknown assertion: {other}"),
                }
            }
        }
    }
    Ok(checker)
}

/// A case loaded from a JSON file: scripts for each stage plus per-key
/// checker configuration. Stage script paths are resolved against the case
/// file's directory.
pub struct SqlCase {
    pub name: String,
    pub meta: Vec<u8>,
    pub dsns: Vec<String>,
    setup: Vec<PathBuf>,
    test: Vec<PathBuf>,
    teardown: Vec<PathBuf>,
    checkers: HashMap<String, Checker>,
    driver: Arc<dyn SqlDriver>,
}

impl fmt::Debug for SqlCase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqlCase")
            .field("name", &self.name)
            .field("meta", &self.meta)
            .field("dsns", &self.dsns)
            .field("setup", &self.setup)
            .field("test", &self.test)
            .field("teardown", &self.teardown)
            .field("checkers", &self.checkers)
            .finish()
    }
}

impl SqlCase {
    pub fn load(
        path: impl AsRef<Path>,
        dsns: Vec<String>,
        driver: Arc<dyn SqlDriver>,
    ) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read case file {}", path.display()))?;
        let raw: RawCase = serde_json::from_str(&text)
            .with_context(|| format!("parse case file {}", path.display()))?;
        if raw.stages.test.is_empty() {
            bail!("$.stages.test is required");
        }
        let home = path.parent().unwrap_or_else(|| Path::new("."));
        let resolve = |names: Vec<String>| names.iter().map(|n| home.join(n)).collect();
        let mut checkers = HashMap::new();
        for (key, raw_checker) in raw.checkers {
            let checker = resolve_checker(raw_checker)
                .with_context(|| format!("checker for key {key:?}"))?;
            checkers.insert(key, checker);
        }
        Ok(SqlCase {
            name: raw.name,
            meta: raw
                .meta
                .map(|v| v.get().as_bytes().to_vec())
                .unwrap_or_default(),
            dsns,
            setup: resolve(raw.stages.setup),
            test: resolve(raw.stages.test),
            teardown: resolve(raw.stages.teardown),
            checkers,
            driver,
        })
    }
}

#[async_trait]
impl Case for SqlCase {
    fn new_task(&self) -> TaskInfo {
        TaskInfo {
            id: uuid::Uuid::new_v4().to_string(),
            name: self.name.clone(),
            meta: self.meta.clone(),
            time: Utc::now(),
        }
    }

    fn checkers(&self) -> &HashMap<String, Checker> {
        &self.checkers
    }

    async fn setup(&self) -> anyhow::Result<()> {
        engine::run_stage(self.driver.clone(), Stage::Setup, &self.setup, &self.dsns, None).await
    }

    async fn test(&self, store: &ResultStore) -> anyhow::Result<()> {
        engine::run_stage(
            self.driver.clone(),
            Stage::Test,
            &self.test,
            &self.dsns,
            Some(store.clone()),
        )
        .await
    }

    async fn teardown(&self) -> anyhow::Result<()> {
        engine::run_stage(
            self.driver.clone(),
            Stage::Teardown,
            &self.teardown,
            &self.dsns,
            None,
        )
        .await
    }
}
