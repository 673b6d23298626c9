use std::collections::HashMap;

use regex::Regex;
use tracing::warn;

use crate::case::Case;
use crate::model::{Stage, TaskInfo, STATE_FAIL, STATE_OK};
use crate::resultset::{Checker, DiffError};
use crate::storage::{ResultStore, StoreError};

/// When to apply [`GlobalChecker`]s during the check phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GlobalCheckMode {
    /// Never.
    #[default]
    None,
    /// Only for keys no per-key checker already examined.
    IfUnchecked,
    /// For every stored key, re-examining already-checked ones.
    Always,
}

/// A checker bound to a key predicate; the first available one wins.
pub struct GlobalChecker {
    filter: Box<dyn Fn(&str) -> bool + Send + Sync>,
    checker: Checker,
}

impl GlobalChecker {
    pub fn new(
        filter: impl Fn(&str) -> bool + Send + Sync + 'static,
        checker: Checker,
    ) -> Self {
        GlobalChecker {
            filter: Box::new(filter),
            checker,
        }
    }

    /// Binds `checker` to keys matching `pattern`. An invalid pattern yields
    /// a checker that never matches.
    pub fn match_regex(pattern: &str, checker: Checker) -> Self {
        match Regex::new(pattern) {
            Ok(re) => Self::new(move |key| re.is_match(key), checker),
            Err(e) => {
                warn!(pattern = %pattern, error = %e, "invalid global checker pattern");
                Self::new(|_| false, checker)
            }
        }
    }

    pub fn available(&self, key: &str) -> bool {
        (self.filter)(key)
    }

    pub fn checker(&self) -> &Checker {
        &self.checker
    }
}

#[derive(Default)]
pub struct RunOptions {
    pub global_check_mode: GlobalCheckMode,
    pub global_checkers: Vec<GlobalChecker>,
}

/// Aggregated outcome of a failed run. `exec_err` is set for the failing
/// script stage only; check-phase failures accumulate in the diff and store
/// lists without short-circuiting across keys.
#[derive(Debug)]
pub struct RunErrors {
    pub info: TaskInfo,
    pub stage: Stage,
    pub exec_err: Option<anyhow::Error>,
    pub diff_keys: Vec<String>,
    pub diff_errs: Vec<DiffError>,
    pub store_errs: Vec<StoreError>,
}

impl RunErrors {
    fn new(info: TaskInfo) -> Self {
        RunErrors {
            info,
            stage: Stage::Setup,
            exec_err: None,
            diff_keys: Vec::new(),
            diff_errs: Vec::new(),
            store_errs: Vec::new(),
        }
    }

    pub fn no_error(&self) -> bool {
        self.exec_err.is_none() && self.diff_errs.is_empty() && self.store_errs.is_empty()
    }
}

impl std::fmt::Display for RunErrors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}:{}:{}] ", self.info.id, self.info.name, self.stage)?;
        match &self.exec_err {
            Some(e) => write!(f, "{e:#}"),
            None => write!(
                f,
                "there are {} diff errors and {} store errors",
                self.diff_errs.len(),
                self.store_errs.len()
            ),
        }
    }
}

impl std::error::Error for RunErrors {}

/// Runs one case end to end: store setup, case setup, test, check phase,
/// then teardown regardless of earlier failures (teardown errors are logged
/// and never override an existing one).
pub async fn run(
    case: &dyn Case,
    store: &ResultStore,
    opts: RunOptions,
) -> Result<(), RunErrors> {
    let info = case.new_task();
    let mut errs = RunErrors::new(info.clone());
    if let Err(e) = store.setup(info) {
        errs.exec_err = Some(e.into());
        return Err(errs);
    }
    if let Err(e) = case.setup().await {
        errs.exec_err = Some(e);
        run_teardown(case).await;
        return Err(errs);
    }

    errs.stage = Stage::Test;
    if let Err(e) = case.test(store).await {
        errs.exec_err = Some(e);
        run_teardown(case).await;
        return Err(errs);
    }

    errs.stage = Stage::Check;
    let mut checked: HashMap<String, bool> = HashMap::new();
    for (key, checker) in case.checkers() {
        checked.insert(key.clone(), check_key(store, key, checker, &mut errs));
    }

    if errs.no_error()
        && opts.global_check_mode != GlobalCheckMode::None
        && !opts.global_checkers.is_empty()
    {
        match store.keys() {
            Err(e) => errs.store_errs.push(e),
            Ok(keys) => {
                for key in keys {
                    let already = checked.get(&key).copied().unwrap_or(false);
                    if already && opts.global_check_mode != GlobalCheckMode::Always {
                        continue;
                    }
                    for gc in &opts.global_checkers {
                        if gc.available(&key) {
                            let done = check_key(store, &key, gc.checker(), &mut errs);
                            checked.insert(key, done);
                            break;
                        }
                    }
                }
            }
        }
    }

    run_teardown(case).await;
    if errs.no_error() {
        Ok(())
    } else {
        Err(errs)
    }
}

/// Diffs the first stored result for `key` against every later one, marking
/// the key OK or FAIL. Returns false only when the key could not be read.
fn check_key(store: &ResultStore, key: &str, checker: &Checker, errs: &mut RunErrors) -> bool {
    let results = match store.read(key) {
        Ok(r) => r,
        Err(e) => {
            errs.store_errs.push(e);
            return false;
        }
    };
    if results.len() <= 1 {
        return true;
    }
    let mut state = STATE_OK;
    let first = &results[0];
    for other in &results[1..] {
        if let Err(e) = checker.diff(&first.result_set, &other.result_set) {
            state = STATE_FAIL;
            errs.diff_keys.push(key.to_string());
            errs.diff_errs.push(e);
            break;
        }
    }
    if let Err(e) = store.mark(key, state) {
        errs.store_errs.push(e);
    }
    true
}

async fn run_teardown(case: &dyn Case) {
    if let Err(e) = case.teardown().await {
        warn!(error = %e, "teardown failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn match_regex_filters_keys() {
        let gc = GlobalChecker::match_regex("^agg_", Checker::default());
        assert!(gc.available("agg_sum"));
        assert!(!gc.available("plain"));
    }

    #[test]
    fn invalid_pattern_never_matches() {
        let gc = GlobalChecker::match_regex("(unclosed", Checker::default());
        assert!(!gc.available("anything"));
    }

    #[test]
    fn run_errors_display() {
        let info = TaskInfo {
            id: "t1".into(),
            name: "case".into(),
            meta: Vec::new(),
            time: chrono::Utc::now(),
        };
        let mut errs = RunErrors::new(info);
        assert!(errs.no_error());
        errs.stage = Stage::Check;
        errs.diff_keys.push("k".into());
        errs.diff_errs.push(DiffError::Data(vec![]));
        assert!(!errs.no_error());
        assert_eq!(
            errs.to_string(),
            "[t1:case:CHECK] there are 1 diff errors and 0 store errors"
        );
    }
}
