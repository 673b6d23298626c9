use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use sqlparity_core::case::{Case, SqlCase};
use sqlparity_core::endpoint::SqliteDriver;
use sqlparity_core::engine;
use sqlparity_core::model::{Stage, TaskInfo, STATE_FAIL, STATE_OK};
use sqlparity_core::run::{run, GlobalCheckMode, GlobalChecker, RunOptions};
use sqlparity_core::storage::ResultStore;
use tempfile::TempDir;

struct Fixture {
    dir: TempDir,
    dsns: Vec<String>,
}

/// Two SQLite endpoints; the second one is pre-seeded with a row in `t`, so
/// queries over `t` diverge while constant queries agree.
fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let a = dir.path().join("a.db");
    let b = dir.path().join("b.db");
    let seed = rusqlite::Connection::open(&b).unwrap();
    seed.execute_batch("create table t (v VARCHAR(10)); insert into t values ('x');")
        .unwrap();
    Fixture {
        dsns: vec![a.to_string_lossy().into_owned(), b.to_string_lossy().into_owned()],
        dir,
    }
}

fn write_file(dir: &Path, name: &str, content: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, content).unwrap();
    path
}

fn test_task(id: &str) -> TaskInfo {
    TaskInfo {
        id: id.into(),
        name: "engine-test".into(),
        meta: Vec::new(),
        time: Utc::now(),
    }
}

#[tokio::test]
async fn run_marks_matching_and_diverging_keys() {
    let fx = fixture();
    write_file(
        fx.dir.path(),
        "setup.sql",
        "create table if not exists t (v VARCHAR(10));",
    );
    write_file(
        fx.dir.path(),
        "test.sql",
        "--query setupkey_probe\n\
         --query k1\n\
         select 1;\n\
         --query k2\n\
         select v from t;",
    );
    write_file(fx.dir.path(), "teardown.sql", "drop table if exists t;");
    let case_path = write_file(
        fx.dir.path(),
        "case.json",
        r#"{
            "name": "parity-smoke",
            "stages": {
                "setup": ["setup.sql"],
                "test": ["test.sql"],
                "teardown": ["teardown.sql"]
            },
            "checkers": {"k1": {}, "k2": {}}
        }"#,
    );

    let case = SqlCase::load(&case_path, fx.dsns.clone(), Arc::new(SqliteDriver)).unwrap();
    let store = ResultStore::open_in_memory().unwrap();
    let errs = run(&case, &store, RunOptions::default()).await.unwrap_err();

    assert!(errs.exec_err.is_none());
    assert_eq!(errs.stage, Stage::Check);
    assert_eq!(errs.diff_keys, vec!["k2"]);
    assert_eq!(errs.diff_errs.len(), 1);
    assert!(errs.store_errs.is_empty());

    assert_eq!(store.keys_by_state(STATE_OK).unwrap(), vec!["k1"]);
    assert_eq!(store.keys_by_state(STATE_FAIL).unwrap(), vec!["k2"]);

    // Only the last capture command of the statement decides the key.
    assert!(store.read("setupkey_probe").unwrap().is_empty());
    assert_eq!(store.read("k1").unwrap().len(), 2);

    // Teardown ran on both endpoints.
    for dsn in &fx.dsns {
        let conn = rusqlite::Connection::open(dsn).unwrap();
        let n: i64 = conn
            .query_row(
                "select count(*) from sqlite_master where name = 't'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(n, 0, "table t should be dropped on {dsn}");
    }
}

#[tokio::test]
async fn setup_stage_never_captures_results() {
    let fx = fixture();
    write_file(
        fx.dir.path(),
        "setup.sql",
        "--query sneaky\nselect 1;\ncreate table if not exists t (v VARCHAR(10));",
    );
    write_file(fx.dir.path(), "test.sql", "--query k\nselect 1;");
    let case_path = write_file(
        fx.dir.path(),
        "case.json",
        r#"{
            "name": "no-setup-capture",
            "stages": {"setup": ["setup.sql"], "test": ["test.sql"]},
            "checkers": {"k": {}}
        }"#,
    );

    let case = SqlCase::load(&case_path, fx.dsns.clone(), Arc::new(SqliteDriver)).unwrap();
    let store = ResultStore::open_in_memory().unwrap();
    run(&case, &store, RunOptions::default()).await.unwrap();

    assert!(store.read("sneaky").unwrap().is_empty());
    assert_eq!(store.keys().unwrap(), vec!["k"]);
    assert_eq!(store.keys_by_state(STATE_OK).unwrap(), vec!["k"]);
}

#[tokio::test]
async fn global_checkers_cover_unchecked_keys() {
    let fx = fixture();
    write_file(
        fx.dir.path(),
        "setup.sql",
        "create table if not exists t (v VARCHAR(10));",
    );
    write_file(
        fx.dir.path(),
        "test.sql",
        "--query k1\nselect 1;\n--query k2\nselect v from t;",
    );
    let case_path = write_file(
        fx.dir.path(),
        "case.json",
        r#"{
            "name": "global-check",
            "stages": {"setup": ["setup.sql"], "test": ["test.sql"]}
        }"#,
    );

    let case = SqlCase::load(&case_path, fx.dsns.clone(), Arc::new(SqliteDriver)).unwrap();
    let store = ResultStore::open_in_memory().unwrap();
    let opts = RunOptions {
        global_check_mode: GlobalCheckMode::IfUnchecked,
        global_checkers: vec![GlobalChecker::match_regex("^k", Default::default())],
    };
    let errs = run(&case, &store, opts).await.unwrap_err();

    assert_eq!(errs.diff_keys, vec!["k2"]);
    assert_eq!(store.keys_by_state(STATE_OK).unwrap(), vec!["k1"]);
    assert_eq!(store.keys_by_state(STATE_FAIL).unwrap(), vec!["k2"]);
}

#[tokio::test]
async fn first_statement_error_cancels_the_stage() {
    let fx = fixture();
    // The insert succeeds on the seeded endpoint and fails on the fresh one.
    let script = write_file(
        fx.dir.path(),
        "test.sql",
        "--query q1\n\
         select 1;\n\
         insert into t values ('boom');\n\
         --query q2\n\
         select 2;",
    );

    let store = ResultStore::open_in_memory().unwrap();
    store.setup(test_task("cancel")).unwrap();

    let err = engine::run_stage(
        Arc::new(SqliteDriver),
        Stage::Test,
        &[script],
        &fx.dsns,
        Some(store.clone()),
    )
    .await
    .unwrap_err();
    assert!(format!("{err:#}").contains("no such table"), "err: {err:#}");

    // Exactly one error surfaced; queued work before the failure was done.
    let q1 = store.read("q1").unwrap();
    assert!(!q1.is_empty() && q1.len() <= 2, "q1 results: {}", q1.len());
    assert!(store.read("q2").unwrap().len() <= 1);
}

#[tokio::test]
async fn ignore_errors_lets_the_stage_finish() {
    let fx = fixture();
    let script = write_file(
        fx.dir.path(),
        "test.sql",
        "--ignore_errors\n\
         insert into t values ('boom');\n\
         --query q\n\
         select 1;",
    );

    let store = ResultStore::open_in_memory().unwrap();
    store.setup(test_task("ignore")).unwrap();

    engine::run_stage(
        Arc::new(SqliteDriver),
        Stage::Test,
        &[script],
        &fx.dsns,
        Some(store.clone()),
    )
    .await
    .unwrap();
    assert_eq!(store.read("q").unwrap().len(), 2);
}

#[tokio::test]
async fn statements_reach_each_endpoint_in_script_order() {
    let fx = fixture();
    let s1 = write_file(
        fx.dir.path(),
        "one.sql",
        "create table if not exists log (v VARCHAR(4));\ninsert into log values ('a');",
    );
    let s2 = write_file(
        fx.dir.path(),
        "two.sql",
        "insert into log values ('b');\n--query order\nselect v from log;",
    );

    let store = ResultStore::open_in_memory().unwrap();
    store.setup(test_task("order")).unwrap();

    engine::run_stage(
        Arc::new(SqliteDriver),
        Stage::Test,
        &[s1, s2],
        &fx.dsns,
        Some(store.clone()),
    )
    .await
    .unwrap();

    let results = store.read("order").unwrap();
    assert_eq!(results.len(), 2);
    for res in &results {
        assert_eq!(res.result_set.raw_value(0, 0), Some(Some("a".as_bytes())));
        assert_eq!(res.result_set.raw_value(1, 0), Some(Some("b".as_bytes())));
    }
}

#[tokio::test]
async fn empty_dsn_list_is_a_no_op() {
    let fx = fixture();
    let script = write_file(fx.dir.path(), "test.sql", "select 1;");
    engine::run_stage(Arc::new(SqliteDriver), Stage::Setup, &[script], &[], None)
        .await
        .unwrap();
}

#[tokio::test]
async fn missing_script_fails_the_stage() {
    let fx = fixture();
    let err = engine::run_stage(
        Arc::new(SqliteDriver),
        Stage::Setup,
        &[fx.dir.path().join("nope.sql")],
        &fx.dsns,
        None,
    )
    .await
    .unwrap_err();
    assert!(format!("{err:#}").contains("nope.sql"));
}

#[tokio::test]
async fn teardown_runs_after_failed_test_stage() {
    let fx = fixture();
    write_file(
        fx.dir.path(),
        "setup.sql",
        "create table if not exists t (v VARCHAR(10));\ncreate table if not exists tombstone (v INT);",
    );
    write_file(fx.dir.path(), "test.sql", "insert into nowhere values (1);");
    write_file(fx.dir.path(), "teardown.sql", "drop table if exists tombstone;");
    let case_path = write_file(
        fx.dir.path(),
        "case.json",
        r#"{
            "name": "teardown-always",
            "stages": {
                "setup": ["setup.sql"],
                "test": ["test.sql"],
                "teardown": ["teardown.sql"]
            }
        }"#,
    );

    let case = SqlCase::load(&case_path, fx.dsns.clone(), Arc::new(SqliteDriver)).unwrap();
    let store = ResultStore::open_in_memory().unwrap();
    let errs = run(&case, &store, RunOptions::default()).await.unwrap_err();
    assert_eq!(errs.stage, Stage::Test);
    assert!(errs.exec_err.is_some());

    for dsn in &fx.dsns {
        let conn = rusqlite::Connection::open(dsn).unwrap();
        let n: i64 = conn
            .query_row(
                "select count(*) from sqlite_master where name = 'tombstone'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(n, 0, "teardown should have dropped tombstone on {dsn}");
    }
}

// Smoke coverage for the Case trait surface used by external callers.
#[tokio::test]
async fn case_new_task_stamps_identity() {
    let fx = fixture();
    write_file(fx.dir.path(), "test.sql", "select 1;");
    let case_path = write_file(
        fx.dir.path(),
        "case.json",
        r#"{"name": "idcheck", "meta": [1, 2], "stages": {"test": ["test.sql"]}}"#,
    );
    let case = SqlCase::load(&case_path, fx.dsns.clone(), Arc::new(SqliteDriver)).unwrap();
    let t1 = case.new_task();
    let t2 = case.new_task();
    assert_ne!(t1.id, t2.id);
    assert_eq!(t1.name, "idcheck");
    assert_eq!(t1.meta, b"[1, 2]".to_vec());
}
