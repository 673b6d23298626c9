use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use sqlparity_core::case::SqlCase;
use sqlparity_core::endpoint::SqliteDriver;
use sqlparity_core::model::{STATE_FAIL, STATE_OK};
use sqlparity_core::resultset::Checker;
use sqlparity_core::run::{run, GlobalCheckMode, GlobalChecker, RunOptions};
use sqlparity_core::storage::ResultStore;
use tracing_subscriber::{fmt, EnvFilter};

const EXIT_DIFF: i32 = 1;
const EXIT_CONFIG: i32 = 2;

#[derive(Parser, Debug)]
#[command(name = "sqlparity", version, about = "Differential SQL testing runner")]
struct Args {
    /// Case file (JSON).
    case: PathBuf,

    /// Endpoint DSN; repeat once per endpoint.
    #[arg(long = "dsn", required = true)]
    dsns: Vec<String>,

    /// Result store database.
    #[arg(long, default_value = "sqlparity.db")]
    store: PathBuf,

    /// When to apply the global checker to stored keys.
    #[arg(long, value_enum, default_value = "none")]
    global_check: GlobalCheckArg,

    /// Key pattern for the global checker.
    #[arg(long, default_value = ".*")]
    global_check_pattern: String,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum GlobalCheckArg {
    None,
    IfUnchecked,
    Always,
}

impl From<GlobalCheckArg> for GlobalCheckMode {
    fn from(arg: GlobalCheckArg) -> Self {
        match arg {
            GlobalCheckArg::None => GlobalCheckMode::None,
            GlobalCheckArg::IfUnchecked => GlobalCheckMode::IfUnchecked,
            GlobalCheckArg::Always => GlobalCheckMode::Always,
        }
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main(flavor = "multi_thread")]
async fn main() {
    init_logging();
    let args = Args::parse();
    std::process::exit(match exec(args).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("fatal: {e:?}");
            EXIT_CONFIG
        }
    });
}

async fn exec(args: Args) -> anyhow::Result<i32> {
    let case = SqlCase::load(&args.case, args.dsns.clone(), Arc::new(SqliteDriver))?;
    let store = ResultStore::open(&args.store)?;

    let opts = RunOptions {
        global_check_mode: args.global_check.into(),
        global_checkers: vec![GlobalChecker::match_regex(
            &args.global_check_pattern,
            Checker::default(),
        )],
    };

    tracing::info!(case = %case.name, endpoints = args.dsns.len(), "starting run");
    let outcome = run(&case, &store, opts).await;

    for state in [STATE_OK, STATE_FAIL] {
        for key in store.keys_by_state(state).unwrap_or_default() {
            println!("{state}\t{key}");
        }
    }

    match outcome {
        Ok(()) => Ok(0),
        Err(errs) => {
            eprintln!("{errs}");
            for (key, diff) in errs.diff_keys.iter().zip(&errs.diff_errs) {
                eprintln!("  key {key:?}: {diff}");
            }
            for store_err in &errs.store_errs {
                eprintln!("  store: {store_err}");
            }
            Ok(EXIT_DIFF)
        }
    }
}
