use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::endpoint::{SqlConn, SqlDriver};
use crate::model::{QueryResult, Stage};
use crate::split::{Command, Splitter, Stmt};
use crate::storage::ResultStore;

pub const CMD_IGNORE_ERRORS: &str = "ignore_errors";
pub const CMD_EXECUTE: &str = "execute";
pub const CMD_QUERY: &str = "query";

const STMT_QUEUE_CAP: usize = 64;

/// Commands that trigger result capture, per stage. Setup and teardown run
/// everything as plain executes; `ignore_errors` is honored everywhere.
fn stage_cmds(stage: Stage) -> &'static [&'static str] {
    match stage {
        Stage::Test => &[CMD_QUERY, CMD_EXECUTE],
        _ => &[],
    }
}

/// Runs one stage: a feeder splits `scripts` in order and broadcasts every
/// statement into one bounded queue per DSN; one worker per DSN drains its
/// queue over its own connection. The first error from any task cancels the
/// feeder; workers finish what was already queued. Waits for all N+1 tasks
/// and returns the first error observed.
pub async fn run_stage(
    driver: Arc<dyn SqlDriver>,
    stage: Stage,
    scripts: &[PathBuf],
    dsns: &[String],
    store: Option<ResultStore>,
) -> anyhow::Result<()> {
    if dsns.is_empty() {
        info!(stage = %stage, "no dsn provided");
        return Ok(());
    }
    let cancel = CancellationToken::new();
    let mut tasks = JoinSet::new();
    let mut queues = Vec::with_capacity(dsns.len());
    for dsn in dsns {
        let (tx, rx) = mpsc::channel::<Stmt>(STMT_QUEUE_CAP);
        queues.push(tx);
        let worker = Worker {
            driver: driver.clone(),
            dsn: dsn.clone(),
            store: store.clone(),
            avail_cmds: stage_cmds(stage),
        };
        tasks.spawn(worker.run(rx));
    }
    tasks.spawn(feed(scripts.to_vec(), queues, cancel.clone()));

    let mut first_err = None;
    while let Some(joined) = tasks.join_next().await {
        let res = joined.unwrap_or_else(|e| Err(anyhow::anyhow!(e).context("stage task panicked")));
        if let Err(e) = res {
            if first_err.is_none() {
                cancel.cancel();
                first_err = Some(e);
            } else {
                debug!(stage = %stage, error = %e, "swallowing follow-up stage error");
            }
        }
    }
    match first_err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Broadcasts every statement of every script, in order, to all queues.
/// Stops on cancellation or when a queue's worker is gone; dropping the
/// senders on return is what closes the queues.
async fn feed(
    scripts: Vec<PathBuf>,
    queues: Vec<mpsc::Sender<Stmt>>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    for path in &scripts {
        let splitter = Splitter::from_file(path)
            .with_context(|| format!("load script {}", path.display()))?;
        for stmt in splitter {
            for queue in &queues {
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    sent = queue.send(stmt.clone()) => {
                        if sent.is_err() {
                            return Ok(());
                        }
                    }
                }
            }
        }
    }
    Ok(())
}

struct Worker {
    driver: Arc<dyn SqlDriver>,
    dsn: String,
    store: Option<ResultStore>,
    avail_cmds: &'static [&'static str],
}

impl Worker {
    async fn run(self, mut queue: mpsc::Receiver<Stmt>) -> anyhow::Result<()> {
        let mut conn = self
            .driver
            .connect(&self.dsn)
            .await
            .with_context(|| format!("connect {}", self.dsn))?;
        let version = conn.server_version().await.unwrap_or_default();
        while let Some(stmt) = queue.recv().await {
            let mut ignore_err = false;
            let mut run_cmd: Option<&Command> = None;
            for cmd in &stmt.commands {
                if cmd.name == CMD_IGNORE_ERRORS {
                    ignore_err = true;
                }
                if self.avail_cmds.contains(&cmd.name.as_str()) {
                    run_cmd = Some(cmd);
                }
            }
            if let Err(e) = self
                .dispatch(conn.as_mut(), &stmt, run_cmd, &version)
                .await
            {
                if ignore_err {
                    debug!(dsn = %self.dsn, sql = %stmt.text, error = %e, "statement error ignored");
                    continue;
                }
                warn!(dsn = %self.dsn, sql = %stmt.text, error = %e, "statement failed");
                return Err(e);
            }
        }
        Ok(())
    }

    async fn dispatch(
        &self,
        conn: &mut dyn SqlConn,
        stmt: &Stmt,
        run_cmd: Option<&Command>,
        version: &str,
    ) -> anyhow::Result<()> {
        let Some(cmd) = run_cmd else {
            conn.execute(&stmt.text).await?;
            return Ok(());
        };
        let key = cmd.args.first().cloned().unwrap_or_default();
        let time = Utc::now();
        let start = Instant::now();
        let result_set = match cmd.name.as_str() {
            CMD_QUERY => conn.query(&stmt.text).await?,
            _ => conn.execute(&stmt.text).await?,
        };
        let duration = start.elapsed().as_secs_f64();
        if let Some(store) = &self.store {
            let res = QueryResult {
                time,
                duration,
                key,
                sql: stmt.text.clone(),
                version: version.to_string(),
                result_set,
            };
            if let Err(e) = store.write(&res) {
                warn!(dsn = %self.dsn, key = %res.key, error = %e, "write result");
            }
        }
        Ok(())
    }
}
