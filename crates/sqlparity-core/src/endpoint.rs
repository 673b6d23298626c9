use anyhow::Context;
use async_trait::async_trait;
use rusqlite::types::ValueRef;
use rusqlite::Connection;

use crate::resultset::{ColumnDef, ExecResult, ResultSet};

/// One open connection to an endpoint. Workers own their connection for the
/// lifetime of a stage and never share it.
#[async_trait]
pub trait SqlConn: Send {
    async fn server_version(&mut self) -> anyhow::Result<String>;
    /// Runs a non-query statement and reports its exec summary.
    async fn execute(&mut self, sql: &str) -> anyhow::Result<ResultSet>;
    /// Runs a query and materializes all rows.
    async fn query(&mut self, sql: &str) -> anyhow::Result<ResultSet>;
}

/// Connection factory for one kind of endpoint, keyed by DSN.
#[async_trait]
pub trait SqlDriver: Send + Sync {
    async fn connect(&self, dsn: &str) -> anyhow::Result<Box<dyn SqlConn>>;
}

/// Embedded SQLite endpoints. The DSN is a filesystem path, or `:memory:`
/// for a throwaway database.
pub struct SqliteDriver;

#[async_trait]
impl SqlDriver for SqliteDriver {
    async fn connect(&self, dsn: &str) -> anyhow::Result<Box<dyn SqlConn>> {
        let conn = if dsn == ":memory:" {
            Connection::open_in_memory()
        } else {
            Connection::open(dsn)
        }
        .with_context(|| format!("open sqlite endpoint {dsn}"))?;
        Ok(Box::new(SqliteConn { conn }))
    }
}

struct SqliteConn {
    conn: Connection,
}

#[async_trait]
impl SqlConn for SqliteConn {
    async fn server_version(&mut self) -> anyhow::Result<String> {
        Ok(format!("sqlite {}", rusqlite::version()))
    }

    async fn execute(&mut self, sql: &str) -> anyhow::Result<ResultSet> {
        let mut stmt = self.conn.prepare(sql)?;
        if stmt.column_count() > 0 {
            // A statement that yields rows has no exec attributes to report;
            // drain it so side effects still happen.
            let mut rows = stmt.query([])?;
            while rows.next()?.is_some() {}
            return Ok(ResultSet::from_exec(ExecResult::default()));
        }
        let rows_affected = stmt.execute([])? as i64;
        Ok(ResultSet::from_exec(ExecResult {
            rows_affected,
            last_insert_id: self.conn.last_insert_rowid(),
            has_rows_affected: true,
            has_last_insert_id: true,
        }))
    }

    async fn query(&mut self, sql: &str) -> anyhow::Result<ResultSet> {
        let mut stmt = self.conn.prepare(sql)?;
        let cols: Vec<ColumnDef> = stmt
            .columns()
            .iter()
            .map(|c| column_def(c.name(), c.decl_type()))
            .collect();
        let mut rs = ResultSet::new(cols);
        let n_cols = rs.n_cols();
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let mut cells = Vec::with_capacity(n_cols);
            for j in 0..n_cols {
                cells.push(match row.get_ref(j)? {
                    ValueRef::Null => None,
                    ValueRef::Integer(v) => Some(v.to_string().into_bytes()),
                    ValueRef::Real(v) => Some(v.to_string().into_bytes()),
                    ValueRef::Text(v) => Some(v.to_vec()),
                    ValueRef::Blob(v) => Some(v.to_vec()),
                });
            }
            rs.push_row(cells);
        }
        Ok(rs)
    }
}

/// Derives column metadata from a declared type like `VARCHAR(50)` or
/// `DECIMAL(10,2)`. SQLite reports no nullability per result column, so
/// `has_nullable` stays unset.
fn column_def(name: &str, decl_type: Option<&str>) -> ColumnDef {
    let mut def = ColumnDef {
        name: name.to_string(),
        ..Default::default()
    };
    let Some(decl) = decl_type else {
        return def;
    };
    match decl.trim().split_once('(') {
        Some((base, rest)) => {
            def.type_name = base.trim().to_uppercase();
            let args: Vec<i64> = rest
                .trim_end_matches(')')
                .split(',')
                .filter_map(|s| s.trim().parse().ok())
                .collect();
            match args.as_slice() {
                [len] => {
                    def.length = *len;
                    def.has_length = true;
                }
                [precision, scale] => {
                    def.precision = *precision;
                    def.scale = *scale;
                    def.has_precision_scale = true;
                }
                _ => {}
            }
        }
        None => def.type_name = decl.trim().to_uppercase(),
    }
    def
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn memory_conn() -> Box<dyn SqlConn> {
        SqliteDriver.connect(":memory:").await.unwrap()
    }

    #[tokio::test]
    async fn execute_reports_rows_affected() {
        let mut conn = memory_conn().await;
        conn.execute("create table t (id integer primary key, v text)")
            .await
            .unwrap();
        let rs = conn
            .execute("insert into t(v) values ('a'), ('b')")
            .await
            .unwrap();
        assert!(rs.is_exec_result());
        let exec = rs.exec_result();
        assert!(exec.has_rows_affected);
        assert_eq!(exec.rows_affected, 2);
        assert!(exec.has_last_insert_id);
        assert_eq!(exec.last_insert_id, 2);
    }

    #[tokio::test]
    async fn execute_drains_row_producing_statements() {
        let mut conn = memory_conn().await;
        let rs = conn.execute("select 1").await.unwrap();
        assert!(rs.is_exec_result());
        assert!(!rs.exec_result().has_rows_affected);
    }

    #[tokio::test]
    async fn query_materializes_rows_and_schema() {
        let mut conn = memory_conn().await;
        conn.execute("create table t (name VARCHAR(50), score DECIMAL(10,2), data BLOB)")
            .await
            .unwrap();
        conn.execute("insert into t values ('alice', 1.5, x'00ff')")
            .await
            .unwrap();
        conn.execute("insert into t values (null, null, '')")
            .await
            .unwrap();

        let rs = conn.query("select name, score, data from t").await.unwrap();
        assert_eq!(rs.n_rows(), 2);
        assert_eq!(rs.n_cols(), 3);

        let name = rs.column_def(0);
        assert_eq!(name.type_name, "VARCHAR");
        assert!(name.has_length);
        assert_eq!(name.length, 50);

        let score = rs.column_def(1);
        assert_eq!(score.type_name, "DECIMAL");
        assert!(score.has_precision_scale);
        assert_eq!((score.precision, score.scale), (10, 2));

        assert_eq!(rs.raw_value(0, 0), Some(Some(b"alice".as_slice())));
        assert_eq!(rs.raw_value(0, 1), Some(Some(b"1.5".as_slice())));
        assert_eq!(rs.raw_value(1, 0), Some(None));
        // NULL and empty text are different cells.
        assert_eq!(rs.raw_value(1, 2), Some(Some(b"".as_slice())));
    }

    #[tokio::test]
    async fn failing_statement_surfaces_error() {
        let mut conn = memory_conn().await;
        assert!(conn.execute("insert into missing values (1)").await.is_err());
        assert!(conn.query("select * from missing").await.is_err());
    }

    #[tokio::test]
    async fn version_mentions_engine() {
        let mut conn = memory_conn().await;
        assert!(conn.server_version().await.unwrap().starts_with("sqlite "));
    }
}
