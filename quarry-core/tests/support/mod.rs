//! Shared fixtures for core integration tests.
#![allow(dead_code)]

use std::{
    fs,
    path::{Path, PathBuf},
    sync::{
        Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use quarry_core::pool::{Connector, DbError, QueryResult};
use quarry_core::settings::WorkspaceSettings;

/// Scripted in-memory backend. The SQL text selects the behaviour:
///
/// * `sleep:<ms>` waits, then succeeds
/// * `fail` is a statement error
/// * `break` is a broken connection
/// * `rows:<n>` returns `n` rows (capped by `max_rows`)
/// * anything else echoes the statement as a single row
#[derive(Debug, Default)]
pub struct FakeConnector {
    pub opened: AtomicUsize,
    pub active: AtomicUsize,
    pub peak_active: AtomicUsize,
    pub fail_connect: AtomicBool,
    pub namespaces: Mutex<Vec<String>>,
    pub executed: Mutex<Vec<(String, String)>>,
}

#[derive(Debug)]
pub struct FakeConnection {
    pub serial: usize,
}

impl FakeConnector {
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn peak_active(&self) -> usize {
        self.peak_active.load(Ordering::SeqCst)
    }
}

struct ActiveGuard<'a>(&'a AtomicUsize);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Connector for FakeConnector {
    type Connection = FakeConnection;

    async fn connect(&self) -> Result<FakeConnection, DbError> {
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(DbError::connect("connection refused"));
        }
        let serial = self.opened.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(FakeConnection { serial })
    }

    async fn ensure_namespace(
        &self,
        _conn: &mut FakeConnection,
        namespace: &str,
    ) -> Result<(), DbError> {
        self.namespaces
            .lock()
            .expect("namespaces lock")
            .push(namespace.to_string());
        Ok(())
    }

    async fn execute(
        &self,
        _conn: &mut FakeConnection,
        namespace: &str,
        sql: &str,
        max_rows: usize,
    ) -> Result<QueryResult, DbError> {
        let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        let _active = ActiveGuard(&self.active);
        self.peak_active.fetch_max(now_active, Ordering::SeqCst);
        self.executed
            .lock()
            .expect("executed lock")
            .push((namespace.to_string(), sql.to_string()));

        if let Some(ms) = sql.strip_prefix("sleep:") {
            let ms: u64 = ms.parse().expect("sleep duration");
            tokio::time::sleep(Duration::from_millis(ms)).await;
            return Ok(QueryResult::default());
        }
        if sql == "fail" {
            return Err(DbError::query("syntax error at or near \"fail\""));
        }
        if sql == "break" {
            return Err(DbError::broken("connection reset by peer"));
        }
        if let Some(n) = sql.strip_prefix("rows:") {
            let n: usize = n.parse().expect("row count");
            let kept = n.min(max_rows);
            return Ok(QueryResult {
                columns: vec!["n".to_string()],
                rows: (0..kept).map(|i| vec![serde_json::json!(i)]).collect(),
                row_count: kept,
                truncated: n > max_rows,
            });
        }

        Ok(QueryResult {
            columns: vec!["sql".to_string()],
            rows: vec![vec![serde_json::json!(sql)]],
            row_count: 1,
            truncated: false,
        })
    }
}

/// A minimal project template with one model.
pub fn write_template(dir: &Path) {
    fs::create_dir_all(dir.join("models")).expect("create template models");
    fs::write(dir.join("dbt_project.yml"), "name: lesson\nprofile: quarry\n")
        .expect("write project file");
    fs::write(dir.join("models/orders.sql"), "select 1 as id\n").expect("write model");
}

/// Workspace settings rooted in `base/workspaces` with a template at
/// `base/template`.
pub fn workspace_settings(base: &Path) -> WorkspaceSettings {
    let template: PathBuf = base.join("template");
    write_template(&template);
    WorkspaceSettings {
        root: base.join("workspaces"),
        template_dir: template,
        ..WorkspaceSettings::default()
    }
}
