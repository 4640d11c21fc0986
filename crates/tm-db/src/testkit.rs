//! Scripted [`QueryEngine`] for exercising SQL translation without a server.
//!
//! Every call is recorded. Queries pop the next queued result (default: no
//! rows); statements pop the next queued result (default: 1 row affected).

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;

use crate::engine::{DbError, QueryEngine, Row, SqlValue};

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    pub kind: CallKind,
    pub sql: String,
    pub params: Vec<SqlValue>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    Query,
    Statement,
}

#[derive(Default)]
pub struct RecordingEngine {
    calls: Mutex<Vec<RecordedCall>>,
    query_results: Mutex<VecDeque<Result<Vec<Row>, DbError>>>,
    statement_results: Mutex<VecDeque<Result<u64, DbError>>>,
}

impl RecordingEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_rows(&self, rows: Vec<Row>) {
        lock(&self.query_results).push_back(Ok(rows));
    }

    pub fn push_query_error(&self, err: DbError) {
        lock(&self.query_results).push_back(Err(err));
    }

    pub fn push_affected(&self, n: u64) {
        lock(&self.statement_results).push_back(Ok(n));
    }

    pub fn push_statement_error(&self, err: DbError) {
        lock(&self.statement_results).push_back(Err(err));
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        lock(&self.calls).clone()
    }

    pub fn statements(&self) -> Vec<RecordedCall> {
        self.calls()
            .into_iter()
            .filter(|c| c.kind == CallKind::Statement)
            .collect()
    }

    fn record(&self, kind: CallKind, sql: &str, params: &[SqlValue]) {
        lock(&self.calls).push(RecordedCall {
            kind,
            sql: normalize_ws(sql),
            params: params.to_vec(),
        });
    }
}

#[async_trait]
impl QueryEngine for RecordingEngine {
    async fn execute_query(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>, DbError> {
        self.record(CallKind::Query, sql, params);
        lock(&self.query_results)
            .pop_front()
            .unwrap_or_else(|| Ok(Vec::new()))
    }

    async fn execute_statement(&self, sql: &str, params: &[SqlValue]) -> Result<u64, DbError> {
        self.record(CallKind::Statement, sql, params);
        lock(&self.statement_results).pop_front().unwrap_or(Ok(1))
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Collapse runs of whitespace so assertions don't depend on formatting.
fn normalize_ws(sql: &str) -> String {
    sql.split_whitespace().collect::<Vec<_>>().join(" ")
}
