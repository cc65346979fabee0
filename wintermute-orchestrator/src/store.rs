//! Durable storage contract for runs, run events, and routing decisions.
//!
//! All writes at orchestrator call sites are best-effort: a failed insert is
//! logged and swallowed, never fatal to the run. The SQLite implementation
//! owns only these three tables; schema for the wider content pipeline lives
//! elsewhere.

use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::Row;

use wintermute_core::error::InfraError;

/// Append-only record of one routing decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingDecisionRecord {
    pub decision_id: String,
    pub run_id: String,
    pub node_id: String,
    pub agent_id: String,
    pub request_tier: u8,
    pub chosen_tier: u8,
    pub provider: Option<String>,
    pub escalation_reason: Option<String>,
    pub confidence: Option<f64>,
    pub complexity: Option<f64>,
    pub quality: Option<f64>,
    pub latency_ms: f64,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cost_usd: f64,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    pub graph_id: String,
    pub scope_type: String,
    pub scope_id: String,
    pub status: String,
    pub started_at: String,
    pub finished_at: Option<String>,
}

#[async_trait]
pub trait DecisionStore: Send + Sync {
    async fn insert_decision(&self, record: &RoutingDecisionRecord) -> Result<(), InfraError>;
    async fn fetch_decisions(
        &self,
        run_id: Option<&str>,
    ) -> Result<Vec<RoutingDecisionRecord>, InfraError>;

    async fn upsert_run(&self, run: &RunRecord) -> Result<(), InfraError>;
    async fn fetch_runs(&self) -> Result<Vec<RunRecord>, InfraError>;

    async fn insert_event(&self, run_id: &str, event: &Value) -> Result<(), InfraError>;
}

/// SQLite-backed store.
pub struct SqliteStore {
    pool: sqlx::SqlitePool,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path` and ensure tables.
    pub async fn open(path: &str) -> Result<Self, InfraError> {
        let url = format!("sqlite://{path}?mode=rwc");
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect(&url)
            .await
            .map_err(|e| InfraError::Database(e.to_string()))?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<(), InfraError> {
        let statements = [
            "CREATE TABLE IF NOT EXISTS routing_decisions (
                decision_id TEXT PRIMARY KEY,
                run_id TEXT NOT NULL,
                node_id TEXT NOT NULL,
                agent_id TEXT NOT NULL,
                request_tier INTEGER NOT NULL,
                chosen_tier INTEGER NOT NULL,
                provider TEXT,
                escalation_reason TEXT,
                confidence REAL,
                complexity REAL,
                quality REAL,
                latency_ms REAL NOT NULL,
                tokens_in INTEGER NOT NULL,
                tokens_out INTEGER NOT NULL,
                cost_usd REAL NOT NULL,
                created_at TEXT NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS runs (
                run_id TEXT PRIMARY KEY,
                graph_id TEXT NOT NULL,
                scope_type TEXT NOT NULL,
                scope_id TEXT NOT NULL,
                status TEXT NOT NULL,
                started_at TEXT NOT NULL,
                finished_at TEXT
            )",
            "CREATE TABLE IF NOT EXISTS run_events (
                event_seq INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id TEXT NOT NULL,
                event_json TEXT NOT NULL
            )",
        ];
        for statement in statements {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| InfraError::Database(e.to_string()))?;
        }
        Ok(())
    }
}

#[async_trait]
impl DecisionStore for SqliteStore {
    async fn insert_decision(&self, record: &RoutingDecisionRecord) -> Result<(), InfraError> {
        sqlx::query(
            "INSERT INTO routing_decisions
             (decision_id, run_id, node_id, agent_id, request_tier, chosen_tier,
              provider, escalation_reason, confidence, complexity, quality,
              latency_ms, tokens_in, tokens_out, cost_usd, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.decision_id)
        .bind(&record.run_id)
        .bind(&record.node_id)
        .bind(&record.agent_id)
        .bind(record.request_tier as i64)
        .bind(record.chosen_tier as i64)
        .bind(&record.provider)
        .bind(&record.escalation_reason)
        .bind(record.confidence)
        .bind(record.complexity)
        .bind(record.quality)
        .bind(record.latency_ms)
        .bind(record.tokens_in as i64)
        .bind(record.tokens_out as i64)
        .bind(record.cost_usd)
        .bind(&record.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| InfraError::Database(e.to_string()))?;
        Ok(())
    }

    async fn fetch_decisions(
        &self,
        run_id: Option<&str>,
    ) -> Result<Vec<RoutingDecisionRecord>, InfraError> {
        let rows = match run_id {
            Some(run_id) => {
                sqlx::query(
                    "SELECT * FROM routing_decisions WHERE run_id = ? ORDER BY created_at",
                )
                .bind(run_id)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query("SELECT * FROM routing_decisions ORDER BY created_at")
                    .fetch_all(&self.pool)
                    .await
            }
        }
        .map_err(|e| InfraError::Database(e.to_string()))?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            records.push(RoutingDecisionRecord {
                decision_id: row.get("decision_id"),
                run_id: row.get("run_id"),
                node_id: row.get("node_id"),
                agent_id: row.get("agent_id"),
                request_tier: row.get::<i64, _>("request_tier") as u8,
                chosen_tier: row.get::<i64, _>("chosen_tier") as u8,
                provider: row.get("provider"),
                escalation_reason: row.get("escalation_reason"),
                confidence: row.get("confidence"),
                complexity: row.get("complexity"),
                quality: row.get("quality"),
                latency_ms: row.get("latency_ms"),
                tokens_in: row.get::<i64, _>("tokens_in") as u64,
                tokens_out: row.get::<i64, _>("tokens_out") as u64,
                cost_usd: row.get("cost_usd"),
                created_at: row.get("created_at"),
            });
        }
        Ok(records)
    }

    async fn upsert_run(&self, run: &RunRecord) -> Result<(), InfraError> {
        sqlx::query(
            "INSERT INTO runs (run_id, graph_id, scope_type, scope_id, status, started_at, finished_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(run_id) DO UPDATE SET status = excluded.status,
                 finished_at = excluded.finished_at",
        )
        .bind(&run.run_id)
        .bind(&run.graph_id)
        .bind(&run.scope_type)
        .bind(&run.scope_id)
        .bind(&run.status)
        .bind(&run.started_at)
        .bind(&run.finished_at)
        .execute(&self.pool)
        .await
        .map_err(|e| InfraError::Database(e.to_string()))?;
        Ok(())
    }

    async fn fetch_runs(&self) -> Result<Vec<RunRecord>, InfraError> {
        let rows = sqlx::query("SELECT * FROM runs ORDER BY started_at DESC")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| InfraError::Database(e.to_string()))?;
        Ok(rows
            .into_iter()
            .map(|row| RunRecord {
                run_id: row.get("run_id"),
                graph_id: row.get("graph_id"),
                scope_type: row.get("scope_type"),
                scope_id: row.get("scope_id"),
                status: row.get("status"),
                started_at: row.get("started_at"),
                finished_at: row.get("finished_at"),
            })
            .collect())
    }

    async fn insert_event(&self, run_id: &str, event: &Value) -> Result<(), InfraError> {
        sqlx::query("INSERT INTO run_events (run_id, event_json) VALUES (?, ?)")
            .bind(run_id)
            .bind(event.to_string())
            .execute(&self.pool)
            .await
            .map_err(|e| InfraError::Database(e.to_string()))?;
        Ok(())
    }
}

/// In-memory store for tests and single-shot CLI invocations.
#[derive(Default)]
pub struct MemoryStore {
    decisions: Mutex<Vec<RoutingDecisionRecord>>,
    runs: Mutex<Vec<RunRecord>>,
    events: Mutex<Vec<(String, Value)>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decision_count(&self) -> usize {
        self.decisions.lock().expect("store lock").len()
    }

    pub fn event_count(&self) -> usize {
        self.events.lock().expect("store lock").len()
    }
}

#[async_trait]
impl DecisionStore for MemoryStore {
    async fn insert_decision(&self, record: &RoutingDecisionRecord) -> Result<(), InfraError> {
        self.decisions.lock().expect("store lock").push(record.clone());
        Ok(())
    }

    async fn fetch_decisions(
        &self,
        run_id: Option<&str>,
    ) -> Result<Vec<RoutingDecisionRecord>, InfraError> {
        let decisions = self.decisions.lock().expect("store lock");
        Ok(decisions
            .iter()
            .filter(|d| run_id.is_none_or(|id| d.run_id == id))
            .cloned()
            .collect())
    }

    async fn upsert_run(&self, run: &RunRecord) -> Result<(), InfraError> {
        let mut runs = self.runs.lock().expect("store lock");
        if let Some(existing) = runs.iter_mut().find(|r| r.run_id == run.run_id) {
            *existing = run.clone();
        } else {
            runs.push(run.clone());
        }
        Ok(())
    }

    async fn fetch_runs(&self) -> Result<Vec<RunRecord>, InfraError> {
        Ok(self.runs.lock().expect("store lock").clone())
    }

    async fn insert_event(&self, run_id: &str, event: &Value) -> Result<(), InfraError> {
        self.events
            .lock()
            .expect("store lock")
            .push((run_id.to_string(), event.clone()));
        Ok(())
    }
}

/// A store that always fails, for exercising the swallow-persistence-errors
/// path in tests.
pub struct FailingStore;

#[async_trait]
impl DecisionStore for FailingStore {
    async fn insert_decision(&self, _record: &RoutingDecisionRecord) -> Result<(), InfraError> {
        Err(InfraError::Database("injected failure".into()))
    }

    async fn fetch_decisions(
        &self,
        _run_id: Option<&str>,
    ) -> Result<Vec<RoutingDecisionRecord>, InfraError> {
        Err(InfraError::Database("injected failure".into()))
    }

    async fn upsert_run(&self, _run: &RunRecord) -> Result<(), InfraError> {
        Err(InfraError::Database("injected failure".into()))
    }

    async fn fetch_runs(&self) -> Result<Vec<RunRecord>, InfraError> {
        Err(InfraError::Database("injected failure".into()))
    }

    async fn insert_event(&self, _run_id: &str, _event: &Value) -> Result<(), InfraError> {
        Err(InfraError::Database("injected failure".into()))
    }
}
