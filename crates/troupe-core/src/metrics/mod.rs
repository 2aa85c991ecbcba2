//! Run telemetry: per-step token usage, cost, and quality scores.
//!
//! Backed by SQLite with WAL mode. All database work goes through
//! `tokio::task::spawn_blocking` so the async runtime never blocks on
//! the connection lock.

use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::Serialize;
use tracing::{debug, info};

use crate::error::CoreError;

// ─── Pricing ──────────────────────────────────────────────────────────────

/// USD per 1k tokens for a model family.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelPricing {
    pub input_per_1k: f64,
    pub output_per_1k: f64,
}

impl ModelPricing {
    pub fn cost_usd(&self, input_tokens: u64, output_tokens: u64) -> f64 {
        (input_tokens as f64 / 1000.0) * self.input_per_1k
            + (output_tokens as f64 / 1000.0) * self.output_per_1k
    }
}

/// Longest-prefix pricing lookup. Unknown models get a conservative
/// mid-range rate; the stub runner is free.
pub fn pricing_for(model: &str) -> ModelPricing {
    let table: &[(&str, ModelPricing)] = &[
        ("stub", ModelPricing { input_per_1k: 0.0, output_per_1k: 0.0 }),
        ("gpt-4o-mini", ModelPricing { input_per_1k: 0.00015, output_per_1k: 0.0006 }),
        ("gpt-4o", ModelPricing { input_per_1k: 0.0025, output_per_1k: 0.01 }),
        ("gpt-4", ModelPricing { input_per_1k: 0.03, output_per_1k: 0.06 }),
        ("gpt-3.5", ModelPricing { input_per_1k: 0.0005, output_per_1k: 0.0015 }),
        ("claude-3-opus", ModelPricing { input_per_1k: 0.015, output_per_1k: 0.075 }),
        ("claude-3-5-sonnet", ModelPricing { input_per_1k: 0.003, output_per_1k: 0.015 }),
        ("claude-3-sonnet", ModelPricing { input_per_1k: 0.003, output_per_1k: 0.015 }),
        ("claude-3-haiku", ModelPricing { input_per_1k: 0.00025, output_per_1k: 0.00125 }),
    ];
    let mut best: Option<(&str, ModelPricing)> = None;
    for (prefix, pricing) in table {
        if model.starts_with(prefix) {
            match best {
                Some((current, _)) if current.len() >= prefix.len() => {}
                _ => best = Some((prefix, *pricing)),
            }
        }
    }
    best.map(|(_, pricing)| pricing).unwrap_or(ModelPricing {
        input_per_1k: 0.001,
        output_per_1k: 0.002,
    })
}

/// Rough character-based token estimate for payloads that arrive
/// without usage numbers.
pub fn estimate_tokens(text: &str) -> u64 {
    (text.len() as u64 + 3) / 4
}

// ─── Records ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct StepUsage {
    pub session_id: String,
    pub workflow: String,
    pub step: u32,
    pub agent: String,
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quality_score: Option<f64>,
    pub duration_ms: u64,
    pub recorded_at: DateTime<Utc>,
}

impl StepUsage {
    pub fn cost_usd(&self) -> f64 {
        pricing_for(&self.model).cost_usd(self.input_tokens, self.output_tokens)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub steps: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avg_quality: Option<f64>,
    pub total_duration_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionCost {
    pub session_id: String,
    pub steps: u64,
    pub cost_usd: f64,
}

// ─── Database ─────────────────────────────────────────────────────────────

/// Thread-safe handle to the telemetry database.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) the database at the given path.
    pub fn open(db_path: &Path) -> Result<Self, CoreError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let conn = Connection::open(db_path)
            .map_err(|e| CoreError::Telemetry(format!("Failed to open database: {e}")))?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .map_err(|e| CoreError::Telemetry(format!("Failed to set pragmas: {e}")))?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.initialize_tables()?;

        info!("[Telemetry] SQLite database opened at {}", db_path.display());
        Ok(db)
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self, CoreError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| CoreError::Telemetry(format!("Failed to open in-memory db: {e}")))?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.initialize_tables()?;
        Ok(db)
    }

    fn with_conn<F, T>(&self, f: F) -> Result<T, CoreError>
    where
        F: FnOnce(&Connection) -> Result<T, rusqlite::Error>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| CoreError::Telemetry(format!("Lock poisoned: {e}")))?;
        f(&conn).map_err(|e| CoreError::Telemetry(e.to_string()))
    }

    async fn with_conn_async<F, T>(&self, f: F) -> Result<T, CoreError>
    where
        F: FnOnce(&Connection) -> Result<T, rusqlite::Error> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.clone();
        tokio::task::spawn_blocking(move || db.with_conn(f))
            .await
            .map_err(|e| CoreError::Telemetry(format!("Task join error: {e}")))?
    }

    fn initialize_tables(&self) -> Result<(), CoreError> {
        self.with_conn(|conn| {
            conn.execute_batch(
                "
                CREATE TABLE IF NOT EXISTS step_metrics (
                    id              INTEGER PRIMARY KEY AUTOINCREMENT,
                    session_id      TEXT NOT NULL,
                    workflow        TEXT NOT NULL,
                    step            INTEGER NOT NULL,
                    agent           TEXT NOT NULL,
                    model           TEXT NOT NULL,
                    input_tokens    INTEGER NOT NULL DEFAULT 0,
                    output_tokens   INTEGER NOT NULL DEFAULT 0,
                    cost_usd        REAL NOT NULL DEFAULT 0,
                    quality_score   REAL,
                    duration_ms     INTEGER NOT NULL DEFAULT 0,
                    recorded_at     INTEGER NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_step_metrics_session ON step_metrics(session_id);
                ",
            )
        })
    }
}

// ─── Store ────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct TelemetryStore {
    db: Database,
}

impl TelemetryStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn open(db_path: &Path) -> Result<Self, CoreError> {
        Ok(Self::new(Database::open(db_path)?))
    }

    pub fn open_in_memory() -> Result<Self, CoreError> {
        Ok(Self::new(Database::open_in_memory()?))
    }

    pub async fn record_step(&self, usage: &StepUsage) -> Result<(), CoreError> {
        let u = usage.clone();
        let cost = usage.cost_usd();
        debug!(
            "[Telemetry] step {} ({}) — {} in / {} out tokens, ${:.6}",
            u.step, u.agent, u.input_tokens, u.output_tokens, cost
        );
        self.db
            .with_conn_async(move |conn| {
                conn.execute(
                    "INSERT INTO step_metrics
                       (session_id, workflow, step, agent, model, input_tokens, output_tokens,
                        cost_usd, quality_score, duration_ms, recorded_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                    rusqlite::params![
                        u.session_id,
                        u.workflow,
                        u.step,
                        u.agent,
                        u.model,
                        u.input_tokens,
                        u.output_tokens,
                        cost,
                        u.quality_score,
                        u.duration_ms,
                        u.recorded_at.timestamp_millis(),
                    ],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn session_summary(&self, session_id: &str) -> Result<SessionSummary, CoreError> {
        let id = session_id.to_string();
        self.db
            .with_conn_async(move |conn| {
                conn.query_row(
                    "SELECT COUNT(*),
                            COALESCE(SUM(input_tokens), 0),
                            COALESCE(SUM(output_tokens), 0),
                            COALESCE(SUM(cost_usd), 0),
                            AVG(quality_score),
                            COALESCE(SUM(duration_ms), 0)
                     FROM step_metrics WHERE session_id = ?1",
                    rusqlite::params![id.clone()],
                    |row| {
                        Ok(SessionSummary {
                            session_id: id.clone(),
                            steps: row.get(0)?,
                            input_tokens: row.get(1)?,
                            output_tokens: row.get(2)?,
                            cost_usd: row.get(3)?,
                            avg_quality: row.get(4)?,
                            total_duration_ms: row.get(5)?,
                        })
                    },
                )
            })
            .await
    }

    /// Most recent steps for a session, newest first.
    pub async fn recent_steps(
        &self,
        session_id: &str,
        limit: u32,
    ) -> Result<Vec<StepUsage>, CoreError> {
        let id = session_id.to_string();
        self.db
            .with_conn_async(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT session_id, workflow, step, agent, model, input_tokens,
                            output_tokens, quality_score, duration_ms, recorded_at
                     FROM step_metrics WHERE session_id = ?1
                     ORDER BY recorded_at DESC, id DESC LIMIT ?2",
                )?;
                let rows = stmt
                    .query_map(rusqlite::params![id, limit], row_to_usage)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    /// Cost rollup per session, most recently active first.
    pub async fn session_costs(&self) -> Result<Vec<SessionCost>, CoreError> {
        self.db
            .with_conn_async(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT session_id, COUNT(*), COALESCE(SUM(cost_usd), 0)
                     FROM step_metrics
                     GROUP BY session_id
                     ORDER BY MAX(recorded_at) DESC",
                )?;
                let rows = stmt
                    .query_map([], |row| {
                        Ok(SessionCost {
                            session_id: row.get(0)?,
                            steps: row.get(1)?,
                            cost_usd: row.get(2)?,
                        })
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }
}

fn row_to_usage(row: &rusqlite::Row<'_>) -> Result<StepUsage, rusqlite::Error> {
    let recorded_ms: i64 = row.get(9)?;
    Ok(StepUsage {
        session_id: row.get(0)?,
        workflow: row.get(1)?,
        step: row.get(2)?,
        agent: row.get(3)?,
        model: row.get(4)?,
        input_tokens: row.get(5)?,
        output_tokens: row.get(6)?,
        quality_score: row.get(7)?,
        duration_ms: row.get(8)?,
        recorded_at: DateTime::<Utc>::from_timestamp_millis(recorded_ms).unwrap_or_else(Utc::now),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usage(step: u32, agent: &str, quality: Option<f64>) -> StepUsage {
        StepUsage {
            session_id: "s-1".into(),
            workflow: "greenfield".into(),
            step,
            agent: agent.into(),
            model: "claude-3-haiku-20240307".into(),
            input_tokens: 1000,
            output_tokens: 2000,
            quality_score: quality,
            duration_ms: 150,
            recorded_at: Utc::now(),
        }
    }

    #[test]
    fn test_pricing_prefers_longest_prefix() {
        assert_eq!(pricing_for("gpt-4o-mini-2024").input_per_1k, 0.00015);
        assert_eq!(pricing_for("gpt-4o").input_per_1k, 0.0025);
        assert_eq!(pricing_for("gpt-4-turbo").input_per_1k, 0.03);
        assert_eq!(pricing_for("stub").output_per_1k, 0.0);
        // Unknown models get the default rate.
        assert_eq!(pricing_for("mistral-large").input_per_1k, 0.001);
    }

    #[test]
    fn test_cost_math() {
        let usage = usage(1, "pm", None);
        let expected = 1.0 * 0.00025 + 2.0 * 0.00125;
        assert!((usage.cost_usd() - expected).abs() < 1e-9);
    }

    #[test]
    fn test_token_estimate_rounds_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abc"), 1);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }

    #[tokio::test]
    async fn test_record_and_summarize_session() {
        let store = TelemetryStore::open_in_memory().unwrap();
        store.record_step(&usage(1, "analyst", Some(0.8))).await.unwrap();
        store.record_step(&usage(2, "pm", None)).await.unwrap();
        store.record_step(&usage(3, "qa", Some(0.6))).await.unwrap();

        let summary = store.session_summary("s-1").await.unwrap();
        assert_eq!(summary.steps, 3);
        assert_eq!(summary.input_tokens, 3000);
        assert_eq!(summary.output_tokens, 6000);
        // AVG ignores NULL quality scores.
        assert!((summary.avg_quality.unwrap() - 0.7).abs() < 1e-9);
        assert_eq!(summary.total_duration_ms, 450);

        let empty = store.session_summary("s-unknown").await.unwrap();
        assert_eq!(empty.steps, 0);
        assert_eq!(empty.avg_quality, None);
    }

    #[tokio::test]
    async fn test_recent_steps_and_session_costs() {
        let store = TelemetryStore::open_in_memory().unwrap();
        for step in 1..=4 {
            store.record_step(&usage(step, "developer", None)).await.unwrap();
        }
        let recent = store.recent_steps("s-1", 2).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].step, 4);

        let costs = store.session_costs().await.unwrap();
        assert_eq!(costs.len(), 1);
        assert_eq!(costs[0].steps, 4);
        assert!(costs[0].cost_usd > 0.0);
    }
}
