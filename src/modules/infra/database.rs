//! Usage Ledger — durable SQLite store for token accounting.
//!
//! Owns the only database handle in the process. Four tables: usage_logs,
//! rate_limit_events, routing_decisions, sessions. Every other component
//! reads and writes through this module; none touch the store directly.
//!
//! Default path: `<home>/.cruise/usage.db`

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{Local, TimeZone};
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::modules::pricing;
use crate::utils::ids::{new_entry_id, now_ms, session_id_for};

// ============================================================================
// Types
// ============================================================================

/// One row per upstream response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageLog {
    pub id: String,
    pub timestamp: i64,
    pub session_id: String,
    /// Effective target model (after routing)
    pub model: String,
    pub provider: String,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cache_read_tokens: i64,
    pub cache_write_tokens: i64,
    pub cost_usd: f64,
    pub latency_ms: i64,
    pub success: bool,
    pub error_type: Option<String>,
    pub project_path: String,
    /// Original requested model, set iff the request was routed
    pub routed_from: Option<String>,
    pub routing_reason: Option<String>,
}

/// Insert form of `UsageLog`: id and session_id are stamped by the ledger,
/// cost is computed at insert time.
#[derive(Debug, Clone, Default)]
pub struct NewUsageLog {
    pub timestamp: i64,
    pub model: String,
    pub provider: String,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cache_read_tokens: i64,
    pub cache_write_tokens: i64,
    pub latency_ms: i64,
    pub success: bool,
    pub error_type: Option<String>,
    pub project_path: String,
    pub routed_from: Option<String>,
    pub routing_reason: Option<String>,
}

/// One row per observed quota-rejection from an upstream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitEvent {
    pub id: String,
    pub timestamp: i64,
    /// Originally requested model, not the routed one
    pub model: String,
    pub error_type: String,
    pub reset_time: Option<i64>,
    pub tokens_used_before_limit: i64,
    pub window_hours: i64,
}

#[derive(Debug, Clone)]
pub struct NewRateLimitEvent {
    pub timestamp: i64,
    pub model: String,
    pub error_type: String,
    pub reset_time: Option<i64>,
    pub tokens_used_before_limit: i64,
    pub window_hours: i64,
}

/// One row per response that actually switched provider or model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingDecisionRow {
    pub id: String,
    pub timestamp: i64,
    pub session_id: String,
    pub original_provider: String,
    pub routed_provider: String,
    pub routed_model: String,
    pub reason: String,
    pub estimated_savings: f64,
}

#[derive(Debug, Clone)]
pub struct NewRoutingDecision {
    pub timestamp: i64,
    pub original_provider: String,
    pub routed_provider: String,
    pub routed_model: String,
    pub reason: String,
    pub estimated_savings: f64,
}

/// Process-lifetime accounting unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub started_at: i64,
    pub ended_at: Option<i64>,
    pub total_cost: f64,
    pub total_tokens: i64,
    pub project_path: String,
}

/// Aggregate over a timeframe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageTotals {
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cache_read_tokens: i64,
    pub cache_write_tokens: i64,
    pub total_cost: f64,
    pub request_count: i64,
    pub avg_latency: f64,
}

/// Reduction window for totals and savings queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeframe {
    Session,
    Today,
    Week,
}

// ============================================================================
// Ledger
// ============================================================================

pub struct Ledger {
    conn: Mutex<Connection>,
    session_id: String,
    project_path: String,
    closed: AtomicBool,
}

impl Ledger {
    /// Open (or create) the store at `path` and start the process session.
    pub fn open(path: &Path) -> Result<Self, String> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| format!("failed to create data directory: {}", e))?;
            }
        }

        info!("Opening usage ledger: {:?}", path);
        let conn = Connection::open(path)
            .map_err(|e| format!("failed to open database: {}", e))?;

        Self::with_connection(conn)
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self, String> {
        let conn = Connection::open_in_memory()
            .map_err(|e| format!("failed to open in-memory database: {}", e))?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self, String> {
        // WAL admits concurrent reads during writes
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON; PRAGMA busy_timeout=5000;")
            .map_err(|e| format!("failed to set PRAGMA: {}", e))?;

        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS sessions (
                session_id    TEXT PRIMARY KEY,
                started_at    INTEGER NOT NULL,
                ended_at      INTEGER,
                total_cost    REAL NOT NULL DEFAULT 0.0,
                total_tokens  INTEGER NOT NULL DEFAULT 0,
                project_path  TEXT NOT NULL DEFAULT ''
            );

            CREATE TABLE IF NOT EXISTS usage_logs (
                id                  TEXT PRIMARY KEY,
                timestamp           INTEGER NOT NULL,
                session_id          TEXT NOT NULL REFERENCES sessions(session_id),
                model               TEXT NOT NULL,
                provider            TEXT NOT NULL,
                input_tokens        INTEGER NOT NULL DEFAULT 0,
                output_tokens       INTEGER NOT NULL DEFAULT 0,
                cache_read_tokens   INTEGER NOT NULL DEFAULT 0,
                cache_write_tokens  INTEGER NOT NULL DEFAULT 0,
                cost_usd            REAL NOT NULL DEFAULT 0.0,
                latency_ms          INTEGER NOT NULL DEFAULT 0,
                success             INTEGER NOT NULL DEFAULT 1,
                error_type          TEXT,
                project_path        TEXT NOT NULL DEFAULT '',
                routed_from         TEXT,
                routing_reason      TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_usage_logs_timestamp ON usage_logs(timestamp);
            CREATE INDEX IF NOT EXISTS idx_usage_logs_session ON usage_logs(session_id);

            CREATE TABLE IF NOT EXISTS rate_limit_events (
                id                        TEXT PRIMARY KEY,
                timestamp                 INTEGER NOT NULL,
                model                     TEXT NOT NULL,
                error_type                TEXT NOT NULL,
                reset_time                INTEGER,
                tokens_used_before_limit  INTEGER NOT NULL DEFAULT 0,
                window_hours              INTEGER NOT NULL DEFAULT 5
            );

            CREATE INDEX IF NOT EXISTS idx_rate_limit_events_model_ts
                ON rate_limit_events(model, timestamp);

            CREATE TABLE IF NOT EXISTS routing_decisions (
                id                 TEXT PRIMARY KEY,
                timestamp          INTEGER NOT NULL,
                session_id         TEXT NOT NULL REFERENCES sessions(session_id),
                original_provider  TEXT NOT NULL,
                routed_provider    TEXT NOT NULL,
                routed_model       TEXT NOT NULL,
                reason             TEXT NOT NULL DEFAULT '',
                estimated_savings  REAL NOT NULL DEFAULT 0.0
            );

            CREATE INDEX IF NOT EXISTS idx_routing_decisions_timestamp
                ON routing_decisions(timestamp);
            ",
        )
        .map_err(|e| format!("failed to create tables: {}", e))?;

        let started_at = now_ms();
        let session_id = session_id_for(started_at);
        let project_path = std::env::current_dir()
            .map(|p| p.display().to_string())
            .unwrap_or_default();

        conn.execute(
            "INSERT INTO sessions (session_id, started_at, project_path) VALUES (?1, ?2, ?3)",
            params![session_id, started_at, project_path],
        )
        .map_err(|e| format!("failed to create session: {}", e))?;

        info!("Session started: {}", session_id);

        Ok(Self {
            conn: Mutex::new(conn),
            session_id,
            project_path,
            closed: AtomicBool::new(false),
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn project_path(&self) -> &str {
        &self.project_path
    }

    // ========================================================================
    // Usage logs
    // ========================================================================

    /// Insert one usage row and recompute the current session's totals in a
    /// single transaction. Returns the stored row with its id and session_id.
    pub fn add_log(&self, entry: NewUsageLog) -> Result<UsageLog, String> {
        let id = new_entry_id(entry.timestamp);
        let cost_usd = pricing::estimate_cost(
            &entry.model,
            entry.input_tokens,
            entry.output_tokens,
            entry.cache_read_tokens,
            entry.cache_write_tokens,
        );

        let conn = self.conn.lock();
        let tx = conn
            .unchecked_transaction()
            .map_err(|e| format!("begin: {}", e))?;

        tx.execute(
            "INSERT INTO usage_logs (
                id, timestamp, session_id, model, provider,
                input_tokens, output_tokens, cache_read_tokens, cache_write_tokens,
                cost_usd, latency_ms, success, error_type, project_path,
                routed_from, routing_reason
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
            params![
                id,
                entry.timestamp,
                self.session_id,
                entry.model,
                entry.provider,
                entry.input_tokens,
                entry.output_tokens,
                entry.cache_read_tokens,
                entry.cache_write_tokens,
                cost_usd,
                entry.latency_ms,
                entry.success as i32,
                entry.error_type,
                entry.project_path,
                entry.routed_from,
                entry.routing_reason,
            ],
        )
        .map_err(|e| format!("insert usage log: {}", e))?;

        tx.execute(
            "UPDATE sessions SET
                total_cost = (SELECT COALESCE(SUM(cost_usd), 0.0) FROM usage_logs WHERE session_id = ?1),
                total_tokens = (SELECT COALESCE(SUM(input_tokens + output_tokens), 0) FROM usage_logs WHERE session_id = ?1)
             WHERE session_id = ?1",
            params![self.session_id],
        )
        .map_err(|e| format!("update session totals: {}", e))?;

        tx.commit().map_err(|e| format!("commit: {}", e))?;

        Ok(UsageLog {
            id,
            timestamp: entry.timestamp,
            session_id: self.session_id.clone(),
            model: entry.model,
            provider: entry.provider,
            input_tokens: entry.input_tokens,
            output_tokens: entry.output_tokens,
            cache_read_tokens: entry.cache_read_tokens,
            cache_write_tokens: entry.cache_write_tokens,
            cost_usd,
            latency_ms: entry.latency_ms,
            success: entry.success,
            error_type: entry.error_type,
            project_path: entry.project_path,
            routed_from: entry.routed_from,
            routing_reason: entry.routing_reason,
        })
    }

    fn query_logs(&self, where_sql: &str, cutoff: Option<i64>) -> Result<Vec<UsageLog>, String> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT id, timestamp, session_id, model, provider,
                    input_tokens, output_tokens, cache_read_tokens, cache_write_tokens,
                    cost_usd, latency_ms, success, error_type, project_path,
                    routed_from, routing_reason
             FROM usage_logs {} ORDER BY timestamp DESC",
            where_sql
        );
        let mut stmt = conn.prepare(&sql).map_err(|e| format!("prepare: {}", e))?;

        let map_row = |row: &rusqlite::Row<'_>| -> rusqlite::Result<UsageLog> {
            Ok(UsageLog {
                id: row.get(0)?,
                timestamp: row.get(1)?,
                session_id: row.get(2)?,
                model: row.get(3)?,
                provider: row.get(4)?,
                input_tokens: row.get(5)?,
                output_tokens: row.get(6)?,
                cache_read_tokens: row.get(7)?,
                cache_write_tokens: row.get(8)?,
                cost_usd: row.get(9)?,
                latency_ms: row.get(10)?,
                success: row.get::<_, i32>(11)? != 0,
                error_type: row.get(12)?,
                project_path: row.get(13)?,
                routed_from: row.get(14)?,
                routing_reason: row.get(15)?,
            })
        };

        let rows = if let Some(cutoff) = cutoff {
            stmt.query_map(params![cutoff], map_row)
        } else {
            stmt.query_map(params![self.session_id], map_row)
        }
        .map_err(|e| format!("query: {}", e))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| format!("collect: {}", e))?;

        Ok(rows)
    }

    /// Logs covering `[now - hours, now]`, newest first.
    pub fn get_window_logs(&self, hours: f64) -> Result<Vec<UsageLog>, String> {
        let cutoff = now_ms() - (hours * 3_600_000.0) as i64;
        self.query_logs("WHERE timestamp >= ?1", Some(cutoff))
    }

    /// Current session's logs, newest first.
    pub fn get_session_logs(&self) -> Result<Vec<UsageLog>, String> {
        self.query_logs("WHERE session_id = ?1", None)
    }

    /// Logs since local midnight today, newest first.
    pub fn get_today_logs(&self) -> Result<Vec<UsageLog>, String> {
        self.query_logs("WHERE timestamp >= ?1", Some(local_midnight_ms()))
    }

    /// Sum of input+output tokens over a rolling window.
    pub fn get_window_token_sum(&self, hours: f64) -> Result<i64, String> {
        let cutoff = now_ms() - (hours * 3_600_000.0) as i64;
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT COALESCE(SUM(input_tokens + output_tokens), 0) FROM usage_logs WHERE timestamp >= ?1",
            params![cutoff],
            |r| r.get(0),
        )
        .map_err(|e| format!("window sum: {}", e))
    }

    // ========================================================================
    // Aggregation
    // ========================================================================

    pub fn get_total_usage(&self, timeframe: Timeframe) -> Result<UsageTotals, String> {
        const TOTALS: &str = "SELECT COALESCE(SUM(input_tokens),0), COALESCE(SUM(output_tokens),0),
                COALESCE(SUM(cache_read_tokens),0), COALESCE(SUM(cache_write_tokens),0),
                COALESCE(SUM(cost_usd),0.0), COUNT(*), COALESCE(AVG(latency_ms),0.0)
         FROM usage_logs";

        let map_row = |r: &rusqlite::Row<'_>| -> rusqlite::Result<UsageTotals> {
            Ok(UsageTotals {
                input_tokens: r.get(0)?,
                output_tokens: r.get(1)?,
                cache_read_tokens: r.get(2)?,
                cache_write_tokens: r.get(3)?,
                total_cost: r.get(4)?,
                request_count: r.get(5)?,
                avg_latency: r.get(6)?,
            })
        };

        let conn = self.conn.lock();
        match timeframe {
            Timeframe::Session => conn.query_row(
                &format!("{} WHERE session_id = ?1", TOTALS),
                params![self.session_id],
                map_row,
            ),
            Timeframe::Today => conn.query_row(
                &format!("{} WHERE timestamp >= ?1", TOTALS),
                params![local_midnight_ms()],
                map_row,
            ),
            Timeframe::Week => conn.query_row(
                &format!("{} WHERE timestamp >= ?1", TOTALS),
                params![now_ms() - 7 * 86_400_000],
                map_row,
            ),
        }
        .map_err(|e| format!("totals: {}", e))
    }

    // ========================================================================
    // Rate-limit events
    // ========================================================================

    /// Insert a quota-rejection event. Learned-limit updates are the
    /// Limit Learner's job, not the ledger's.
    pub fn add_rate_limit_event(&self, event: NewRateLimitEvent) -> Result<RateLimitEvent, String> {
        let id = new_entry_id(event.timestamp);
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO rate_limit_events
                (id, timestamp, model, error_type, reset_time, tokens_used_before_limit, window_hours)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                id,
                event.timestamp,
                event.model,
                event.error_type,
                event.reset_time,
                event.tokens_used_before_limit,
                event.window_hours,
            ],
        )
        .map_err(|e| format!("insert rate limit event: {}", e))?;

        Ok(RateLimitEvent {
            id,
            timestamp: event.timestamp,
            model: event.model,
            error_type: event.error_type,
            reset_time: event.reset_time,
            tokens_used_before_limit: event.tokens_used_before_limit,
            window_hours: event.window_hours,
        })
    }

    fn query_rate_limit_events(
        &self,
        where_sql: &str,
        order_sql: &str,
        text_param: Option<&str>,
        int_param: Option<i64>,
    ) -> Result<Vec<RateLimitEvent>, String> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT id, timestamp, model, error_type, reset_time, tokens_used_before_limit, window_hours
             FROM rate_limit_events {} {}",
            where_sql, order_sql
        );
        let mut stmt = conn.prepare(&sql).map_err(|e| format!("prepare: {}", e))?;

        let map_row = |row: &rusqlite::Row<'_>| -> rusqlite::Result<RateLimitEvent> {
            Ok(RateLimitEvent {
                id: row.get(0)?,
                timestamp: row.get(1)?,
                model: row.get(2)?,
                error_type: row.get(3)?,
                reset_time: row.get(4)?,
                tokens_used_before_limit: row.get(5)?,
                window_hours: row.get(6)?,
            })
        };

        let rows = match (text_param, int_param) {
            (Some(t), None) => stmt.query_map(params![t], map_row),
            (None, Some(i)) => stmt.query_map(params![i], map_row),
            _ => stmt.query_map([], map_row),
        }
        .map_err(|e| format!("query: {}", e))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| format!("collect: {}", e))?;

        Ok(rows)
    }

    /// All quota-rejections for one model, newest first.
    pub fn get_rate_limit_history(&self, model: &str) -> Result<Vec<RateLimitEvent>, String> {
        self.query_rate_limit_events(
            "WHERE model = ?1",
            "ORDER BY timestamp DESC",
            Some(model),
            None,
        )
    }

    /// Quota-rejections in the last `hours`, oldest first so callers can
    /// replay them chronologically.
    pub fn get_rate_limit_window(&self, hours: f64) -> Result<Vec<RateLimitEvent>, String> {
        let cutoff = now_ms() - (hours * 3_600_000.0) as i64;
        self.query_rate_limit_events(
            "WHERE timestamp >= ?1",
            "ORDER BY timestamp ASC",
            None,
            Some(cutoff),
        )
    }

    // ========================================================================
    // Routing decisions
    // ========================================================================

    pub fn add_routing_decision(
        &self,
        decision: NewRoutingDecision,
    ) -> Result<RoutingDecisionRow, String> {
        let id = new_entry_id(decision.timestamp);
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO routing_decisions
                (id, timestamp, session_id, original_provider, routed_provider,
                 routed_model, reason, estimated_savings)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                id,
                decision.timestamp,
                self.session_id,
                decision.original_provider,
                decision.routed_provider,
                decision.routed_model,
                decision.reason,
                decision.estimated_savings,
            ],
        )
        .map_err(|e| format!("insert routing decision: {}", e))?;

        Ok(RoutingDecisionRow {
            id,
            timestamp: decision.timestamp,
            session_id: self.session_id.clone(),
            original_provider: decision.original_provider,
            routed_provider: decision.routed_provider,
            routed_model: decision.routed_model,
            reason: decision.reason,
            estimated_savings: decision.estimated_savings,
        })
    }

    /// Sum of estimated savings over a timeframe, in USD.
    pub fn get_routing_savings(&self, timeframe: Timeframe) -> Result<f64, String> {
        const SAVINGS: &str =
            "SELECT COALESCE(SUM(estimated_savings), 0.0) FROM routing_decisions";

        let conn = self.conn.lock();
        match timeframe {
            Timeframe::Session => conn.query_row(
                &format!("{} WHERE session_id = ?1", SAVINGS),
                params![self.session_id],
                |r| r.get(0),
            ),
            Timeframe::Today => conn.query_row(
                &format!("{} WHERE timestamp >= ?1", SAVINGS),
                params![local_midnight_ms()],
                |r| r.get(0),
            ),
            Timeframe::Week => conn.query_row(
                &format!("{} WHERE timestamp >= ?1", SAVINGS),
                params![now_ms() - 7 * 86_400_000],
                |r| r.get(0),
            ),
        }
        .map_err(|e| format!("savings: {}", e))
    }

    // ========================================================================
    // Sessions & maintenance
    // ========================================================================

    pub fn get_session(&self) -> Result<Session, String> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT session_id, started_at, ended_at, total_cost, total_tokens, project_path
             FROM sessions WHERE session_id = ?1",
            params![self.session_id],
            |row| {
                Ok(Session {
                    session_id: row.get(0)?,
                    started_at: row.get(1)?,
                    ended_at: row.get(2)?,
                    total_cost: row.get(3)?,
                    total_tokens: row.get(4)?,
                    project_path: row.get(5)?,
                })
            },
        )
        .map_err(|e| format!("session not found: {}", e))
    }

    /// Delete usage logs older than `retention_days`. Returns the number of
    /// rows removed. Sessions and events are kept.
    pub fn cleanup(&self, retention_days: i64) -> Result<usize, String> {
        let cutoff = now_ms() - retention_days * 86_400_000;
        let conn = self.conn.lock();
        let affected = conn
            .execute(
                "DELETE FROM usage_logs WHERE timestamp < ?1",
                params![cutoff],
            )
            .map_err(|e| format!("cleanup: {}", e))?;
        info!("Cleanup removed {} usage logs older than {} days", affected, retention_days);
        Ok(affected)
    }

    pub fn vacuum(&self) -> Result<(), String> {
        let conn = self.conn.lock();
        conn.execute_batch("VACUUM")
            .map_err(|e| format!("vacuum: {}", e))
    }

    /// Mark the session ended and stop accepting the handle. Idempotent.
    pub fn close(&self) -> Result<(), String> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE sessions SET ended_at = ?1 WHERE session_id = ?2",
            params![now_ms(), self.session_id],
        )
        .map_err(|e| format!("close session: {}", e))?;
        info!("Session closed: {}", self.session_id);
        Ok(())
    }
}

/// Millisecond timestamp of local midnight today.
fn local_midnight_ms() -> i64 {
    let now = Local::now();
    let midnight = now.date_naive().and_hms_opt(0, 0, 0).unwrap_or_default();
    match Local.from_local_datetime(&midnight).earliest() {
        Some(dt) => dt.timestamp_millis(),
        None => now.timestamp_millis() - now.timestamp_millis() % 86_400_000,
    }
}

// ============================================================================
// Tests
// ============================================================================
