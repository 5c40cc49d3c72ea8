//! SQLite-backed repository.
//!
//! A single connection behind `Arc<Mutex<_>>`, WAL mode, foreign keys on.
//! Timestamps are stored as RFC 3339 text; structured blobs (config
//! snapshots, event payloads, digests) as JSON text. Every application
//! status update runs in one transaction together with its status-history
//! row and its event, per the repository contract.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::info;
use uuid::Uuid;

use jobpilot_core::digest::SessionDigest;
use jobpilot_core::governor::DomainPolicy;
use jobpilot_core::model::{
    Application, ApplicationId, ApplicationStatus, CompanyTier, CounterDelta, Effort, Event,
    EventType, FieldDescriptor, ModelUsage, Question, Session, SessionCounters, SessionId,
    SessionLimits, SessionStatus, UsageStatus, ValueSource,
};

use super::{Repository, RepositoryError, Result};

/// SQLite repository.
#[derive(Debug, Clone)]
pub struct SqliteRepository {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteRepository {
    /// Opens (or creates) a database at `path` and initializes the schema.
    ///
    /// # Errors
    ///
    /// Returns a storage error when the file cannot be opened or the schema
    /// cannot be created.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    /// Opens an in-memory database, for tests and dry runs.
    ///
    /// # Errors
    ///
    /// Returns a storage error when schema creation fails.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.pragma_update(None, "busy_timeout", 5_000)?;
        Self::init_schema(&conn)?;
        info!("repository schema ready");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Creates all tables and indexes.
    ///
    /// # Errors
    ///
    /// Returns the underlying SQLite error on failure.
    pub fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                status TEXT NOT NULL,
                max_items INTEGER NOT NULL,
                max_duration_secs INTEGER NOT NULL,
                max_concurrency INTEGER NOT NULL,
                budget_micros INTEGER NOT NULL,
                attempted INTEGER NOT NULL DEFAULT 0,
                succeeded INTEGER NOT NULL DEFAULT 0,
                failed INTEGER NOT NULL DEFAULT 0,
                skipped INTEGER NOT NULL DEFAULT 0,
                cancelled INTEGER NOT NULL DEFAULT 0,
                in_flight INTEGER NOT NULL DEFAULT 0,
                tokens_in INTEGER NOT NULL DEFAULT 0,
                tokens_out INTEGER NOT NULL DEFAULT 0,
                cost_micros INTEGER NOT NULL DEFAULT 0,
                config_snapshot TEXT NOT NULL,
                timezone TEXT NOT NULL,
                created_at TEXT NOT NULL,
                started_at TEXT,
                ended_at TEXT,
                heartbeat_at TEXT
            );
            CREATE TABLE IF NOT EXISTS applications (
                id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL REFERENCES sessions(id),
                user_id TEXT NOT NULL,
                job_url TEXT NOT NULL,
                job_title TEXT,
                company TEXT,
                company_tier TEXT NOT NULL,
                domain TEXT NOT NULL,
                hint_effort TEXT NOT NULL,
                effort TEXT,
                qa_required INTEGER NOT NULL DEFAULT 0,
                match_score REAL NOT NULL,
                status TEXT NOT NULL,
                enqueue_seq INTEGER NOT NULL,
                resume_ref TEXT,
                profile_ref TEXT,
                failure_code TEXT,
                failure_detail TEXT,
                tokens_in INTEGER NOT NULL DEFAULT 0,
                tokens_out INTEGER NOT NULL DEFAULT 0,
                cost_micros INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                started_at TEXT,
                submitted_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_applications_session
                ON applications(session_id, status);
            CREATE TABLE IF NOT EXISTS application_status_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                application_id TEXT NOT NULL REFERENCES applications(id),
                from_status TEXT NOT NULL,
                to_status TEXT NOT NULL,
                reason_code TEXT,
                reason_detail TEXT,
                at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS questions (
                application_id TEXT NOT NULL REFERENCES applications(id),
                step_index INTEGER NOT NULL,
                field_type TEXT NOT NULL,
                label TEXT NOT NULL,
                raw_label TEXT NOT NULL,
                required INTEGER NOT NULL,
                value TEXT NOT NULL,
                source TEXT NOT NULL,
                confidence REAL NOT NULL,
                validation_error TEXT,
                correction TEXT,
                corrected_by TEXT,
                at TEXT NOT NULL,
                PRIMARY KEY (application_id, step_index)
            );
            CREATE TABLE IF NOT EXISTS events (
                session_id TEXT NOT NULL REFERENCES sessions(id),
                seq INTEGER NOT NULL,
                id TEXT NOT NULL,
                application_id TEXT,
                event_type TEXT NOT NULL,
                detail TEXT,
                payload TEXT NOT NULL,
                at TEXT NOT NULL,
                PRIMARY KEY (session_id, seq)
            );
            CREATE INDEX IF NOT EXISTS idx_events_application
                ON events(application_id);
            CREATE TABLE IF NOT EXISTS model_usage (
                id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL REFERENCES sessions(id),
                application_id TEXT,
                provider TEXT NOT NULL,
                model TEXT NOT NULL,
                purpose TEXT NOT NULL,
                tokens_in INTEGER NOT NULL,
                tokens_out INTEGER NOT NULL,
                cost_micros INTEGER NOT NULL,
                started_at TEXT NOT NULL,
                ended_at TEXT,
                status TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS digests (
                session_id TEXT PRIMARY KEY REFERENCES sessions(id),
                summary TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS domain_policies (
                domain TEXT PRIMARY KEY,
                max_per_day INTEGER NOT NULL,
                min_interval_secs INTEGER NOT NULL,
                max_concurrent INTEGER NOT NULL,
                avoid INTEGER NOT NULL,
                cooldown_secs INTEGER NOT NULL,
                jitter_max_secs INTEGER NOT NULL,
                blocked_until TEXT
            );",
        )
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

// Fixed-width form so lexicographic comparison in SQL matches time order.
fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}

fn parse_ts(column: usize, text: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                column,
                rusqlite::types::Type::Text,
                Box::new(e),
            )
        })
}

fn parse_opt_ts(column: usize, text: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    text.map(|t| parse_ts(column, &t)).transpose()
}

fn parse_uuid(column: usize, text: &str) -> rusqlite::Result<Uuid> {
    Uuid::parse_str(text).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn conversion<E>(column: usize) -> impl FnOnce(E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    move |e| {
        rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, Box::new(e))
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn row_to_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<Session> {
    let id: String = row.get("id")?;
    let user_id: String = row.get("user_id")?;
    let status: String = row.get("status")?;
    let config: String = row.get("config_snapshot")?;
    Ok(Session {
        id: SessionId(parse_uuid(0, &id)?),
        user_id: parse_uuid(1, &user_id)?,
        status: SessionStatus::parse(&status).map_err(conversion(2))?,
        limits: SessionLimits {
            max_items: row.get("max_items")?,
            max_duration_secs: row.get::<_, i64>("max_duration_secs")? as u64,
            max_concurrency: row.get("max_concurrency")?,
            budget_micros: row.get::<_, i64>("budget_micros")? as u64,
        },
        counters: SessionCounters {
            attempted: row.get("attempted")?,
            succeeded: row.get("succeeded")?,
            failed: row.get("failed")?,
            skipped: row.get("skipped")?,
            cancelled: row.get("cancelled")?,
            in_flight: row.get("in_flight")?,
            tokens_in: row.get::<_, i64>("tokens_in")? as u64,
            tokens_out: row.get::<_, i64>("tokens_out")? as u64,
            cost_micros: row.get::<_, i64>("cost_micros")? as u64,
        },
        config_snapshot: serde_json::from_str(&config).map_err(conversion(3))?,
        timezone: row.get("timezone")?,
        created_at: parse_ts(4, &row.get::<_, String>("created_at")?)?,
        started_at: parse_opt_ts(5, row.get("started_at")?)?,
        ended_at: parse_opt_ts(6, row.get("ended_at")?)?,
        heartbeat_at: parse_opt_ts(7, row.get("heartbeat_at")?)?,
    })
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn row_to_application(row: &rusqlite::Row<'_>) -> rusqlite::Result<Application> {
    let id: String = row.get("id")?;
    let session_id: String = row.get("session_id")?;
    let user_id: String = row.get("user_id")?;
    let tier: String = row.get("company_tier")?;
    let hint: String = row.get("hint_effort")?;
    let effort: Option<String> = row.get("effort")?;
    let status: String = row.get("status")?;
    Ok(Application {
        id: ApplicationId(parse_uuid(0, &id)?),
        session_id: SessionId(parse_uuid(1, &session_id)?),
        user_id: parse_uuid(2, &user_id)?,
        job_url: row.get("job_url")?,
        job_title: row.get("job_title")?,
        company: row.get("company")?,
        company_tier: CompanyTier::parse(&tier).map_err(conversion(3))?,
        domain: row.get("domain")?,
        hint_effort: Effort::parse(&hint).map_err(conversion(4))?,
        effort: effort
            .map(|e| Effort::parse(&e).map_err(conversion(5)))
            .transpose()?,
        match_score: row.get("match_score")?,
        status: ApplicationStatus::parse(&status).map_err(conversion(6))?,
        enqueue_seq: row.get("enqueue_seq")?,
        resume_ref: row.get("resume_ref")?,
        profile_ref: row.get("profile_ref")?,
        failure_code: row.get("failure_code")?,
        failure_detail: row.get("failure_detail")?,
        tokens_in: row.get::<_, i64>("tokens_in")? as u64,
        tokens_out: row.get::<_, i64>("tokens_out")? as u64,
        cost_micros: row.get::<_, i64>("cost_micros")? as u64,
        created_at: parse_ts(7, &row.get::<_, String>("created_at")?)?,
        started_at: parse_opt_ts(8, row.get("started_at")?)?,
        submitted_at: parse_opt_ts(9, row.get("submitted_at")?)?,
    })
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn row_to_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<Event> {
    let id: String = row.get("id")?;
    let session_id: String = row.get("session_id")?;
    let application_id: Option<String> = row.get("application_id")?;
    let event_type: String = row.get("event_type")?;
    let payload: String = row.get("payload")?;
    Ok(Event {
        id: parse_uuid(0, &id)?,
        session_id: SessionId(parse_uuid(1, &session_id)?),
        application_id: application_id
            .map(|a| parse_uuid(2, &a).map(ApplicationId))
            .transpose()?,
        seq: row.get::<_, i64>("seq")? as u64,
        event_type: EventType::parse(&event_type).map_err(conversion(3))?,
        detail: row.get("detail")?,
        payload: serde_json::from_str(&payload).map_err(conversion(4))?,
        at: parse_ts(5, &row.get::<_, String>("at")?)?,
    })
}

const SESSION_COLUMNS: &str = "id, user_id, status, max_items, max_duration_secs, \
     max_concurrency, budget_micros, attempted, succeeded, failed, skipped, cancelled, \
     in_flight, tokens_in, tokens_out, cost_micros, config_snapshot, timezone, created_at, \
     started_at, ended_at, heartbeat_at";

const APPLICATION_COLUMNS: &str = "id, session_id, user_id, job_url, job_title, company, \
     company_tier, domain, hint_effort, effort, qa_required, match_score, status, enqueue_seq, \
     resume_ref, profile_ref, failure_code, failure_detail, tokens_in, tokens_out, cost_micros, \
     created_at, started_at, submitted_at";

#[allow(clippy::cast_possible_wrap)]
impl Repository for SqliteRepository {
    fn create_session(&self, session: &Session) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO sessions (id, user_id, status, max_items, max_duration_secs, \
             max_concurrency, budget_micros, config_snapshot, timezone, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                session.id.to_string(),
                session.user_id.to_string(),
                session.status.as_str(),
                session.limits.max_items,
                session.limits.max_duration_secs as i64,
                session.limits.max_concurrency,
                session.limits.budget_micros as i64,
                serde_json::to_string(&session.config_snapshot)?,
                session.timezone,
                ts(session.created_at),
            ],
        )?;
        Ok(())
    }

    fn get_session(&self, id: SessionId) -> Result<Session> {
        let conn = self.lock();
        conn.query_row(
            &format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?1"),
            params![id.to_string()],
            row_to_session,
        )
        .optional()?
        .ok_or_else(|| RepositoryError::NotFound {
            entity: "session",
            id: id.to_string(),
        })
    }

    fn update_session_status(&self, id: SessionId, to: SessionStatus) -> Result<()> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let current: String = tx
            .query_row(
                "SELECT status FROM sessions WHERE id = ?1",
                params![id.to_string()],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| RepositoryError::NotFound {
                entity: "session",
                id: id.to_string(),
            })?;
        SessionStatus::parse(&current)?.transition_to(to)?;
        tx.execute(
            "UPDATE sessions SET status = ?2 WHERE id = ?1",
            params![id.to_string(), to.as_str()],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn add_session_counters(&self, id: SessionId, delta: &CounterDelta) -> Result<()> {
        let conn = self.lock();
        let current: String = conn
            .query_row(
                "SELECT status FROM sessions WHERE id = ?1",
                params![id.to_string()],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| RepositoryError::NotFound {
                entity: "session",
                id: id.to_string(),
            })?;
        if SessionStatus::parse(&current)?.is_terminal() {
            return Err(RepositoryError::Frozen(id.to_string()));
        }
        conn.execute(
            "UPDATE sessions SET \
                attempted = attempted + ?2, succeeded = succeeded + ?3, \
                failed = failed + ?4, skipped = skipped + ?5, \
                cancelled = cancelled + ?6, in_flight = in_flight + ?7, \
                tokens_in = tokens_in + ?8, tokens_out = tokens_out + ?9, \
                cost_micros = cost_micros + ?10 \
             WHERE id = ?1",
            params![
                id.to_string(),
                delta.attempted,
                delta.succeeded,
                delta.failed,
                delta.skipped,
                delta.cancelled,
                delta.in_flight,
                delta.tokens_in as i64,
                delta.tokens_out as i64,
                delta.cost_micros as i64,
            ],
        )?;
        Ok(())
    }

    fn mark_session_terminal(
        &self,
        id: SessionId,
        to: SessionStatus,
        ended_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let current: String = tx
            .query_row(
                "SELECT status FROM sessions WHERE id = ?1",
                params![id.to_string()],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| RepositoryError::NotFound {
                entity: "session",
                id: id.to_string(),
            })?;
        SessionStatus::parse(&current)?.transition_to(to)?;
        tx.execute(
            "UPDATE sessions SET status = ?2, ended_at = ?3 WHERE id = ?1",
            params![id.to_string(), to.as_str(), ts(ended_at)],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn set_session_started(&self, id: SessionId, at: DateTime<Utc>) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE sessions SET started_at = COALESCE(started_at, ?2) WHERE id = ?1",
            params![id.to_string(), ts(at)],
        )?;
        Ok(())
    }

    fn touch_heartbeat(&self, id: SessionId, at: DateTime<Utc>) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE sessions SET heartbeat_at = ?2 WHERE id = ?1",
            params![id.to_string(), ts(at)],
        )?;
        Ok(())
    }

    fn list_stale_sessions(&self, expiry: DateTime<Utc>) -> Result<Vec<Session>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions \
             WHERE status NOT IN ('completed', 'failed', 'cancelled') \
               AND (heartbeat_at IS NULL OR heartbeat_at < ?1) \
               AND status != 'planned'"
        ))?;
        let rows = stmt.query_map(params![ts(expiry)], row_to_session)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn create_application(&self, app: &Application) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO applications (id, session_id, user_id, job_url, job_title, company, \
             company_tier, domain, hint_effort, match_score, status, enqueue_seq, resume_ref, \
             profile_ref, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            params![
                app.id.to_string(),
                app.session_id.to_string(),
                app.user_id.to_string(),
                app.job_url,
                app.job_title,
                app.company,
                app.company_tier.as_str(),
                app.domain,
                app.hint_effort.as_str(),
                app.match_score,
                app.status.as_str(),
                app.enqueue_seq,
                app.resume_ref,
                app.profile_ref,
                ts(app.created_at),
            ],
        )?;
        Ok(())
    }

    fn get_application(&self, id: ApplicationId) -> Result<Application> {
        let conn = self.lock();
        conn.query_row(
            &format!("SELECT {APPLICATION_COLUMNS} FROM applications WHERE id = ?1"),
            params![id.to_string()],
            row_to_application,
        )
        .optional()?
        .ok_or_else(|| RepositoryError::NotFound {
            entity: "application",
            id: id.to_string(),
        })
    }

    fn update_application_status(
        &self,
        id: ApplicationId,
        to: ApplicationStatus,
        reason: Option<(&str, &str)>,
        event: &Event,
    ) -> Result<()> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let current: String = tx
            .query_row(
                "SELECT status FROM applications WHERE id = ?1",
                params![id.to_string()],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| RepositoryError::NotFound {
                entity: "application",
                id: id.to_string(),
            })?;
        let from = ApplicationStatus::parse(&current)?;
        from.transition_to(to)?;

        let (code, detail) = match reason {
            Some((c, d)) => (Some(c), Some(d)),
            None => (None, None),
        };
        tx.execute(
            "UPDATE applications SET status = ?2, \
                failure_code = COALESCE(?3, failure_code), \
                failure_detail = COALESCE(?4, failure_detail) \
             WHERE id = ?1",
            params![id.to_string(), to.as_str(), code, detail],
        )?;
        tx.execute(
            "INSERT INTO application_status_history \
             (application_id, from_status, to_status, reason_code, reason_detail, at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                id.to_string(),
                from.as_str(),
                to.as_str(),
                code,
                detail,
                ts(event.at),
            ],
        )?;
        tx.execute(
            "INSERT OR IGNORE INTO events \
             (session_id, seq, id, application_id, event_type, detail, payload, at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                event.session_id.to_string(),
                event.seq as i64,
                event.id.to_string(),
                event.application_id.map(|a| a.to_string()),
                event.event_type.as_str(),
                event.detail,
                serde_json::to_string(&event.payload)?,
                ts(event.at),
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn set_application_effort(
        &self,
        id: ApplicationId,
        effort: Effort,
        qa_required: bool,
    ) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE applications SET effort = ?2, qa_required = ?3 WHERE id = ?1",
            params![id.to_string(), effort.as_str(), i32::from(qa_required)],
        )?;
        Ok(())
    }

    fn set_application_timing(
        &self,
        id: ApplicationId,
        started_at: Option<DateTime<Utc>>,
        submitted_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE applications SET \
                started_at = COALESCE(?2, started_at), \
                submitted_at = COALESCE(?3, submitted_at) \
             WHERE id = ?1",
            params![id.to_string(), started_at.map(ts), submitted_at.map(ts)],
        )?;
        Ok(())
    }

    fn add_application_usage(
        &self,
        id: ApplicationId,
        tokens_in: u64,
        tokens_out: u64,
        cost_micros: u64,
    ) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE applications SET \
                tokens_in = tokens_in + ?2, tokens_out = tokens_out + ?3, \
                cost_micros = cost_micros + ?4 \
             WHERE id = ?1",
            params![
                id.to_string(),
                tokens_in as i64,
                tokens_out as i64,
                cost_micros as i64
            ],
        )?;
        Ok(())
    }

    fn list_queued(&self, session: SessionId, limit: u32) -> Result<Vec<Application>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {APPLICATION_COLUMNS} FROM applications \
             WHERE session_id = ?1 AND status = 'queued' \
             ORDER BY enqueue_seq ASC LIMIT ?2"
        ))?;
        let rows = stmt.query_map(params![session.to_string(), limit], row_to_application)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn list_in_progress(&self, session: SessionId) -> Result<Vec<Application>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {APPLICATION_COLUMNS} FROM applications \
             WHERE session_id = ?1 AND status IN ('in_progress', 'paused') \
             ORDER BY enqueue_seq ASC"
        ))?;
        let rows = stmt.query_map(params![session.to_string()], row_to_application)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn list_applications(&self, session: SessionId) -> Result<Vec<Application>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {APPLICATION_COLUMNS} FROM applications \
             WHERE session_id = ?1 ORDER BY enqueue_seq ASC"
        ))?;
        let rows = stmt.query_map(params![session.to_string()], row_to_application)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn append_question(
        &self,
        application: ApplicationId,
        field: &FieldDescriptor,
        value: &str,
        source: ValueSource,
        confidence: f64,
        validation_error: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<u32> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let step: u32 = tx.query_row(
            "SELECT COALESCE(MAX(step_index) + 1, 0) FROM questions WHERE application_id = ?1",
            params![application.to_string()],
            |row| row.get(0),
        )?;
        tx.execute(
            "INSERT INTO questions (application_id, step_index, field_type, label, raw_label, \
             required, value, source, confidence, validation_error, at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                application.to_string(),
                step,
                field.field_type,
                field.label,
                field.raw_label,
                i32::from(field.required),
                value,
                source.as_str(),
                confidence,
                validation_error,
                ts(at),
            ],
        )?;
        tx.commit()?;
        Ok(step)
    }

    fn list_questions(&self, application: ApplicationId) -> Result<Vec<Question>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT application_id, step_index, field_type, label, raw_label, required, value, \
             source, confidence, validation_error, correction, corrected_by, at \
             FROM questions WHERE application_id = ?1 ORDER BY step_index ASC",
        )?;
        let rows = stmt.query_map(params![application.to_string()], |row| {
            let app: String = row.get("application_id")?;
            let source: String = row.get("source")?;
            Ok(Question {
                application_id: ApplicationId(parse_uuid(0, &app)?),
                step_index: row.get("step_index")?,
                field: FieldDescriptor {
                    field_type: row.get("field_type")?,
                    label: row.get("label")?,
                    raw_label: row.get("raw_label")?,
                    required: row.get::<_, i32>("required")? != 0,
                },
                value: row.get("value")?,
                source: ValueSource::parse(&source).map_err(conversion(1))?,
                confidence: row.get("confidence")?,
                validation_error: row.get("validation_error")?,
                correction: row.get("correction")?,
                corrected_by: row.get("corrected_by")?,
                at: parse_ts(2, &row.get::<_, String>("at")?)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn append_event(&self, event: &Event) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT OR IGNORE INTO events \
             (session_id, seq, id, application_id, event_type, detail, payload, at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                event.session_id.to_string(),
                event.seq as i64,
                event.id.to_string(),
                event.application_id.map(|a| a.to_string()),
                event.event_type.as_str(),
                event.detail,
                serde_json::to_string(&event.payload)?,
                ts(event.at),
            ],
        )?;
        Ok(())
    }

    fn max_event_seq(&self, session: SessionId) -> Result<u64> {
        let conn = self.lock();
        let max: i64 = conn.query_row(
            "SELECT COALESCE(MAX(seq), 0) FROM events WHERE session_id = ?1",
            params![session.to_string()],
            |row| row.get(0),
        )?;
        #[allow(clippy::cast_sign_loss)]
        Ok(max as u64)
    }

    fn list_events(&self, session: SessionId) -> Result<Vec<Event>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT session_id, seq, id, application_id, event_type, detail, payload, at \
             FROM events WHERE session_id = ?1 ORDER BY seq ASC",
        )?;
        let rows = stmt.query_map(params![session.to_string()], row_to_event)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn append_usage(&self, usage: &ModelUsage) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO model_usage (id, session_id, application_id, provider, model, purpose, \
             tokens_in, tokens_out, cost_micros, started_at, ended_at, status) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                usage.id.to_string(),
                usage.session_id.to_string(),
                usage.application_id.map(|a| a.to_string()),
                usage.provider,
                usage.model,
                usage.purpose,
                usage.tokens_in as i64,
                usage.tokens_out as i64,
                usage.cost_micros as i64,
                ts(usage.started_at),
                usage.ended_at.map(ts),
                usage.status.as_str(),
            ],
        )?;
        Ok(())
    }

    fn list_usage(&self, session: SessionId) -> Result<Vec<ModelUsage>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, session_id, application_id, provider, model, purpose, tokens_in, \
             tokens_out, cost_micros, started_at, ended_at, status \
             FROM model_usage WHERE session_id = ?1 ORDER BY started_at ASC",
        )?;
        let rows = stmt.query_map(params![session.to_string()], |row| {
            let id: String = row.get("id")?;
            let session_id: String = row.get("session_id")?;
            let application_id: Option<String> = row.get("application_id")?;
            let status: String = row.get("status")?;
            #[allow(clippy::cast_sign_loss)]
            Ok(ModelUsage {
                id: parse_uuid(0, &id)?,
                session_id: SessionId(parse_uuid(1, &session_id)?),
                application_id: application_id
                    .map(|a| parse_uuid(2, &a).map(ApplicationId))
                    .transpose()?,
                provider: row.get("provider")?,
                model: row.get("model")?,
                purpose: row.get("purpose")?,
                tokens_in: row.get::<_, i64>("tokens_in")? as u64,
                tokens_out: row.get::<_, i64>("tokens_out")? as u64,
                cost_micros: row.get::<_, i64>("cost_micros")? as u64,
                started_at: parse_ts(3, &row.get::<_, String>("started_at")?)?,
                ended_at: parse_opt_ts(4, row.get("ended_at")?)?,
                status: if status == "ok" {
                    UsageStatus::Ok
                } else {
                    UsageStatus::Error
                },
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn upsert_digest(&self, digest: &SessionDigest) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO digests (session_id, summary, created_at) VALUES (?1, ?2, ?3) \
             ON CONFLICT(session_id) DO UPDATE SET summary = excluded.summary, \
             created_at = excluded.created_at",
            params![
                digest.session_id.to_string(),
                serde_json::to_string(digest)?,
                ts(Utc::now()),
            ],
        )?;
        Ok(())
    }

    fn get_digest(&self, session: SessionId) -> Result<Option<SessionDigest>> {
        let conn = self.lock();
        let summary: Option<String> = conn
            .query_row(
                "SELECT summary FROM digests WHERE session_id = ?1",
                params![session.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        summary
            .map(|s| serde_json::from_str(&s).map_err(RepositoryError::from))
            .transpose()
    }

    fn load_domain_policies(&self) -> Result<HashMap<String, DomainPolicy>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT domain, max_per_day, min_interval_secs, max_concurrent, avoid, \
             cooldown_secs, jitter_max_secs, blocked_until FROM domain_policies",
        )?;
        let rows = stmt.query_map([], |row| {
            let domain: String = row.get("domain")?;
            #[allow(clippy::cast_sign_loss)]
            let policy = DomainPolicy {
                max_per_day: row.get("max_per_day")?,
                min_interval_secs: row.get::<_, i64>("min_interval_secs")? as u64,
                max_concurrent: row.get("max_concurrent")?,
                avoid: row.get::<_, i32>("avoid")? != 0,
                cooldown_secs: row.get::<_, i64>("cooldown_secs")? as u64,
                jitter_max_secs: row.get::<_, i64>("jitter_max_secs")? as u64,
                blocked_until: parse_opt_ts(0, row.get("blocked_until")?)?,
            };
            Ok((domain, policy))
        })?;
        Ok(rows.collect::<rusqlite::Result<HashMap<_, _>>>()?)
    }

    fn upsert_domain_policy(&self, domain: &str, policy: &DomainPolicy) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO domain_policies (domain, max_per_day, min_interval_secs, \
             max_concurrent, avoid, cooldown_secs, jitter_max_secs, blocked_until) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8) \
             ON CONFLICT(domain) DO UPDATE SET \
                max_per_day = excluded.max_per_day, \
                min_interval_secs = excluded.min_interval_secs, \
                max_concurrent = excluded.max_concurrent, \
                avoid = excluded.avoid, \
                cooldown_secs = excluded.cooldown_secs, \
                jitter_max_secs = excluded.jitter_max_secs, \
                blocked_until = excluded.blocked_until",
            params![
                domain,
                policy.max_per_day,
                policy.min_interval_secs as i64,
                policy.max_concurrent,
                i32::from(policy.avoid),
                policy.cooldown_secs as i64,
                policy.jitter_max_secs as i64,
                policy.blocked_until.map(ts),
            ],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobpilot_core::model::{CompanyTier, Effort, JobSpec};

    fn repo() -> SqliteRepository {
        SqliteRepository::open_in_memory().unwrap()
    }

    fn session() -> Session {
        Session {
            id: SessionId::new(),
            user_id: Uuid::new_v4(),
            status: SessionStatus::Planned,
            limits: SessionLimits::default(),
            counters: SessionCounters::default(),
            config_snapshot: serde_json::json!({"max_items": 25}),
            timezone: "UTC".to_string(),
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
            heartbeat_at: None,
        }
    }

    fn application(session: &Session, seq: i64) -> Application {
        Application::from_spec(
            session.id,
            session.user_id,
            &JobSpec {
                url: format!("https://ats.example.com/jobs/{seq}"),
                title: Some("Engineer".into()),
                company: Some("Example".into()),
                description: None,
                company_tier: CompanyTier::Normal,
                hint_effort: Effort::Medium,
            },
            0.8,
            seq,
            Utc::now(),
        )
        .unwrap()
    }

    fn event(
        session: SessionId,
        app: Option<ApplicationId>,
        seq: u64,
        event_type: EventType,
    ) -> Event {
        Event::new(
            session,
            app,
            seq,
            event_type,
            None,
            serde_json::json!({}),
            Utc::now(),
        )
    }

    #[test]
    fn test_session_round_trip() {
        let r = repo();
        let s = session();
        r.create_session(&s).unwrap();
        let loaded = r.get_session(s.id).unwrap();
        assert_eq!(loaded.id, s.id);
        assert_eq!(loaded.status, SessionStatus::Planned);
        assert_eq!(loaded.config_snapshot, s.config_snapshot);
    }

    #[test]
    fn test_status_transition_validated() {
        let r = repo();
        let s = session();
        r.create_session(&s).unwrap();
        r.update_session_status(s.id, SessionStatus::Running).unwrap();
        // planned -> completed without draining is illegal.
        let err = r
            .update_session_status(s.id, SessionStatus::Completed)
            .unwrap_err();
        assert!(matches!(err, RepositoryError::IllegalTransition(_)));
    }

    #[test]
    fn test_application_transition_is_transactional() {
        let r = repo();
        let s = session();
        r.create_session(&s).unwrap();
        let a = application(&s, 1);
        r.create_application(&a).unwrap();

        let e = event(s.id, Some(a.id), 1, EventType::ItemStarted);
        r.update_application_status(a.id, ApplicationStatus::InProgress, None, &e)
            .unwrap();

        let loaded = r.get_application(a.id).unwrap();
        assert_eq!(loaded.status, ApplicationStatus::InProgress);
        let events = r.list_events(s.id).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EventType::ItemStarted);

        // Illegal transition writes nothing: no row update, no event.
        let bad = event(s.id, Some(a.id), 2, EventType::ItemQueued);
        let err = r
            .update_application_status(a.id, ApplicationStatus::Queued, None, &bad)
            .unwrap_err();
        assert!(matches!(err, RepositoryError::IllegalTransition(_)));
        assert_eq!(r.list_events(s.id).unwrap().len(), 1);
    }

    #[test]
    fn test_event_append_idempotent() {
        let r = repo();
        let s = session();
        r.create_session(&s).unwrap();
        let e = event(s.id, None, 7, EventType::SessionPaused);
        r.append_event(&e).unwrap();
        r.append_event(&e).unwrap();
        let events = r.list_events(s.id).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(r.max_event_seq(s.id).unwrap(), 7);
    }

    #[test]
    fn test_counters_frozen_after_terminal() {
        let r = repo();
        let s = session();
        r.create_session(&s).unwrap();
        r.update_session_status(s.id, SessionStatus::Running).unwrap();
        r.add_session_counters(s.id, &CounterDelta::dispatched())
            .unwrap();
        r.update_session_status(s.id, SessionStatus::Draining)
            .unwrap();
        r.mark_session_terminal(s.id, SessionStatus::Completed, Utc::now())
            .unwrap();
        let err = r
            .add_session_counters(s.id, &CounterDelta::skipped())
            .unwrap_err();
        assert!(matches!(err, RepositoryError::Frozen(_)));
    }

    #[test]
    fn test_question_step_index_strictly_increasing() {
        let r = repo();
        let s = session();
        r.create_session(&s).unwrap();
        let a = application(&s, 1);
        r.create_application(&a).unwrap();
        let field = FieldDescriptor {
            field_type: "text".into(),
            label: "full name".into(),
            raw_label: "Full Name *".into(),
            required: true,
        };
        let s0 = r
            .append_question(a.id, &field, "Ada Lovelace", ValueSource::Profile, 0.99, None, Utc::now())
            .unwrap();
        let s1 = r
            .append_question(a.id, &field, "London", ValueSource::Llm, 0.7, None, Utc::now())
            .unwrap();
        assert_eq!((s0, s1), (0, 1));
        let questions = r.list_questions(a.id).unwrap();
        assert_eq!(questions.len(), 2);
        assert_eq!(questions[1].step_index, 1);
    }

    #[test]
    fn test_domain_policy_round_trip() {
        let r = repo();
        let policy = DomainPolicy {
            max_per_day: 5,
            min_interval_secs: 300,
            max_concurrent: 2,
            avoid: false,
            cooldown_secs: 900,
            jitter_max_secs: 30,
            blocked_until: None,
        };
        r.upsert_domain_policy("linkedin.com", &policy).unwrap();
        let loaded = r.load_domain_policies().unwrap();
        assert_eq!(loaded["linkedin.com"], policy);
    }

    #[test]
    fn test_reopen_preserves_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobpilot.db");
        let s = session();
        {
            let r = SqliteRepository::open(&path).unwrap();
            r.create_session(&s).unwrap();
            r.append_event(&event(s.id, None, 3, EventType::SessionPaused))
                .unwrap();
        }
        let r = SqliteRepository::open(&path).unwrap();
        assert_eq!(r.get_session(s.id).unwrap().id, s.id);
        assert_eq!(r.max_event_seq(s.id).unwrap(), 3);
    }

    #[test]
    fn test_digest_upsert() {
        let r = repo();
        let s = session();
        r.create_session(&s).unwrap();
        let digest = jobpilot_core::digest::build_digest(&s, &[]);
        r.upsert_digest(&digest).unwrap();
        r.upsert_digest(&digest).unwrap();
        let loaded = r.get_digest(s.id).unwrap().unwrap();
        assert_eq!(loaded.session_id, s.id);
    }
}
