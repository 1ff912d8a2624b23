#![allow(clippy::missing_errors_doc)]

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono_event_core::{
    assemble_report, build_leaderboard, decide_admission, format_day, format_rfc3339, now_utc,
    parse_day, write_report_csv, AdmissionDecision, AdmissionReceipt, Attempt, AttemptRow,
    AttemptSubmission, Candidate, CandidateRegistration, Circuit, DayResults, DayStats,
    EventConfig, EventError, Leaderboard, NewCandidate,
};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, TransactionBehavior};
use time::Date;
use tracing::{debug, info, warn};

const EVENT_MIGRATION_VERSION: i64 = 1;

const SCHEMA_EVENT_V1: &str = r"
CREATE TABLE IF NOT EXISTS candidates (
  number INTEGER PRIMARY KEY CHECK (number >= 1),
  first_name TEXT NOT NULL CHECK (length(trim(first_name)) > 0),
  last_name TEXT NOT NULL CHECK (length(trim(last_name)) > 0),
  email TEXT,
  phone TEXT,
  registered_at TEXT NOT NULL,
  UNIQUE (first_name, last_name)
);

CREATE TRIGGER IF NOT EXISTS trg_candidates_no_update
BEFORE UPDATE ON candidates
BEGIN
  SELECT RAISE(FAIL, 'candidates are immutable once registered');
END;

CREATE TRIGGER IF NOT EXISTS trg_candidates_no_delete
BEFORE DELETE ON candidates
BEGIN
  SELECT RAISE(FAIL, 'candidates are immutable once registered');
END;

CREATE TABLE IF NOT EXISTS attempts (
  sequence_id INTEGER PRIMARY KEY AUTOINCREMENT,
  candidate_number INTEGER NOT NULL,
  circuit INTEGER NOT NULL CHECK (circuit BETWEEN 1 AND 4),
  primary_metric REAL NOT NULL CHECK (primary_metric >= 0.0),
  secondary_metric INTEGER NOT NULL DEFAULT 0 CHECK (secondary_metric >= 0),
  day TEXT NOT NULL,
  recorded_at TEXT NOT NULL,
  UNIQUE (candidate_number, circuit, day),
  FOREIGN KEY (candidate_number) REFERENCES candidates(number)
);

CREATE TRIGGER IF NOT EXISTS trg_attempts_no_update
BEFORE UPDATE ON attempts
BEGIN
  SELECT RAISE(FAIL, 'attempts are replaced, never updated in place');
END;

CREATE INDEX IF NOT EXISTS idx_attempts_circuit_day_seq
  ON attempts(circuit, day, sequence_id);
CREATE INDEX IF NOT EXISTS idx_attempts_day
  ON attempts(day);
";

const ATTEMPT_COLUMNS: &str =
    "a.sequence_id, a.candidate_number, a.circuit, a.primary_metric, a.secondary_metric, a.day";

/// Attempt Store and Candidate Registry on a single `SQLite` file.
///
/// The handle keeps no connection: every operation opens its own, scoped to
/// that call, so handles are cheap to clone and safe to share across threads.
#[derive(Debug, Clone)]
pub struct SqliteEventStore {
    path: PathBuf,
    busy_timeout: Duration,
}

impl SqliteEventStore {
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with_config(path, &EventConfig::default())
    }

    pub fn open_with_config(path: &Path, config: &EventConfig) -> Result<Self> {
        config.validate().context("invalid store configuration")?;

        let store = Self {
            path: path.to_path_buf(),
            busy_timeout: Duration::from_millis(config.busy_timeout_ms),
        };

        let conn = store
            .connect()
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")
            .context("failed to configure sqlite journal mode")?;

        Ok(store)
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn migrate(&self) -> Result<()> {
        let conn = self.connect()?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL
            );",
        )
        .context("failed to ensure schema_migrations exists")?;

        conn.execute_batch(SCHEMA_EVENT_V1)
            .context("failed to apply event schema")?;

        ensure_unique_index_on_columns(&conn, "attempts", &["candidate_number", "circuit", "day"])?;

        let now = format_rfc3339(now_utc())?;
        conn.execute(
            "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
            params![EVENT_MIGRATION_VERSION, now],
        )
        .context("failed to register event schema migration")?;

        debug!(
            version = EVENT_MIGRATION_VERSION,
            path = %self.path.display(),
            "event schema migrated"
        );
        Ok(())
    }

    /// Validates and stores a new candidate under the next free number.
    pub fn register_candidate(
        &self,
        registration: &CandidateRegistration,
    ) -> Result<Candidate, EventError> {
        let candidate = registration.validate()?;

        let mut conn = self.connect()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(storage)?;

        let duplicate = tx
            .query_row(
                "SELECT EXISTS(
                    SELECT 1 FROM candidates WHERE first_name = ?1 AND last_name = ?2
                 )",
                params![candidate.first_name, candidate.last_name],
                |row| row.get::<_, i64>(0),
            )
            .map_err(storage)?
            == 1;
        if duplicate {
            return Err(duplicate_candidate(&candidate));
        }

        let next_number: i64 = tx
            .query_row(
                "SELECT COALESCE(MAX(number), 0) + 1 FROM candidates",
                [],
                |row| row.get(0),
            )
            .map_err(storage)?;
        let number = u32::try_from(next_number).map_err(|_| {
            EventError::Storage(format!("candidate number overflow: {next_number}"))
        })?;

        let registered_at = format_rfc3339(now_utc())?;
        tx.execute(
            "INSERT INTO candidates(number, first_name, last_name, email, phone, registered_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                i64::from(number),
                candidate.first_name,
                candidate.last_name,
                candidate.email,
                candidate.phone,
                registered_at,
            ],
        )
        .map_err(|err| match constraint_violation(&err) {
            Some(Constraint::Unique) => duplicate_candidate(&candidate),
            _ => storage(err),
        })?;
        tx.commit().map_err(storage)?;

        info!(number, contact_waived = registration.bypass_contact, "candidate registered");
        Ok(Candidate {
            number,
            first_name: candidate.first_name,
            last_name: candidate.last_name,
            email: candidate.email,
            phone: candidate.phone,
        })
    }

    /// Looks a candidate up by number; a miss is `Ok(None)`.
    pub fn get_candidate(&self, number: u32) -> Result<Option<Candidate>, EventError> {
        let conn = self.connect()?;
        conn.query_row(
            "SELECT number, first_name, last_name, email, phone
             FROM candidates
             WHERE number = ?1",
            params![i64::from(number)],
            parse_candidate_row,
        )
        .optional()
        .map_err(storage)
    }

    pub fn list_candidates(&self) -> Result<Vec<Candidate>, EventError> {
        let conn = self.connect()?;
        list_candidates_with(&conn)
    }

    /// Runs Attempt Admission for one submission.
    ///
    /// The receipt is `accepted` even when the attempt was not better than the
    /// live one and nothing was written. A uniqueness conflict on the natural
    /// key retries the whole read-compare-replace sequence once.
    pub fn record_attempt(
        &self,
        submission: &AttemptSubmission,
    ) -> Result<AdmissionReceipt, EventError> {
        let submission = submission.validate()?;
        retry_on_conflict(|| self.admit_once(&submission))
    }

    fn admit_once(&self, submission: &AttemptSubmission) -> Result<AdmissionReceipt, EventError> {
        let mut conn = self.connect()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(storage)?;

        if !candidate_exists(&tx, submission.candidate_number)? {
            return Err(EventError::ReferenceError(submission.candidate_number));
        }

        let existing = tx
            .query_row(
                &format!(
                    "SELECT {ATTEMPT_COLUMNS}
                     FROM attempts a
                     WHERE a.candidate_number = ?1 AND a.circuit = ?2 AND a.day = ?3"
                ),
                params![
                    i64::from(submission.candidate_number),
                    i64::from(submission.circuit.number()),
                    format_day(submission.day)?,
                ],
                parse_attempt_row,
            )
            .optional()
            .map_err(storage)?;

        let decision = decide_admission(
            submission.circuit,
            existing.as_ref(),
            &submission.performance(),
        );

        let sequence_id = match decision {
            AdmissionDecision::Insert => insert_attempt(&tx, submission)?,
            AdmissionDecision::Replace(existing_id) => {
                tx.execute(
                    "DELETE FROM attempts WHERE sequence_id = ?1",
                    params![existing_id],
                )
                .map_err(storage)?;
                insert_attempt(&tx, submission)?
            }
            AdmissionDecision::Reject => existing
                .as_ref()
                .map(|attempt| attempt.sequence_id)
                .ok_or_else(|| {
                    EventError::Storage("rejected attempt without a live attempt".to_string())
                })?,
        };
        tx.commit().map_err(storage)?;

        info!(
            candidate = submission.candidate_number,
            circuit = %submission.circuit,
            decision = decision.as_str(),
            sequence_id,
            "attempt admitted"
        );

        Ok(AdmissionReceipt {
            accepted: true,
            decision,
            sequence_id,
        })
    }

    /// Ranked best list and recent feed for one circuit and day.
    pub fn leaderboard(
        &self,
        circuit: Circuit,
        day: Date,
        top_n: usize,
        recent_m: usize,
    ) -> Result<Leaderboard, EventError> {
        let conn = self.connect()?;
        let rows = attempt_rows_for(&conn, circuit, day)?;
        Ok(build_leaderboard(circuit, day, &rows, top_n, recent_m))
    }

    /// Leaderboards for every circuit on `day`, plus the days that have data.
    pub fn day_results(
        &self,
        day: Date,
        top_n: usize,
        recent_m: usize,
    ) -> Result<DayResults, EventError> {
        let conn = self.connect()?;
        let available_days = available_days_with(&conn)?;

        let mut circuits = Vec::with_capacity(Circuit::ALL.len());
        for circuit in Circuit::ALL {
            let rows = attempt_rows_for(&conn, circuit, day)?;
            circuits.push(build_leaderboard(circuit, day, &rows, top_n, recent_m));
        }

        Ok(DayResults {
            day,
            available_days,
            circuits,
        })
    }

    /// Distinct days having any attempt, most recent first.
    pub fn available_days(&self) -> Result<Vec<Date>, EventError> {
        let conn = self.connect()?;
        available_days_with(&conn)
    }

    pub fn stats(&self, day: Date) -> Result<DayStats, EventError> {
        let conn = self.connect()?;

        let per_circuit_day = count_by_circuit(
            &conn,
            "SELECT circuit, COUNT(*) FROM attempts WHERE day = ?1 GROUP BY circuit",
            Some(format_day(day)?),
        )?;
        let per_circuit_all_time = count_by_circuit(
            &conn,
            "SELECT circuit, COUNT(*) FROM attempts GROUP BY circuit",
            None,
        )?;

        Ok(DayStats {
            day,
            total_day: per_circuit_day.values().sum(),
            total_all_time: per_circuit_all_time.values().sum(),
            per_circuit_day,
            per_circuit_all_time,
        })
    }

    /// Every stored attempt, in write order.
    pub fn list_attempts(&self) -> Result<Vec<Attempt>, EventError> {
        let conn = self.connect()?;
        list_attempts_with(&conn)
    }

    /// CSV audit dump of every candidate and every stored attempt.
    pub fn export_report(&self) -> Result<Vec<u8>, EventError> {
        let mut conn = self.connect()?;
        let tx = conn.transaction().map_err(storage)?;
        let candidates = list_candidates_with(&tx)?;
        let attempts = list_attempts_with(&tx)?;
        drop(tx);

        let rows = assemble_report(&candidates, &attempts);
        let mut buffer = Vec::new();
        write_report_csv(&rows, &mut buffer)?;

        debug!(
            candidates = candidates.len(),
            attempts = attempts.len(),
            "report exported"
        );
        Ok(buffer)
    }

    fn connect(&self) -> Result<Connection, EventError> {
        let conn = Connection::open(&self.path).map_err(|err| {
            EventError::Storage(format!(
                "failed to open sqlite database at {}: {err}",
                self.path.display()
            ))
        })?;
        conn.busy_timeout(self.busy_timeout).map_err(storage)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .map_err(storage)?;
        Ok(conn)
    }
}

/// Runs `operation`, and runs it exactly once more if the first try ends in
/// [`EventError::WriteConflict`]. A second conflict is returned as is.
pub fn retry_on_conflict<T>(
    mut operation: impl FnMut() -> Result<T, EventError>,
) -> Result<T, EventError> {
    match operation() {
        Err(EventError::WriteConflict(reason)) => {
            warn!(%reason, "write conflict on attempt admission, retrying once");
            operation()
        }
        other => other,
    }
}

enum Constraint {
    Unique,
    ForeignKey,
    Other,
}

fn constraint_violation(err: &rusqlite::Error) -> Option<Constraint> {
    match err {
        rusqlite::Error::SqliteFailure(inner, _)
            if inner.code == ErrorCode::ConstraintViolation =>
        {
            Some(match inner.extended_code {
                rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                | rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY => Constraint::Unique,
                rusqlite::ffi::SQLITE_CONSTRAINT_FOREIGNKEY => Constraint::ForeignKey,
                _ => Constraint::Other,
            })
        }
        _ => None,
    }
}

#[allow(clippy::needless_pass_by_value)]
fn storage(err: rusqlite::Error) -> EventError {
    EventError::Storage(err.to_string())
}

fn duplicate_candidate(candidate: &NewCandidate) -> EventError {
    EventError::DuplicateCandidate {
        first_name: candidate.first_name.clone(),
        last_name: candidate.last_name.clone(),
    }
}

fn candidate_exists(conn: &Connection, number: u32) -> Result<bool, EventError> {
    let exists: i64 = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM candidates WHERE number = ?1)",
            params![i64::from(number)],
            |row| row.get(0),
        )
        .map_err(storage)?;
    Ok(exists == 1)
}

fn insert_attempt(conn: &Connection, submission: &AttemptSubmission) -> Result<i64, EventError> {
    let day = format_day(submission.day)?;
    let recorded_at = format_rfc3339(now_utc())?;

    conn.execute(
        "INSERT INTO attempts(
            candidate_number, circuit, primary_metric, secondary_metric, day, recorded_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            i64::from(submission.candidate_number),
            i64::from(submission.circuit.number()),
            submission.primary_metric,
            i64::from(submission.secondary_metric),
            day,
            recorded_at,
        ],
    )
    .map_err(|err| match constraint_violation(&err) {
        Some(Constraint::Unique) => EventError::WriteConflict(format!(
            "candidate {} already has an attempt on circuit {} for {day}",
            submission.candidate_number, submission.circuit
        )),
        Some(Constraint::ForeignKey) => EventError::ReferenceError(submission.candidate_number),
        Some(Constraint::Other) | None => storage(err),
    })?;

    Ok(conn.last_insert_rowid())
}

fn attempt_rows_for(
    conn: &Connection,
    circuit: Circuit,
    day: Date,
) -> Result<Vec<AttemptRow>, EventError> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {ATTEMPT_COLUMNS}, c.first_name, c.last_name
             FROM attempts a
             JOIN candidates c ON c.number = a.candidate_number
             WHERE a.circuit = ?1 AND a.day = ?2
             ORDER BY a.sequence_id ASC"
        ))
        .map_err(storage)?;

    let rows = stmt
        .query_map(
            params![i64::from(circuit.number()), format_day(day)?],
            |row| {
                Ok(AttemptRow {
                    attempt: parse_attempt_row(row)?,
                    first_name: row.get(6)?,
                    last_name: row.get(7)?,
                })
            },
        )
        .map_err(storage)?;

    collect_rows(rows)
}

fn available_days_with(conn: &Connection) -> Result<Vec<Date>, EventError> {
    let mut stmt = conn
        .prepare("SELECT DISTINCT day FROM attempts ORDER BY day DESC")
        .map_err(storage)?;
    let rows = stmt
        .query_map([], |row| {
            let raw: String = row.get(0)?;
            parse_day(&raw).map_err(|err| conversion_error(0, rusqlite::types::Type::Text, &err))
        })
        .map_err(storage)?;

    collect_rows(rows)
}

fn list_candidates_with(conn: &Connection) -> Result<Vec<Candidate>, EventError> {
    let mut stmt = conn
        .prepare(
            "SELECT number, first_name, last_name, email, phone
             FROM candidates
             ORDER BY number ASC",
        )
        .map_err(storage)?;
    let rows = stmt.query_map([], parse_candidate_row).map_err(storage)?;
    collect_rows(rows)
}

fn list_attempts_with(conn: &Connection) -> Result<Vec<Attempt>, EventError> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {ATTEMPT_COLUMNS} FROM attempts a ORDER BY a.sequence_id ASC"
        ))
        .map_err(storage)?;
    let rows = stmt.query_map([], parse_attempt_row).map_err(storage)?;
    collect_rows(rows)
}

fn count_by_circuit(
    conn: &Connection,
    query: &str,
    day: Option<String>,
) -> Result<BTreeMap<u8, u64>, EventError> {
    let mut counts: BTreeMap<u8, u64> = Circuit::ALL
        .iter()
        .map(|circuit| (circuit.number(), 0))
        .collect();

    let mut stmt = conn.prepare(query).map_err(storage)?;
    let mut rows = match day {
        Some(day) => stmt.query(params![day]),
        None => stmt.query([]),
    }
    .map_err(storage)?;

    while let Some(row) = rows.next().map_err(storage)? {
        let circuit: i64 = row.get(0).map_err(storage)?;
        let count: i64 = row.get(1).map_err(storage)?;
        let circuit = Circuit::from_number(circuit)?;
        let count = u64::try_from(count)
            .map_err(|_| EventError::Storage(format!("invalid attempt count: {count}")))?;
        counts.insert(circuit.number(), count);
    }

    Ok(counts)
}

fn parse_candidate_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Candidate> {
    let number_i64: i64 = row.get(0)?;
    let number = u32::try_from(number_i64).map_err(|_| {
        conversion_error(
            0,
            rusqlite::types::Type::Integer,
            &format!("invalid candidate number: {number_i64}"),
        )
    })?;

    Ok(Candidate {
        number,
        first_name: row.get(1)?,
        last_name: row.get(2)?,
        email: row.get(3)?,
        phone: row.get(4)?,
    })
}

fn parse_attempt_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Attempt> {
    let candidate_i64: i64 = row.get(1)?;
    let circuit_i64: i64 = row.get(2)?;
    let secondary_i64: i64 = row.get(4)?;
    let day_raw: String = row.get(5)?;

    let candidate_number = u32::try_from(candidate_i64).map_err(|_| {
        conversion_error(
            1,
            rusqlite::types::Type::Integer,
            &format!("invalid candidate_number: {candidate_i64}"),
        )
    })?;
    let circuit = Circuit::from_number(circuit_i64)
        .map_err(|err| conversion_error(2, rusqlite::types::Type::Integer, &err))?;
    let secondary_metric = u32::try_from(secondary_i64).map_err(|_| {
        conversion_error(
            4,
            rusqlite::types::Type::Integer,
            &format!("invalid secondary_metric: {secondary_i64}"),
        )
    })?;
    let day = parse_day(&day_raw)
        .map_err(|err| conversion_error(5, rusqlite::types::Type::Text, &err))?;

    Ok(Attempt {
        sequence_id: row.get(0)?,
        candidate_number,
        circuit,
        primary_metric: row.get(3)?,
        secondary_metric,
        day,
    })
}

fn conversion_error(
    column: usize,
    column_type: rusqlite::types::Type,
    message: &dyn std::fmt::Display,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        column,
        column_type,
        Box::new(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            message.to_string(),
        )),
    )
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>, EventError> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row.map_err(storage)?);
    }
    Ok(values)
}

fn ensure_unique_index_on_columns(
    conn: &Connection,
    table_name: &str,
    columns: &[&str],
) -> Result<()> {
    let mut stmt = conn
        .prepare(&format!("PRAGMA index_list({table_name})"))
        .with_context(|| format!("failed to inspect index_list for {table_name}"))?;
    let mut rows = stmt.query([])?;

    while let Some(row) = rows.next()? {
        let index_name: String = row.get(1)?;
        let is_unique: i64 = row.get(2)?;
        if is_unique != 1 {
            continue;
        }

        let indexed_columns = index_columns(conn, &index_name)?;
        if indexed_columns == columns {
            return Ok(());
        }
    }

    Err(anyhow!(
        "schema check failed: expected UNIQUE({}) on {table_name}",
        columns.join(", ")
    ))
}

fn index_columns(conn: &Connection, index_name: &str) -> Result<Vec<String>> {
    let mut stmt = conn
        .prepare(&format!("PRAGMA index_info({index_name})"))
        .with_context(|| format!("failed to inspect index_info for {index_name}"))?;
    let mut rows = stmt.query([])?;

    let mut columns = Vec::new();
    while let Some(row) = rows.next()? {
        columns.push(row.get::<_, String>(2)?);
    }

    Ok(columns)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::float_cmp, clippy::too_many_lines)]

    use super::*;
    use proptest::prelude::*;
    use std::sync::Barrier;
    use time::macros::date;
    use ulid::Ulid;

    const DAY: Date = date!(2025 - 06 - 14);

    fn must<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    struct TempDb {
        path: PathBuf,
    }

    impl TempDb {
        fn new(label: &str) -> Self {
            Self {
                path: std::env::temp_dir()
                    .join(format!("chrono-event-{label}-{}.sqlite3", Ulid::new())),
            }
        }
    }

    impl Drop for TempDb {
        fn drop(&mut self) {
            for suffix in ["", "-wal", "-shm"] {
                let mut raw = self.path.clone().into_os_string();
                raw.push(suffix);
                let _ = std::fs::remove_file(PathBuf::from(raw));
            }
        }
    }

    fn fixture_store(label: &str) -> (TempDb, SqliteEventStore) {
        let db = TempDb::new(label);
        let store = must(SqliteEventStore::open(&db.path));
        must(store.migrate());
        (db, store)
    }

    fn register(store: &SqliteEventStore, first_name: &str, last_name: &str) -> Candidate {
        must(store.register_candidate(&CandidateRegistration {
            first_name: first_name.to_string(),
            last_name: last_name.to_string(),
            bypass_contact: true,
            ..CandidateRegistration::default()
        }))
    }

    fn submission(candidate: u32, circuit: Circuit, time: f64, touches: u32) -> AttemptSubmission {
        AttemptSubmission {
            candidate_number: candidate,
            circuit,
            primary_metric: time,
            secondary_metric: touches,
            day: DAY,
        }
    }

    fn live_attempts(store: &SqliteEventStore, candidate: u32, circuit: Circuit) -> Vec<Attempt> {
        must(store.list_attempts())
            .into_iter()
            .filter(|attempt| attempt.candidate_number == candidate && attempt.circuit == circuit)
            .collect()
    }

    #[test]
    fn registration_round_trips_identity_fields() {
        let (_db, store) = fixture_store("register");
        let registered = must(store.register_candidate(&CandidateRegistration {
            first_name: "Ada".to_string(),
            last_name: "Lovelace".to_string(),
            email: Some("ada@example.org".to_string()),
            phone: Some("0612345678".to_string()),
            bypass_contact: false,
        }));
        assert_eq!(registered.number, 1);

        let fetched = must(store.get_candidate(registered.number));
        assert_eq!(fetched, Some(registered));

        let second = register(&store, "Grace", "Hopper");
        assert_eq!(second.number, 2);
        assert_eq!(second.email, None);
        assert_eq!(must(store.get_candidate(42)), None);

        let numbers: Vec<u32> = must(store.list_candidates())
            .iter()
            .map(|candidate| candidate.number)
            .collect();
        assert_eq!(numbers, vec![1, 2]);
    }

    #[test]
    fn duplicate_names_and_bad_contact_are_rejected() {
        let (_db, store) = fixture_store("duplicate");
        register(&store, "Ada", "Lovelace");

        let duplicate = store.register_candidate(&CandidateRegistration {
            first_name: "Ada".to_string(),
            last_name: "Lovelace".to_string(),
            bypass_contact: true,
            ..CandidateRegistration::default()
        });
        assert!(matches!(
            duplicate,
            Err(EventError::DuplicateCandidate { .. })
        ));

        let malformed = store.register_candidate(&CandidateRegistration {
            first_name: "Alan".to_string(),
            last_name: "Turing".to_string(),
            email: Some("not-an-email".to_string()),
            phone: Some("0612345678".to_string()),
            bypass_contact: false,
        });
        assert!(matches!(malformed, Err(EventError::InvalidArgument(_))));
        assert_eq!(must(store.list_candidates()).len(), 1);
    }

    #[test]
    fn timed_circuit_replaces_only_on_a_faster_time() {
        let (_db, store) = fixture_store("timed");
        let ada = register(&store, "Ada", "Lovelace");

        let first = must(store.record_attempt(&submission(ada.number, Circuit::Ninja, 57.0, 0)));
        assert_eq!(first.decision, AdmissionDecision::Insert);

        let slower = must(store.record_attempt(&submission(ada.number, Circuit::Ninja, 60.0, 0)));
        assert!(slower.accepted);
        assert_eq!(slower.decision, AdmissionDecision::Reject);
        assert_eq!(slower.sequence_id, first.sequence_id);

        let faster = must(store.record_attempt(&submission(ada.number, Circuit::Ninja, 41.5, 0)));
        assert_eq!(faster.decision, AdmissionDecision::Replace(first.sequence_id));
        assert!(faster.sequence_id > first.sequence_id);

        let live = live_attempts(&store, ada.number, Circuit::Ninja);
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].primary_metric, 41.5);
    }

    #[test]
    fn precision_and_suspension_follow_their_policies() {
        let (_db, store) = fixture_store("policies");
        let ada = register(&store, "Ada", "Lovelace");

        must(store.record_attempt(&submission(ada.number, Circuit::Precision, 5.0, 3)));
        let more_touches =
            must(store.record_attempt(&submission(ada.number, Circuit::Precision, 100.0, 4)));
        assert!(matches!(more_touches.decision, AdmissionDecision::Replace(_)));
        let slower_same_touches =
            must(store.record_attempt(&submission(ada.number, Circuit::Precision, 120.0, 4)));
        assert_eq!(slower_same_touches.decision, AdmissionDecision::Reject);

        must(store.record_attempt(&submission(ada.number, Circuit::Suspension, 30.0, 0)));
        let longer =
            must(store.record_attempt(&submission(ada.number, Circuit::Suspension, 44.0, 0)));
        assert!(matches!(longer.decision, AdmissionDecision::Replace(_)));

        let precision = live_attempts(&store, ada.number, Circuit::Precision);
        assert_eq!((precision[0].secondary_metric, precision[0].primary_metric), (4, 100.0));
        let suspension = live_attempts(&store, ada.number, Circuit::Suspension);
        assert_eq!(suspension[0].primary_metric, 44.0);
    }

    #[test]
    fn attempts_on_other_days_are_independent() {
        let (_db, store) = fixture_store("days");
        let ada = register(&store, "Ada", "Lovelace");

        must(store.record_attempt(&submission(ada.number, Circuit::Ninja, 40.0, 0)));
        let mut next_day = submission(ada.number, Circuit::Ninja, 50.0, 0);
        next_day.day = date!(2025 - 06 - 15);
        let receipt = must(store.record_attempt(&next_day));
        assert_eq!(receipt.decision, AdmissionDecision::Insert);

        assert_eq!(
            must(store.available_days()),
            vec![date!(2025 - 06 - 15), date!(2025 - 06 - 14)]
        );
    }

    #[test]
    fn unknown_candidate_and_bad_metric_fail_as_values() {
        let (_db, store) = fixture_store("reference");

        let missing = store.record_attempt(&submission(9, Circuit::Ninja, 40.0, 0));
        assert_eq!(missing, Err(EventError::ReferenceError(9)));

        let ada = register(&store, "Ada", "Lovelace");
        let negative = store.record_attempt(&submission(ada.number, Circuit::Ninja, -1.0, 0));
        assert!(matches!(negative, Err(EventError::InvalidArgument(_))));
        let not_a_number =
            store.record_attempt(&submission(ada.number, Circuit::Ninja, f64::NAN, 0));
        assert!(matches!(not_a_number, Err(EventError::InvalidArgument(_))));
        assert!(must(store.list_attempts()).is_empty());
    }

    #[test]
    fn natural_key_violation_maps_to_write_conflict() {
        let (_db, store) = fixture_store("conflict");
        let ada = register(&store, "Ada", "Lovelace");
        let conn = must(store.connect());

        let entry = submission(ada.number, Circuit::Crossfit, 80.0, 0);
        must(insert_attempt(&conn, &entry));
        assert!(matches!(
            insert_attempt(&conn, &entry),
            Err(EventError::WriteConflict(_))
        ));

        let orphan = submission(77, Circuit::Crossfit, 80.0, 0);
        assert_eq!(
            insert_attempt(&conn, &orphan),
            Err(EventError::ReferenceError(77))
        );
    }

    #[test]
    fn conflict_retry_runs_exactly_once_more() {
        let mut calls = 0;
        let recovered = retry_on_conflict(|| {
            calls += 1;
            if calls == 1 {
                Err(EventError::WriteConflict("race".to_string()))
            } else {
                Ok(calls)
            }
        });
        assert_eq!(recovered, Ok(2));

        let mut calls = 0;
        let persistent: Result<(), EventError> = retry_on_conflict(|| {
            calls += 1;
            Err(EventError::WriteConflict("race".to_string()))
        });
        assert!(matches!(persistent, Err(EventError::WriteConflict(_))));
        assert_eq!(calls, 2);

        let mut calls = 0;
        let other: Result<(), EventError> = retry_on_conflict(|| {
            calls += 1;
            Err(EventError::ReferenceError(3))
        });
        assert_eq!(other, Err(EventError::ReferenceError(3)));
        assert_eq!(calls, 1);
    }

    #[test]
    fn write_conflict_reruns_admission_against_the_live_attempt() {
        let (_db, store) = fixture_store("rerun");
        let ada = register(&store, "Ada", "Lovelace");
        let live = must(store.record_attempt(&submission(ada.number, Circuit::Ninja, 50.0, 0)));

        // First pass acts on a stale read that saw no live attempt and inserts blindly.
        let stale_insert = |entry: &AttemptSubmission| -> Result<AdmissionReceipt, EventError> {
            let conn = store.connect()?;
            insert_attempt(&conn, entry).map(|sequence_id| AdmissionReceipt {
                accepted: true,
                decision: AdmissionDecision::Insert,
                sequence_id,
            })
        };

        let faster = submission(ada.number, Circuit::Ninja, 42.0, 0);
        let mut calls = 0;
        let replaced = must(retry_on_conflict(|| {
            calls += 1;
            if calls == 1 {
                stale_insert(&faster)
            } else {
                store.admit_once(&faster)
            }
        }));
        assert_eq!(calls, 2);
        assert_eq!(replaced.decision, AdmissionDecision::Replace(live.sequence_id));

        let kept = live_attempts(&store, ada.number, Circuit::Ninja);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].primary_metric, 42.0);
        assert_eq!(kept[0].sequence_id, replaced.sequence_id);

        let slower = submission(ada.number, Circuit::Ninja, 61.0, 0);
        let mut calls = 0;
        let rejected = must(retry_on_conflict(|| {
            calls += 1;
            if calls == 1 {
                stale_insert(&slower)
            } else {
                store.admit_once(&slower)
            }
        }));
        assert_eq!(calls, 2);
        assert!(rejected.accepted);
        assert_eq!(rejected.decision, AdmissionDecision::Reject);
        assert_eq!(rejected.sequence_id, replaced.sequence_id);

        let kept = live_attempts(&store, ada.number, Circuit::Ninja);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].primary_metric, 42.0);
    }

    #[test]
    fn concurrent_submissions_keep_the_better_attempt() {
        for (first, second) in [(40.0, 35.0), (35.0, 40.0)] {
            let (_db, store) = fixture_store("concurrent");
            let ada = register(&store, "Ada", "Lovelace");
            let barrier = Barrier::new(2);

            let outcomes: Vec<Result<AdmissionReceipt, EventError>> = std::thread::scope(|scope| {
                let handles = [first, second].map(|time| {
                    let store = store.clone();
                    let barrier = &barrier;
                    scope.spawn(move || {
                        barrier.wait();
                        store.record_attempt(&submission(ada.number, Circuit::Ninja, time, 0))
                    })
                });
                handles
                    .into_iter()
                    .map(|handle| match handle.join() {
                        Ok(outcome) => outcome,
                        Err(_) => panic!("admission thread panicked"),
                    })
                    .collect()
            });

            for outcome in outcomes {
                assert!(must(outcome).accepted);
            }

            let live = live_attempts(&store, ada.number, Circuit::Ninja);
            assert_eq!(live.len(), 1);
            assert_eq!(live[0].primary_metric, 35.0);
        }
    }

    #[test]
    fn leaderboard_reflects_replacements_in_recent_feed() {
        let (_db, store) = fixture_store("leaderboard");
        let ada = register(&store, "Ada", "Lovelace");
        let grace = register(&store, "Grace", "Hopper");
        let alan = register(&store, "Alan", "Turing");
        let edsger = register(&store, "Edsger", "Dijkstra");

        must(store.record_attempt(&submission(ada.number, Circuit::Ninja, 50.0, 0)));
        must(store.record_attempt(&submission(grace.number, Circuit::Ninja, 40.0, 0)));
        must(store.record_attempt(&submission(alan.number, Circuit::Ninja, 70.0, 0)));
        must(store.record_attempt(&submission(edsger.number, Circuit::Ninja, 45.0, 0)));
        must(store.record_attempt(&submission(ada.number, Circuit::Ninja, 30.0, 0)));
        must(store.record_attempt(&submission(grace.number, Circuit::Crossfit, 10.0, 0)));

        let board = must(store.leaderboard(Circuit::Ninja, DAY, 3, 5));
        let best: Vec<u32> = board.best.iter().map(|entry| entry.candidate_number).collect();
        assert_eq!(best, vec![ada.number, grace.number, edsger.number]);
        assert_eq!(board.best[0].time, "00:30.00");
        assert_eq!(board.best[0].last_name, "Lovelace");

        let recent: Vec<u32> = board
            .recent
            .iter()
            .map(|entry| entry.candidate_number)
            .collect();
        assert_eq!(recent, vec![ada.number, edsger.number, alan.number, grace.number]);

        let empty = must(store.leaderboard(Circuit::Suspension, DAY, 3, 5));
        assert!(empty.best.is_empty() && empty.recent.is_empty());
    }

    #[test]
    fn day_results_and_stats_cover_every_circuit() {
        let (_db, store) = fixture_store("stats");
        let ada = register(&store, "Ada", "Lovelace");
        let grace = register(&store, "Grace", "Hopper");

        must(store.record_attempt(&submission(ada.number, Circuit::Ninja, 50.0, 0)));
        must(store.record_attempt(&submission(grace.number, Circuit::Ninja, 40.0, 0)));
        must(store.record_attempt(&submission(ada.number, Circuit::Precision, 12.0, 5)));
        let mut yesterday = submission(ada.number, Circuit::Suspension, 20.0, 0);
        yesterday.day = date!(2025 - 06 - 13);
        must(store.record_attempt(&yesterday));

        let results = must(store.day_results(DAY, 3, 5));
        assert_eq!(results.circuits.len(), 4);
        assert_eq!(results.circuits[0].best.len(), 2);
        assert_eq!(results.circuits[2].best[0].touches, Some(5));
        assert!(results.circuits[3].best.is_empty());
        assert_eq!(results.available_days, vec![DAY, date!(2025 - 06 - 13)]);

        let stats = must(store.stats(DAY));
        assert_eq!(stats.per_circuit_day.get(&1), Some(&2));
        assert_eq!(stats.per_circuit_day.get(&2), Some(&0));
        assert_eq!(stats.per_circuit_day.get(&3), Some(&1));
        assert_eq!(stats.total_day, 3);
        assert_eq!(stats.per_circuit_all_time.get(&4), Some(&1));
        assert_eq!(stats.total_all_time, 4);
    }

    #[test]
    fn export_dumps_raw_history_per_candidate() {
        let (_db, store) = fixture_store("export");
        let ada = register(&store, "Ada", "Lovelace");
        register(&store, "Grace", "Hopper");

        must(store.record_attempt(&submission(ada.number, Circuit::Ninja, 62.5, 0)));
        let mut next_day = submission(ada.number, Circuit::Ninja, 70.0, 0);
        next_day.day = date!(2025 - 06 - 15);
        must(store.record_attempt(&next_day));
        must(store.record_attempt(&submission(ada.number, Circuit::Precision, 12.34, 4)));

        let bytes = must(store.export_report());
        let text = must(String::from_utf8(bytes));
        assert!(text.starts_with("Number,Last name,First name,Email,Phone,"));
        assert!(text.contains("1,Lovelace,Ada,,,\"01:02.50\n01:10.00\",,00:12.34,4,"));
        assert!(text.contains("2,Hopper,Grace,,,,,,,"));
    }

    #[test]
    fn schema_blocks_in_place_updates_and_requires_natural_key() {
        let (_db, store) = fixture_store("schema");
        let ada = register(&store, "Ada", "Lovelace");
        let receipt = must(store.record_attempt(&submission(ada.number, Circuit::Ninja, 50.0, 0)));

        let conn = must(store.connect());
        let update = conn.execute(
            "UPDATE attempts SET primary_metric = 1.0 WHERE sequence_id = ?1",
            params![receipt.sequence_id],
        );
        assert!(update.is_err());

        let rename = conn.execute("UPDATE candidates SET first_name = 'Eve'", []);
        assert!(rename.is_err());

        must(ensure_unique_index_on_columns(
            &conn,
            "attempts",
            &["candidate_number", "circuit", "day"],
        ));
    }

    #[test]
    fn migration_is_idempotent_and_preserves_existing_data() {
        let (_db, store) = fixture_store("idempotent");
        let ada = register(&store, "Ada", "Lovelace");
        must(store.record_attempt(&submission(ada.number, Circuit::Ninja, 50.0, 0)));

        must(store.migrate());
        must(store.migrate());

        assert_eq!(must(store.list_candidates()).len(), 1);
        assert_eq!(must(store.list_attempts()).len(), 1);
    }

    #[test]
    fn migrate_fails_when_attempts_table_lacks_natural_key() {
        let db = TempDb::new("legacy");
        let store = must(SqliteEventStore::open(&db.path));
        let conn = must(store.connect());
        must(conn.execute_batch(
            "CREATE TABLE attempts (
                sequence_id INTEGER PRIMARY KEY AUTOINCREMENT,
                candidate_number INTEGER NOT NULL,
                circuit INTEGER NOT NULL,
                primary_metric REAL NOT NULL,
                secondary_metric INTEGER NOT NULL DEFAULT 0,
                day TEXT NOT NULL,
                recorded_at TEXT NOT NULL
             );",
        ));
        drop(conn);

        let err = match store.migrate() {
            Ok(()) => panic!("expected migration to fail"),
            Err(err) => err.to_string(),
        };
        assert!(
            err.contains("UNIQUE(candidate_number, circuit, day)"),
            "unexpected error: {err}"
        );
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn prop_admission_keeps_the_best_attempt(
            code in 0usize..4,
            stream in prop::collection::vec((0u32..6000, 0u32..6), 1..12),
        ) {
            let circuit = Circuit::ALL[code];
            let (_db, store) = fixture_store("prop-admission");
            let ada = register(&store, "Ada", "Lovelace");

            let mut best: Option<(f64, u32)> = None;
            for (hundredths, touches) in &stream {
                let time = f64::from(*hundredths) / 100.0;
                let entry = submission(ada.number, circuit, time, *touches);
                let receipt = must(store.record_attempt(&entry));
                prop_assert!(receipt.accepted);

                let incoming = chrono_event_core::Performance {
                    primary_metric: time,
                    secondary_metric: *touches,
                };
                let better = match best {
                    None => true,
                    Some((t, k)) => circuit.policy().compare(
                        &incoming,
                        &chrono_event_core::Performance { primary_metric: t, secondary_metric: k },
                    ) == chrono_event_core::Rank::Better,
                };
                if better {
                    best = Some((time, *touches));
                }
            }

            let live = live_attempts(&store, ada.number, circuit);
            prop_assert_eq!(live.len(), 1);
            let Some((time, touches)) = best else {
                return Err(TestCaseError::fail("no attempt recorded"));
            };
            prop_assert_eq!(live[0].primary_metric, time);
            prop_assert_eq!(live[0].secondary_metric, touches);
        }
    }
}
