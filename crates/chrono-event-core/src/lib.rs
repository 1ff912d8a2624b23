use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};
use std::io::Write;

use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;
use time::macros::format_description;
use time::{Date, OffsetDateTime, UtcOffset};

time::serde::format_description!(day_format, Date, "[year]-[month]-[day]");

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum EventError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("candidate already registered: {first_name} {last_name}")]
    DuplicateCandidate {
        first_name: String,
        last_name: String,
    },
    #[error("unknown candidate number: {0}")]
    ReferenceError(u32),
    #[error("write conflict: {0}")]
    WriteConflict(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl EventError {
    /// Stable machine-readable code for error envelopes.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidArgument(_) => "event.invalid_argument",
            Self::DuplicateCandidate { .. } => "event.duplicate_candidate",
            Self::ReferenceError(_) => "event.reference_error",
            Self::WriteConflict(_) => "event.write_conflict",
            Self::NotFound(_) => "event.not_found",
            Self::Storage(_) => "event.storage",
            Self::Configuration(_) => "event.configuration",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(try_from = "u8", into = "u8")]
pub enum Circuit {
    Ninja,
    Crossfit,
    Precision,
    Suspension,
}

impl Circuit {
    pub const ALL: [Self; 4] = [Self::Ninja, Self::Crossfit, Self::Precision, Self::Suspension];

    #[must_use]
    pub fn number(self) -> u8 {
        match self {
            Self::Ninja => 1,
            Self::Crossfit => 2,
            Self::Precision => 3,
            Self::Suspension => 4,
        }
    }

    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Ninja => "Ninja",
            Self::Crossfit => "Crossfit/Hyrox",
            Self::Precision => "Precision",
            Self::Suspension => "Suspension",
        }
    }

    /// Resolves a circuit from its wire/storage number.
    ///
    /// # Errors
    /// Returns [`EventError::InvalidArgument`] for anything outside `1..=4`.
    pub fn from_number(value: i64) -> Result<Self, EventError> {
        match value {
            1 => Ok(Self::Ninja),
            2 => Ok(Self::Crossfit),
            3 => Ok(Self::Precision),
            4 => Ok(Self::Suspension),
            other => Err(EventError::InvalidArgument(format!(
                "circuit MUST be one of 1, 2, 3, 4 (got {other})"
            ))),
        }
    }

    #[must_use]
    pub fn policy(self) -> RankingPolicy {
        RankingPolicy::for_circuit(self)
    }
}

impl TryFrom<u8> for Circuit {
    type Error = EventError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::from_number(i64::from(value))
    }
}

impl From<Circuit> for u8 {
    fn from(value: Circuit) -> Self {
        value.number()
    }
}

impl Display for Circuit {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.number())
    }
}

/// The measured part of an attempt, as seen by a ranking policy.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Performance {
    pub primary_metric: f64,
    pub secondary_metric: u32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum Rank {
    Better,
    Worse,
    Equal,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum RankingPolicy {
    /// Lower elapsed time wins.
    LowestTime,
    /// More touches wins, ties broken by lower elapsed time.
    MostTouchesThenLowestTime,
    /// Longer hold wins.
    HighestTime,
}

impl RankingPolicy {
    #[must_use]
    pub fn for_circuit(circuit: Circuit) -> Self {
        match circuit {
            Circuit::Ninja | Circuit::Crossfit => Self::LowestTime,
            Circuit::Precision => Self::MostTouchesThenLowestTime,
            Circuit::Suspension => Self::HighestTime,
        }
    }

    #[must_use]
    pub fn uses_secondary_metric(self) -> bool {
        matches!(self, Self::MostTouchesThenLowestTime)
    }

    /// Best-first ordering: `Ordering::Less` means `lhs` ranks ahead of `rhs`.
    #[must_use]
    pub fn ordering(self, lhs: &Performance, rhs: &Performance) -> Ordering {
        match self {
            Self::LowestTime => lhs.primary_metric.total_cmp(&rhs.primary_metric),
            Self::MostTouchesThenLowestTime => rhs
                .secondary_metric
                .cmp(&lhs.secondary_metric)
                .then_with(|| lhs.primary_metric.total_cmp(&rhs.primary_metric)),
            Self::HighestTime => rhs.primary_metric.total_cmp(&lhs.primary_metric),
        }
    }

    #[must_use]
    pub fn compare(self, lhs: &Performance, rhs: &Performance) -> Rank {
        match self.ordering(lhs, rhs) {
            Ordering::Less => Rank::Better,
            Ordering::Greater => Rank::Worse,
            Ordering::Equal => Rank::Equal,
        }
    }
}

/// Checks an elapsed-time value and normalizes `-0.0` to `0.0`.
///
/// # Errors
/// Returns [`EventError::InvalidArgument`] for negative, NaN or infinite values.
pub fn validate_primary_metric(value: f64) -> Result<f64, EventError> {
    if !value.is_finite() {
        return Err(EventError::InvalidArgument(format!(
            "time MUST be a finite number of seconds (got {value})"
        )));
    }

    if value < 0.0 {
        return Err(EventError::InvalidArgument(format!(
            "time MUST be >= 0 seconds (got {value})"
        )));
    }

    Ok(value.abs())
}

/// Parses a submitted elapsed time such as `"83.25"`.
///
/// # Errors
/// Returns [`EventError::InvalidArgument`] when the text is not a
/// non-negative real number.
pub fn parse_primary_metric(raw: &str) -> Result<f64, EventError> {
    let trimmed = raw.trim();
    let value: f64 = trimmed.parse().map_err(|_| {
        EventError::InvalidArgument(format!("time MUST be a number of seconds (got {raw:?})"))
    })?;
    validate_primary_metric(value)
}

/// Formats seconds as `MM:SS.hh`, truncating (never rounding) the hundredths.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn format_elapsed(seconds: f64) -> String {
    let hundredths = if seconds.is_finite() && seconds > 0.0 {
        (seconds * 100.0).floor() as u64
    } else {
        0
    };

    let minutes = hundredths / 6_000;
    let whole_seconds = (hundredths % 6_000) / 100;
    let fraction = hundredths % 100;
    format!("{minutes:02}:{whole_seconds:02}.{fraction:02}")
}

/// Parses a `YYYY-MM-DD` competition day.
///
/// # Errors
/// Returns [`EventError::InvalidArgument`] for any other shape.
pub fn parse_day(raw: &str) -> Result<Date, EventError> {
    Date::parse(raw.trim(), format_description!("[year]-[month]-[day]"))
        .map_err(|err| EventError::InvalidArgument(format!("day MUST be YYYY-MM-DD: {err}")))
}

/// Formats a competition day as `YYYY-MM-DD`.
///
/// # Errors
/// Returns [`EventError::InvalidArgument`] when the date cannot be rendered.
pub fn format_day(day: Date) -> Result<String, EventError> {
    day.format(format_description!("[year]-[month]-[day]"))
        .map_err(|err| EventError::InvalidArgument(format!("failed to format day: {err}")))
}

/// Formats a timestamp as RFC3339 in UTC.
///
/// # Errors
/// Returns [`EventError::InvalidArgument`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, EventError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| {
            EventError::InvalidArgument(format!("failed to format RFC3339 timestamp: {err}"))
        })
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}

#[must_use]
pub fn today_utc() -> Date {
    now_utc().date()
}

fn serialize_days<S>(days: &[Date], serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    let rendered = days
        .iter()
        .map(|day| format_day(*day))
        .collect::<Result<Vec<_>, _>>()
        .map_err(serde::ser::Error::custom)?;
    serializer.collect_seq(rendered)
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Candidate {
    pub number: u32,
    pub first_name: String,
    pub last_name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
}

/// Registration request as submitted by the front desk.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Default)]
pub struct CandidateRegistration {
    pub first_name: String,
    pub last_name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub bypass_contact: bool,
}

/// A registration that passed validation, ready to be numbered and stored.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct NewCandidate {
    pub first_name: String,
    pub last_name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
}

impl CandidateRegistration {
    /// Validates identity and contact fields.
    ///
    /// With `bypass_contact` set, contact validation is skipped entirely and
    /// both contact fields are dropped.
    ///
    /// # Errors
    /// Returns [`EventError::InvalidArgument`] for blank names or a
    /// missing/malformed email or phone.
    pub fn validate(&self) -> Result<NewCandidate, EventError> {
        let first_name = self.first_name.trim();
        let last_name = self.last_name.trim();

        if first_name.is_empty() {
            return Err(EventError::InvalidArgument("first_name MUST be provided".to_string()));
        }

        if last_name.is_empty() {
            return Err(EventError::InvalidArgument("last_name MUST be provided".to_string()));
        }

        if self.bypass_contact {
            return Ok(NewCandidate {
                first_name: first_name.to_string(),
                last_name: last_name.to_string(),
                email: None,
                phone: None,
            });
        }

        let email = self.email.as_deref().unwrap_or_default();
        if !is_valid_email(email) {
            return Err(EventError::InvalidArgument(format!(
                "malformed email: {email:?}"
            )));
        }

        let phone = self.phone.as_deref().unwrap_or_default();
        if !is_valid_phone(phone) {
            return Err(EventError::InvalidArgument(format!(
                "malformed phone (expected 10 digits): {phone:?}"
            )));
        }

        Ok(NewCandidate {
            first_name: first_name.to_string(),
            last_name: last_name.to_string(),
            email: Some(email.to_string()),
            phone: Some(phone.to_string()),
        })
    }
}

/// `local@domain.tld` with no whitespace anywhere.
#[must_use]
pub fn is_valid_email(value: &str) -> bool {
    if value.is_empty() || value.chars().any(char::is_whitespace) {
        return false;
    }

    value
        .char_indices()
        .filter(|(_, ch)| *ch == '@')
        .any(|(at, _)| {
            if at == 0 {
                return false;
            }
            let domain = &value[at + 1..];
            domain
                .char_indices()
                .any(|(dot, ch)| ch == '.' && dot > 0 && dot + 1 < domain.len())
        })
}

/// Exactly ten ASCII digits.
#[must_use]
pub fn is_valid_phone(value: &str) -> bool {
    value.len() == 10 && value.bytes().all(|byte| byte.is_ascii_digit())
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Attempt {
    pub sequence_id: i64,
    pub candidate_number: u32,
    pub circuit: Circuit,
    pub primary_metric: f64,
    pub secondary_metric: u32,
    #[serde(with = "day_format")]
    pub day: Date,
}

impl Attempt {
    #[must_use]
    pub fn performance(&self) -> Performance {
        Performance {
            primary_metric: self.primary_metric,
            secondary_metric: self.secondary_metric,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AttemptSubmission {
    pub candidate_number: u32,
    pub circuit: Circuit,
    pub primary_metric: f64,
    pub secondary_metric: u32,
    #[serde(with = "day_format")]
    pub day: Date,
}

impl AttemptSubmission {
    /// Validates the submission before admission.
    ///
    /// # Errors
    /// Returns [`EventError::InvalidArgument`] for a zero candidate number or
    /// an invalid elapsed time.
    pub fn validate(&self) -> Result<Self, EventError> {
        if self.candidate_number == 0 {
            return Err(EventError::InvalidArgument("candidate number MUST be >= 1".to_string()));
        }

        Ok(Self {
            primary_metric: validate_primary_metric(self.primary_metric)?,
            ..self.clone()
        })
    }

    #[must_use]
    pub fn performance(&self) -> Performance {
        Performance {
            primary_metric: self.primary_metric,
            secondary_metric: self.secondary_metric,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum AdmissionDecision {
    Insert,
    Replace(i64),
    Reject,
}

impl AdmissionDecision {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Replace(_) => "replace",
            Self::Reject => "reject",
        }
    }
}

/// Decides what happens to an incoming attempt given the live attempt for
/// the same candidate, circuit and day. Only a strictly better attempt
/// replaces the live one.
#[must_use]
pub fn decide_admission(
    circuit: Circuit,
    existing: Option<&Attempt>,
    incoming: &Performance,
) -> AdmissionDecision {
    let Some(existing) = existing else {
        return AdmissionDecision::Insert;
    };

    match circuit.policy().compare(incoming, &existing.performance()) {
        Rank::Better => AdmissionDecision::Replace(existing.sequence_id),
        Rank::Worse | Rank::Equal => AdmissionDecision::Reject,
    }
}

/// Outcome reported back to the submitter. `accepted` is true for every
/// validated submission, including one that was not better than the live
/// attempt and therefore not stored again.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct AdmissionReceipt {
    pub accepted: bool,
    pub decision: AdmissionDecision,
    pub sequence_id: i64,
}

/// An attempt joined with the identity of its candidate.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AttemptRow {
    pub attempt: Attempt,
    pub first_name: String,
    pub last_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LeaderboardEntry {
    pub candidate_number: u32,
    pub last_name: String,
    pub first_name: String,
    pub time: String,
    pub primary_metric: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub touches: Option<u32>,
    pub sequence_id: i64,
}

impl LeaderboardEntry {
    fn from_row(row: &AttemptRow, policy: RankingPolicy) -> Self {
        Self {
            candidate_number: row.attempt.candidate_number,
            last_name: row.last_name.clone(),
            first_name: row.first_name.clone(),
            time: format_elapsed(row.attempt.primary_metric),
            primary_metric: row.attempt.primary_metric,
            touches: policy
                .uses_secondary_metric()
                .then_some(row.attempt.secondary_metric),
            sequence_id: row.attempt.sequence_id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Leaderboard {
    pub circuit: Circuit,
    pub label: String,
    #[serde(with = "day_format")]
    pub day: Date,
    pub best: Vec<LeaderboardEntry>,
    pub recent: Vec<LeaderboardEntry>,
}

/// Builds the ranked best list and the recent activity feed for one
/// circuit and day. Rows for other circuits or days are ignored.
///
/// `best` keeps the first (best) attempt per candidate after a stable sort by
/// the circuit policy, so equal attempts stay in write order. `recent` is the
/// raw feed by descending sequence id, neither deduplicated nor re-ranked.
#[must_use]
pub fn build_leaderboard(
    circuit: Circuit,
    day: Date,
    rows: &[AttemptRow],
    top_n: usize,
    recent_m: usize,
) -> Leaderboard {
    let policy = circuit.policy();

    let mut scoped: Vec<&AttemptRow> = rows
        .iter()
        .filter(|row| row.attempt.circuit == circuit && row.attempt.day == day)
        .collect();
    scoped.sort_by_key(|row| row.attempt.sequence_id);

    let mut ranked = scoped.clone();
    ranked.sort_by(|lhs, rhs| {
        policy.ordering(&lhs.attempt.performance(), &rhs.attempt.performance())
    });

    // Live attempts are unique per candidate already; legacy rows may not be.
    let mut seen = BTreeSet::new();
    let best = ranked
        .into_iter()
        .filter(|row| seen.insert(row.attempt.candidate_number))
        .take(top_n)
        .map(|row| LeaderboardEntry::from_row(row, policy))
        .collect();

    let recent = scoped
        .iter()
        .rev()
        .take(recent_m)
        .map(|row| LeaderboardEntry::from_row(row, policy))
        .collect();

    Leaderboard {
        circuit,
        label: circuit.label().to_string(),
        day,
        best,
        recent,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DayResults {
    #[serde(with = "day_format")]
    pub day: Date,
    #[serde(serialize_with = "serialize_days", skip_deserializing)]
    pub available_days: Vec<Date>,
    pub circuits: Vec<Leaderboard>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct DayStats {
    #[serde(with = "day_format")]
    pub day: Date,
    pub per_circuit_day: BTreeMap<u8, u64>,
    pub total_day: u64,
    pub per_circuit_all_time: BTreeMap<u8, u64>,
    pub total_all_time: u64,
}

pub const REPORT_HEADERS: [&str; 10] = [
    "Number",
    "Last name",
    "First name",
    "Email",
    "Phone",
    "Circuit 1 - Ninja",
    "Circuit 2 - Crossfit/Hyrox",
    "Circuit 3 - Precision (time)",
    "Circuit 3 - Precision (touches)",
    "Circuit 4 - Suspension",
];

/// One exported line: identity plus every stored value per circuit.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ReportRow {
    pub number: u32,
    pub last_name: String,
    pub first_name: String,
    pub email: String,
    pub phone: String,
    pub ninja_times: String,
    pub crossfit_times: String,
    pub precision_times: String,
    pub precision_touches: String,
    pub suspension_times: String,
}

impl ReportRow {
    fn to_record(&self) -> [String; 10] {
        [
            self.number.to_string(),
            self.last_name.clone(),
            self.first_name.clone(),
            self.email.clone(),
            self.phone.clone(),
            self.ninja_times.clone(),
            self.crossfit_times.clone(),
            self.precision_times.clone(),
            self.precision_touches.clone(),
            self.suspension_times.clone(),
        ]
    }
}

/// Flattens candidates and raw attempt history into report rows, one per
/// candidate in number order. Cells list every attempt newline-joined in
/// write order; nothing is ranked or deduplicated.
#[must_use]
pub fn assemble_report(candidates: &[Candidate], attempts: &[Attempt]) -> Vec<ReportRow> {
    let mut ordered: Vec<&Attempt> = attempts.iter().collect();
    ordered.sort_by_key(|attempt| attempt.sequence_id);

    let mut by_key: BTreeMap<(u32, Circuit), Vec<&Attempt>> = BTreeMap::new();
    for attempt in ordered {
        by_key
            .entry((attempt.candidate_number, attempt.circuit))
            .or_default()
            .push(attempt);
    }

    let mut sorted_candidates: Vec<&Candidate> = candidates.iter().collect();
    sorted_candidates.sort_by_key(|candidate| candidate.number);

    sorted_candidates
        .into_iter()
        .map(|candidate| {
            let cell = |circuit: Circuit, render: &dyn Fn(&Attempt) -> String| {
                by_key
                    .get(&(candidate.number, circuit))
                    .map(|items| {
                        items
                            .iter()
                            .map(|attempt| render(*attempt))
                            .collect::<Vec<_>>()
                            .join("\n")
                    })
                    .unwrap_or_default()
            };
            let time = |attempt: &Attempt| format_elapsed(attempt.primary_metric);
            let touches = |attempt: &Attempt| attempt.secondary_metric.to_string();

            ReportRow {
                number: candidate.number,
                last_name: candidate.last_name.clone(),
                first_name: candidate.first_name.clone(),
                email: candidate.email.clone().unwrap_or_default(),
                phone: candidate.phone.clone().unwrap_or_default(),
                ninja_times: cell(Circuit::Ninja, &time),
                crossfit_times: cell(Circuit::Crossfit, &time),
                precision_times: cell(Circuit::Precision, &time),
                precision_touches: cell(Circuit::Precision, &touches),
                suspension_times: cell(Circuit::Suspension, &time),
            }
        })
        .collect()
}

/// Writes report rows as CSV with a header line.
///
/// # Errors
/// Returns [`EventError::Storage`] when the underlying writer fails.
pub fn write_report_csv<W: Write>(rows: &[ReportRow], writer: W) -> Result<(), EventError> {
    let mut csv_writer = csv::Writer::from_writer(writer);
    csv_writer
        .write_record(REPORT_HEADERS)
        .map_err(|err| EventError::Storage(format!("failed to write report header: {err}")))?;

    for row in rows {
        csv_writer.write_record(row.to_record()).map_err(|err| {
            EventError::Storage(format!("failed to write report row {}: {err}", row.number))
        })?;
    }

    csv_writer
        .flush()
        .map_err(|err| EventError::Storage(format!("failed to flush report: {err}")))
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EventConfig {
    pub top_n: usize,
    pub recent_m: usize,
    pub busy_timeout_ms: u64,
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            top_n: 3,
            recent_m: 5,
            busy_timeout_ms: 5_000,
        }
    }
}

impl EventConfig {
    /// Validates list bounds and the store busy timeout.
    ///
    /// # Errors
    /// Returns [`EventError::Configuration`] when a field is zero.
    pub fn validate(&self) -> Result<(), EventError> {
        if self.top_n == 0 {
            return Err(EventError::Configuration("top_n MUST be >= 1".to_string()));
        }

        if self.recent_m == 0 {
            return Err(EventError::Configuration("recent_m MUST be >= 1".to_string()));
        }

        if self.busy_timeout_ms == 0 {
            return Err(EventError::Configuration("busy_timeout_ms MUST be >= 1".to_string()));
        }

        Ok(())
    }

    /// Decodes and validates a configuration from JSON. Missing fields take
    /// their defaults.
    ///
    /// # Errors
    /// Returns [`EventError::Configuration`] when JSON decoding fails
    /// or decoded values are invalid.
    pub fn from_json(value: &Value) -> Result<Self, EventError> {
        let config: Self = serde_json::from_value(value.clone())
            .map_err(|err| EventError::Configuration(format!("invalid config JSON: {err}")))?;
        config.validate()?;
        Ok(config)
    }
}
