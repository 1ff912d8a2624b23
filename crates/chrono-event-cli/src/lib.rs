//! Command surface for the event timing desk.
//!
//! Hosts embed the desk through:
//! - [`run_cli`] for full parsed CLI execution.
//! - [`run_command_with_db`] for direct [`Command`] execution against a DB path.
//! - [`run_command`] for execution against an existing [`SqliteEventStore`].

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono_event_core::{
    parse_day, parse_primary_metric, today_utc, AdmissionDecision, AdmissionReceipt,
    AttemptSubmission, Circuit, CandidateRegistration, EventConfig, EventError,
};
use chrono_event_store_sqlite::SqliteEventStore;
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use time::Date;

#[derive(Debug, Parser)]
#[command(name = "chrono-event")]
#[command(about = "Timed-circuit event desk: registration, scoring and leaderboards")]
pub struct Cli {
    #[arg(long, default_value = "./chrono_event.sqlite3")]
    db: PathBuf,

    /// JSON file with `top_n`, `recent_m` and `busy_timeout_ms`.
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Candidate {
        #[command(subcommand)]
        command: CandidateCommand,
    },
    Attempt {
        #[command(subcommand)]
        command: AttemptCommand,
    },
    Leaderboard {
        #[command(subcommand)]
        command: LeaderboardCommand,
    },
    Results {
        #[command(subcommand)]
        command: ResultsCommand,
    },
    Days {
        #[command(subcommand)]
        command: DaysCommand,
    },
    Stats {
        #[command(subcommand)]
        command: StatsCommand,
    },
    Export(ExportArgs),
}

#[derive(Debug, Subcommand)]
pub enum CandidateCommand {
    Register(RegisterArgs),
    Show(CandidateShowArgs),
    List,
}

#[derive(Debug, Args)]
pub struct RegisterArgs {
    #[arg(long)]
    first_name: String,
    #[arg(long)]
    last_name: String,
    #[arg(long)]
    email: Option<String>,
    #[arg(long)]
    phone: Option<String>,
    /// Register without contact details.
    #[arg(long)]
    no_contact: bool,
}

#[derive(Debug, Args)]
pub struct CandidateShowArgs {
    #[arg(long)]
    number: u32,
}

#[derive(Debug, Subcommand)]
pub enum AttemptCommand {
    Record(RecordArgs),
}

#[derive(Debug, Args)]
pub struct RecordArgs {
    #[arg(long)]
    number: u32,
    #[arg(long)]
    circuit: i64,
    /// Elapsed seconds, e.g. `83.25`.
    #[arg(long, allow_hyphen_values = true)]
    time: String,
    #[arg(long, default_value_t = 0)]
    touches: u32,
    /// Competition day as YYYY-MM-DD (today in UTC when omitted; malformed values are rejected).
    #[arg(long)]
    day: Option<String>,
}

#[derive(Debug, Subcommand)]
pub enum LeaderboardCommand {
    Show(LeaderboardShowArgs),
}

#[derive(Debug, Args)]
pub struct LeaderboardShowArgs {
    #[arg(long)]
    circuit: i64,
    #[command(flatten)]
    view: ViewArgs,
}

#[derive(Debug, Subcommand)]
pub enum ResultsCommand {
    Show(ViewArgs),
}

#[derive(Debug, Args)]
pub struct ViewArgs {
    /// Competition day as YYYY-MM-DD (today in UTC when omitted; malformed values are rejected).
    #[arg(long)]
    day: Option<String>,
    #[arg(long)]
    top_n: Option<usize>,
    #[arg(long)]
    recent: Option<usize>,
}

#[derive(Debug, Subcommand)]
pub enum DaysCommand {
    List,
}

#[derive(Debug, Subcommand)]
pub enum StatsCommand {
    Show(DayArgs),
}

#[derive(Debug, Args)]
pub struct DayArgs {
    /// Competition day as YYYY-MM-DD (today in UTC when omitted; malformed values are rejected).
    #[arg(long)]
    day: Option<String>,
}

#[derive(Debug, Args)]
pub struct ExportArgs {
    /// Destination CSV file; stdout when omitted.
    #[arg(long)]
    output: Option<PathBuf>,
}

#[derive(Debug, Serialize)]
struct RegisteredOutput {
    number: u32,
}

#[derive(Debug, Serialize)]
struct AttemptOutput {
    accepted: bool,
    decision: &'static str,
    sequence_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    replaced_sequence_id: Option<i64>,
}

impl From<AdmissionReceipt> for AttemptOutput {
    fn from(receipt: AdmissionReceipt) -> Self {
        let replaced_sequence_id = match receipt.decision {
            AdmissionDecision::Replace(previous) => Some(previous),
            AdmissionDecision::Insert | AdmissionDecision::Reject => None,
        };
        Self {
            accepted: receipt.accepted,
            decision: receipt.decision.as_str(),
            sequence_id: receipt.sequence_id,
            replaced_sequence_id,
        }
    }
}

/// Failure shape written to stderr by the binary.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ErrorEnvelope {
    pub code: &'static str,
    pub message: String,
}

/// Code for failures that carry no [`EventError`], such as an unreadable
/// config file or a failed migration.
pub const INTERNAL_ERROR_CODE: &str = "event.internal";

impl ErrorEnvelope {
    /// Classifies an error by the first [`EventError`] in its chain.
    #[must_use]
    pub fn from_error(err: &anyhow::Error) -> Self {
        let code = err
            .chain()
            .find_map(|cause| cause.downcast_ref::<EventError>())
            .map_or(INTERNAL_ERROR_CODE, EventError::code);
        Self {
            code,
            message: format!("{err:#}"),
        }
    }
}

#[derive(Debug, Serialize)]
struct ExportOutput {
    output: String,
    bytes: usize,
}

/// Executes the parsed top-level CLI command graph.
///
/// # Errors
/// Returns an error when configuration loading, migration, or command
/// execution fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    let config = load_config(cli.config.as_deref())?;
    run_command_with_db(&cli.db, &config, cli.command)
}

/// Executes a parsed command using the provided `SQLite` DB path.
///
/// # Errors
/// Returns an error when store open/migrate fails or the requested command fails.
pub fn run_command_with_db(db_path: &Path, config: &EventConfig, command: Command) -> Result<()> {
    let store = SqliteEventStore::open_with_config(db_path, config)?;
    store.migrate()?;
    run_command(command, &store, config)
}

/// Executes a parsed command against an existing store handle.
///
/// # Errors
/// Returns an error when argument validation, admission, or retrieval fails.
pub fn run_command(command: Command, store: &SqliteEventStore, config: &EventConfig) -> Result<()> {
    match command {
        Command::Candidate { command } => run_candidate(command, store),
        Command::Attempt { command } => run_attempt(command, store),
        Command::Leaderboard { command } => match command {
            LeaderboardCommand::Show(args) => {
                let circuit = Circuit::from_number(args.circuit)?;
                let (day, view) = resolve_view(&args.view, config)?;
                let board = store.leaderboard(circuit, day, view.top_n, view.recent_m)?;
                print_json(&board)
            }
        },
        Command::Results { command } => match command {
            ResultsCommand::Show(args) => {
                let (day, view) = resolve_view(&args, config)?;
                let results = store.day_results(day, view.top_n, view.recent_m)?;
                print_json(&results)
            }
        },
        Command::Days { command } => match command {
            DaysCommand::List => {
                let days = store
                    .available_days()?
                    .into_iter()
                    .map(chrono_event_core::format_day)
                    .collect::<Result<Vec<_>, _>>()?;
                print_json(&days)
            }
        },
        Command::Stats { command } => match command {
            StatsCommand::Show(args) => {
                let day = resolve_day(args.day.as_deref())?;
                print_json(&store.stats(day)?)
            }
        },
        Command::Export(args) => run_export(&args, store),
    }
}

fn run_candidate(command: CandidateCommand, store: &SqliteEventStore) -> Result<()> {
    match command {
        CandidateCommand::Register(args) => {
            let registration = CandidateRegistration {
                first_name: args.first_name,
                last_name: args.last_name,
                email: args.email,
                phone: args.phone,
                bypass_contact: args.no_contact,
            };
            let candidate = store.register_candidate(&registration)?;
            print_json(&RegisteredOutput {
                number: candidate.number,
            })
        }
        CandidateCommand::Show(args) => match store.get_candidate(args.number)? {
            Some(candidate) => print_json(&candidate),
            None => Err(EventError::NotFound(format!("candidate {}", args.number)).into()),
        },
        CandidateCommand::List => print_json(&store.list_candidates()?),
    }
}

fn run_attempt(command: AttemptCommand, store: &SqliteEventStore) -> Result<()> {
    match command {
        AttemptCommand::Record(args) => {
            let submission = AttemptSubmission {
                candidate_number: args.number,
                circuit: Circuit::from_number(args.circuit)?,
                primary_metric: parse_primary_metric(&args.time)?,
                secondary_metric: args.touches,
                day: resolve_day(args.day.as_deref())?,
            };
            let receipt = store.record_attempt(&submission)?;
            print_json(&AttemptOutput::from(receipt))
        }
    }
}

fn run_export(args: &ExportArgs, store: &SqliteEventStore) -> Result<()> {
    let report = store.export_report()?;

    match &args.output {
        Some(path) => {
            std::fs::write(path, &report)
                .with_context(|| format!("failed to write report to {}", path.display()))?;
            print_json(&ExportOutput {
                output: path.display().to_string(),
                bytes: report.len(),
            })
        }
        None => {
            let mut stdout = std::io::stdout().lock();
            stdout
                .write_all(&report)
                .context("failed to write report to stdout")?;
            stdout.flush().context("failed to flush stdout")
        }
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Reads an [`EventConfig`] from a JSON file, or the defaults when no file is given.
///
/// # Errors
/// Returns an error when the file cannot be read, is not JSON, or fails validation.
pub fn load_config(path: Option<&Path>) -> Result<EventConfig> {
    let Some(path) = path else {
        return Ok(EventConfig::default());
    };

    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let value: serde_json::Value = serde_json::from_str(&raw)
        .with_context(|| format!("config file {} is not valid JSON", path.display()))?;
    Ok(EventConfig::from_json(&value)?)
}

fn resolve_day(raw: Option<&str>) -> Result<Date, EventError> {
    match raw {
        Some(raw) => parse_day(raw),
        None => Ok(today_utc()),
    }
}

fn resolve_view(args: &ViewArgs, config: &EventConfig) -> Result<(Date, EventConfig)> {
    let day = resolve_day(args.day.as_deref())?;
    let view = EventConfig {
        top_n: args.top_n.unwrap_or(config.top_n),
        recent_m: args.recent.unwrap_or(config.recent_m),
        ..config.clone()
    };
    view.validate()?;
    Ok((day, view))
}
