use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use chrono::Duration;
use clap::{Args, Parser, Subcommand, ValueEnum};
use rusqlite::{Connection, OpenFlags};
use serde::Serialize;
use thiserror::Error;

use aircast_core::{load_station_config, FlagDecision, Station, StationConfig, StuckFinding};

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] aircast_core::ConfigError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("station error: {0}")]
    Station(#[from] aircast_core::StationError),
    #[error("authentication failed")]
    Authentication,
    #[error("required resource missing: {0}")]
    MissingResource(String),
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Aircast command-line control interface", long_about = None)]
pub struct Cli {
    /// Path to the main station.toml
    #[arg(long, default_value = "configs/station.toml")]
    pub config: PathBuf,
    /// Alternate path for station.sqlite
    #[arg(long)]
    pub db: Option<PathBuf>,
    /// Token for local authentication (when AIRCASTCTL_TOKEN is set)
    #[arg(long)]
    pub token: Option<String>,
    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Show a summary of station state
    Status,
    /// Request queue operations
    #[command(subcommand)]
    Queue(QueueCommands),
    /// Moderation review surface
    #[command(subcommand)]
    Flagged(FlaggedCommands),
    /// Per-user standing
    #[command(subcommand)]
    User(UserCommands),
    /// Housekeeping operations
    #[command(subcommand)]
    Maintenance(MaintenanceCommands),
    /// Integrity checks
    #[command(subcommand)]
    Health(HealthCommands),
}

#[derive(Subcommand, Debug)]
pub enum QueueCommands {
    /// List waiting entries for a channel
    Show(QueueShowArgs),
}

#[derive(Args, Debug)]
pub struct QueueShowArgs {
    /// Channel to inspect
    #[arg(long)]
    pub channel: String,
    /// Maximum records returned
    #[arg(long, default_value_t = 20)]
    pub limit: usize,
}

#[derive(Subcommand, Debug)]
pub enum FlaggedCommands {
    /// List entries held for review
    List(FlaggedListArgs),
    /// Resolve one flagged entry
    Resolve(FlaggedResolveArgs),
}

#[derive(Args, Debug)]
pub struct FlaggedListArgs {
    /// Restrict to one channel
    #[arg(long)]
    pub channel: Option<String>,
}

#[derive(Args, Debug)]
pub struct FlaggedResolveArgs {
    pub request_id: String,
    #[arg(long, value_enum)]
    pub decision: ResolveDecision,
    #[arg(long)]
    pub reason: String,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum ResolveDecision {
    Approve,
    Reject,
}

#[derive(Subcommand, Debug)]
pub enum UserCommands {
    /// Show reputation, ban state and active timeouts
    Standing(UserStandingArgs),
}

#[derive(Args, Debug)]
pub struct UserStandingArgs {
    pub user_id: String,
}

#[derive(Subcommand, Debug)]
pub enum MaintenanceCommands {
    /// Delete terminal entries past the retention window
    Purge,
    /// Online backup of the station database
    Backup(BackupArgs),
    /// Export the moderation audit log as gzipped JSONL
    ExportAudit(ExportAuditArgs),
    /// Find entries stuck in generation or review
    Stuck(StuckArgs),
}

#[derive(Args, Debug)]
pub struct BackupArgs {
    #[arg(long)]
    pub output: PathBuf,
}

#[derive(Args, Debug)]
pub struct ExportAuditArgs {
    #[arg(long)]
    pub output: PathBuf,
}

#[derive(Args, Debug)]
pub struct StuckArgs {
    /// Age in minutes before a generating entry counts as stuck
    #[arg(long, default_value_t = 30)]
    pub generating_minutes: i64,
    /// Age in hours before a flagged entry counts as unreviewed
    #[arg(long, default_value_t = 24)]
    pub review_hours: i64,
}

#[derive(Subcommand, Debug)]
pub enum HealthCommands {
    /// Run basic checks against config and database
    Check,
}

pub fn run(cli: Cli) -> Result<()> {
    enforce_token(&cli)?;
    let context = AppContext::new(&cli)?;

    match &cli.command {
        Commands::Status => {
            let status = context.gather_status()?;
            render(&status, cli.format)?;
        }
        Commands::Queue(QueueCommands::Show(args)) => {
            let queue = context.queue_show(args)?;
            render(&queue, cli.format)?;
        }
        Commands::Flagged(FlaggedCommands::List(args)) => {
            let flagged = context.flagged_list(args)?;
            render(&flagged, cli.format)?;
        }
        Commands::Flagged(FlaggedCommands::Resolve(args)) => {
            let result = context.flagged_resolve(args)?;
            render(&result, cli.format)?;
        }
        Commands::User(UserCommands::Standing(args)) => {
            let standing = context.user_standing(args)?;
            render(&standing, cli.format)?;
        }
        Commands::Maintenance(MaintenanceCommands::Purge) => {
            let result = context.purge()?;
            render(&result, cli.format)?;
        }
        Commands::Maintenance(MaintenanceCommands::Backup(args)) => {
            let result = context.backup(args)?;
            render(&result, cli.format)?;
        }
        Commands::Maintenance(MaintenanceCommands::ExportAudit(args)) => {
            let result = context.export_audit(args)?;
            render(&result, cli.format)?;
        }
        Commands::Maintenance(MaintenanceCommands::Stuck(args)) => {
            let findings = context.stuck(args)?;
            render(&findings, cli.format)?;
        }
        Commands::Health(HealthCommands::Check) => {
            let report = context.health_check()?;
            render(&report, cli.format)?;
            if report
                .iter()
                .any(|entry| matches!(entry.status, CheckStatus::Error))
            {
                return Err(AppError::MissingResource(
                    "one or more checks failed".to_string(),
                ));
            }
        }
    }

    Ok(())
}

fn enforce_token(cli: &Cli) -> Result<()> {
    if let Ok(expected) = std::env::var("AIRCASTCTL_TOKEN") {
        match &cli.token {
            Some(provided) if provided == &expected => Ok(()),
            _ => Err(AppError::Authentication),
        }
    } else {
        Ok(())
    }
}

fn render<T>(value: &T, format: OutputFormat) -> Result<()>
where
    T: Serialize + DisplayFallback,
{
    match format {
        OutputFormat::Text => {
            println!("{}", value.display());
            Ok(())
        }
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{}", json);
            Ok(())
        }
    }
}

trait DisplayFallback {
    fn display(&self) -> String;
}

#[derive(Debug)]
struct AppContext {
    config: StationConfig,
    config_path: PathBuf,
    db_path: PathBuf,
}

impl AppContext {
    fn new(cli: &Cli) -> Result<Self> {
        let config_path = cli.config.clone();
        let config = load_station_config(&config_path)?;
        let db_path = cli.db.clone().unwrap_or_else(|| config.database_path());
        Ok(Self {
            config,
            config_path,
            db_path,
        })
    }

    fn station(&self) -> Result<Station> {
        let mut config = self.config.clone();
        if let Some(parent) = self.db_path.parent() {
            config.storage.data_dir = parent.display().to_string();
        }
        if let Some(name) = self.db_path.file_name() {
            config.storage.database = name.to_string_lossy().into_owned();
        }
        Ok(Station::open(config)?)
    }

    fn open_database(&self, path: &Path) -> Result<Connection> {
        if !path.exists() {
            return Err(AppError::MissingResource(format!(
                "database missing: {}",
                path.display()
            )));
        }
        let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)?;
        Ok(conn)
    }

    fn gather_status(&self) -> Result<StatusReport> {
        let conn = self.open_database(&self.db_path)?;
        let mut request_counts = HashMap::new();
        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM requests GROUP BY status")?;
        for row in stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))? {
            let (status, count): (String, i64) = row?;
            request_counts.insert(status, count);
        }
        let channels: i64 =
            conn.query_row("SELECT COUNT(*) FROM channels WHERE active = 1", [], |row| {
                row.get(0)
            })?;
        let users: i64 = conn.query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))?;
        Ok(StatusReport {
            station: StationInfo {
                name: self.config.station.name.clone(),
                environment: self.config.station.environment.clone(),
            },
            request_counts,
            active_channels: channels,
            known_users: users,
        })
    }

    fn queue_show(&self, args: &QueueShowArgs) -> Result<QueueList> {
        let conn = self.open_database(&self.db_path)?;
        let mut stmt = conn.prepare(
            "SELECT request_id, user_id, status, base_priority, computed_priority, submitted_at \
             FROM requests \
             WHERE channel_id = ?1 AND status = 'queued' \
             ORDER BY computed_priority DESC, submitted_at ASC \
             LIMIT ?2",
        )?;
        let rows = stmt
            .query_map((&args.channel, args.limit as i64), |row| {
                Ok(QueueRow {
                    request_id: row.get(0)?,
                    user_id: row.get(1)?,
                    status: row.get(2)?,
                    base_priority: row.get(3)?,
                    computed_priority: row.get(4)?,
                    submitted_at: row.get::<_, Option<String>>(5)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(QueueList { rows })
    }

    fn flagged_list(&self, args: &FlaggedListArgs) -> Result<FlaggedList> {
        let conn = self.open_database(&self.db_path)?;
        let mut stmt = conn.prepare(
            "SELECT request_id, user_id, channel_id, prompt, verdict_reason, submitted_at \
             FROM requests \
             WHERE status = 'flagged' AND (?1 IS NULL OR channel_id = ?1) \
             ORDER BY submitted_at ASC",
        )?;
        let rows = stmt
            .query_map([args.channel.as_ref()], |row| {
                Ok(FlaggedRow {
                    request_id: row.get(0)?,
                    user_id: row.get(1)?,
                    channel_id: row.get(2)?,
                    prompt: row.get(3)?,
                    reason: row.get(4)?,
                    submitted_at: row.get::<_, Option<String>>(5)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(FlaggedList { rows })
    }

    fn flagged_resolve(&self, args: &FlaggedResolveArgs) -> Result<ResolveResult> {
        let station = self.station()?;
        let decision = match args.decision {
            ResolveDecision::Approve => FlagDecision::Approve,
            ResolveDecision::Reject => FlagDecision::Reject,
        };
        let status = station.resolve_flag(&args.request_id, decision, &args.reason)?;
        Ok(ResolveResult {
            request_id: args.request_id.clone(),
            status: status.to_string(),
        })
    }

    fn user_standing(&self, args: &UserStandingArgs) -> Result<StandingReport> {
        let station = self.station()?;
        let standing = station.user_standing(&args.user_id)?;
        Ok(StandingReport {
            user_id: standing.user_id,
            reputation: standing.reputation,
            ban_state: standing.ban_state.to_string(),
            ban_until: standing.ban_until.map(|ts| ts.to_rfc3339()),
            strike_weight_in_window: standing.strike_weight_in_window,
            active_timeout_until: standing.active_timeout_until.map(|ts| ts.to_rfc3339()),
        })
    }

    fn purge(&self) -> Result<PurgeResult> {
        let station = self.station()?;
        let removed = station.purge_terminal()?;
        Ok(PurgeResult { removed })
    }

    fn backup(&self, args: &BackupArgs) -> Result<FileResult> {
        let station = self.station()?;
        station.backup_to(&args.output)?;
        Ok(FileResult {
            status: "ok".to_string(),
            path: args.output.display().to_string(),
        })
    }

    fn export_audit(&self, args: &ExportAuditArgs) -> Result<FileResult> {
        let station = self.station()?;
        station.export_audit(&args.output)?;
        Ok(FileResult {
            status: "ok".to_string(),
            path: args.output.display().to_string(),
        })
    }

    fn stuck(&self, args: &StuckArgs) -> Result<StuckList> {
        let station = self.station()?;
        let findings = station.audit_stuck(
            Duration::minutes(args.generating_minutes),
            Duration::hours(args.review_hours),
        )?;
        Ok(StuckList { findings })
    }

    fn health_check(&self) -> Result<Vec<HealthEntry>> {
        let mut results = Vec::new();
        results.push(self.check_path("station.toml", &self.config_path));
        results.push(self.check_database("station.sqlite", &self.db_path));
        Ok(results)
    }

    fn check_path(&self, name: &str, path: &Path) -> HealthEntry {
        if path.exists() {
            HealthEntry::ok(name, format!("{}", path.display()))
        } else {
            HealthEntry::error(name, format!("{path} missing", path = path.display()))
        }
    }

    fn check_database(&self, name: &str, path: &Path) -> HealthEntry {
        if !path.exists() {
            return HealthEntry::warn(name, format!("{path} missing", path = path.display()));
        }
        match self.open_database(path) {
            Ok(conn) => {
                let pragma: rusqlite::Result<String> =
                    conn.query_row("PRAGMA integrity_check;", [], |row| row.get(0));
                match pragma {
                    Ok(result) if result.to_lowercase() == "ok" => {
                        HealthEntry::ok(name, "integrity ok".to_string())
                    }
                    Ok(result) => HealthEntry::warn(name, format!("integrity_check: {result}")),
                    Err(err) => HealthEntry::warn(name, format!("error: {err}")),
                }
            }
            Err(err) => HealthEntry::error(name, format!("failed to open: {err}")),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub station: StationInfo,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub request_counts: HashMap<String, i64>,
    pub active_channels: i64,
    pub known_users: i64,
}

#[derive(Debug, Serialize)]
pub struct StationInfo {
    pub name: String,
    pub environment: String,
}

impl DisplayFallback for StatusReport {
    fn display(&self) -> String {
        let mut lines = vec![format!(
            "Station: {} (env: {})",
            self.station.name, self.station.environment
        )];
        if !self.request_counts.is_empty() {
            lines.push("Requests:".to_string());
            for (status, count) in self.request_counts.iter() {
                lines.push(format!("  - {status}: {count}"));
            }
        }
        lines.push(format!("Active channels: {}", self.active_channels));
        lines.push(format!("Known users: {}", self.known_users));
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct QueueList {
    pub rows: Vec<QueueRow>,
}

#[derive(Debug, Serialize)]
pub struct QueueRow {
    pub request_id: String,
    pub user_id: String,
    pub status: String,
    pub base_priority: i64,
    pub computed_priority: f64,
    pub submitted_at: Option<String>,
}

impl DisplayFallback for QueueList {
    fn display(&self) -> String {
        if self.rows.is_empty() {
            return "Queue empty".to_string();
        }
        let mut lines = Vec::new();
        for entry in &self.rows {
            lines.push(format!(
                "{id} user={user} priority={priority:.1} base={base} submitted={submitted}",
                id = entry.request_id,
                user = entry.user_id,
                priority = entry.computed_priority,
                base = entry.base_priority,
                submitted = entry.submitted_at.as_deref().unwrap_or("-"),
            ));
        }
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct FlaggedList {
    pub rows: Vec<FlaggedRow>,
}

#[derive(Debug, Serialize)]
pub struct FlaggedRow {
    pub request_id: String,
    pub user_id: String,
    pub channel_id: String,
    pub prompt: String,
    pub reason: Option<String>,
    pub submitted_at: Option<String>,
}

impl DisplayFallback for FlaggedList {
    fn display(&self) -> String {
        if self.rows.is_empty() {
            return "Nothing waiting for review".to_string();
        }
        let mut lines = Vec::new();
        for entry in &self.rows {
            lines.push(format!(
                "{id} channel={channel} user={user} reason={reason} | {prompt}",
                id = entry.request_id,
                channel = entry.channel_id,
                user = entry.user_id,
                reason = entry.reason.as_deref().unwrap_or("-"),
                prompt = entry.prompt,
            ));
        }
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct ResolveResult {
    pub request_id: String,
    pub status: String,
}

impl DisplayFallback for ResolveResult {
    fn display(&self) -> String {
        format!("{} -> {}", self.request_id, self.status)
    }
}

#[derive(Debug, Serialize)]
pub struct StandingReport {
    pub user_id: String,
    pub reputation: i64,
    pub ban_state: String,
    pub ban_until: Option<String>,
    pub strike_weight_in_window: i64,
    pub active_timeout_until: Option<String>,
}

impl DisplayFallback for StandingReport {
    fn display(&self) -> String {
        let mut lines = vec![
            format!("User: {}", self.user_id),
            format!("Reputation: {}", self.reputation),
            format!("Ban state: {}", self.ban_state),
            format!("Strikes in window: {}", self.strike_weight_in_window),
        ];
        if let Some(until) = &self.ban_until {
            lines.push(format!("Banned until: {until}"));
        }
        if let Some(until) = &self.active_timeout_until {
            lines.push(format!("Active timeout until: {until}"));
        }
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct PurgeResult {
    pub removed: usize,
}

impl DisplayFallback for PurgeResult {
    fn display(&self) -> String {
        format!("Removed {} terminal entries", self.removed)
    }
}

#[derive(Debug, Serialize)]
pub struct FileResult {
    pub status: String,
    pub path: String,
}

impl DisplayFallback for FileResult {
    fn display(&self) -> String {
        format!("[{}] {}", self.status, self.path)
    }
}

#[derive(Debug, Serialize)]
pub struct StuckList {
    pub findings: Vec<StuckFinding>,
}

impl DisplayFallback for StuckList {
    fn display(&self) -> String {
        if self.findings.is_empty() {
            return "Nothing stuck".to_string();
        }
        let mut lines = Vec::new();
        for finding in &self.findings {
            lines.push(format!(
                "{id} channel={channel} kind={kind:?} age={age:.0}m",
                id = finding.request_id,
                channel = finding.channel_id,
                kind = finding.kind,
                age = finding.age_minutes,
            ));
        }
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct HealthEntry {
    pub name: String,
    pub status: CheckStatus,
    pub detail: String,
}

#[derive(Debug, Serialize)]
pub enum CheckStatus {
    #[serde(rename = "ok")]
    Ok,
    #[serde(rename = "warn")]
    Warn,
    #[serde(rename = "error")]
    Error,
}

impl fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CheckStatus::Ok => "OK",
            CheckStatus::Warn => "WARN",
            CheckStatus::Error => "ERROR",
        };
        write!(f, "{}", label)
    }
}

impl HealthEntry {
    fn ok(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Ok,
            detail: detail.into(),
        }
    }

    fn warn(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Warn,
            detail: detail.into(),
        }
    }

    fn error(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Error,
            detail: detail.into(),
        }
    }
}

impl DisplayFallback for Vec<HealthEntry> {
    fn display(&self) -> String {
        let mut lines = Vec::new();
        for entry in self {
            lines.push(format!(
                "[{status}] {name}: {detail}",
                status = entry.status,
                name = entry.name,
                detail = entry.detail
            ));
        }
        lines.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::params;
    use std::fs;
    use tempfile::TempDir;

    fn prepare_test_context() -> Result<(TempDir, AppContext)> {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        let configs_dir = root.join("configs");
        fs::create_dir_all(&configs_dir).unwrap();
        fs::copy("../configs/station.toml", configs_dir.join("station.toml")).unwrap();

        let data_dir = root.join("data");
        fs::create_dir_all(&data_dir).unwrap();
        let db_path = data_dir.join("station.sqlite");

        let conn = Connection::open(&db_path).unwrap();
        for schema in ["requests.sql", "users.sql", "rate_windows.sql"] {
            conn.execute_batch(&fs::read_to_string(format!("../sql/{schema}")).unwrap())
                .unwrap();
        }
        conn.execute(
            "INSERT INTO channels(channel_id, name) VALUES (?1, ?2)",
            params!["main", "Main Rotation"],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO users(user_id, reputation) VALUES (?1, ?2)",
            params!["user-1", 50],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO requests(request_id, user_id, channel_id, prompt, status, computed_priority)
             VALUES (?1, ?2, ?3, ?4, 'queued', 42.0)",
            params!["req-1", "user-1", "main", "a song"],
        )
        .unwrap();

        let cli = Cli {
            config: configs_dir.join("station.toml"),
            db: Some(db_path),
            token: None,
            format: OutputFormat::Json,
            command: Commands::Status,
        };

        let context = AppContext::new(&cli)?;
        Ok((temp, context))
    }

    #[test]
    fn status_report_counts_requests() {
        let (_temp, context) = prepare_test_context().unwrap();
        let status = context.gather_status().unwrap();
        assert_eq!(status.station.name, "aircast-primary");
        assert_eq!(status.request_counts.get("queued"), Some(&1));
        assert_eq!(status.active_channels, 1);
        assert_eq!(status.known_users, 1);
    }

    #[test]
    fn queue_show_returns_waiting_entries() {
        let (_temp, context) = prepare_test_context().unwrap();
        let queue = context
            .queue_show(&QueueShowArgs {
                channel: "main".to_string(),
                limit: 5,
            })
            .unwrap();
        assert_eq!(queue.rows.len(), 1);
        assert_eq!(queue.rows[0].request_id, "req-1");
        assert!((queue.rows[0].computed_priority - 42.0).abs() < f64::EPSILON);
    }

    #[test]
    fn flagged_list_is_empty_without_flags() {
        let (_temp, context) = prepare_test_context().unwrap();
        let flagged = context.flagged_list(&FlaggedListArgs { channel: None }).unwrap();
        assert!(flagged.rows.is_empty());
    }
}
