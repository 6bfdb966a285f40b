//! qalog-cli: operator CLI for the qalog HTTP API
//!
//! # Subcommands
//! - `status`                                  : show server health
//! - `live <program> [--watch]`                : current session/iteration tail
//! - `sessions <program>`                      : sessions, newest first
//! - `iterations <program> <session>`          : per-iteration summary
//! - `remark add|resolve …`                    : annotate an iteration
//! - `archive <year>`                          : move a year of logs aside

use std::time::Duration;

use clap::{Parser, Subcommand};
use serde::Deserialize;
use serde_json::{json, Value};

const DEFAULT_SERVER: &str = "http://127.0.0.1:8766";
const DEFAULT_POLL_SECONDS: u64 = 2;

// ============================================================================
// CLI Definition
// ============================================================================

#[derive(Debug, Parser)]
#[command(name = "qalog-cli", version, about = "qalog: QA activity logger CLI")]
struct Cli {
    /// qalog HTTP server URL (overrides QALOG_HTTP_URL env var)
    #[arg(long, env = "QALOG_HTTP_URL", default_value = DEFAULT_SERVER)]
    server: String,

    /// Print raw JSON instead of tables
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Show qalog server status
    Status,

    /// Show the live session/iteration tail of a program
    Live {
        program: String,

        /// Keep polling and print each change
        #[arg(long)]
        watch: bool,

        /// Poll interval in seconds
        #[arg(long, default_value_t = DEFAULT_POLL_SECONDS)]
        interval: u64,
    },

    /// List a program's sessions, newest first
    Sessions { program: String },

    /// List the iterations of one session
    Iterations { program: String, session: String },

    /// Add or resolve an iteration remark
    Remark {
        #[command(subcommand)]
        action: RemarkCommand,
    },

    /// Move all logs created in YEAR into qa_logs_YEAR
    Archive { year: i32 },
}

#[derive(Debug, Subcommand)]
enum RemarkCommand {
    /// Create or replace the remark on an iteration
    Add {
        program: String,
        session: String,
        iteration: i32,
        #[arg(long)]
        name: String,
        #[arg(long, default_value = "")]
        body: String,
        #[arg(long)]
        author: String,
    },

    /// Mark the remark on an iteration resolved
    Resolve {
        program: String,
        session: String,
        iteration: i32,
        #[arg(long = "by")]
        resolved_by: String,

        /// Reopen instead of resolving
        #[arg(long)]
        reopen: bool,
    },
}

// ============================================================================
// API Response Types
// ============================================================================

/// GET /status body
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveStatus {
    pub iteration: i32,
    pub active: bool,
    pub latest_iteration: i32,
    pub latest_session: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SessionRow {
    pub session_id: String,
    pub user_id: String,
    pub iteration_count: i32,
    pub log_count: i64,
    pub updated_at: String,
}

#[derive(Debug, Deserialize)]
pub struct IterationRow {
    pub iteration: i32,
    pub log_count: i64,
    pub error_count: i64,
    pub first_at: Option<String>,
    pub remark_name: Option<String>,
    pub remark_resolved: Option<bool>,
}

// ============================================================================
// Formatting
// ============================================================================

pub fn format_live(program: &str, s: &LiveStatus) -> String {
    match &s.latest_session {
        Some(session) => format!(
            "{}  {}  iteration {}  [{}]",
            program,
            session,
            s.latest_iteration,
            if s.active { "active" } else { "idle" }
        ),
        None => format!("{}  no sessions found", program),
    }
}

pub fn format_session_row(r: &SessionRow) -> String {
    format!(
        "{:<32} {:<12} {:>5} {:>7}  {}",
        truncate(&r.session_id, 32),
        truncate(&r.user_id, 12),
        r.iteration_count,
        r.log_count,
        r.updated_at
    )
}

pub fn format_iteration_row(r: &IterationRow) -> String {
    let remark = match (&r.remark_name, r.remark_resolved) {
        (Some(name), Some(true)) => format!("{} (resolved)", name),
        (Some(name), _) => name.clone(),
        (None, _) => "-".to_string(),
    };
    format!(
        "{:>5} {:>7} {:>7}  {:<25} {}",
        r.iteration,
        r.log_count,
        r.error_count,
        r.first_at.as_deref().unwrap_or("-"),
        remark
    )
}

/// Cut to `max` characters, marking the cut with `…`.
pub fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max.saturating_sub(1)).collect();
    out.push('…');
    out
}

// ============================================================================
// HTTP Client Calls
// ============================================================================

fn client() -> anyhow::Result<reqwest::blocking::Client> {
    Ok(reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()?)
}

/// Send a request and return the JSON body, exiting on transport or HTTP
/// errors.
fn send(req: reqwest::blocking::RequestBuilder, what: &str) -> anyhow::Result<Value> {
    let resp = match req.send() {
        Ok(r) => r,
        Err(e) => {
            eprintln!("qalog-cli: {} failed: {}", what, e);
            std::process::exit(1);
        }
    };

    if !resp.status().is_success() {
        let status = resp.status();
        let body = resp.text().unwrap_or_default();
        eprintln!("qalog-cli: server returned {}: {}", status, body);
        std::process::exit(1);
    }

    Ok(resp.json()?)
}

fn print_json(value: &Value) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Show the server status by calling GET /health.
fn do_status(server: &str) -> anyhow::Result<()> {
    let client = reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()?;

    let url = format!("{}/health", server);
    match client.get(&url).send() {
        Ok(r) if r.status().is_success() => {
            let body: Value = r.json().unwrap_or_default();
            println!("qalog server: {}", body["status"].as_str().unwrap_or("unknown"));
            println!("Version:      {}", body["version"].as_str().unwrap_or("?"));
            println!("PostgreSQL:   {}", body["postgresql"].as_str().unwrap_or("?"));
            println!("Socket:       {}", body["socket"].as_str().unwrap_or("?"));
        }
        Ok(r) => {
            eprintln!("qalog-cli: server unhealthy (HTTP {})", r.status());
            std::process::exit(1);
        }
        Err(e) => {
            eprintln!("qalog-cli: cannot reach {}: {}", url, e);
            std::process::exit(1);
        }
    }

    Ok(())
}

fn fetch_live(client: &reqwest::blocking::Client, server: &str, program: &str) -> anyhow::Result<LiveStatus> {
    let body = send(
        client
            .get(format!("{}/status", server))
            .query(&[("program", program)]),
        "status poll",
    )?;
    Ok(serde_json::from_value(body)?)
}

fn do_live(server: &str, program: &str, watch: bool, interval: u64, json_output: bool) -> anyhow::Result<()> {
    let client = client()?;
    let mut last: Option<LiveStatus> = None;

    loop {
        let status = fetch_live(&client, server, program)?;
        if last.as_ref() != Some(&status) {
            if json_output {
                print_json(&json!({
                    "iteration": status.iteration,
                    "active": status.active,
                    "latestIteration": status.latest_iteration,
                    "latestSession": status.latest_session,
                }))?;
            } else {
                println!("{}", format_live(program, &status));
            }
            last = Some(status);
        }
        if !watch {
            return Ok(());
        }
        std::thread::sleep(Duration::from_secs(interval.max(1)));
    }
}

fn do_sessions(server: &str, program: &str, json_output: bool) -> anyhow::Result<()> {
    let body = send(
        client()?
            .get(format!("{}/sessions", server))
            .query(&[("program", program)]),
        "session listing",
    )?;
    if json_output {
        return print_json(&body);
    }

    let rows: Vec<SessionRow> = serde_json::from_value(body)?;
    if rows.is_empty() {
        eprintln!("No sessions found for: {}", program);
        return Ok(());
    }
    println!(
        "{:<32} {:<12} {:>5} {:>7}  {}",
        "SESSION", "USER", "ITER", "LOGS", "UPDATED"
    );
    for r in &rows {
        println!("{}", format_session_row(r));
    }
    Ok(())
}

fn do_iterations(server: &str, program: &str, session: &str, json_output: bool) -> anyhow::Result<()> {
    let body = send(
        client()?
            .get(format!("{}/iterations", server))
            .query(&[("program", program), ("session", session)]),
        "iteration listing",
    )?;
    if json_output {
        return print_json(&body);
    }

    let rows: Vec<IterationRow> = serde_json::from_value(body)?;
    if rows.is_empty() {
        eprintln!("No iterations found for: {}", session);
        return Ok(());
    }
    println!(
        "{:>5} {:>7} {:>7}  {:<25} {}",
        "ITER", "LOGS", "ERRORS", "FIRST", "REMARK"
    );
    for r in &rows {
        println!("{}", format_iteration_row(r));
    }
    Ok(())
}

fn do_remark(server: &str, action: RemarkCommand, json_output: bool) -> anyhow::Result<()> {
    let client = client()?;
    let body = match action {
        RemarkCommand::Add {
            program,
            session,
            iteration,
            name,
            body,
            author,
        } => send(
            client.put(format!("{}/remarks", server)).json(&json!({
                "program": program,
                "session_id": session,
                "iteration": iteration,
                "name": name,
                "body": body,
                "author": author,
            })),
            "remark save",
        )?,
        RemarkCommand::Resolve {
            program,
            session,
            iteration,
            resolved_by,
            reopen,
        } => send(
            client.post(format!("{}/remarks/resolve", server)).json(&json!({
                "program": program,
                "session_id": session,
                "iteration": iteration,
                "resolved_by": resolved_by,
                "resolved": !reopen,
            })),
            "remark resolve",
        )?,
    };

    if json_output {
        return print_json(&body);
    }
    println!(
        "{} iteration {}: {} ({})",
        body["session_id"].as_str().unwrap_or("?"),
        body["iteration"],
        body["name"].as_str().unwrap_or("?"),
        if body["resolved"].as_bool().unwrap_or(false) {
            "resolved"
        } else {
            "open"
        }
    );
    Ok(())
}

fn do_archive(server: &str, year: i32, json_output: bool) -> anyhow::Result<()> {
    let body = send(
        client()?
            .post(format!("{}/archive", server))
            .json(&json!({ "year": year })),
        "archive",
    )?;
    if json_output {
        return print_json(&body);
    }
    println!(
        "Archived {} rows into {}",
        body["rows_archived"],
        body["table"].as_str().unwrap_or("?")
    );
    Ok(())
}

// ============================================================================
// Main
// ============================================================================

fn main() {
    let cli = Cli::parse();
    let server = cli.server.trim_end_matches('/').to_string();

    let result = match cli.command {
        Commands::Status => do_status(&server),
        Commands::Live {
            program,
            watch,
            interval,
        } => do_live(&server, &program, watch, interval, cli.json),
        Commands::Sessions { program } => do_sessions(&server, &program, cli.json),
        Commands::Iterations { program, session } => {
            do_iterations(&server, &program, &session, cli.json)
        }
        Commands::Remark { action } => do_remark(&server, action, cli.json),
        Commands::Archive { year } => do_archive(&server, year, cli.json),
    };

    if let Err(e) = result {
        eprintln!("qalog-cli: {}", e);
        std::process::exit(1);
    }
}

// ============================================================================
// Tests
// ============================================================================
