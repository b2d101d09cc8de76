// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::error;

use aegis::audit::AuditLog;
use aegis::channel::NullChannel;
use aegis::config::Config;
use aegis::error::ErrorCode;
use aegis::pty::NativePty;
use aegis::session::{self, SessionParams};
use aegis::store::Store;

#[derive(Parser)]
#[command(name = "aegis", version, about = "Human-in-the-loop supervisor for CLI AI agents.")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a supervised session in the foreground.
    Run {
        /// The agent tool to launch (e.g. claude, codex, gemini).
        tool: String,
        /// Arguments passed through to the tool.
        args: Vec<String>,
    },
    /// List active sessions.
    Status,
    /// Tail recent audit events.
    Logs {
        /// Number of trailing events to print.
        #[arg(long, default_value = "20")]
        count: usize,
    },
    /// Environment health check.
    Doctor,
    /// Audit log operations.
    Audit {
        #[command(subcommand)]
        command: AuditCommands,
    },
}

#[derive(Subcommand)]
enum AuditCommands {
    /// Re-hash the chain end-to-end.
    Verify,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    std::process::exit(match cli.command {
        Commands::Run { tool, args } => run_cmd(tool, args).await,
        Commands::Status => status_cmd().await,
        Commands::Logs { count } => logs_cmd(count).await,
        Commands::Doctor => doctor_cmd().await,
        Commands::Audit { command: AuditCommands::Verify } => audit_verify_cmd().await,
    });
}

async fn load_config() -> Result<Config, i32> {
    Config::load().map_err(|e| {
        error!("config error: {e:#}");
        ErrorCode::ConfigError.exit_code()
    })
}

async fn run_cmd(tool: String, args: Vec<String>) -> i32 {
    let config = match load_config().await {
        Ok(c) => c,
        Err(code) => return code,
    };

    let mut command = vec![tool.clone()];
    command.extend(args);

    let (cols, rows) = aegis::pty::raw_mode::terminal_size().unwrap_or((80, 24));
    let backend = match NativePty::spawn(&command, cols, rows) {
        Ok(backend) => Box::new(backend),
        Err(e) => {
            error!("failed to spawn {tool}: {e:#}");
            return ErrorCode::EnvError.exit_code();
        }
    };

    let db_path = match config.db_path() {
        Ok(path) => path,
        Err(e) => {
            error!("{e:#}");
            return ErrorCode::ConfigError.exit_code();
        }
    };
    let audit_log_path = match config.audit_log_path() {
        Ok(path) => path,
        Err(e) => {
            error!("{e:#}");
            return ErrorCode::ConfigError.exit_code();
        }
    };

    let params = SessionParams {
        session_id: uuid::Uuid::new_v4().to_string(),
        tool: tool.clone(),
        cwd: std::env::current_dir().unwrap_or_else(|_| ".".into()),
        db_path,
        audit_log_path,
        log_level: config.logging.level.clone(),
        stuck_timeout: std::time::Duration::from_secs_f64(config.prompts.stuck_timeout_seconds),
        prompt_timeout: std::time::Duration::from_secs(config.prompts.timeout_seconds),
        free_text_enabled: config.prompts.free_text_enabled,
        detection_threshold: config.detection_threshold(&tool),
    };

    let (_reply_tx, reply_rx) = aegis::channel::reply_queue();
    match session::run(params, backend, Arc::new(NullChannel), reply_rx).await {
        Ok(result) => result.status.code.unwrap_or(1),
        Err(e) => {
            error!("fatal: {e:#}");
            ErrorCode::Generic.exit_code()
        }
    }
}

async fn status_cmd() -> i32 {
    let config = match load_config().await {
        Ok(c) => c,
        Err(code) => return code,
    };
    let db_path = match config.db_path() {
        Ok(p) => p,
        Err(e) => {
            error!("{e:#}");
            return ErrorCode::ConfigError.exit_code();
        }
    };
    let store = match Store::open(&db_path) {
        Ok(s) => s,
        Err(e) => {
            error!("{e:#}");
            return ErrorCode::StateCorruption.exit_code();
        }
    };
    match store.active_sessions() {
        Ok(sessions) if sessions.is_empty() => {
            println!("no active sessions");
            0
        }
        Ok(sessions) => {
            for session in sessions {
                println!(
                    "{}\t{}\t{}\tpid={}",
                    session.id,
                    session.tool,
                    session.cwd,
                    session.pid.map(|p| p.to_string()).unwrap_or_else(|| "-".to_owned())
                );
            }
            0
        }
        Err(e) => {
            error!("{e:#}");
            ErrorCode::StateCorruption.exit_code()
        }
    }
}

async fn logs_cmd(count: usize) -> i32 {
    let config = match load_config().await {
        Ok(c) => c,
        Err(code) => return code,
    };
    let path = match config.audit_log_path() {
        Ok(p) => p,
        Err(e) => {
            error!("{e:#}");
            return ErrorCode::ConfigError.exit_code();
        }
    };
    let contents = match std::fs::read_to_string(&path) {
        Ok(c) => c,
        Err(e) => {
            error!("failed to read audit log {}: {e}", path.display());
            return ErrorCode::StateCorruption.exit_code();
        }
    };
    let lines: Vec<&str> = contents.lines().collect();
    let start = lines.len().saturating_sub(count);
    for line in &lines[start..] {
        println!("{line}");
    }
    0
}

async fn doctor_cmd() -> i32 {
    let mut ok = true;

    match Config::load() {
        Ok(config) => {
            println!("config: ok");
            match config.db_path().and_then(|p| config.audit_log_path().map(|a| (p, a))) {
                Ok((db_path, audit_path)) => {
                    println!("database path: {}", db_path.display());
                    println!("audit log path: {}", audit_path.display());
                }
                Err(e) => {
                    println!("data directory: error ({e:#})");
                    ok = false;
                }
            }
        }
        Err(e) => {
            println!("config: error ({e:#})");
            ok = false;
        }
    }

    if aegis::pty::raw_mode::terminal_size().is_some() {
        println!("terminal: ok");
    } else {
        println!("terminal: not a tty (fine for non-interactive checks)");
    }

    if ok {
        println!("doctor: all checks passed");
        0
    } else {
        println!("doctor: issues found");
        ErrorCode::ConfigError.exit_code()
    }
}

async fn audit_verify_cmd() -> i32 {
    let config = match load_config().await {
        Ok(c) => c,
        Err(code) => return code,
    };
    let path = match config.audit_log_path() {
        Ok(p) => p,
        Err(e) => {
            error!("{e:#}");
            return ErrorCode::ConfigError.exit_code();
        }
    };
    let log = match AuditLog::open(&path) {
        Ok(l) => l,
        Err(e) => {
            error!("failed to open audit log {}: {e:#}", path.display());
            return ErrorCode::StateCorruption.exit_code();
        }
    };
    match log.verify() {
        Ok(report) if report.ok => {
            println!("audit log intact: {} events", report.count);
            0
        }
        Ok(report) => {
            println!(
                "audit log broken after {} events: {}",
                report.count,
                report.first_error.as_deref().unwrap_or("unknown error")
            );
            ErrorCode::StateCorruption.exit_code()
        }
        Err(e) => {
            error!("{e:#}");
            ErrorCode::StateCorruption.exit_code()
        }
    }
}
