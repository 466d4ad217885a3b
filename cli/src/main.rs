//! Tether CLI - runs one symbolic edit tool against the current directory.
//!
//! ```text
//! tether <tool> '<json args>'    run a tool, print {"ok": ...} or {"error": ...}
//! tether <tool>                  same, reading the JSON arguments from stdin
//! tether --list                  print the tool definitions
//! ```
//!
//! Exit codes: `0` success, `1` the tool failed, `2` usage or setup error.
//! Logs go to `~/.tether/logs/tether.log`; stdout carries only the result.

use std::env;
use std::fs::{self, OpenOptions};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, bail};
use serde_json::{Value, json};
use tether_config::TetherConfig;
use tether_lineage::LineageRecorder;
use tether_lsp::SessionManager;
use tether_tools::{EditError, EditExecutor, ToolCtx, ToolRegistry};
use tokio::io::AsyncReadExt;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

const USAGE: &str = "usage: tether <tool> ['<json args>'] | tether --list";

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    let (log_file, init_warnings) = open_log_file();

    if let Some((log_path, file)) = log_file {
        tracing_subscriber::registry()
            .with(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
            .with(env_filter)
            .init();

        tracing::info!(path = %log_path.display(), "Logging initialized");
        for warning in init_warnings {
            tracing::warn!("{warning}");
        }
        return;
    }

    // stdout is reserved for the JSON result.
    tracing_subscriber::registry().with(env_filter).init();
}

fn open_log_file() -> (Option<(PathBuf, fs::File)>, Vec<String>) {
    let mut warnings = Vec::new();

    for candidate in log_file_candidates() {
        if let Some(parent) = candidate.parent()
            && let Err(e) = fs::create_dir_all(parent)
        {
            warnings.push(format!(
                "Failed to create log dir {}: {e}",
                parent.display()
            ));
            continue;
        }

        match OpenOptions::new()
            .create(true)
            .append(true)
            .open(&candidate)
        {
            Ok(file) => return (Some((candidate, file)), warnings),
            Err(e) => {
                warnings.push(format!(
                    "Failed to open log file {}: {e}",
                    candidate.display()
                ));
            }
        }
    }

    (None, warnings)
}

fn log_file_candidates() -> Vec<PathBuf> {
    let mut candidates = Vec::new();

    // Primary: ~/.tether/logs/tether.log
    if let Some(dir) = tether_config::tether_dir() {
        candidates.push(dir.join("logs").join("tether.log"));
    }

    // Fallback: ./.tether/logs/tether.log
    candidates.push(PathBuf::from(".tether").join("logs").join("tether.log"));

    candidates
}

#[derive(Debug, PartialEq)]
enum Invocation {
    List,
    Run { tool: String, args: Option<Value> },
}

fn parse_invocation(argv: &[String]) -> Result<Invocation> {
    match argv {
        [flag] if flag == "--list" => Ok(Invocation::List),
        [tool] => Ok(Invocation::Run {
            tool: tool.clone(),
            args: None,
        }),
        [tool, raw] => {
            let args = serde_json::from_str(raw).context("arguments are not valid JSON")?;
            Ok(Invocation::Run {
                tool: tool.clone(),
                args: Some(args),
            })
        }
        _ => bail!("{USAGE}"),
    }
}

async fn read_stdin_args() -> Result<Value> {
    let mut raw = String::new();
    tokio::io::stdin()
        .read_to_string(&mut raw)
        .await
        .context("failed to read arguments from stdin")?;
    serde_json::from_str(&raw).context("arguments on stdin are not valid JSON")
}

fn error_payload(err: &EditError) -> Value {
    json!({
        "error": {
            "kind": err.tag(),
            "message": err.to_string(),
            "retryable": err.is_retryable(),
        }
    })
}

/// Run `tool` with `args` rooted at the current directory.
async fn run_tool(registry: &ToolRegistry, tool: &str, args: Value) -> Result<Result<Value, EditError>> {
    let executor = registry.lookup(tool)?;
    let config = TetherConfig::load()?;
    let root = env::current_dir().context("failed to resolve the current directory")?;

    let manager = Arc::new(SessionManager::new(config.lsp, &root));
    let ctx = ToolCtx {
        executor: EditExecutor::new(Arc::clone(&manager)),
        recorder: LineageRecorder::new(config.lineage, &root),
    };

    let result = executor.execute(args, &ctx).await;
    manager.shutdown().await;
    Ok(result)
}

async fn run(argv: &[String]) -> Result<ExitCode> {
    let registry = ToolRegistry::with_symbol_tools();
    let (tool, args) = match parse_invocation(argv)? {
        Invocation::List => {
            println!("{}", serde_json::to_string_pretty(&registry.definitions())?);
            return Ok(ExitCode::SUCCESS);
        }
        Invocation::Run { tool, args: Some(args) } => (tool, args),
        Invocation::Run { tool, args: None } => (tool, read_stdin_args().await?),
    };

    match run_tool(&registry, &tool, args).await? {
        Ok(value) => {
            println!("{}", json!({ "ok": value }));
            Ok(ExitCode::SUCCESS)
        }
        Err(err) => {
            tracing::warn!(tool = %tool, kind = err.tag(), "Tool failed: {err}");
            println!("{}", error_payload(&err));
            Ok(ExitCode::from(1))
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();

    let argv: Vec<String> = env::args().skip(1).collect();
    match run(&argv).await {
        Ok(code) => code,
        Err(err) => {
            tracing::error!("{err:#}");
            eprintln!("Error: {err:#}");
            ExitCode::from(2)
        }
    }
}
