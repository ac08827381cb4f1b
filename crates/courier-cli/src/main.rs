// SPDX-License-Identifier: AGPL-3.0
// Courier CLI - Entry point
//
// One-shot front end: each invocation restores the saved transfers, runs a
// command, waits for what it started and leaves anything unfinished in the
// snapshot for the next run.

mod bridge;

use bridge::{Authorizers, ManagerBridge, WaitOutcome};
use clap::{Args, Parser, Subcommand};
use courier_core::{
    ApiKeyAuthorizer, DuplicateMarkerPolicy, Params, RequestAuthorizer, SettingsStore,
    StaticHeaderAuthorizer, TaskStatus, TransferError, TransferSettings,
};
use std::collections::HashSet;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

#[derive(Debug, Parser)]
#[command(name = "courier", version, about = "Resumable, retrying file transfers")]
struct Cli {
    #[command(flatten)]
    global: GlobalOptions,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Args)]
struct GlobalOptions {
    /// Settings file (defaults to the platform config directory)
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    /// Snapshot file, overriding the settings
    #[arg(long, global = true)]
    state_file: Option<PathBuf>,

    /// Bearer token for S3-style requests
    #[arg(long, global = true)]
    s3_token: Option<String>,

    /// API key for GCS-style requests
    #[arg(long, global = true)]
    gcs_api_key: Option<String>,

    /// Replace a live transfer that reuses a marker instead of failing
    #[arg(long, global = true)]
    supersede: bool,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Upload a local file
    Upload {
        local: PathBuf,
        remote: String,
        #[command(flatten)]
        transfer: TransferOptions,
    },
    /// Download a remote file
    Download {
        remote: String,
        local: PathBuf,
        #[command(flatten)]
        transfer: TransferOptions,
    },
    /// Delete a remote file
    Delete { remote: String },
    /// List saved transfers
    Status {
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },
    /// Retry every pending transfer and wait for them
    Retry {
        /// Reset attempt counts first
        #[arg(long)]
        fresh: bool,
    },
    /// Forget a saved transfer
    Cancel { marker: String },
    /// Forget all saved transfers
    Reset,
}

#[derive(Debug, Args)]
struct TransferOptions {
    /// Transfer identifier (generated when omitted)
    #[arg(long)]
    marker: Option<String>,

    /// Backend parameter as key=value; values that parse as JSON are kept as JSON
    #[arg(long = "param", value_parser = parse_param)]
    params: Vec<(String, serde_json::Value)>,

    /// Return once the transfer is dispatched
    #[arg(long)]
    no_wait: bool,
}

impl TransferOptions {
    fn marker(&self) -> String {
        self.marker
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
    }

    fn params(&self) -> Params {
        self.params.iter().cloned().collect()
    }
}

fn parse_param(raw: &str) -> Result<(String, serde_json::Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got {}", raw))?;
    if key.is_empty() {
        return Err(format!("empty key in {}", raw));
    }
    let value = serde_json::from_str(value)
        .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

fn main() -> ExitCode {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("courier_cli=info".parse().unwrap())
                .add_directive("courier_core=info".parse().unwrap())
                .add_directive("courier_http=info".parse().unwrap()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    tracing::debug!("Starting Courier v{}", env!("CARGO_PKG_VERSION"));

    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn load_settings(global: &GlobalOptions) -> Result<TransferSettings, TransferError> {
    let store = match &global.settings {
        Some(path) => SettingsStore::open(path)?,
        None => SettingsStore::new()?,
    };
    let mut settings = store.get();
    if let Some(state_file) = &global.state_file {
        settings.state_file = Some(state_file.clone());
    }
    if global.supersede {
        settings.duplicate_marker_policy = DuplicateMarkerPolicy::Supersede;
    }
    Ok(settings)
}

fn authorizers(global: &GlobalOptions) -> Authorizers {
    Authorizers {
        s3: global
            .s3_token
            .as_deref()
            .map(|token| -> Arc<dyn RequestAuthorizer> {
                Arc::new(StaticHeaderAuthorizer::bearer(token))
            }),
        gcs: global
            .gcs_api_key
            .as_ref()
            .map(|key| -> Arc<dyn RequestAuthorizer> {
                Arc::new(ApiKeyAuthorizer::new(key.clone()))
            }),
    }
}

fn run(cli: Cli) -> Result<ExitCode, TransferError> {
    let settings = load_settings(&cli.global)?;
    let bridge = ManagerBridge::new(settings, authorizers(&cli.global))?;
    let manager = bridge.manager();

    let code = match cli.command {
        Command::Upload {
            local,
            remote,
            transfer,
        } => {
            let marker = transfer.marker();
            let task = manager.upload_file(&local, &remote, &marker, transfer.params())?;
            println!("{}: {} {}", task.marker, task.describe_direction(), task.remote_url);
            finish(&bridge, marker, transfer.no_wait)
        }
        Command::Download {
            remote,
            local,
            transfer,
        } => {
            let marker = transfer.marker();
            let task = manager.download_file(&remote, &local, &marker, transfer.params())?;
            println!(
                "{}: {} {}",
                task.marker,
                task.describe_direction(),
                task.local_file_path.display()
            );
            finish(&bridge, marker, transfer.no_wait)
        }
        Command::Delete { remote } => {
            manager.delete_file(&remote)?;
            println!("Deleted {}", remote);
            ExitCode::SUCCESS
        }
        Command::Status { json } => {
            let tasks = manager.current_state();
            if json {
                let infos: Vec<_> = tasks.iter().map(|t| t.info()).collect();
                let text = serde_json::to_string_pretty(&infos).map_err(|e| {
                    TransferError::InvalidConfig(format!("Failed to serialize state: {}", e))
                })?;
                println!("{}", text);
            } else {
                for task in &tasks {
                    println!(
                        "{}  {:8}  {:18}  attempt {}  {}",
                        task.marker,
                        task.describe_direction(),
                        task.describe_status(),
                        task.attempt_count,
                        task.remote_url
                    );
                }
                println!("{}", manager.pending_summary());
            }
            ExitCode::SUCCESS
        }
        Command::Retry { fresh } => {
            if fresh {
                manager.reset_retries();
            }
            let markers: HashSet<String> = manager
                .current_state()
                .into_iter()
                .filter(|t| t.status == TaskStatus::PendingRetry)
                .map(|t| t.marker)
                .collect();
            if markers.is_empty() {
                println!("{}", manager.pending_summary());
                ExitCode::SUCCESS
            } else {
                let dispatched = manager.retry_pending();
                println!("Retrying {} transfers", dispatched);
                report(bridge.wait_for(markers))
            }
        }
        Command::Cancel { marker } => {
            manager.cancel_transfer(&marker)?;
            println!("Cancelled {}", marker);
            ExitCode::SUCCESS
        }
        Command::Reset => {
            manager.reset();
            println!("All transfers forgotten");
            ExitCode::SUCCESS
        }
    };

    bridge.shutdown();
    Ok(code)
}

fn finish(bridge: &ManagerBridge, marker: String, no_wait: bool) -> ExitCode {
    if no_wait {
        return ExitCode::SUCCESS;
    }
    report(bridge.wait_for(HashSet::from([marker])))
}

fn report(outcome: WaitOutcome) -> ExitCode {
    match outcome {
        WaitOutcome::Finished(results) => {
            let mut failed = false;
            for (marker, result) in results {
                match result {
                    Ok(()) => println!("{}: done", marker),
                    Err(e) => {
                        failed = true;
                        println!("{}: failed: {}", marker, e);
                    }
                }
            }
            if failed {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            }
        }
        WaitOutcome::Interrupted => {
            println!("Interrupted; unfinished transfers will resume on the next run");
            ExitCode::FAILURE
        }
    }
}
