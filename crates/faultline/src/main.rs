//! faultline CLI
//!
//! Inspect, export and clear the fault records VoiceJot persists on this
//! device. Reads both the managed and the native store.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use serde::Serialize;

use faultline_core::bridge::{LocalNativeBridge, NativeBridge};
use faultline_core::config::{Config, LogFormat};
use faultline_core::error::Remediation;
use faultline_core::interceptor::FaultSummary;
use faultline_core::logging::{LogConfig, init_logging};
use faultline_core::managed_store::ManagedFaultStore;
use faultline_core::native::NativeFaultStore;
use faultline_core::record::{DeviceContext, FaultRecord};
use faultline_core::report::{ClearConfirmation, RecordDetail, UnifiedReport, export_record};

/// faultline - fault records for VoiceJot
#[derive(Parser, Debug)]
#[command(name = "fl")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (defaults to $FAULTLINE_CONFIG, then the platform config dir)
    #[arg(long, global = true, env = "FAULTLINE_CONFIG")]
    config: Option<PathBuf>,

    /// Override the data directory holding both stores
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Log level filter (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Log format: pretty or json
    #[arg(long, global = true)]
    log_format: Option<LogFormat>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List managed and native records, most recent first
    List {
        /// Emit JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Show every record with an id
    Show {
        id: String,
    },
    /// Print the shareable text of a record
    Export {
        id: String,
    },
    /// Totals by origin and the most recent record
    Summary {
        #[arg(long)]
        json: bool,
    },
    /// Clear both stores
    Clear {
        /// Confirm the clear; nothing is removed without it
        #[arg(long)]
        yes: bool,
    },
    /// Write a record to the native error log
    LogNative {
        #[arg(long)]
        context: String,
        #[arg(long)]
        message: String,
        #[arg(long)]
        stack: Option<String>,
    },
    /// Print the effective configuration
    Config,
}

#[derive(Serialize)]
struct ListOutput<'a> {
    records: &'a [FaultRecord],
    native_unavailable: Option<&'a str>,
}

#[derive(Serialize)]
struct SummaryOutput<'a> {
    #[serde(flatten)]
    summary: &'a FaultSummary,
    native_unavailable: Option<&'a str>,
}

struct Stores {
    managed: ManagedFaultStore,
    bridge: LocalNativeBridge,
}

impl Stores {
    fn open(config: &Config) -> Self {
        tracing::debug!(data_dir = %config.data_dir().display(), "opening fault stores");
        let native = Arc::new(NativeFaultStore::from_config(config));
        Self {
            managed: ManagedFaultStore::from_config(config),
            bridge: LocalNativeBridge::new(native)
                .with_device(DeviceContext::detect(&config.device)),
        }
    }

    async fn report(&self) -> anyhow::Result<UnifiedReport> {
        Ok(UnifiedReport::open(&self.managed, &self.bridge).await?)
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => return report_failure(&e),
    };

    let mut log_config = LogConfig::from(&config.general);
    if let Some(level) = &cli.log_level {
        log_config.level.clone_from(level);
    }
    if let Some(format) = cli.log_format {
        log_config.format = format;
    }
    if let Err(e) = init_logging(&log_config) {
        eprintln!("warning: logging unavailable: {e}");
    }

    match run(cli.command, &config).await {
        Ok(code) => code,
        Err(e) => report_failure(&e),
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    if let Some(dir) = &cli.data_dir {
        config.general.data_dir = dir.display().to_string();
    }
    config.validate()?;
    Ok(config)
}

async fn run(command: Commands, config: &Config) -> anyhow::Result<ExitCode> {
    let stores = Stores::open(config);

    match command {
        Commands::List { json } => {
            let report = stores.report().await?;
            if json {
                let output = ListOutput {
                    records: report.records(),
                    native_unavailable: report.native_unavailable(),
                };
                println!("{}", serde_json::to_string_pretty(&output)?);
            } else {
                println!("{}", report.status_line());
                for row in report.rows() {
                    println!("{}  {:<9}  {}  [{}]", row.time, row.badge, row.message, row.id);
                }
            }
        }
        Commands::Show { id } => {
            let report = stores.report().await?;
            let matches = report.find(&id);
            if matches.is_empty() {
                bail!("no fault record with id {id}");
            }
            for (i, record) in matches.into_iter().enumerate() {
                if i > 0 {
                    println!();
                }
                print_detail(&RecordDetail::from(record));
            }
        }
        Commands::Export { id } => {
            let report = stores.report().await?;
            let matches = report.find(&id);
            if matches.is_empty() {
                bail!("no fault record with id {id}");
            }
            let texts: Vec<String> = matches.into_iter().map(export_record).collect();
            print!("{}", texts.join("\n---\n\n"));
        }
        Commands::Summary { json } => {
            let report = stores.report().await?;
            let summary = FaultSummary::from_records(report.records());
            if json {
                let output = SummaryOutput {
                    summary: &summary,
                    native_unavailable: report.native_unavailable(),
                };
                println!("{}", serde_json::to_string_pretty(&output)?);
            } else {
                println!("{summary}");
                if let Some(reason) = report.native_unavailable() {
                    println!("Native records unavailable: {reason}");
                }
            }
        }
        Commands::Clear { yes } => {
            if !yes {
                bail!("refusing to clear fault records without --yes");
            }
            let mut report = stores.report().await?;
            let outcome = report
                .clear_all(&stores.managed, &stores.bridge, ClearConfirmation::confirmed())
                .await;
            println!("{outcome}");
            if !outcome.is_complete() {
                return Ok(ExitCode::FAILURE);
            }
        }
        Commands::LogNative {
            context,
            message,
            stack,
        } => {
            stores
                .bridge
                .log_native_error(&context, &message, stack.as_deref())
                .await?;
            println!("Recorded native fault for {context}");
        }
        Commands::Config => {
            print!("{}", config.to_toml().context("rendering config")?);
        }
    }

    Ok(ExitCode::SUCCESS)
}

fn print_detail(detail: &RecordDetail) {
    println!("[{}] {}", detail.badge, detail.time);
    println!("{}", detail.message);
    if let Some(thread) = &detail.thread {
        println!("\nThread: {thread}");
    }
    if let Some(device) = &detail.device {
        println!("Device: {device}");
    }
    if let Some(trace) = &detail.subtree_trace {
        println!("\nSubtree trace:\n{trace}");
    }
    if let Some(stack) = &detail.stack_trace {
        println!("\nStack trace:\n{stack}");
    }
}

fn remediation_for(err: &anyhow::Error) -> Option<Remediation> {
    use faultline_core::error::{BridgeError, ConfigError, Error, StoreError};

    if let Some(e) = err.downcast_ref::<Error>() {
        return e.remediation();
    }
    if let Some(e) = err.downcast_ref::<StoreError>() {
        return Some(e.remediation());
    }
    if let Some(e) = err.downcast_ref::<BridgeError>() {
        return Some(e.remediation());
    }
    err.downcast_ref::<ConfigError>().map(ConfigError::remediation)
}

fn report_failure(err: &anyhow::Error) -> ExitCode {
    eprintln!("Error: {err:#}");
    if let Some(remediation) = remediation_for(err) {
        eprint!("\n{}", remediation.render_plain());
    }
    ExitCode::FAILURE
}
