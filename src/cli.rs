use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use anyhow::Result;
use crate::config::Config;
use crate::contract::{FleetApi, JobCommand};
use crate::fleet::{JobHistory, PrintManager, PrinterView};
use crate::load_config::load_config;
use crate::spark_client::SparkFleetClient;
use crate::status::{Message, StatusHub};

/// CLI for spark-print: watch and command a fleet of Spark printers.
#[derive(Parser)]
#[clap(
    name = "spark-print",
    version,
    about = "Watch and control a fleet of Spark 3D printers"
)]
pub struct Cli {
    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Keep the fleet in sync and print every change until interrupted
    Watch {
        /// Path to the YAML config file
        #[clap(long)]
        config: PathBuf,
    },
    /// Fetch the fleet once and print one line per printer
    Printers {
        #[clap(long)]
        config: PathBuf,
    },
    /// Pause the active job of a printer
    Pause {
        #[clap(long)]
        config: PathBuf,
        #[clap(long)]
        printer: String,
    },
    /// Resume the paused job of a printer
    Resume {
        #[clap(long)]
        config: PathBuf,
        #[clap(long)]
        printer: String,
    },
    /// Cancel the active job of a printer
    Cancel {
        #[clap(long)]
        config: PathBuf,
        #[clap(long)]
        printer: String,
    },
}

fn manager(config: &Config, status: &StatusHub) -> (Arc<dyn FleetApi>, PrintManager) {
    let api: Arc<dyn FleetApi> = Arc::new(SparkFleetClient::new(&config.api));
    let manager = PrintManager::new(api.clone(), config.fleet.clone(), status.clone());
    (api, manager)
}

/// One human-readable line for a printer.
pub fn format_printer(view: &PrinterView) -> String {
    let status = view.status.printer_status.as_deref().unwrap_or("unknown");
    let kind = view
        .printer_type
        .as_ref()
        .map(|t| t.name.as_str())
        .unwrap_or(view.printer.type_id.as_str());
    let mut line = format!(
        "{:<24} {:<12} {:<12} {}",
        view.printer.printer_name, kind, status, view.printer.printer_id
    );
    if let Some(seconds) = view.status.data.seconds_left {
        line.push_str(&format!("  {}s left", seconds));
    }
    if let Some(job) = &view.job {
        line.push_str(&format!("  job {}", job.job_name.as_deref().unwrap_or(&job.job_id)));
    }
    line
}

async fn job_command(config: PathBuf, printer: String, command: JobCommand) -> Result<()> {
    let config = load_config(config)?;
    let status = StatusHub::default();
    let (_, manager) = manager(&config, &status);
    manager.refresh().await;
    match manager.send_job_command(&printer, command).await {
        Ok(new_status) => {
            println!(
                "{} sent to {}; printer is now {}",
                command.as_str(),
                printer,
                new_status.printer_status().unwrap_or("unknown")
            );
            Ok(())
        }
        Err(e) => {
            eprintln!("[ERROR] {} failed: {}", command.as_str(), e);
            Err(anyhow::Error::new(e))
        }
    }
}

/// Extracted async CLI logic entrypoint for integration tests and main()
pub async fn run(cli: Cli) -> Result<()> {
    tracing::info!("trace_initialised");

    match cli.command {
        Commands::Watch { config } => {
            let config = load_config(config)?;
            let status = StatusHub::default();
            let (api, manager) = manager(&config, &status);
            let history = JobHistory::new(api, status.clone());

            let mut fleet = manager.subscribe();
            let mut messages = status.subscribe_messages();
            manager.start();
            history.set_refresh_interval(config.history.refresh_interval());
            println!("Watching fleet, Ctrl-C to stop...");

            loop {
                tokio::select! {
                    changed = fleet.recv() => {
                        if changed.is_err() {
                            continue;
                        }
                        for view in manager.printer_data() {
                            println!("{}", format_printer(&view));
                        }
                        println!();
                    }
                    message = messages.recv() => {
                        if let Ok(Message::Error(text)) = message {
                            eprintln!("[ERROR] {text}");
                        }
                    }
                    _ = tokio::signal::ctrl_c() => break,
                }
            }

            manager.stop();
            history.set_refresh_interval(None);
            Ok(())
        }
        Commands::Printers { config } => {
            let config = load_config(config)?;
            let status = StatusHub::default();
            let (_, manager) = manager(&config, &status);
            manager.refresh().await;
            for view in manager.printer_data() {
                println!("{}", format_printer(&view));
            }
            Ok(())
        }
        Commands::Pause { config, printer } => {
            job_command(config, printer, JobCommand::Pause).await
        }
        Commands::Resume { config, printer } => {
            job_command(config, printer, JobCommand::Resume).await
        }
        Commands::Cancel { config, printer } => {
            job_command(config, printer, JobCommand::Cancel).await
        }
    }
}
