//! Ambient operations CLI (`spec.md` §6 "Ambient CLI"): `serve`,
//! `register`, `unregister`, `list`, `health`, `bench` — scoped to what
//! a router operator needs, in the same `clap::Parser` + `colored` +
//! subcommand idiom as the teacher's `src/bin/llm-ops.rs`.

pub mod bench;

use std::path::PathBuf;

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;

use crate::config::Config;
use crate::model::descriptor::{Capability, ModelFormat};
use crate::registry::EntryStatus;
use crate::service::RouterService;

#[derive(Parser)]
#[command(name = "router")]
#[command(about = "Universal language-model inference router — operations CLI", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Verbose logging (debug level, overrides LOG_LEVEL)
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the service: load the registry journal and run until
    /// interrupted (Ctrl-C).
    Serve,

    /// Register a model descriptor from a JSON file.
    Register {
        /// Path to a descriptor JSON file matching `spec.md` §3's shape.
        path: PathBuf,

        /// Load the model eagerly instead of waiting for first request.
        #[arg(short, long)]
        eager: bool,
    },

    /// Unregister (and tear down) a model by id.
    Unregister {
        /// Model id to remove.
        id: String,
    },

    /// List every registered model and its status.
    List {
        /// Filter by format tag (e.g. "mock", "gguf", "api").
        #[arg(short, long)]
        format: Option<String>,

        /// Filter by capability tag (e.g. "chat", "streaming").
        #[arg(short, long)]
        capability: Option<String>,
    },

    /// Print the aggregate health report.
    Health,

    /// Run generation benchmarks against a registered model.
    Bench {
        /// Model id to benchmark.
        #[arg(short, long)]
        model: String,

        /// Number of requests to send.
        #[arg(short, long, default_value = "10")]
        iterations: usize,

        /// Emit machine-readable JSON instead of a formatted table.
        #[arg(short, long)]
        json: bool,
    },
}

impl Cli {
    pub async fn run(self) -> Result<()> {
        let config = Config::from_env().map_err(anyhow::Error::from)?;
        let service = RouterService::from_config(&config)
            .await
            .context("failed to build router service from configuration")?;

        match self.command {
            Commands::Serve => serve(&service).await,
            Commands::Register { path, eager } => register(&service, &path, eager).await,
            Commands::Unregister { id } => unregister(&service, &id).await,
            Commands::List { format, capability } => list(&service, format, capability).await,
            Commands::Health => health(&service).await,
            Commands::Bench { model, iterations, json } => {
                bench::run(&service, &model, iterations, json).await
            }
        }
    }
}

async fn serve(service: &RouterService) -> Result<()> {
    println!("{}", "router serve".bold().cyan());
    let models = service.list_models().await;
    println!("{} models loaded from registry journal", models.len().to_string().green());
    println!("{}", "listening for requests (Ctrl-C to stop)".dimmed());
    tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
    println!("{}", "shutting down".yellow());
    Ok(())
}

async fn register(service: &RouterService, path: &PathBuf, eager: bool) -> Result<()> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading descriptor file {}", path.display()))?;
    let descriptor = serde_json::from_str(&raw).context("parsing descriptor JSON")?;

    let entry = service
        .load(descriptor)
        .await
        .map_err(anyhow::Error::from)
        .context("registering model")?;
    println!("{} {}", "registered".green().bold(), entry.descriptor.id);

    if eager {
        service
            .load_now(&entry.descriptor.id)
            .await
            .map_err(anyhow::Error::from)
            .context("eagerly loading model")?;
        println!("{} {}", "loaded".green().bold(), entry.descriptor.id);
    }
    Ok(())
}

async fn unregister(service: &RouterService, id: &str) -> Result<()> {
    service
        .unload(id)
        .await
        .map_err(anyhow::Error::from)
        .with_context(|| format!("unregistering {id}"))?;
    println!("{} {}", "unregistered".yellow().bold(), id);
    Ok(())
}

async fn list(service: &RouterService, format: Option<String>, capability: Option<String>) -> Result<()> {
    let mut entries = service.list_models().await;

    if let Some(raw) = &format {
        let wanted: ModelFormat = serde_json::from_value(serde_json::Value::String(raw.clone()))
            .with_context(|| format!("unrecognized format {raw:?}"))?;
        entries.retain(|e| e.descriptor.format == wanted);
    }
    if let Some(raw) = &capability {
        let wanted: Capability = serde_json::from_value(serde_json::Value::String(raw.clone()))
            .with_context(|| format!("unrecognized capability {raw:?}"))?;
        entries.retain(|e| e.descriptor.capabilities.contains(wanted));
    }

    if entries.is_empty() {
        println!("{}", "no models match".dimmed());
        return Ok(());
    }

    for e in entries {
        let status_colored = match e.status {
            EntryStatus::Loaded => "loaded".green(),
            EntryStatus::Registered => "registered".blue(),
            EntryStatus::Available => "available".cyan(),
            EntryStatus::Unloading => "unloading".yellow(),
            EntryStatus::Error => "error".red(),
        };
        println!(
            "{:<20} {:<10} {:<8} inferences={} avg_latency_ms={:.1}",
            e.descriptor.id.bold(),
            format!("{:?}", e.descriptor.format).to_lowercase(),
            status_colored,
            e.metrics.inference_count,
            e.metrics.avg_latency_ms,
        );
    }
    Ok(())
}

async fn health(service: &RouterService) -> Result<()> {
    let report = service.health().await;
    let status = if report.status == "healthy" {
        report.status.green().bold()
    } else {
        report.status.red().bold()
    };
    println!("{} {}", "status:".bold(), status);
    for c in report.components {
        let marker = if c.healthy { "OK".green() } else { "FAIL".red() };
        println!("  [{}] {} — {}", marker, c.name, c.detail);
    }
    Ok(())
}
