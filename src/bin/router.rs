//! Router operations CLI entry point. Thin: all behavior lives in
//! `llm_inference_router::cli` so it's testable without a process
//! boundary.

use anyhow::Result;
use clap::Parser;
use colored::Colorize;
use llm_inference_router::cli::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        tracing_subscriber::EnvFilter::new("debug")
    } else {
        tracing_subscriber::EnvFilter::from_default_env()
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    println!("{}", "🚀 LLM Inference Router".bold().cyan());
    println!();

    cli.run().await
}
