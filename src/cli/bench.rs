//! `router bench` — retargets the teacher's `cli/benchmark.rs` harness
//! shape (colored table output, `--json`, `--iterations`) at
//! `generate`/`stream` instead of infra benchmarks.

use std::time::Instant;

use anyhow::{Context, Result};
use colored::Colorize;
use serde::Serialize;

use crate::request::Request;
use crate::service::RouterService;

#[derive(Serialize)]
struct BenchResult {
    model_id: String,
    iterations: usize,
    total_ms: u128,
    avg_latency_ms: f64,
    errors: usize,
}

pub async fn run(service: &RouterService, model_id: &str, iterations: usize, json: bool) -> Result<()> {
    if !json {
        println!();
        println!("{}", "=================================================".cyan().bold());
        println!("{}", format!("   router bench — {model_id}").cyan().bold());
        println!("{}", "=================================================".cyan().bold());
        println!();
    }

    let start = Instant::now();
    let mut latencies = Vec::with_capacity(iterations);
    let mut errors = 0usize;

    for i in 0..iterations {
        let mut request = Request::new(format!("benchmark prompt #{i}"));
        request.model_id = Some(model_id.to_string());
        request.strategy_override = Some(crate::router::Strategy::Explicit);

        let call_start = Instant::now();
        match service.generate(request).await {
            Ok(result) => latencies.push(result.latency_ms),
            Err(e) => {
                errors += 1;
                if !json {
                    println!("  {} iteration {i}: {e}", "error".red());
                }
            }
        }
        let _ = call_start.elapsed();
    }

    let total_ms = start.elapsed().as_millis();
    let avg_latency_ms = if latencies.is_empty() {
        0.0
    } else {
        latencies.iter().sum::<u64>() as f64 / latencies.len() as f64
    };

    let result = BenchResult {
        model_id: model_id.to_string(),
        iterations,
        total_ms,
        avg_latency_ms,
        errors,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&result).context("serializing bench result")?);
    } else {
        println!();
        println!("{}", "results".bold());
        println!("  iterations:       {}", result.iterations);
        println!("  total:            {} ms", result.total_ms);
        println!("  avg latency:      {:.2} ms", result.avg_latency_ms);
        let errors_str = result.errors.to_string();
        println!("  errors:           {}", if result.errors == 0 { errors_str.green() } else { errors_str.red() });
    }

    Ok(())
}
