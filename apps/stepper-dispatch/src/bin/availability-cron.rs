//! One-shot trigger for availability maintenance, meant to be run by an
//! external scheduler. Exits non-zero when the run fails or reports errors.

use anyhow::Context;
use clap::Parser;
use stepper_dispatch::telemetry::init_tracing;
use stepper_sdk::StepperClient;
use tracing::{error, info};

#[derive(Debug, Parser)]
#[command(name = "availability-cron", about = "Run StepperGO availability maintenance once")]
struct Args {
    /// Base URL of the dispatch service.
    #[arg(long, env = "STEPPER_DISPATCH_URL", default_value = "http://127.0.0.1:8080")]
    url: String,
    #[arg(long, env = "CRON_SECRET", hide_env_values = true)]
    secret: Option<String>,
    /// Succeed even if some records failed to reconcile.
    #[arg(long)]
    allow_partial: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(&std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()));

    let client = match args.secret.as_deref().filter(|s| !s.trim().is_empty()) {
        Some(secret) => StepperClient::new(&args.url).with_token(secret),
        None => StepperClient::new(&args.url),
    };
    let summary = client
        .run_availability_maintenance()
        .await
        .with_context(|| format!("availability maintenance call to {}", args.url))?;

    println!("{}", serde_json::to_string_pretty(&summary)?);
    info!(
        schedules_expired = summary.schedules_expired,
        schedules_applied = summary.schedules_applied,
        drivers_reclaimed = summary.drivers_reclaimed,
        offers_expired = summary.offers_expired,
        errors = summary.errors.len(),
        "availability maintenance finished"
    );
    if !summary.errors.is_empty() && !args.allow_partial {
        for err in &summary.errors {
            error!(step = %err.step, record = %err.record_id, message = %err.message, "maintenance error");
        }
        anyhow::bail!("{} record(s) failed to reconcile", summary.errors.len());
    }
    Ok(())
}
