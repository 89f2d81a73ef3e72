use std::sync::Arc;

use anyhow::Context;
use report_flow::config::WorkflowConfig;
use report_flow::stages::{
    self, CLEANUP, CommandHandler, EXTERNAL_CAPABILITIES, HandlerRegistry, RetryingHandler,
    StageHandler, StandardStages,
};
use report_flow::workflow::{StageResult, TracingObserver, stage_fn};

/// Prefix of the per-capability command variables, e.g.
/// `REPORT_FLOW_HANDLER_FETCH_EMAIL="python3 fetch_email.py"`.
const HANDLER_ENV_PREFIX: &str = "REPORT_FLOW_HANDLER_";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config = WorkflowConfig::from_env().context("invalid workflow configuration")?;

    eprintln!("📨 Report Flow v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Max iterations: {}", config.max_iterations);
    eprintln!("   Handler timeout: {:?}", config.handler_timeout);
    eprintln!("   Retry attempts: {}", config.retry.max_attempts);

    // ── Collaborators ───────────────────────────────────────────────────
    let registry = Arc::new(HandlerRegistry::new());
    for capability in EXTERNAL_CAPABILITIES.iter().chain(std::iter::once(&CLEANUP)) {
        let key = format!("{HANDLER_ENV_PREFIX}{}", capability.to_uppercase());
        let Ok(line) = std::env::var(&key) else {
            continue;
        };
        let Some(command) = CommandHandler::from_command_line(*capability, &line) else {
            anyhow::bail!("{key} is set but empty");
        };
        let command: Arc<dyn StageHandler> =
            Arc::new(command.with_timeout(config.handler_timeout));
        registry
            .register(Arc::new(RetryingHandler::new(command, config.retry.clone())))
            .await;
        eprintln!("   Handler: {} -> {}", capability, line);
    }

    let mut missing = Vec::new();
    for capability in EXTERNAL_CAPABILITIES {
        if !registry.has(capability).await {
            missing.push(capability);
        }
    }
    if !missing.is_empty() {
        tracing::warn!(
            "No handler configured for: {} (those stages will fail)",
            missing.join(", ")
        );
    }

    let mut standard = StandardStages::from_registry(Arc::clone(&registry), &config);
    if !registry.has(CLEANUP).await {
        standard.cleanup = stage_fn(|_| Ok(StageResult::success().with("skipped", true)));
    }

    // ── Run ─────────────────────────────────────────────────────────────
    let outcome = stages::run_standard(standard, config, Arc::new(TracingObserver))
        .await
        .context("workflow run aborted")?;

    println!("{}", serde_json::to_string_pretty(&outcome)?);

    if !outcome.final_status.is_success() {
        std::process::exit(1);
    }
    Ok(())
}
