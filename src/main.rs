use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

use task_delegator::bus::LoggingSink;
use task_delegator::workers::WorkerCapability;
use task_delegator::{Coordinator, DelegationContext, DelegatorConfig, SubmitOptions};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Optional daily log file next to stderr output
    let (file_layer, _log_guard) = match std::env::var("DELEGATOR_LOG_DIR") {
        Ok(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "delegator.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_writer(writer).with_ansi(false)),
                Some(guard),
            )
        }
        Err(_) => (None, None),
    };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(file_layer)
        .init();

    let text = std::env::args().skip(1).collect::<Vec<_>>().join(" ");
    if text.trim().is_empty() {
        eprintln!("Usage: task-delegator <task description>");
        std::process::exit(2);
    }

    let config = DelegatorConfig::from_env().context("invalid DELEGATOR_* configuration")?;
    let db_path = PathBuf::from(
        std::env::var("DELEGATOR_DB_PATH").unwrap_or_else(|_| "./data/delegator.db".to_string()),
    );

    eprintln!("Task Delegator v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Database: {}", db_path.display());
    eprintln!("   Max concurrent tasks: {}", config.max_concurrent_tasks);

    let ctx = DelegationContext::open(config, Some(&db_path), Arc::new(LoggingSink))
        .await
        .with_context(|| format!("failed to open database at {}", db_path.display()))?;

    if let Ok(path) = std::env::var("DELEGATOR_WORKERS_FILE") {
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read workers file {path}"))?;
        let workers: Vec<WorkerCapability> =
            serde_json::from_str(&raw).with_context(|| format!("invalid workers file {path}"))?;
        eprintln!("   Workers: {} loaded from {}", workers.len(), path);
        for worker in workers {
            ctx.registry.report(worker).await;
        }
    } else {
        eprintln!("   Workers: none registered, default candidates apply");
    }

    let coordinator = Coordinator::new(ctx);
    coordinator.start().await;

    let title: String = text.chars().take(60).collect();
    let outcome = coordinator
        .submit(&title, &text, SubmitOptions::default())
        .await;
    coordinator.shutdown().await;

    match outcome {
        Ok(submission) => {
            println!("{}", serde_json::to_string_pretty(&submission)?);
            Ok(())
        }
        Err(e) => {
            eprintln!("{}", serde_json::to_string_pretty(&e.report())?);
            std::process::exit(1);
        }
    }
}
