//! # Structured Logging Module
//!
//! Environment-aware structured logging for the orchestrator. Console output,
//! optionally JSON formatted; `RUST_LOG` overrides the configured filter.
//!
//! User-visible job logs are a separate concern: they are persisted on the
//! job itself (see [`crate::models::Job::log`]).

use chrono::Utc;
use std::sync::OnceLock;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};
use uuid::Uuid;

use crate::config::LoggingConfig;
use crate::models::Job;

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize structured logging once per process.
///
/// Without a configuration the filter is derived from `CATALOG_ENV`.
pub fn init_structured_logging(config: Option<&LoggingConfig>) {
    LOGGER_INITIALIZED.get_or_init(|| {
        let environment = get_environment();
        let level = config
            .map(|c| c.level.clone())
            .unwrap_or_else(|| get_log_level(&environment).to_string());
        let json = config.is_some_and(|c| c.json);

        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&level));
        let layer = if json {
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .json()
                .with_filter(filter)
                .boxed()
        } else {
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_ansi(true)
                .with_filter(filter)
                .boxed()
        };

        // A global subscriber may already be installed (tests, embedding applications).
        if tracing_subscriber::registry().with(layer).try_init().is_err() {
            tracing::debug!("Global tracing subscriber already initialized, keeping it");
        }

        tracing::info!(
            pid = std::process::id(),
            environment = %environment,
            json,
            "🔧 STRUCTURED LOGGING: Initialized"
        );
    });
}

fn get_environment() -> String {
    std::env::var("CATALOG_ENV")
        .or_else(|_| std::env::var("APP_ENV"))
        .unwrap_or_else(|_| "development".to_string())
}

fn get_log_level(environment: &str) -> &'static str {
    match environment {
        "production" => "info",
        _ => "debug",
    }
}

/// Log a job state transition
pub fn log_job_transition(
    job_id: Uuid,
    job_type: &str,
    from: &str,
    to: &str,
    status: &str,
    waiting: bool,
) {
    tracing::info!(
        job_id = %job_id,
        job_type = %job_type,
        from_state = %from,
        to_state = %to,
        status = %status,
        waiting,
        timestamp = %Utc::now().to_rfc3339(),
        "🔄 JOB_TRANSITION"
    );
}

/// Log a job entering the catalog.
pub fn log_job_created(job: &Job) {
    tracing::info!(
        job_id = %job.id(),
        job_type = %job.job_type(),
        execution_level = %job.execution_level(),
        name = %job.name(),
        state = %job.state(),
        timestamp = %Utc::now().to_rfc3339(),
        "🆕 JOB_CREATED"
    );
}

/// Log an executor outcome once it is applied, with the counters it left behind.
pub fn log_task_outcome(job: &Job, task_id: Uuid, status: &str, error: Option<&str>) {
    if let Some(error) = error {
        tracing::warn!(
            job_id = %job.id(),
            task_id = %task_id,
            status = %status,
            error = %error,
            active_tasks = job.active_tasks(),
            failed_tasks = job.failed_tasks(),
            "📋 TASK_OUTCOME"
        );
    } else {
        tracing::info!(
            job_id = %job.id(),
            task_id = %task_id,
            status = %status,
            active_tasks = job.active_tasks(),
            failed_tasks = job.failed_tasks(),
            "📋 TASK_OUTCOME"
        );
    }
}
