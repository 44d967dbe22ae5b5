//! Structured observability hooks for build lifecycle events.
//!
//! This module provides:
//! - Build-scoped tracing spans via the `BuildSpan` RAII guard
//! - Emission functions for lifecycle events (build, job, cron, delivery)
//!
//! Events are emitted at `info!` level with an `event` field naming the
//! lifecycle step, so JSON log pipelines can filter on it.

use kiln_state::model::Status;
use tracing::{info, warn};

/// RAII guard that enters a build-scoped tracing span.
///
/// ```ignore
/// let _span = BuildSpan::enter(42);
/// // every tracing call below carries build_id = 42
/// ```
pub struct BuildSpan {
    _span: tracing::span::EnteredSpan,
}

impl BuildSpan {
    pub fn enter(build_id: i64) -> Self {
        let span = tracing::info_span!("kiln.build", build_id = build_id);
        Self {
            _span: span.entered(),
        }
    }
}

pub fn emit_build_submitted(build_id: i64, user_id: i64, driver: &str) {
    info!(
        event = "build.submitted",
        build_id = build_id,
        user_id = user_id,
        driver = %driver,
    );
}

pub fn emit_build_started(build_id: i64, stages: usize) {
    info!(event = "build.started", build_id = build_id, stages = stages);
}

/// Emit event: build reached a terminal status.
pub fn emit_build_finished(build_id: i64, status: Status, duration_ms: u64) {
    info!(
        event = "build.finished",
        build_id = build_id,
        status = %status,
        duration_ms = duration_ms,
    );
}

pub fn emit_job_finished(build_id: i64, job: &str, status: Status) {
    info!(event = "job.finished", build_id = build_id, job = %job, status = %status);
}

/// Emit event: a cron materialised a build.
pub fn emit_cron_invoked(cron_id: i64, build_id: i64, next_run: &str) {
    info!(
        event = "cron.invoked",
        cron_id = cron_id,
        build_id = build_id,
        next_run = %next_run,
    );
}

/// Emit event: one webhook delivery attempt was recorded.
pub fn emit_delivery_recorded(
    webhook_id: i64,
    event_type: &str,
    code: Option<u16>,
    duration_ms: u64,
    redelivery: bool,
) {
    info!(
        event = "hook.delivered",
        webhook_id = webhook_id,
        event_type = %event_type,
        code = code.unwrap_or(0),
        duration_ms = duration_ms,
        redelivery = redelivery,
    );
}

/// Emit event: a webhook delivery failed at the transport layer (warning level).
pub fn emit_delivery_failed(webhook_id: i64, error: &dyn std::fmt::Display) {
    warn!(event = "hook.delivery_failed", webhook_id = webhook_id, error = %error);
}

pub fn emit_curated(user_id: i64, reclaimed: usize, bytes: u64) {
    info!(
        event = "curator.reclaimed",
        user_id = user_id,
        reclaimed = reclaimed,
        bytes = bytes,
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_span_enters() {
        let _span = BuildSpan::enter(1);
        emit_build_started(1, 2);
    }
}
