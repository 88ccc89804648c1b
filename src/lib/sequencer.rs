//! Runs stages in order, stops at the first failure, and always runs the cleanup stage once.
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::anyhow;
use chrono::Utc;
use log::{error, info, warn};

use crate::stages::{RunContext, Stage};
use crate::{RunStatus, StageOutcome, StageResult};


/// What [run_sequence] reports
#[derive(Debug)]
pub struct SequenceOutcome {
    /// One entry per stage, in order; stages after a failure are `skipped`
    pub stages: Vec<StageResult>,
    pub cleanup: StageResult,
    pub status: RunStatus,
}

impl SequenceOutcome {
    pub fn failed_stage(&self) -> Option<&StageResult> {
        self.stages
            .iter()
            .find(|s| s.outcome == StageOutcome::Failed)
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        *s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown cause"
    }
}

fn execute(stage: &dyn Stage, ctx: &mut RunContext) -> StageResult {
    info!("Running stage \"{}\"", stage.name());
    let start = Utc::now();
    let result = match catch_unwind(AssertUnwindSafe(|| stage.execute(ctx))) {
        Ok(r) => r,
        Err(payload) => Err(anyhow!("stage panicked: {}", panic_message(&*payload))),
    };
    let mut logs = ctx.runner.take_logs();
    let (outcome, failure, err) = match result {
        Ok(()) => (StageOutcome::Succeeded, None, None),
        Err(e) => {
            let msg = ctx.runner.redact(&format!("{:#}", e));
            logs.push(format!("Stage \"{}\" failed: {}", stage.name(), msg));
            (StageOutcome::Failed, Some(stage.failure_kind()), Some(msg))
        }
    };
    StageResult {
        name: stage.name().to_string(),
        class: stage.class(),
        outcome,
        failure,
        error: err,
        logs,
        start_date: Some(start),
        end_date: Some(Utc::now()),
    }
}

/// Runs the cleanup stage when dropped, unless [release](CleanupGuard::release) already did
struct CleanupGuard<'g, 'r> {
    ctx: &'g mut RunContext<'r>,
    cleanup: &'g dyn Stage,
    armed: bool,
}

impl<'g, 'r> CleanupGuard<'g, 'r> {
    fn new(ctx: &'g mut RunContext<'r>, cleanup: &'g dyn Stage) -> Self {
        CleanupGuard {
            ctx,
            cleanup,
            armed: true,
        }
    }

    fn context(&mut self) -> &mut RunContext<'r> {
        &mut *self.ctx
    }

    fn release(&mut self) -> StageResult {
        self.armed = false;
        let r = execute(self.cleanup, &mut *self.ctx);
        if r.outcome == StageOutcome::Failed {
            warn!("cleanup did not complete: {}", r.error.as_deref().unwrap_or("unknown error"));
        }
        r
    }
}

impl Drop for CleanupGuard<'_, '_> {
    fn drop(&mut self) {
        if self.armed {
            warn!("stage sequence aborted, cleaning up");
            let _ = self.release();
        }
    }
}

/// Executes `stages` in order against `ctx`, then `cleanup`.
///
/// A failing stage stops the sequence; the remaining ones are recorded as skipped. Once
/// `interrupted` is set, the next stage is recorded as failed without being started. The cleanup
/// stage runs exactly once whatever happens, and its own failure never fails the run.
pub fn run_sequence(
    stages: &[&dyn Stage],
    cleanup: &dyn Stage,
    ctx: &mut RunContext,
    interrupted: &AtomicBool,
) -> SequenceOutcome {
    let mut guard = CleanupGuard::new(ctx, cleanup);
    let mut results = Vec::with_capacity(stages.len());
    let mut status = RunStatus::Succeeded;
    for stage in stages {
        if status == RunStatus::Failed {
            results.push(StageResult::skipped(stage.name(), stage.class()));
            continue;
        }
        let r = if interrupted.load(Ordering::Relaxed) {
            warn!("run interrupted before stage \"{}\"", stage.name());
            StageResult {
                outcome: StageOutcome::Failed,
                failure: Some(stage.failure_kind()),
                error: Some("run interrupted".to_string()),
                ..StageResult::skipped(stage.name(), stage.class())
            }
        } else {
            execute(*stage, guard.context())
        };
        if r.outcome == StageOutcome::Failed {
            error!(
                "Stage \"{}\" returned execution failure! aborting next stages",
                r.name
            );
            status = RunStatus::Failed;
        }
        results.push(r);
    }
    let cleanup = guard.release();
    SequenceOutcome {
        stages: results,
        cleanup,
        status,
    }
}
