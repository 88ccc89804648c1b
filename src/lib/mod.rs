use std::collections::HashMap;
use std::fs;
use std::sync::atomic::AtomicBool;

use anyhow::Result;
use chrono::{DateTime, Utc};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use tempdir::TempDir;

use crate::conf::{FailureKind, PipelineConfig};
use crate::history::History;
use crate::lock::RunLock;
use crate::notifications::notify_all;
use crate::secrets::SecretProvider;
use crate::sequencer::run_sequence;
use crate::stages::{InjectCredentials, RunContext, Stage};
use crate::utils::git::Commit;
use crate::utils::redact::Redactor;
use crate::utils::runner::CommandRunner;

pub mod conf;
pub mod error;
pub mod history;
pub mod lock;
pub mod manifest;
pub mod notifications;
pub mod secrets;
pub mod sequencer;
pub mod stages;
pub mod utils;
pub mod watch;

/// Environment variables, as seen by every command of a run
pub type Env = HashMap<String, String>;


#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Succeeded,
    Failed,
}

impl Default for RunStatus {
    fn default() -> Self {
        RunStatus::Failed
    }
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
        }
    }
}

/// Normal stages run in order; the cleanup stage runs once at the end, whatever happened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageClass {
    Normal,
    Cleanup,
}

impl Default for StageClass {
    fn default() -> Self {
        StageClass::Normal
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageOutcome {
    Succeeded,
    Failed,
    /// never started because an earlier stage failed
    Skipped,
}

impl Default for StageOutcome {
    fn default() -> Self {
        StageOutcome::Skipped
    }
}

#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageResult {
    pub name: String,
    pub class: StageClass,
    pub outcome: StageOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub logs: Vec<String>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
}

impl StageResult {
    pub fn skipped(name: &str, class: StageClass) -> Self {
        StageResult {
            name: name.to_string(),
            class,
            outcome: StageOutcome::Skipped,
            ..Default::default()
        }
    }
}

/// What is kept of a run once it is over
#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub number: u64,
    pub branch: Option<String>,
    pub commit: Option<Commit>,
    pub image_tag: Option<String>,
    pub status: RunStatus,
    pub failed_stage: Option<String>,
    pub failure: Option<FailureKind>,
    pub stages: Vec<StageResult>,
    pub cleanup: Option<StageResult>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
}

impl RunRecord {
    pub fn succeeded(&self) -> bool {
        self.status == RunStatus::Succeeded
    }
}

/// Runs `config` once: credentials, stages, cleanup, then history and notifications.
///
/// Errors only when the run could not start at all (another run holds the lock, no workspace);
/// a failing stage is reported in the returned [RunRecord].
pub fn launch(
    config: &PipelineConfig,
    runner: &dyn CommandRunner,
    secrets: &dyn SecretProvider,
) -> Result<RunRecord> {
    launch_interruptible(config, runner, secrets, &AtomicBool::new(false))
}

/// Like [launch], but stops before the next stage once `interrupted` is set.
///
/// An interrupted run is failed; cleanup, history and notifications happen as for any failure.
pub fn launch_interruptible(
    config: &PipelineConfig,
    runner: &dyn CommandRunner,
    secrets: &dyn SecretProvider,
    interrupted: &AtomicBool,
) -> Result<RunRecord> {
    config.validate()?;
    let state_dir = &config.options.state_dir;
    let _lock = if config.options.disallow_concurrent {
        Some(RunLock::acquire(&state_dir.join("run.lock"))?)
    } else {
        None
    };
    let history = History::new(state_dir);
    let number = history.next_number()?;

    // the temporary workspace lives until the end of the run
    let (workdir, _tmp) = match &config.options.workspace {
        Some(ws) => {
            fs::create_dir_all(ws)?;
            (ws.clone(), None)
        }
        None => {
            let t = TempDir::new("bake_ci_execution")?;
            (t.path().to_path_buf(), Some(t))
        }
    };
    info!("Starting run #{} in {}", number, workdir.display());

    let mut env = config.env.clone();
    env.insert("BAKE_CI_RUN".to_string(), number.to_string());
    let mut ctx = RunContext::new(runner, secrets, Redactor::default(), env, &workdir);

    let credentials = InjectCredentials(&config.credentials);
    let mut stages: Vec<&dyn Stage> = Vec::with_capacity(config.stages.len() + 1);
    if !config.credentials.is_empty() {
        stages.push(&credentials);
    }
    stages.extend(config.stages.iter().map(|s| s as &dyn Stage));

    let start_date = Utc::now();
    let outcome = run_sequence(&stages, &config.cleanup, &mut ctx, interrupted);
    let failed = outcome.failed_stage();
    let record = RunRecord {
        number,
        branch: ctx.branch.clone(),
        commit: ctx.commit.clone(),
        image_tag: ctx.env.get("IMAGE_TAG").cloned(),
        status: outcome.status,
        failed_stage: failed.map(|s| s.name.clone()),
        failure: failed.and_then(|s| s.failure),
        start_date: Some(start_date),
        end_date: Some(Utc::now()),
        stages: outcome.stages,
        cleanup: Some(outcome.cleanup),
    };
    match record.status {
        RunStatus::Succeeded => info!("Run #{} succeeded", number),
        RunStatus::Failed => error!(
            "Run #{} failed at stage \"{}\"",
            number,
            record.failed_stage.as_deref().unwrap_or("?")
        ),
    }

    if let Err(e) = history.save(&record) {
        warn!("could not save run #{}: {}", number, e);
    }
    match history.prune(config.options.keep_runs) {
        Ok(pruned) if !pruned.is_empty() => info!("discarded old runs {:?}", pruned),
        Ok(_) => {}
        Err(e) => warn!("could not discard old runs: {}", e),
    }
    notify_all(&config.notifiers, &record, runner);
    Ok(record)
}
