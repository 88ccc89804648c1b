use std::path::Path;

use anyhow::Result;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};

#[cfg(feature = "mails")]
use crate::notifications::mail::Mailer;
use crate::utils::runner::{CommandRunner, Invocation};
use crate::{Env, RunRecord};

#[cfg(feature = "mails")]
/// Mail notifications
pub mod mail;


#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
/// Represents all possible notifiers
pub enum Notifier {
    /// Writes the outcome to the log
    Log(LogNotifier),
    /// Runs a shell command with the outcome in its environment
    Command(CommandNotifier),
    #[cfg(feature = "mails")]
    /// Sending mails with SMTP
    Mailer(Mailer),
}

impl Notifier {
    /// Sends the communication, whatever the variant of Notifier it is
    pub fn send(&self, record: &RunRecord, runner: &dyn CommandRunner) -> Result<()> {
        match self {
            Notifier::Log(n) => n.send(record),
            Notifier::Command(n) => n.run(record, runner),
            #[cfg(feature = "mails")]
            Notifier::Mailer(m) => m.send(record),
        }
    }
}

/// Defines a [Notifier], who can communicate run results to the outside world
pub trait Notify {
    /// validates the intention to communicate the result to the outside world
    fn send(&self, record: &RunRecord) -> Result<()>;
}

/// Fires every notifier once. Their failures are logged, never propagated.
pub fn notify_all(notifiers: &[Notifier], record: &RunRecord, runner: &dyn CommandRunner) {
    for n in notifiers {
        if let Err(e) = n.send(record, runner) {
            warn!("notification failed: {:#}", e);
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct LogNotifier {
    pub success: String,
    pub failure: String,
}

impl Default for LogNotifier {
    fn default() -> Self {
        LogNotifier {
            success: "Pipeline completed successfully!".to_string(),
            failure: "Pipeline failed. Check the logs above for details.".to_string(),
        }
    }
}

impl Notify for LogNotifier {
    fn send(&self, record: &RunRecord) -> Result<()> {
        if record.succeeded() {
            info!("{}", self.success);
        } else {
            error!("{}", self.failure);
        }
        Ok(())
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct CommandNotifier {
    /// run with `sh -c`
    pub exec: String,
}

/// `BAKE_CI_*` variables describing how `record` ended
pub(crate) fn status_env(record: &RunRecord) -> Env {
    let mut env = Env::new();
    env.insert("BAKE_CI_STATUS".to_string(), record.status.as_str().to_string());
    env.insert("BAKE_CI_RUN".to_string(), record.number.to_string());
    if let Some(stage) = &record.failed_stage {
        env.insert("BAKE_CI_FAILED_STAGE".to_string(), stage.clone());
    }
    if let Some(tag) = &record.image_tag {
        env.insert("BAKE_CI_IMAGE_TAG".to_string(), tag.clone());
    }
    env
}

impl CommandNotifier {
    fn run(&self, record: &RunRecord, runner: &dyn CommandRunner) -> Result<()> {
        debug!("notifying with `{}`", self.exec);
        let inv = Invocation::shell(&self.exec, &status_env(record), Path::new("."));
        runner.run(&inv)?.check(&inv)?;
        Ok(())
    }
}
