//! What each kind of stage does, and the context they share during a run.
use std::cell::RefCell;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use log::{debug, info, warn};

use crate::conf::{CleanupConfig, FailureKind, StageBody, StageConfig};
use crate::secrets::{inject, SecretProvider};
use crate::utils::docker::{docker_remove_container, docker_stop};
use crate::utils::git::Commit;
use crate::utils::interpolate;
use crate::utils::redact::Redactor;
use crate::utils::runner::{CommandOutput, CommandRunner, Invocation};
use crate::{Env, StageClass};

pub mod build;
pub mod checkout;
pub mod database;
pub mod deploy;


/// Something a stage created that must not outlive the run
#[derive(Debug, Clone, PartialEq)]
pub enum Resource {
    /// a docker container, stopped then removed
    Container(String),
    /// a file in the workspace, deleted
    File(PathBuf),
}

/// [CommandRunner] decorator logging every command and its output, secrets masked
pub struct LoggedRunner<'r> {
    inner: &'r dyn CommandRunner,
    redactor: Redactor,
    logs: RefCell<Vec<String>>,
}

impl<'r> LoggedRunner<'r> {
    pub fn new(inner: &'r dyn CommandRunner, redactor: Redactor) -> Self {
        LoggedRunner {
            inner,
            redactor,
            logs: RefCell::new(vec![]),
        }
    }

    pub fn redact(&self, s: &str) -> String {
        self.redactor.redact(s)
    }

    pub fn redactor_mut(&mut self) -> &mut Redactor {
        &mut self.redactor
    }

    /// Appends a line to the current stage's log
    pub fn note(&self, line: &str) {
        self.logs.borrow_mut().push(self.redact(line));
    }

    /// Logs collected since the last call
    pub fn take_logs(&self) -> Vec<String> {
        self.logs.borrow_mut().drain(..).collect()
    }
}

impl CommandRunner for LoggedRunner<'_> {
    fn run(&self, inv: &Invocation) -> Result<CommandOutput> {
        let line = self.redact(&inv.command_line());
        info!("  - {}", line);
        self.logs.borrow_mut().push(format!("$ {}", line));
        let output = self.inner.run(inv)?;
        for (stream, s) in [("stdout", &output.stdout), ("stderr", &output.stderr)] {
            for l in s.lines() {
                let l = self.redact(l);
                debug!("    {}: {}", stream, l);
                self.logs.borrow_mut().push(l);
            }
        }
        Ok(output)
    }
}

/// State shared by the stages of one run
pub struct RunContext<'r> {
    /// Visible to every stage; stages may add to it for the ones after them
    pub env: Env,
    pub workdir: PathBuf,
    pub runner: LoggedRunner<'r>,
    pub secrets: &'r dyn SecretProvider,
    /// Released by the cleanup stage, last registered first
    pub resources: Vec<Resource>,
    /// Set once the sources are checked out
    pub commit: Option<Commit>,
    pub branch: Option<String>,
}

impl<'r> RunContext<'r> {
    pub fn new(
        runner: &'r dyn CommandRunner,
        secrets: &'r dyn SecretProvider,
        redactor: Redactor,
        env: Env,
        workdir: &Path,
    ) -> Self {
        RunContext {
            env,
            workdir: workdir.to_path_buf(),
            runner: LoggedRunner::new(runner, redactor),
            secrets,
            resources: vec![],
            commit: None,
            branch: None,
        }
    }

    /// `${VAR}` expansion against the current environment
    pub fn expand(&self, s: &str) -> String {
        interpolate(s, &self.env).to_string()
    }

    pub fn set_var(&mut self, key: &str, value: &str) {
        debug!("setting {}={}", key, self.runner.redact(value));
        self.env.insert(key.to_string(), value.to_string());
    }

    pub fn register(&mut self, resource: Resource) {
        if !self.resources.contains(&resource) {
            self.resources.push(resource);
        }
    }

    /// Runs `script` with `sh -c` in the workspace, failing on a non-zero exit
    pub fn shell(&self, script: &str) -> Result<CommandOutput> {
        let inv = Invocation::shell(script, &self.env, &self.workdir);
        self.runner.run(&inv)?.check(&inv)
    }

    /// Resolves a credential id to the path of a private key
    pub(crate) fn key_path(&self, credential: &str) -> Result<String> {
        let secret = self.secrets.resolve(credential)?;
        let path = shellexpand::tilde(&secret.value).to_string();
        if !Path::new(&path).exists() {
            return Err(anyhow!("key file for credential \"{}\" not found", credential));
        }
        Ok(path)
    }

    fn release(&mut self, resource: &Resource) -> Result<()> {
        match resource {
            Resource::Container(name) => {
                // the container may never have started
                let stopped = docker_stop(&self.runner, name, &self.env, &self.workdir);
                let removed = docker_remove_container(&self.runner, name, &self.env, &self.workdir);
                stopped.and(removed)
            }
            Resource::File(path) => {
                if path.exists() {
                    std::fs::remove_file(path)?;
                    self.runner.note(&format!("removed {}", path.display()));
                }
                Ok(())
            }
        }
    }
}

/// One named step of a run
pub trait Stage {
    fn name(&self) -> &str;
    fn class(&self) -> StageClass {
        StageClass::Normal
    }
    fn failure_kind(&self) -> FailureKind {
        FailureKind::Other
    }
    fn execute(&self, ctx: &mut RunContext) -> Result<()>;
}

impl Stage for StageConfig {
    fn name(&self) -> &str {
        &self.name
    }

    fn failure_kind(&self) -> FailureKind {
        StageConfig::failure_kind(self)
    }

    fn execute(&self, ctx: &mut RunContext) -> Result<()> {
        match &self.body {
            StageBody::Shell(commands) => {
                for c in commands {
                    ctx.shell(c)?;
                }
                Ok(())
            }
            StageBody::Checkout(c) => checkout::run(c, ctx),
            StageBody::Database(c) => database::run(c, ctx),
            StageBody::Build(c) => build::run(c, ctx),
            StageBody::Deploy(c) => deploy::run(c, ctx),
        }
    }
}

/// Resolves the pipeline's credentials into the environment before anything else runs
pub struct InjectCredentials<'c>(pub &'c HashMap<String, String>);

impl Stage for InjectCredentials<'_> {
    fn name(&self) -> &str {
        "credentials"
    }

    fn failure_kind(&self) -> FailureKind {
        FailureKind::Environment
    }

    fn execute(&self, ctx: &mut RunContext) -> Result<()> {
        let secrets = ctx.secrets;
        inject(secrets, self.0, &mut ctx.env, ctx.runner.redactor_mut())?;
        ctx.runner
            .note(&format!("resolved {} credential(s)", self.0.len()));
        Ok(())
    }
}

impl Stage for CleanupConfig {
    fn name(&self) -> &str {
        "cleanup"
    }

    fn class(&self) -> StageClass {
        StageClass::Cleanup
    }

    /// Best effort: every resource and every command is attempted, failures are only counted
    fn execute(&self, ctx: &mut RunContext) -> Result<()> {
        let mut failures = 0;
        while let Some(resource) = ctx.resources.pop() {
            if let Err(e) = ctx.release(&resource) {
                warn!("could not release {:?}: {}", resource, e);
                failures += 1;
            }
        }
        for c in &self.shell {
            if let Err(e) = ctx.shell(c) {
                warn!("cleanup command failed: {}", ctx.runner.redact(&e.to_string()));
                failures += 1;
            }
        }
        if failures > 0 {
            return Err(anyhow!("{} cleanup step(s) failed", failures));
        }
        Ok(())
    }
}
