use std::fmt::{Display, Formatter};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use anyhow::{anyhow, Result};
use log::debug;

use crate::error::CiError;
use crate::Env;


/// One external command, fully described: program, arguments, environment and working directory.
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub env: Env,
    pub cwd: PathBuf,
    pub stdin: Option<String>,
}

impl Invocation {
    pub fn new(program: &str, args: &[&str], env: &Env, cwd: &Path) -> Self {
        Invocation {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            env: env.clone(),
            cwd: cwd.to_path_buf(),
            stdin: None,
        }
    }

    /// A script handed to `sh -c`, so pipes and `$VARS` behave like in a shell stage
    pub fn shell(script: &str, env: &Env, cwd: &Path) -> Self {
        Invocation::new("sh", &["-c", script], env, cwd)
    }

    pub fn with_stdin(mut self, input: &str) -> Self {
        self.stdin = Some(input.to_string());
        self
    }

    /// The script if this is a `sh -c` invocation, the command line otherwise
    pub fn command_line(&self) -> String {
        if self.program == "sh" && self.args.len() == 2 && self.args[0] == "-c" {
            return self.args[1].clone();
        }
        self.to_string()
    }
}

impl Display for Invocation {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.program)?;
        for a in &self.args {
            f.write_str(" ")?;
            f.write_str(a)?;
        }
        Ok(())
    }
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct CommandOutput {
    /// exit code, `None` if the process was killed by a signal
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Turns a non-zero exit into a [CiError::CommandFailed]
    pub fn check(self, inv: &Invocation) -> Result<CommandOutput> {
        if self.success() {
            return Ok(self);
        }
        Err(CiError::CommandFailed {
            command: inv.command_line(),
            code: self.code,
        }
        .into())
    }
}

/// Anything able to execute an [Invocation]. Stages never spawn processes themselves.
pub trait CommandRunner {
    fn run(&self, inv: &Invocation) -> Result<CommandOutput>;
}

/// Runs invocations as local child processes, waiting for each to finish
#[derive(Debug, Default, Clone, Copy)]
pub struct ShellRunner;

impl CommandRunner for ShellRunner {
    fn run(&self, inv: &Invocation) -> Result<CommandOutput> {
        debug!("Running in {}: {}", inv.cwd.display(), inv.program);
        let mut cmd = Command::new(&inv.program);
        cmd.args(&inv.args)
            .envs(&inv.env)
            .current_dir(&inv.cwd)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let output = match &inv.stdin {
            None => cmd.stdin(Stdio::null()).output()?,
            Some(input) => {
                let mut process = cmd.stdin(Stdio::piped()).spawn()?;
                {
                    let stdin = process
                        .stdin
                        .as_mut()
                        .ok_or_else(|| anyhow!("could not open stdin of {}", inv.program))?;
                    stdin.write_all(input.as_bytes())?;
                }
                process.wait_with_output()?
            }
        };
        Ok(CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}
