use std::fmt::{Display, Formatter};
use std::path::Path;

/// all utility functions git-related
use anyhow::{anyhow, Result};
use chrono::{DateTime, TimeZone, Utc};
use lazy_static::lazy_static;
use log::debug;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::utils::runner::{CommandRunner, Invocation};
use crate::utils::{shell_quote, trim_newline};
use crate::Env;

lazy_static! {
    static ref REF_PATTERN: Regex = Regex::new(r"^([0-9a-fA-F]+)[ \t]+refs/heads/(\S+)$")
        .expect("could not compile pattern");
}

/// `git log` format understood by [parse_commit]
const COMMIT_FORMAT: &str = "--format=%H%n%h%n%an%n%ae%n%at%n%s";


#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct CommitPerson {
    pub name: String,
    pub email: String,
    pub date: DateTime<Utc>,
}

impl Display for CommitPerson {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} <{}> {}", self.name, self.email, self.date.to_rfc3339())
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Commit {
    pub hash: String,
    pub short_hash: String,
    pub author: CommitPerson,
    pub subject: String,
}

/// Parses the output of `git log -n 1` with [COMMIT_FORMAT]
pub(crate) fn parse_commit(raw: &str) -> Result<Commit> {
    let lines: Vec<&str> = raw.lines().collect();
    if lines.len() < 5 {
        return Err(anyhow!("unexpected git log output: {:?}", raw));
    }
    let ts: i64 = lines[4].trim().parse()?;
    let date = Utc
        .timestamp_opt(ts, 0)
        .single()
        .ok_or_else(|| anyhow!("invalid commit timestamp {}", ts))?;
    Ok(Commit {
        hash: lines[0].trim().to_string(),
        short_hash: lines[1].trim().to_string(),
        author: CommitPerson {
            name: lines[2].to_string(),
            email: lines[3].to_string(),
            date,
        },
        subject: lines.get(5).map(|s| s.to_string()).unwrap_or_default(),
    })
}

/// `GIT_SSH_COMMAND` value authenticating with the given private key
pub fn ssh_command_for_key(key_path: &str) -> String {
    format!(
        "ssh -i {} -o IdentitiesOnly=yes -o StrictHostKeyChecking=no",
        shell_quote(key_path)
    )
}

/// Clones a single branch of `repo_url` into `to`, which must be empty
pub fn clone_branch(
    runner: &dyn CommandRunner,
    repo_url: &str,
    branch: &str,
    env: &Env,
    to: &Path,
) -> Result<()> {
    let inv = Invocation::new(
        "git",
        &["clone", "--branch", branch, "--single-branch", repo_url, "."],
        env,
        to,
    );
    let output = runner.run(&inv)?;
    if !output.success() {
        return Err(anyhow!(
            "Could not git clone {}#{}: {}",
            repo_url,
            branch,
            output.stderr.trim()
        ));
    }
    Ok(())
}

/// Abbreviated hash of HEAD in `repo`
pub fn short_head(runner: &dyn CommandRunner, env: &Env, repo: &Path) -> Result<String> {
    let inv = Invocation::shell("git rev-parse --short HEAD", env, repo);
    let mut s = runner.run(&inv)?.check(&inv)?.stdout;
    trim_newline(&mut s);
    if s.is_empty() {
        return Err(anyhow!("git rev-parse returned an empty hash"));
    }
    Ok(s)
}

pub fn get_commit(runner: &dyn CommandRunner, env: &Env, repo: &Path) -> Result<Commit> {
    let inv = Invocation::new("git", &["log", "-n", "1", COMMIT_FORMAT, "HEAD"], env, repo);
    let out = runner.run(&inv)?;
    if !out.success() {
        return Err(anyhow!("Could not read HEAD commit in {}", repo.display()));
    }
    parse_commit(&out.stdout)
}

pub(crate) fn heads_from_ls_remote(out: &str) -> std::collections::HashMap<String, String> {
    out.lines()
        .filter_map(|line| REF_PATTERN.captures(line.trim()))
        .map(|capture| (capture[2].to_string(), capture[1].to_string()))
        .collect()
}

/// Lists the remote's branches and their head hash
pub fn fetch_heads(
    runner: &dyn CommandRunner,
    uri: &str,
    env: &Env,
) -> Result<std::collections::HashMap<String, String>> {
    debug!("Running git ls-remote --heads {}", uri);
    let inv = Invocation::new("git", &["ls-remote", "--heads", uri], env, Path::new("."));
    let o = runner.run(&inv)?;
    if !o.success() {
        return Err(anyhow!(
            "failed to run git ls-remote --heads {}: {}",
            uri,
            o.stderr.trim()
        ));
    }
    Ok(heads_from_ls_remote(&o.stdout))
}
