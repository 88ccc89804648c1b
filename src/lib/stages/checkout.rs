use std::fs;
use std::path::Path;

use anyhow::Result;
use log::{debug, info, warn};

use crate::conf::CheckoutConfig;
use crate::stages::RunContext;
use crate::utils::git::{clone_branch, get_commit, ssh_command_for_key};


/// Clones the configured branch into the workspace
pub fn run(c: &CheckoutConfig, ctx: &mut RunContext) -> Result<()> {
    let url = ctx.expand(&c.url);
    let branch = ctx.expand(&c.branch);
    let mut env = ctx.env.clone();
    if let Some(credential) = &c.credentials {
        let key = ctx.key_path(credential)?;
        env.insert("GIT_SSH_COMMAND".to_string(), ssh_command_for_key(&key));
    }
    info!("Checking out {}#{}", url, branch);
    clear_previous_checkout(&ctx.workdir)?;
    clone_branch(&ctx.runner, &url, &branch, &env, &ctx.workdir)?;
    ctx.branch = Some(branch);
    match get_commit(&ctx.runner, &ctx.env, &ctx.workdir) {
        Ok(commit) => {
            info!("HEAD is {} \"{}\" by {}", commit.short_hash, commit.subject, commit.author.name);
            ctx.commit = Some(commit);
        }
        Err(e) => warn!("could not read HEAD commit: {}", e),
    }
    Ok(())
}

/// Empties `dir` when it holds a clone from an earlier run; `git clone` wants an empty target
fn clear_previous_checkout(dir: &Path) -> Result<()> {
    if !dir.join(".git").exists() {
        return Ok(());
    }
    debug!("Removing previous checkout in {}", dir.display());
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            fs::remove_dir_all(entry.path())?;
        } else {
            fs::remove_file(entry.path())?;
        }
    }
    Ok(())
}
