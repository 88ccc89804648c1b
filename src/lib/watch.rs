//! Polling the checked-out branch for new commits.
use std::fs;
use std::path::PathBuf;

use anyhow::{anyhow, Result};
use log::{debug, trace};

use crate::conf::PipelineConfig;
use crate::error::CiError;
use crate::secrets::SecretProvider;
use crate::utils::git::{fetch_heads, ssh_command_for_key};
use crate::utils::interpolate;
use crate::utils::runner::CommandRunner;
use crate::Env;

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tempdir::TempDir;

    use crate::secrets::FileSecretProvider;
    use crate::utils::tests::{deser_yaml, FakeRunner};
    use crate::watch::HeadWatcher;

    const LS_REMOTE: &str = "970683e1d18cf8229795fc8346ef6f66c0e8b2b0\trefs/heads/django-app
1f2e3d4c5b6a79881f2e3d4c5b6a79881f2e3d4c\trefs/heads/main
";

    fn watcher(dir: &TempDir) -> HeadWatcher {
        let c = deser_yaml(&format!(
            "env:
  REPO: git@192.168.1.158:eddie/django-bakery-app.git
options:
  state_dir: {}
stages:
  - name: Checkout
    checkout:
      url: ${{REPO}}
      branch: django-app
",
            dir.path().display()
        ))
        .unwrap();
        HeadWatcher::from_config(&c).expect("no checkout stage")
    }

    #[test]
    fn new_head_then_nothing() {
        let dir = TempDir::new("bake_ci_watch").expect("could not create temp dir");
        let w = watcher(&dir);
        let runner = FakeRunner::new().respond("git ls-remote", LS_REMOTE);
        let secrets = FileSecretProvider::default();
        let head = w.poll(&runner, &secrets).unwrap();
        assert_eq!(head.as_deref(), Some("970683e1d18cf8229795fc8346ef6f66c0e8b2b0"));
        assert_eq!(
            runner.command_lines(),
            vec!["git ls-remote --heads git@192.168.1.158:eddie/django-bakery-app.git"]
        );
        w.remember(&head.unwrap()).unwrap();
        assert_eq!(w.poll(&runner, &secrets).unwrap(), None);
    }

    #[test]
    fn missing_branch_is_an_error() {
        let dir = TempDir::new("bake_ci_watch").expect("could not create temp dir");
        let w = watcher(&dir);
        let runner = FakeRunner::new().respond("git ls-remote", "");
        assert!(w.poll(&runner, &FileSecretProvider::default()).is_err());
    }

    #[test]
    fn pipeline_without_checkout_cannot_be_watched() {
        let c = deser_yaml("stages:\n  - name: a\n    shell: [\"true\"]\n").unwrap();
        assert!(HeadWatcher::from_config(&c).is_err());
    }
}

/// Remembers the last built head of the pipeline's branch in `<state_dir>/last_head`
#[derive(Debug, Clone)]
pub struct HeadWatcher {
    pub url: String,
    pub branch: String,
    credentials: Option<String>,
    state: PathBuf,
}

impl HeadWatcher {
    /// Watches the url and branch of the pipeline's checkout stage
    pub fn from_config(config: &PipelineConfig) -> Result<Self> {
        let (url, branch, credentials) = config.checkout().ok_or_else(|| {
            CiError::InvalidConfig("only a pipeline with a checkout stage can be watched".to_string())
        })?;
        Ok(HeadWatcher {
            url: interpolate(url, &config.env).to_string(),
            branch: interpolate(branch, &config.env).to_string(),
            credentials: credentials.map(|c| c.to_string()),
            state: config.options.state_dir.join("last_head"),
        })
    }

    pub fn last_head(&self) -> Option<String> {
        fs::read_to_string(&self.state)
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    pub fn remember(&self, head: &str) -> Result<()> {
        if let Some(parent) = self.state.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.state, format!("{}\n", head))?;
        Ok(())
    }

    /// The branch's head if it differs from the last one built
    pub fn poll(&self, runner: &dyn CommandRunner, secrets: &dyn SecretProvider) -> Result<Option<String>> {
        let mut env = Env::new();
        if let Some(id) = &self.credentials {
            let key = secrets.resolve(id)?;
            env.insert(
                "GIT_SSH_COMMAND".to_string(),
                ssh_command_for_key(&shellexpand::tilde(&key.value)),
            );
        }
        let heads = fetch_heads(runner, &self.url, &env)?;
        trace!("remote heads: {:?}", heads);
        let head = heads
            .get(&self.branch)
            .ok_or_else(|| anyhow!("branch {} not found on {}", self.branch, self.url))?;
        if self.last_head().as_deref() == Some(head.as_str()) {
            debug!("{}#{} still at {}", self.url, self.branch, head);
            return Ok(None);
        }
        Ok(Some(head.clone()))
    }
}
