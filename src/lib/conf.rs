/// Defines what makes for a valid pipeline
use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::error::CiError;
use crate::notifications::Notifier;
use crate::utils::retry::Retry;
use crate::Env;

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use crate::conf::{FailureKind, StageBody};
    use crate::notifications::Notifier;
    use crate::utils::tests::{deser_yaml, get_sample_resource_file};

    #[test]
    fn reference_pipeline() {
        let s = get_sample_resource_file("pipelines/django-bakery.yml")
            .expect("could not find django-bakery.yml");
        let c = deser_yaml(&s).expect("could not deserialize reference pipeline");
        c.validate().expect("reference pipeline should be valid");
        let names: Vec<&str> = c.stages.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "Checkout",
                "Start MySQL",
                "Setup Python",
                "Migrate Database",
                "Run Tests",
                "Build Docker Image",
                "Deploy to Kubernetes (Ansible)"
            ]
        );
        assert_eq!(c.options.keep_runs, 10);
        assert!(c.options.disallow_concurrent);
        assert_eq!(c.credentials.get("DB_USER").map(|s| s.as_str()), Some("db-user"));
        assert_eq!(c.env.get("IMAGE_NAME").map(|s| s.as_str()), Some("django-bakery-app"));
        let (url, branch, _) = c.checkout().expect("no checkout stage");
        assert_eq!(branch, "django-app");
        assert_eq!(url, "git@192.168.1.158:eddie/django-bakery-app.git");
        match &c.stages[1].body {
            StageBody::Database(db) => {
                assert_eq!(db.readiness.interval_secs, 2);
                assert_eq!(db.container.as_deref(), Some("test-mysql"));
            }
            other => panic!("got invalid stage body: {:?}", other),
        }
        assert_eq!(c.stages[3].failure_kind(), FailureKind::Verification);
        assert_eq!(c.stages[0].failure_kind(), FailureKind::Checkout);
        assert_eq!(c.cleanup.shell.len(), 3);
    }

    #[test]
    fn basic_config() {
        let s = get_sample_resource_file("tests/basic_config.yml")
            .expect("could not find basic_config");
        let c = deser_yaml(&s).expect("could not deserialize basic config");
        assert_eq!(c.stages.len(), 2);
        let s0 = c.stages.get(0).unwrap();
        assert_eq!(s0.name, "say hello");
        assert_eq!(
            s0.body,
            StageBody::Shell(vec!["echo \"hello $GREETED\"".to_string()])
        );
        assert_eq!(s0.failure_kind(), FailureKind::Other);
        assert_eq!(c.options.keep_runs, 10);
        assert!(c.cleanup.shell.is_empty());
        assert_eq!(c.notifiers.len(), 1);
        assert!(matches!(c.notifiers[0], Notifier::Log(_)));
    }

    #[test]
    fn duplicate_stage_names_are_rejected() {
        let c = deser_yaml(
            "stages:
  - name: a
    shell: [\"true\"]
  - name: a
    shell: [\"true\"]",
        )
        .expect("could not parse");
        assert!(c.validate().is_err());
    }

    #[test]
    fn empty_pipeline_is_rejected() {
        let c = deser_yaml("stages: []").expect("could not parse");
        assert!(c.validate().is_err());
    }
}

fn default_true() -> bool {
    true
}

fn default_keep_runs() -> usize {
    10
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(".bake-ci")
}

fn default_notifiers() -> Vec<Notifier> {
    vec![Notifier::Log(Default::default())]
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
/// Run-level policies
pub struct RunOptions {
    #[serde(default = "default_true")]
    /// Reject a run while another one holds the lock
    pub disallow_concurrent: bool,
    #[serde(default = "default_keep_runs")]
    /// How many run records to keep
    pub keep_runs: usize,
    #[serde(default = "default_state_dir")]
    /// Where the lock, the run history and the watch state live
    pub state_dir: PathBuf,
    #[serde(default)]
    /// Directory the sources are checked out to. A fresh temporary directory when absent.
    pub workspace: Option<PathBuf>,
}

impl Default for RunOptions {
    fn default() -> Self {
        RunOptions {
            disallow_concurrent: true,
            keep_runs: default_keep_runs(),
            state_dir: default_state_dir(),
            workspace: None,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
/// Why a run failed, as reported in the run record
pub enum FailureKind {
    Checkout,
    /// database bring-up, dependency installation
    Environment,
    /// migrations and tests
    Verification,
    Build,
    Deploy,
    Other,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
/// Represents an entire pipeline file
pub struct PipelineConfig {
    #[serde(default)]
    /// Initial environment, visible to every stage
    pub env: Env,
    #[serde(default)]
    /// `ENV_KEY: credential-id`, resolved by a [SecretProvider](crate::secrets::SecretProvider)
    pub credentials: HashMap<String, String>,
    #[serde(default)]
    pub options: RunOptions,
    /// Stages, run in this order
    pub stages: Vec<StageConfig>,
    #[serde(default)]
    /// Always run, after the stages
    pub cleanup: CleanupConfig,
    #[serde(default = "default_notifiers")]
    pub notifiers: Vec<Notifier>,
}

impl PipelineConfig {
    pub fn from_file(path: &Path) -> Result<PipelineConfig> {
        let c: PipelineConfig = serde_yaml::from_reader(File::open(path)?)?;
        c.validate()?;
        Ok(c)
    }

    pub fn validate(&self) -> Result<()> {
        if self.stages.is_empty() {
            return Err(CiError::InvalidConfig("a pipeline needs at least one stage".to_string()).into());
        }
        let mut seen = HashSet::new();
        for s in &self.stages {
            if !seen.insert(s.name.as_str()) {
                return Err(CiError::InvalidConfig(format!("stage \"{}\" is defined twice", s.name)).into());
            }
        }
        if self.options.keep_runs == 0 {
            return Err(CiError::InvalidConfig("keep_runs must be at least 1".to_string()).into());
        }
        Ok(())
    }

    /// url, branch and credential id of the first checkout stage
    pub fn checkout(&self) -> Option<(&str, &str, Option<&str>)> {
        self.stages.iter().find_map(|s| match &s.body {
            StageBody::Checkout(c) => Some((c.url.as_str(), c.branch.as_str(), c.credentials.as_deref())),
            _ => None,
        })
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
/// A named stage. Serializes to:
/// ```yaml
/// name: Run Tests
/// shell:
///   - . venv/bin/activate && python manage.py test
/// failure: verification  # optional, how a failure is classified
/// ```
pub struct StageConfig {
    pub name: String,
    #[serde(flatten)]
    pub body: StageBody,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureKind>,
}

impl StageConfig {
    pub fn failure_kind(&self) -> FailureKind {
        if let Some(k) = self.failure {
            return k;
        }
        match self.body {
            StageBody::Shell(_) => FailureKind::Other,
            StageBody::Checkout(_) => FailureKind::Checkout,
            StageBody::Database(_) => FailureKind::Environment,
            StageBody::Build(_) => FailureKind::Build,
            StageBody::Deploy(_) => FailureKind::Deploy,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "snake_case")]
/// What a stage does
pub enum StageBody {
    /// Shell commands, each one run with `sh -c` in the workspace
    Shell(Vec<String>),
    Checkout(CheckoutConfig),
    Database(DatabaseConfig),
    Build(BuildConfig),
    Deploy(DeployConfig),
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CheckoutConfig {
    pub url: String,
    pub branch: String,
    #[serde(default)]
    /// Credential id resolving to a private key path
    pub credentials: Option<String>,
}

fn default_mysql_image() -> String {
    "mysql:8.0".to_string()
}

fn default_mysql_port() -> u16 {
    3306
}

fn default_root_password() -> String {
    "rootpass".to_string()
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
/// An ephemeral MySQL container
pub struct DatabaseConfig {
    #[serde(default)]
    /// Container name, random when absent
    pub container: Option<String>,
    #[serde(default = "default_mysql_image")]
    pub image: String,
    #[serde(default = "default_root_password")]
    pub root_password: String,
    pub database: String,
    pub user: String,
    pub password: String,
    #[serde(default = "default_mysql_port")]
    /// Host port mapped to the container's 3306
    pub port: u16,
    #[serde(default)]
    /// Extra arguments for the server
    pub args: Vec<String>,
    #[serde(default)]
    pub readiness: Retry,
    #[serde(default = "default_true")]
    /// Create the user and grant it every privilege once the server answers
    pub grant: bool,
}

fn default_context() -> String {
    ".".to_string()
}

fn default_image_name() -> String {
    "${IMAGE_NAME}".to_string()
}

fn default_image_tag() -> String {
    "${IMAGE_TAG}".to_string()
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
/// Builds, tags and exports the application image
pub struct BuildConfig {
    #[serde(default = "default_image_name")]
    pub image: String,
    #[serde(default)]
    pub dockerfile: Option<String>,
    #[serde(default = "default_context")]
    pub context: String,
    #[serde(default = "default_true")]
    pub no_cache: bool,
    #[serde(default = "default_true")]
    /// Also tag the image as `latest`
    pub latest: bool,
    #[serde(default)]
    pub build_args: Env,
    #[serde(default)]
    /// Exported archive, `<image>.tar.gz` when absent
    pub archive: Option<String>,
}

fn default_ssh_user() -> String {
    "root".to_string()
}

fn default_ssh_port() -> u16 {
    22
}

fn default_remote_dir() -> String {
    "/tmp/".to_string()
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
/// Ships the archive to a host and runs the playbook there
pub struct DeployConfig {
    pub host: String,
    #[serde(default = "default_ssh_user")]
    pub user: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    #[serde(default)]
    /// Credential id resolving to a private key path
    pub credentials: Option<String>,
    #[serde(default)]
    pub strict_host_key_checking: bool,
    #[serde(default = "default_remote_dir")]
    pub remote_dir: String,
    /// Manifest whose `image: <name>:<tag>` lines get the new tag
    pub manifest: String,
    /// Directory the playbook is run from
    pub playbook_dir: String,
    pub playbook: String,
    #[serde(default = "default_image_name")]
    pub image: String,
    #[serde(default = "default_image_tag")]
    pub tag: String,
    #[serde(default)]
    pub archive: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct CleanupConfig {
    #[serde(default)]
    /// Best-effort commands, run after the registered resources are released
    pub shell: Vec<String>,
}
