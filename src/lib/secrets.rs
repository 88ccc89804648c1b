//! Credentials are referenced by id in the pipeline and resolved right before a run.
//! Their values end up in the run's environment and in the [Redactor], never on disk.
use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::Path;

use anyhow::Result;
use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::CiError;
use crate::utils::redact::{Redactor, MASK};
use crate::Env;

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use pretty_assertions::assert_eq;

    use crate::error::CiError;
    use crate::secrets::{
        env_key, inject, EnvSecretProvider, FileSecretProvider, Secret, SecretProvider,
    };
    use crate::utils::redact::Redactor;
    use crate::Env;

    #[test]
    fn env_provider_reads_prefixed_vars() {
        std::env::set_var("BAKE_CI_TEST_SECRET_DB_USER", "baker");
        std::env::set_var("BAKE_CI_TEST_SECRET_DEVOPS_KEY", "hunter2");
        std::env::set_var("BAKE_CI_TEST_SECRET_DEVOPS_KEY_USR", "root");
        let p = EnvSecretProvider::with_prefix("BAKE_CI_TEST_SECRET_");
        let s = p.resolve("db-user").expect("db-user should resolve");
        assert_eq!(s.value, "baker");
        assert_eq!(s.username, None);
        let s = p.resolve("devops.key").expect("devops.key should resolve");
        assert_eq!(s.username, Some("root".to_string()));
        let err = p.resolve("nope").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CiError>(),
            Some(CiError::SecretNotFound(_))
        ));
    }

    #[test]
    fn file_provider_accepts_both_shapes() {
        let yaml = "db-user: baker
db-password:
  password: s3cret
devops:
  username: root
  password: toor
";
        let p = FileSecretProvider::from_yaml(yaml).expect("could not parse secrets");
        assert_eq!(p.resolve("db-user").unwrap().value, "baker");
        assert_eq!(p.resolve("db-password").unwrap().value, "s3cret");
        assert_eq!(p.resolve("devops").unwrap().username, Some("root".to_string()));
        assert!(p.resolve("missing").is_err());
    }

    #[test]
    fn injection_follows_credential_shape() {
        let p = FileSecretProvider::from_yaml(
            "db-password: s3cret\nregistry:\n  username: bot\n  password: tok\n",
        )
        .unwrap();
        let mut creds = HashMap::new();
        creds.insert("DB_PASSWORD".to_string(), "db-password".to_string());
        creds.insert("REGISTRY".to_string(), "registry".to_string());
        let mut env = Env::new();
        let mut redactor = Redactor::default();
        inject(&p, &creds, &mut env, &mut redactor).expect("injection failed");
        assert_eq!(env.get("DB_PASSWORD").unwrap(), "s3cret");
        assert_eq!(env.get("REGISTRY").unwrap(), "bot:tok");
        assert_eq!(env.get("REGISTRY_USR").unwrap(), "bot");
        assert_eq!(env.get("REGISTRY_PSW").unwrap(), "tok");
        assert_eq!(redactor.redact("pw=s3cret tok"), "pw=**** ****");
    }

    #[test]
    fn redacted_rendering() {
        let s = Secret {
            username: Some("root".to_string()),
            value: "toor".to_string(),
        };
        assert_eq!(s.redacted(), "root:****");
        assert_eq!(format!("{:?}", s).contains("toor"), false);
        assert_eq!(env_key("git-ssh.key"), "GIT_SSH_KEY");
    }
}

/// A resolved credential
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Secret {
    #[serde(default)]
    pub username: Option<String>,
    #[serde(alias = "password")]
    pub value: String,
}

impl Secret {
    /// What may appear in logs instead of the secret
    pub fn redacted(&self) -> String {
        match &self.username {
            Some(u) => format!("{}:{}", u, MASK),
            None => MASK.to_string(),
        }
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.redacted())
    }
}

/// Turns a credential id into a [Secret]
pub trait SecretProvider {
    fn resolve(&self, id: &str) -> Result<Secret>;
}

/// `git-ssh-key` -> `GIT_SSH_KEY`
pub fn env_key(id: &str) -> String {
    id.chars()
        .map(|c| match c {
            '-' | '.' | ' ' => '_',
            c => c.to_ascii_uppercase(),
        })
        .collect()
}

/// Reads `<prefix><ID>` and optionally `<prefix><ID>_USR` from the process environment
#[derive(Debug, Clone)]
pub struct EnvSecretProvider {
    prefix: String,
}

impl Default for EnvSecretProvider {
    fn default() -> Self {
        EnvSecretProvider::with_prefix("BAKE_CI_SECRET_")
    }
}

impl EnvSecretProvider {
    pub fn with_prefix(prefix: &str) -> Self {
        EnvSecretProvider {
            prefix: prefix.to_string(),
        }
    }
}

impl SecretProvider for EnvSecretProvider {
    fn resolve(&self, id: &str) -> Result<Secret> {
        let key = format!("{}{}", self.prefix, env_key(id));
        let value = env::var(&key).map_err(|_| CiError::SecretNotFound(id.to_string()))?;
        Ok(Secret {
            username: env::var(format!("{}_USR", key)).ok(),
            value,
        })
    }
}

#[derive(Deserialize, Debug)]
#[serde(untagged)]
enum SecretEntry {
    Text(String),
    Full(Secret),
}

/// Secrets kept in a YAML file: `id: value` or `id: {username, password}`
#[derive(Debug, Default)]
pub struct FileSecretProvider {
    secrets: HashMap<String, Secret>,
}

impl FileSecretProvider {
    pub fn from_yaml(s: &str) -> Result<Self> {
        let entries: HashMap<String, SecretEntry> = serde_yaml::from_str(s)?;
        let secrets = entries
            .into_iter()
            .map(|(id, e)| {
                let secret = match e {
                    SecretEntry::Text(value) => Secret {
                        username: None,
                        value,
                    },
                    SecretEntry::Full(s) => s,
                };
                (id, secret)
            })
            .collect();
        Ok(FileSecretProvider { secrets })
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        FileSecretProvider::from_yaml(&fs::read_to_string(path)?)
    }
}

impl SecretProvider for FileSecretProvider {
    fn resolve(&self, id: &str) -> Result<Secret> {
        self.secrets
            .get(id)
            .cloned()
            .ok_or_else(|| CiError::SecretNotFound(id.to_string()).into())
    }
}

/// Resolves every `ENV_KEY: credential-id` pair into `env`, registering the values with `redactor`
pub fn inject(
    provider: &dyn SecretProvider,
    credentials: &HashMap<String, String>,
    env: &mut Env,
    redactor: &mut Redactor,
) -> Result<()> {
    for (key, id) in credentials {
        let secret = provider.resolve(id)?;
        debug!("injecting credential {} as {} ({})", id, key, secret.redacted());
        redactor.add(&secret.value);
        match &secret.username {
            None => {
                env.insert(key.clone(), secret.value.clone());
            }
            Some(user) => {
                let joined = format!("{}:{}", user, secret.value);
                redactor.add(&joined);
                env.insert(key.clone(), joined);
                env.insert(format!("{}_USR", key), user.clone());
                env.insert(format!("{}_PSW", key), secret.value.clone());
            }
        }
    }
    Ok(())
}
