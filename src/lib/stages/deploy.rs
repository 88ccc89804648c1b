use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use log::info;

use crate::conf::DeployConfig;
use crate::manifest::ImagePatch;
use crate::stages::build::{archive_name, resolved};
use crate::stages::RunContext;
use crate::utils::runner::{CommandRunner, Invocation};
use crate::utils::ssh::SshTarget;
use crate::utils::{is_local_host, shell_quote};

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::Path;

    use pretty_assertions::assert_eq;
    use tempdir::TempDir;

    use crate::conf::DeployConfig;
    use crate::error::CiError;
    use crate::secrets::FileSecretProvider;
    use crate::stages::deploy::run;
    use crate::stages::RunContext;
    use crate::utils::redact::Redactor;
    use crate::utils::tests::FakeRunner;
    use crate::Env;

    fn config(host: &str, remote_dir: &str, manifest: &str, playbook_dir: &str) -> DeployConfig {
        DeployConfig {
            host: host.to_string(),
            user: "root".to_string(),
            port: 22,
            credentials: None,
            strict_host_key_checking: false,
            remote_dir: remote_dir.to_string(),
            manifest: manifest.to_string(),
            playbook_dir: playbook_dir.to_string(),
            playbook: "playbooks/deploy_app.yml".to_string(),
            image: "${IMAGE_NAME}".to_string(),
            tag: "${IMAGE_TAG}".to_string(),
            archive: None,
        }
    }

    fn env() -> Env {
        let mut env = Env::new();
        env.insert("IMAGE_NAME".to_string(), "django-bakery-app".to_string());
        env.insert("IMAGE_TAG".to_string(), "abc1234".to_string());
        env
    }

    #[test]
    fn remote_deploy_is_one_copy_and_one_session() {
        let runner = FakeRunner::new();
        let secrets = FileSecretProvider::default();
        let mut ctx = RunContext::new(&runner, &secrets, Redactor::default(), env(), Path::new("."));
        let c = config(
            "192.168.1.182",
            "/tmp/",
            "/ecns_projects/myapp/k8s/deployment.yaml",
            "/ecns_projects/ansible-devops-infra",
        );
        run(&c, &mut ctx).expect("deploy failed");
        let calls = runner.calls.borrow();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].program, "scp");
        assert!(calls[0].to_string().ends_with("django-bakery-app.tar.gz root@192.168.1.182:/tmp/"));
        assert_eq!(calls[1].program, "ssh");
        let script = calls[1].stdin.clone().expect("no script sent");
        assert_eq!(
            script,
            "set -e
echo 'Decompressing image...'
gunzip -f '/tmp/django-bakery-app.tar.gz'
echo 'Updating image tag in /ecns_projects/myapp/k8s/deployment.yaml to abc1234...'
sed -i 's|image: django-bakery-app:.*|image: django-bakery-app:abc1234|g' '/ecns_projects/myapp/k8s/deployment.yaml'
echo 'Verifying image tag update...'
grep -F 'image: django-bakery-app:abc1234' '/ecns_projects/myapp/k8s/deployment.yaml'
cd '/ecns_projects/ansible-devops-infra'
ansible-playbook 'playbooks/deploy_app.yml' -e 'image_name=django-bakery-app' -e 'image_tag=abc1234'
"
        );
    }

    #[test]
    fn copy_failure_skips_the_session() {
        let runner = FakeRunner::new().fail_on("scp");
        let secrets = FileSecretProvider::default();
        let mut ctx = RunContext::new(&runner, &secrets, Redactor::default(), env(), Path::new("."));
        let c = config("192.168.1.182", "/tmp/", "/m.yaml", "/infra");
        assert!(run(&c, &mut ctx).is_err());
        assert_eq!(runner.count("ssh"), 0);
    }

    #[test]
    fn local_deploy_patches_manifest() {
        let dir = TempDir::new("bake_ci_deploy").expect("could not create temp dir");
        let ws = dir.path().join("ws");
        let remote = dir.path().join("remote");
        fs::create_dir_all(&ws).unwrap();
        fs::write(ws.join("django-bakery-app.tar.gz"), "gz").unwrap();
        let manifest = dir.path().join("deployment.yaml");
        fs::write(&manifest, "containers:\n  - image: django-bakery-app:0f0f0f0\n").unwrap();

        let runner = FakeRunner::new();
        let secrets = FileSecretProvider::default();
        let mut ctx = RunContext::new(&runner, &secrets, Redactor::default(), env(), &ws);
        let c = config(
            "localhost",
            remote.to_str().unwrap(),
            manifest.to_str().unwrap(),
            dir.path().to_str().unwrap(),
        );
        run(&c, &mut ctx).expect("local deploy failed");

        assert!(remote.join("django-bakery-app.tar.gz").is_file());
        assert_eq!(
            fs::read_to_string(&manifest).unwrap(),
            "containers:\n  - image: django-bakery-app:abc1234\n"
        );
        let calls = runner.calls.borrow();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].program, "gunzip");
        assert_eq!(
            calls[1].to_string(),
            "ansible-playbook playbooks/deploy_app.yml -e image_name=django-bakery-app -e image_tag=abc1234"
        );
        assert_eq!(calls[1].cwd, dir.path());
    }

    #[test]
    fn local_manifest_without_reference_fails() {
        let dir = TempDir::new("bake_ci_deploy").expect("could not create temp dir");
        fs::write(dir.path().join("django-bakery-app.tar.gz"), "gz").unwrap();
        let manifest = dir.path().join("deployment.yaml");
        fs::write(&manifest, "image: nginx:1\n").unwrap();
        let runner = FakeRunner::new();
        let secrets = FileSecretProvider::default();
        let mut ctx = RunContext::new(&runner, &secrets, Redactor::default(), env(), dir.path());
        let c = config(
            "127.0.0.1",
            dir.path().join("remote").to_str().unwrap(),
            manifest.to_str().unwrap(),
            dir.path().to_str().unwrap(),
        );
        let err = run(&c, &mut ctx).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CiError>(),
            Some(CiError::ManifestUnchanged { .. })
        ));
        assert_eq!(runner.count("ansible-playbook"), 0);
    }

    #[test]
    fn deploy_without_tag_is_rejected() {
        let runner = FakeRunner::new();
        let secrets = FileSecretProvider::default();
        let mut env = env();
        env.remove("IMAGE_TAG");
        let mut ctx = RunContext::new(&runner, &secrets, Redactor::default(), env, Path::new("."));
        let c = config("192.168.1.182", "/tmp/", "/m.yaml", "/infra");
        assert!(run(&c, &mut ctx).is_err());
        assert!(runner.calls.borrow().is_empty());
    }
}

/// Everything the deploy steps need, expanded
struct DeployPlan {
    archive: String,
    remote_dir: String,
    manifest: String,
    playbook_dir: String,
    playbook: String,
    patch: ImagePatch,
    image: String,
    tag: String,
}

impl DeployPlan {
    fn remote_archive(&self) -> Result<String> {
        let file = Path::new(&self.archive)
            .file_name()
            .and_then(|f| f.to_str())
            .ok_or_else(|| anyhow!("invalid archive name {}", self.archive))?;
        Ok(format!("{}/{}", self.remote_dir.trim_end_matches('/'), file))
    }

    fn playbook_args(&self) -> Vec<String> {
        vec![
            self.playbook.clone(),
            "-e".to_string(),
            format!("image_name={}", self.image),
            "-e".to_string(),
            format!("image_tag={}", self.tag),
        ]
    }

    /// The commands run in the single ssh session: decompress, patch, verify, apply
    fn remote_script(&self) -> Result<String> {
        let manifest = shell_quote(&self.manifest);
        let playbook = self
            .playbook_args()
            .iter()
            .map(|a| if a == "-e" { a.clone() } else { shell_quote(a) })
            .collect::<Vec<String>>()
            .join(" ");
        Ok(format!(
            "set -e
echo 'Decompressing image...'
gunzip -f {archive}
echo {updating}
sed -i {sed} {manifest}
echo 'Verifying image tag update...'
grep -F {expected} {manifest}
cd {playbook_dir}
ansible-playbook {playbook}
",
            archive = shell_quote(&self.remote_archive()?),
            updating = shell_quote(&format!(
                "Updating image tag in {} to {}...",
                self.manifest, self.tag
            )),
            sed = shell_quote(&self.patch.sed_expression()),
            manifest = manifest,
            expected = shell_quote(&self.patch.replacement()),
            playbook_dir = shell_quote(&self.playbook_dir),
            playbook = playbook,
        ))
    }
}

fn deploy_remote(plan: &DeployPlan, target: &SshTarget, ctx: &RunContext) -> Result<()> {
    info!("Copying compressed Docker image to {}...", target.host);
    target.copy_to(&ctx.runner, &plan.archive, &plan.remote_dir, &ctx.env, &ctx.workdir)?;
    info!("Decompressing, updating image tag and deploying...");
    let script = plan.remote_script()?;
    for l in script.lines() {
        ctx.runner.note(&format!("remote> {}", l));
    }
    let out = target.execute(&ctx.runner, &script, &ctx.env, &ctx.workdir)?;
    for l in out.stdout.lines().filter(|l| l.contains("image:")) {
        info!("{}", ctx.runner.redact(l.trim()));
    }
    Ok(())
}

fn deploy_local(plan: &DeployPlan, ctx: &RunContext) -> Result<()> {
    let remote_archive = PathBuf::from(plan.remote_archive()?);
    if let Some(parent) = remote_archive.parent() {
        fs::create_dir_all(parent)?;
    }
    info!("Copying compressed Docker image to {}...", remote_archive.display());
    fs::copy(ctx.workdir.join(&plan.archive), &remote_archive)?;

    info!("Decompressing image...");
    let target = remote_archive.to_string_lossy().to_string();
    let inv = Invocation::new("gunzip", &["-f", target.as_str()], &ctx.env, &ctx.workdir);
    ctx.runner.run(&inv)?.check(&inv)?;

    info!("Updating image tag in {} to {}...", plan.manifest, plan.tag);
    let content = fs::read_to_string(&plan.manifest)?;
    let patched = plan.patch.apply_checked(&content, &plan.manifest)?;
    fs::write(&plan.manifest, patched)?;
    ctx.runner
        .note(&format!("{}: {}", plan.manifest, plan.patch.replacement()));

    let args = plan.playbook_args();
    let args = args.iter().map(|s| s.as_str()).collect::<Vec<&str>>();
    let inv = Invocation::new("ansible-playbook", &args, &ctx.env, Path::new(&plan.playbook_dir));
    ctx.runner.run(&inv)?.check(&inv)?;
    Ok(())
}

/// Ships the exported image and rolls the manifest forward to the new tag
pub fn run(c: &DeployConfig, ctx: &mut RunContext) -> Result<()> {
    let image = resolved("image", ctx.expand(&c.image))?;
    let tag = resolved("tag", ctx.expand(&c.tag))?;
    let archive = match &c.archive {
        Some(a) => ctx.expand(a),
        None => ctx
            .env
            .get("IMAGE_ARCHIVE")
            .cloned()
            .unwrap_or_else(|| archive_name(&image)),
    };
    let plan = DeployPlan {
        archive,
        remote_dir: ctx.expand(&c.remote_dir),
        manifest: ctx.expand(&c.manifest),
        playbook_dir: ctx.expand(&c.playbook_dir),
        playbook: ctx.expand(&c.playbook),
        patch: ImagePatch::new(&image, &tag)?,
        image,
        tag,
    };
    let host = ctx.expand(&c.host);
    if is_local_host(&host) {
        info!("{} is local, deploying without ssh", host);
        return deploy_local(&plan, ctx);
    }
    let identity_file = match &c.credentials {
        Some(id) => Some(ctx.key_path(id)?),
        None => None,
    };
    let target = SshTarget {
        host,
        user: ctx.expand(&c.user),
        port: c.port,
        identity_file,
        strict_host_key_checking: c.strict_host_key_checking,
    };
    deploy_remote(&plan, &target, ctx)
}
