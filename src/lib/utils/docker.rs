use std::path::Path;

use anyhow::{anyhow, Result};
use log::debug;
use rand::Rng;

use crate::utils::runner::{CommandOutput, CommandRunner, Invocation};
use crate::utils::shell_quote;
use crate::Env;

#[cfg(test)]
mod tests {
    use std::path::Path;

    use pretty_assertions::assert_eq;

    use crate::utils::docker::{
        build_image, ping_args, rng_docker_chars, run_detached, save_compressed, BuildSpec,
        ContainerSpec, DOCKER_NAME_CHARSET,
    };
    use crate::utils::tests::FakeRunner;
    use crate::Env;

    #[test]
    fn random_names_are_valid() {
        let n = rng_docker_chars(6);
        assert!(n.starts_with("bake-ci-"));
        assert_eq!(n.len(), "bake-ci-".len() + 6);
        assert!(n.bytes().all(|b| DOCKER_NAME_CHARSET.contains(&b)));
    }

    #[test]
    fn run_detached_args() {
        let runner = FakeRunner::new();
        let spec = ContainerSpec {
            name: "test-mysql".to_string(),
            image: "mysql:8.0".to_string(),
            env: vec![("MYSQL_DATABASE".to_string(), "bake_db".to_string())],
            ports: vec!["3306:3306".to_string()],
            args: vec!["--default-authentication-plugin=mysql_native_password".to_string()],
        };
        run_detached(&runner, &spec, &Env::new(), Path::new(".")).expect("docker run failed");
        assert_eq!(
            runner.command_lines(),
            vec!["docker run -d --name test-mysql -e MYSQL_DATABASE=bake_db -p 3306:3306 mysql:8.0 --default-authentication-plugin=mysql_native_password"]
        );
    }

    #[test]
    fn build_tags_and_cachebust() {
        let runner = FakeRunner::new();
        let spec = BuildSpec {
            dockerfile: None,
            context: ".".to_string(),
            tags: vec!["app:abc1234".to_string(), "app:latest".to_string()],
            build_args: vec![("CACHEBUST".to_string(), "1700000000".to_string())],
            no_cache: true,
        };
        build_image(&runner, &spec, &Env::new(), Path::new(".")).expect("build failed");
        assert_eq!(
            runner.command_lines(),
            vec!["docker build --no-cache --build-arg CACHEBUST=1700000000 -t app:abc1234 -t app:latest ."]
        );
    }

    #[test]
    fn save_pipes_through_gzip() {
        let runner = FakeRunner::new();
        save_compressed(&runner, "app:abc1234", "app.tar.gz", &Env::new(), Path::new("."))
            .expect("save failed");
        assert_eq!(
            runner.command_lines(),
            vec!["bash -o pipefail -c docker save 'app:abc1234' | gzip > 'app.tar.gz'"]
        );
    }

    #[test]
    fn ping_uses_loopback() {
        assert_eq!(
            ping_args("test-mysql"),
            vec!["exec", "test-mysql", "mysqladmin", "ping", "-h127.0.0.1", "--silent"]
        );
    }
}

pub(crate) const DOCKER_NAME_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz-_0123456789";

/// A random, valid, container name
pub(crate) fn rng_docker_chars(n: u8) -> String {
    let mut rng = rand::thread_rng();
    format!(
        "bake-ci-{}",
        (0..n)
            .map(|_| {
                let idx = rng.gen_range(0..DOCKER_NAME_CHARSET.len());
                DOCKER_NAME_CHARSET[idx] as char
            })
            .collect::<String>()
    )
}

fn docker_cmd(
    runner: &dyn CommandRunner,
    args: &[&str],
    env: &Env,
    cwd: &Path,
) -> Result<(Invocation, CommandOutput)> {
    let inv = Invocation::new("docker", args, env, cwd);
    let output = runner.run(&inv)?;
    Ok((inv, output))
}

/// What `docker run -d` needs to know
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub env: Vec<(String, String)>,
    pub ports: Vec<String>,
    /// passed after the image name
    pub args: Vec<String>,
}

/// Starts a detached container
pub fn run_detached(
    runner: &dyn CommandRunner,
    spec: &ContainerSpec,
    env: &Env,
    cwd: &Path,
) -> Result<CommandOutput> {
    let env_args = spec
        .env
        .iter()
        .flat_map(|(k, v)| vec!["-e".to_string(), format!("{}={}", k, v)])
        .collect::<Vec<String>>();
    let port_args = spec
        .ports
        .iter()
        .flat_map(|p| vec!["-p".to_string(), p.clone()])
        .collect::<Vec<String>>();
    let args = {
        let mut args: Vec<&str> = vec!["run", "-d", "--name", spec.name.as_str()];
        args.extend(env_args.iter().map(|s| s.as_str()));
        args.extend(port_args.iter().map(|s| s.as_str()));
        args.push(&spec.image);
        args.extend(spec.args.iter().map(|s| s.as_str()));
        args
    };
    let (inv, output) = docker_cmd(runner, &args, env, cwd)?;
    if !output.success() {
        return Err(anyhow!(
            "Could not start container {} from {}: {}",
            spec.name,
            spec.image,
            output.stderr.trim()
        ));
    }
    output.check(&inv)
}

pub(crate) fn ping_args(container: &str) -> Vec<&str> {
    vec!["exec", container, "mysqladmin", "ping", "-h127.0.0.1", "--silent"]
}

/// Whether the database inside `container` answers a ping
pub fn mysql_ping(runner: &dyn CommandRunner, container: &str, env: &Env, cwd: &Path) -> Result<bool> {
    let (_, output) = docker_cmd(runner, &ping_args(container), env, cwd)?;
    Ok(output.success())
}

/// Runs `command` (argv) inside a running container
pub fn exec_in_container(
    runner: &dyn CommandRunner,
    container: &str,
    command: &[&str],
    env: &Env,
    cwd: &Path,
) -> Result<CommandOutput> {
    let mut args = vec!["exec", container];
    args.extend(command);
    let (inv, output) = docker_cmd(runner, &args, env, cwd)?;
    output.check(&inv)
}

#[derive(Debug, Clone, PartialEq)]
pub struct BuildSpec {
    pub dockerfile: Option<String>,
    pub context: String,
    pub tags: Vec<String>,
    pub build_args: Vec<(String, String)>,
    pub no_cache: bool,
}

/// Builds an image with every tag in `spec.tags`
pub fn build_image(runner: &dyn CommandRunner, spec: &BuildSpec, env: &Env, cwd: &Path) -> Result<()> {
    debug!("building {} from {}", spec.tags.join(", "), spec.context);
    let file_arg = spec.dockerfile.as_ref().map(|f| format!("--file={}", f));
    let build_args = spec
        .build_args
        .iter()
        .flat_map(|(k, v)| vec!["--build-arg".to_string(), format!("{}={}", k, v)])
        .collect::<Vec<String>>();
    let tag_args = spec
        .tags
        .iter()
        .flat_map(|t| vec!["-t".to_string(), t.clone()])
        .collect::<Vec<String>>();
    let args = {
        let mut args: Vec<&str> = vec!["build"];
        if spec.no_cache {
            args.push("--no-cache");
        }
        if let Some(f) = &file_arg {
            args.push(f);
        }
        args.extend(build_args.iter().map(|s| s.as_str()));
        args.extend(tag_args.iter().map(|s| s.as_str()));
        args.push(&spec.context);
        args
    };
    let (_, output) = docker_cmd(runner, &args, env, cwd)?;
    if !output.success() {
        return Err(anyhow!(
            "Could not build docker image {}: {}",
            spec.tags.join(", "),
            output.stderr.trim()
        ));
    }
    Ok(())
}

/// `docker save <image> | gzip > <archive>`
pub fn save_compressed(
    runner: &dyn CommandRunner,
    image: &str,
    archive: &str,
    env: &Env,
    cwd: &Path,
) -> Result<()> {
    let script = format!(
        "docker save {} | gzip > {}",
        shell_quote(image),
        shell_quote(archive)
    );
    let inv = Invocation::new("bash", &["-o", "pipefail", "-c", script.as_str()], env, cwd);
    runner.run(&inv)?.check(&inv)?;
    Ok(())
}

pub fn docker_stop(runner: &dyn CommandRunner, container: &str, env: &Env, cwd: &Path) -> Result<()> {
    let (inv, output) = docker_cmd(runner, &["stop", container], env, cwd)?;
    output.check(&inv).map(|_| ())
}

pub fn docker_remove_container(
    runner: &dyn CommandRunner,
    container: &str,
    env: &Env,
    cwd: &Path,
) -> Result<()> {
    let (_, output) = docker_cmd(runner, &["rm", container], env, cwd)?;
    if !output.success() {
        return Err(anyhow!("Could not remove docker container {}", container));
    }
    Ok(())
}
