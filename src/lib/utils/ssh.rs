use std::path::Path;

use anyhow::Result;
use log::debug;

use crate::utils::runner::{CommandOutput, CommandRunner, Invocation};
use crate::Env;

#[cfg(test)]
mod tests {
    use std::path::Path;

    use pretty_assertions::assert_eq;

    use crate::utils::ssh::SshTarget;
    use crate::utils::tests::FakeRunner;
    use crate::Env;

    fn target() -> SshTarget {
        SshTarget {
            host: "192.168.1.182".to_string(),
            user: "root".to_string(),
            port: 22,
            identity_file: None,
            strict_host_key_checking: false,
        }
    }

    #[test]
    fn scp_args() {
        let runner = FakeRunner::new();
        target()
            .copy_to(&runner, "app.tar.gz", "/tmp/", &Env::new(), Path::new("."))
            .expect("scp failed");
        assert_eq!(
            runner.command_lines(),
            vec!["scp -o StrictHostKeyChecking=no -o BatchMode=yes -o ConnectTimeout=10 app.tar.gz root@192.168.1.182:/tmp/"]
        );
    }

    #[test]
    fn ssh_with_key_and_port() {
        let runner = FakeRunner::new();
        let t = SshTarget {
            port: 2222,
            identity_file: Some("/keys/devops".to_string()),
            strict_host_key_checking: true,
            ..target()
        };
        t.execute(&runner, "uptime", &Env::new(), Path::new("."))
            .expect("ssh failed");
        let calls = runner.calls.borrow();
        assert_eq!(calls[0].program, "ssh");
        assert_eq!(
            calls[0].args,
            vec![
                "-i",
                "/keys/devops",
                "-p",
                "2222",
                "-o",
                "BatchMode=yes",
                "-o",
                "ConnectTimeout=10",
                "root@192.168.1.182",
                "sh",
                "-s"
            ]
        );
        assert_eq!(calls[0].stdin.as_deref(), Some("uptime"));
    }
}

/// A host reachable with ssh/scp
#[derive(Debug, Clone, PartialEq)]
pub struct SshTarget {
    pub host: String,
    pub user: String,
    pub port: u16,
    pub identity_file: Option<String>,
    pub strict_host_key_checking: bool,
}

impl SshTarget {
    pub fn destination(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }

    /// options shared by ssh and scp; scp spells the port flag differently
    fn common_args(&self, port_flag: &str) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(identity_file) = &self.identity_file {
            args.push("-i".to_string());
            args.push(identity_file.clone());
        }
        if self.port != 22 {
            args.push(port_flag.to_string());
            args.push(self.port.to_string());
        }
        if !self.strict_host_key_checking {
            args.push("-o".to_string());
            args.push("StrictHostKeyChecking=no".to_string());
        }
        args.extend([
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "ConnectTimeout=10".to_string(),
        ]);
        args
    }

    /// `scp <local> <user>@<host>:<remote_dir>`
    pub fn copy_to(
        &self,
        runner: &dyn CommandRunner,
        local: &str,
        remote_dir: &str,
        env: &Env,
        cwd: &Path,
    ) -> Result<CommandOutput> {
        let mut args = self.common_args("-P");
        args.push(local.to_string());
        args.push(format!("{}:{}", self.destination(), remote_dir));
        let args = args.iter().map(|s| s.as_str()).collect::<Vec<&str>>();
        let inv = Invocation::new("scp", &args, env, cwd);
        debug!("copying {} to {}:{}", local, self.host, remote_dir);
        runner.run(&inv)?.check(&inv)
    }

    /// Runs `script` in a single ssh session, fed to the remote `sh` on stdin
    pub fn execute(
        &self,
        runner: &dyn CommandRunner,
        script: &str,
        env: &Env,
        cwd: &Path,
    ) -> Result<CommandOutput> {
        let mut args = self.common_args("-p");
        args.push(self.destination());
        args.push("sh".to_string());
        args.push("-s".to_string());
        let args = args.iter().map(|s| s.as_str()).collect::<Vec<&str>>();
        let inv = Invocation::new("ssh", &args, env, cwd).with_stdin(script);
        runner.run(&inv)?.check(&inv)
    }
}
