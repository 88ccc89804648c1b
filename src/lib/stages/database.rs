use anyhow::Result;
use log::info;

use crate::conf::DatabaseConfig;
use crate::stages::{Resource, RunContext};
use crate::utils::docker::{exec_in_container, mysql_ping, rng_docker_chars, run_detached, ContainerSpec};

#[cfg(test)]
mod tests {
    use std::path::Path;

    use pretty_assertions::assert_eq;

    use crate::conf::DatabaseConfig;
    use crate::error::CiError;
    use crate::secrets::FileSecretProvider;
    use crate::stages::database::{grant_sql, run};
    use crate::stages::{Resource, RunContext};
    use crate::utils::redact::Redactor;
    use crate::utils::retry::Retry;
    use crate::utils::tests::FakeRunner;
    use crate::Env;

    fn config(max_attempts: u32) -> DatabaseConfig {
        DatabaseConfig {
            container: Some("test-mysql".to_string()),
            image: "mysql:8.0".to_string(),
            root_password: "rootpass".to_string(),
            database: "${DB_NAME}".to_string(),
            user: "${DB_USER}".to_string(),
            password: "${DB_PASSWORD}".to_string(),
            port: 3306,
            args: vec![],
            readiness: Retry {
                interval_secs: 0,
                max_attempts,
            },
            grant: true,
        }
    }

    fn env() -> Env {
        let mut env = Env::new();
        env.insert("DB_NAME".to_string(), "bake_db".to_string());
        env.insert("DB_USER".to_string(), "baker".to_string());
        env.insert("DB_PASSWORD".to_string(), "s3cret".to_string());
        env
    }

    #[test]
    fn starts_waits_and_grants() {
        let runner = FakeRunner::new();
        let secrets = FileSecretProvider::default();
        let mut ctx = RunContext::new(&runner, &secrets, Redactor::default(), env(), Path::new("."));
        run(&config(5), &mut ctx).expect("database stage failed");
        let lines = runner.command_lines();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("docker run -d --name test-mysql -e MYSQL_ROOT_PASSWORD=rootpass -e MYSQL_DATABASE=bake_db -e MYSQL_USER=baker -e MYSQL_PASSWORD=s3cret -p 3306:3306 mysql:8.0"));
        assert_eq!(lines[1], "docker exec test-mysql mysqladmin ping -h127.0.0.1 --silent");
        assert!(lines[2].starts_with("docker exec test-mysql mysql -uroot -prootpass -e"));
        assert_eq!(ctx.resources, vec![Resource::Container("test-mysql".to_string())]);
    }

    #[test]
    fn never_ready_is_bounded() {
        let runner = FakeRunner::new().fail_on("docker exec test-mysql mysqladmin ping");
        let secrets = FileSecretProvider::default();
        let mut ctx = RunContext::new(&runner, &secrets, Redactor::default(), env(), Path::new("."));
        let err = run(&config(3), &mut ctx).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CiError>(),
            Some(CiError::NotReady { attempts: 3, .. })
        ));
        assert_eq!(runner.count("docker exec test-mysql mysqladmin ping"), 3);
        // registered even though the stage failed, so cleanup removes it
        assert_eq!(ctx.resources.len(), 1);
    }

    #[test]
    fn grant_statement() {
        assert_eq!(
            grant_sql("baker", "it's"),
            "CREATE USER IF NOT EXISTS 'baker'@'%' IDENTIFIED BY 'it''s'; GRANT ALL PRIVILEGES ON *.* TO 'baker'@'%' WITH GRANT OPTION; FLUSH PRIVILEGES;"
        );
    }
}

fn sql_string(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

pub(crate) fn grant_sql(user: &str, password: &str) -> String {
    let user = sql_string(user);
    format!(
        "CREATE USER IF NOT EXISTS {user}@'%' IDENTIFIED BY {pw}; GRANT ALL PRIVILEGES ON *.* TO {user}@'%' WITH GRANT OPTION; FLUSH PRIVILEGES;",
        user = user,
        pw = sql_string(password)
    )
}

/// Starts the test database, waits until it answers, then lets the application user in
pub fn run(c: &DatabaseConfig, ctx: &mut RunContext) -> Result<()> {
    let name = match &c.container {
        Some(n) => ctx.expand(n),
        None => rng_docker_chars(8),
    };
    let user = ctx.expand(&c.user);
    let password = ctx.expand(&c.password);
    let spec = ContainerSpec {
        name: name.clone(),
        image: ctx.expand(&c.image),
        env: vec![
            ("MYSQL_ROOT_PASSWORD".to_string(), ctx.expand(&c.root_password)),
            ("MYSQL_DATABASE".to_string(), ctx.expand(&c.database)),
            ("MYSQL_USER".to_string(), user.clone()),
            ("MYSQL_PASSWORD".to_string(), password.clone()),
        ],
        ports: vec![format!("{}:3306", c.port)],
        args: c.args.iter().map(|a| ctx.expand(a)).collect(),
    };
    // registered first: a half-started container must be removed too
    ctx.register(Resource::Container(name.clone()));
    run_detached(&ctx.runner, &spec, &ctx.env, &ctx.workdir)?;

    info!("Waiting for {} to be ready...", name);
    c.readiness.poll(&name, |_| mysql_ping(&ctx.runner, &name, &ctx.env, &ctx.workdir))?;

    if c.grant {
        info!("Creating user and granting privileges...");
        let root = format!("-p{}", ctx.expand(&c.root_password));
        let sql = grant_sql(&user, &password);
        exec_in_container(
            &ctx.runner,
            &name,
            &["mysql", "-uroot", root.as_str(), "-e", sql.as_str()],
            &ctx.env,
            &ctx.workdir,
        )?;
    }
    Ok(())
}
