use std::path::Path;
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Result;
use clap::{App, AppSettings, Arg, ArgMatches, SubCommand};
use log::{debug, error, info, trace, warn, LevelFilter};

use bakeci::conf::PipelineConfig;
use bakeci::error::CiError;
use bakeci::history::History;
use bakeci::launch_interruptible;
use bakeci::secrets::{EnvSecretProvider, FileSecretProvider, SecretProvider};
use bakeci::utils::runner::ShellRunner;
use bakeci::watch::HeadWatcher;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() {
    let matches = App::new("bake-ci")
        .version(VERSION)
        .about("Tests, builds and deploys the django bakery app, one stage after the other")
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("FILE")
                .help("Sets the pipeline file")
                .takes_value(true)
                .default_value("bake-ci.yml"),
        )
        .arg(
            Arg::with_name("secrets")
                .long("secrets")
                .value_name("FILE")
                .help("Reads credentials from a YAML file instead of BAKE_CI_SECRET_* variables")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .multiple(true)
                .help("Logs more; repeat for even more"),
        )
        .subcommand(SubCommand::with_name("run").about("Runs the pipeline once"))
        .subcommand(
            SubCommand::with_name("watch")
                .about("Runs the pipeline every time the checked out branch moves")
                .arg(
                    Arg::with_name("interval")
                        .long("interval")
                        .value_name("SECONDS")
                        .takes_value(true)
                        .default_value("60"),
                ),
        )
        .subcommand(
            SubCommand::with_name("history")
                .about("Lists the retained runs, newest first")
                .arg(
                    Arg::with_name("limit")
                        .long("limit")
                        .short("n")
                        .takes_value(true),
                ),
        )
        .get_matches();

    let level = match matches.occurrences_of("verbose") {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    pretty_env_logger::formatted_timed_builder()
        .filter_level(level)
        .parse_filters(&std::env::var("RUST_LOG").unwrap_or_default())
        .init();

    match dispatch(&matches) {
        Ok(true) => {}
        Ok(false) => process::exit(1),
        Err(e) => {
            error!("{:#}", e);
            process::exit(2);
        }
    }
}

/// `Ok(false)` when a run failed
fn dispatch(matches: &ArgMatches) -> Result<bool> {
    let config_file = matches.value_of("config").unwrap_or("bake-ci.yml");
    let config = PipelineConfig::from_file(Path::new(config_file))?;
    debug!("config: {:#?}", config);
    let secrets: Box<dyn SecretProvider> = match matches.value_of("secrets") {
        Some(f) => Box::new(FileSecretProvider::from_file(Path::new(f))?),
        None => Box::new(EnvSecretProvider::default()),
    };
    match matches.subcommand() {
        ("run", _) => {
            let term = termination_flag()?;
            let record = launch_interruptible(&config, &ShellRunner, secrets.as_ref(), &term)?;
            Ok(record.succeeded())
        }
        ("watch", Some(m)) => {
            let interval: u64 = m.value_of("interval").unwrap_or("60").parse()?;
            watch(&config, secrets.as_ref(), Duration::from_secs(interval))?;
            Ok(true)
        }
        ("history", Some(m)) => {
            let limit = match m.value_of("limit") {
                Some(l) => Some(l.parse::<usize>()?),
                None => None,
            };
            history(&config, limit)?;
            Ok(true)
        }
        _ => Ok(true),
    }
}

/// Set on SIGTERM or SIGINT; a run in progress stops before its next stage
fn termination_flag() -> Result<Arc<AtomicBool>> {
    let term = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&term))?;
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&term))?;
    Ok(term)
}

fn watch(config: &PipelineConfig, secrets: &dyn SecretProvider, wait_period: Duration) -> Result<()> {
    let term = termination_flag()?;
    let watcher = HeadWatcher::from_config(config)?;
    info!("Watching {}#{}", watcher.url, watcher.branch);
    while !term.load(Ordering::Relaxed) {
        match watcher.poll(&ShellRunner, secrets) {
            Ok(None) => {}
            Ok(Some(head)) => {
                info!("Detected change in {}#{}: {}", watcher.url, watcher.branch, head);
                match launch_interruptible(config, &ShellRunner, secrets, &term) {
                    Ok(record) => {
                        debug!("run #{} ended: {:?}", record.number, record.status);
                        // an interrupted run builds the same head again next time
                        if !term.load(Ordering::Relaxed) {
                            watcher.remember(&head)?;
                        }
                    }
                    Err(e) => match e.downcast_ref::<CiError>() {
                        Some(CiError::AlreadyRunning { .. }) => {
                            warn!("{}, will retry", e)
                        }
                        _ => error!("could not start a run: {:#}", e),
                    },
                }
            }
            Err(e) => warn!("could not poll {}: {:#}", watcher.url, e),
        }
        trace!("Waiting {:?}", wait_period);
        // sleep in short steps so a signal is honoured quickly
        let mut waited = Duration::ZERO;
        while waited < wait_period && !term.load(Ordering::Relaxed) {
            let step = Duration::from_millis(500).min(wait_period - waited);
            thread::sleep(step);
            waited += step;
        }
    }
    info!("Exiting");
    Ok(())
}

fn history(config: &PipelineConfig, limit: Option<usize>) -> Result<()> {
    let records = History::new(&config.options.state_dir).list()?;
    for r in records.iter().take(limit.unwrap_or(usize::MAX)) {
        let date = r
            .start_date
            .map(|d| d.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_default();
        let commit = r
            .commit
            .as_ref()
            .map(|c| c.short_hash.as_str())
            .unwrap_or("-");
        match &r.failed_stage {
            None => println!("#{:<5} {} {:<9} {} {}", r.number, date, r.status.as_str(), commit, r.image_tag.as_deref().unwrap_or("-")),
            Some(stage) => println!("#{:<5} {} {:<9} {} failed at \"{}\"", r.number, date, r.status.as_str(), commit, stage),
        }
    }
    Ok(())
}
