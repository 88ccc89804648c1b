use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use anyhow::Result;
use chrono::Utc;
use log::{debug, warn};

use crate::error::CiError;


/// Token proving the holder is the only active run. Released on drop.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
}

impl RunLock {
    /// Creates the lock file, failing with [CiError::AlreadyRunning] if a live run holds it.
    ///
    /// A lock whose pid no longer exists was left by a run that died; it is taken over once.
    pub fn acquire(path: &Path) -> Result<RunLock> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut f = match create(path) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => match holder(path) {
                Some(pid) if !is_alive(pid) => {
                    warn!(
                        "run lock {} was left by pid {} which is gone, taking it over",
                        path.display(),
                        pid
                    );
                    fs::remove_file(path)?;
                    create(path).map_err(|e| match e.kind() {
                        ErrorKind::AlreadyExists => anyhow::Error::from(CiError::AlreadyRunning {
                            path: path.to_path_buf(),
                        }),
                        _ => anyhow::Error::from(e),
                    })?
                }
                _ => {
                    return Err(CiError::AlreadyRunning {
                        path: path.to_path_buf(),
                    }
                    .into())
                }
            },
            Err(e) => return Err(e.into()),
        };
        write!(f, "pid {}\nstarted {}\n", std::process::id(), Utc::now().to_rfc3339())?;
        debug!("acquired run lock {}", path.display());
        Ok(RunLock {
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn create(path: &Path) -> std::io::Result<File> {
    OpenOptions::new().write(true).create_new(true).open(path)
}

/// The pid written in an existing lock file
fn holder(path: &Path) -> Option<u32> {
    let content = fs::read_to_string(path).ok()?;
    content
        .lines()
        .find_map(|l| l.strip_prefix("pid "))
        .and_then(|pid| pid.trim().parse().ok())
}

#[cfg(unix)]
fn is_alive(pid: u32) -> bool {
    let pid = match libc::pid_t::try_from(pid) {
        Ok(pid) => pid,
        Err(_) => return false,
    };
    // signal 0 only checks that the process exists
    if unsafe { libc::kill(pid, 0) } == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() != Some(libc::ESRCH)
}

#[cfg(not(unix))]
fn is_alive(_pid: u32) -> bool {
    true
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!("could not release run lock {}: {}", self.path.display(), e);
        } else {
            debug!("released run lock {}", self.path.display());
        }
    }
}
