use std::thread;
use std::time::Duration;

use anyhow::Result;
use log::{debug, trace};
use serde::{Deserialize, Serialize};

use crate::error::CiError;


fn default_interval() -> u64 {
    2
}

fn default_max_attempts() -> u32 {
    60
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Eq, PartialEq)]
/// Bounded polling: at most `max_attempts` checks, `interval_secs` apart
pub struct Retry {
    #[serde(default = "default_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl Default for Retry {
    fn default() -> Self {
        Retry {
            interval_secs: default_interval(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl Retry {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// Calls `check` with the 1-based attempt number until it returns `Ok(true)`.
    /// Returns the number of attempts it took, or [CiError::NotReady] once the budget is spent.
    /// An `Err` from the check is not retried.
    pub fn poll<F>(&self, what: &str, mut check: F) -> Result<u32>
    where
        F: FnMut(u32) -> Result<bool>,
    {
        let max = self.max_attempts.max(1);
        for attempt in 1..=max {
            trace!("checking {} ({}/{})", what, attempt, max);
            if check(attempt)? {
                debug!("{} ready after {} attempt(s)", what, attempt);
                return Ok(attempt);
            }
            if attempt < max {
                thread::sleep(self.interval());
            }
        }
        Err(CiError::NotReady {
            what: what.to_string(),
            attempts: max,
        }
        .into())
    }
}
