use std::fs::{self, File};
use std::path::{Path, PathBuf};

use anyhow::Result;
use log::{debug, trace};

use crate::RunRecord;


/// Run records, one YAML file per run under `<state_dir>/runs`
#[derive(Debug, Clone)]
pub struct History {
    dir: PathBuf,
}

impl History {
    pub fn new(state_dir: &Path) -> Self {
        History {
            dir: state_dir.join("runs"),
        }
    }

    fn record_path(&self, number: u64) -> PathBuf {
        self.dir.join(format!("{}.yml", number))
    }

    /// Run numbers on disk, oldest first
    fn numbers(&self) -> Result<Vec<u64>> {
        if !self.dir.is_dir() {
            return Ok(vec![]);
        }
        let mut numbers = vec![];
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("yml") {
                continue;
            }
            if let Some(n) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<u64>().ok())
            {
                numbers.push(n);
            }
        }
        numbers.sort_unstable();
        Ok(numbers)
    }

    pub fn next_number(&self) -> Result<u64> {
        Ok(self.numbers()?.last().map(|n| n + 1).unwrap_or(1))
    }

    pub fn save(&self, record: &RunRecord) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir)?;
        let path = self.record_path(record.number);
        serde_yaml::to_writer(File::create(&path)?, record)?;
        debug!("saved run #{} to {}", record.number, path.display());
        Ok(path)
    }

    pub fn load(&self, number: u64) -> Result<RunRecord> {
        Ok(serde_yaml::from_reader(File::open(self.record_path(number))?)?)
    }

    /// Every retained record, newest first
    pub fn list(&self) -> Result<Vec<RunRecord>> {
        let mut records = vec![];
        for n in self.numbers()?.into_iter().rev() {
            records.push(self.load(n)?);
        }
        Ok(records)
    }

    /// Deletes the oldest records until at most `keep` remain. Returns the deleted run numbers.
    pub fn prune(&self, keep: usize) -> Result<Vec<u64>> {
        let numbers = self.numbers()?;
        if numbers.len() <= keep {
            return Ok(vec![]);
        }
        let excess = numbers.len() - keep;
        let mut removed = vec![];
        for n in numbers.into_iter().take(excess) {
            trace!("discarding run #{}", n);
            fs::remove_file(self.record_path(n))?;
            removed.push(n);
        }
        Ok(removed)
    }
}
