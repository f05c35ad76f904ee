//! Per-bean agent output logs.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::Result;

/// Lines of output quoted in crash reports.
pub const CRASH_TAIL_LINES: usize = 50;

/// Append-only log files under one directory, one per bean.
pub struct OutputLog {
    dir: PathBuf,
    open: HashMap<String, File>,
}

impl OutputLog {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            open: HashMap::new(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, bean_id: &str) -> PathBuf {
        log_path(&self.dir, bean_id)
    }

    /// Start a fresh log for a new run.
    pub fn truncate(&mut self, bean_id: &str) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        let file = File::create(self.path(bean_id))?;
        self.open.insert(bean_id.to_string(), file);
        Ok(())
    }

    pub fn append(&mut self, bean_id: &str, line: &str) -> Result<()> {
        if !self.open.contains_key(bean_id) {
            fs::create_dir_all(&self.dir)?;
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(self.path(bean_id))?;
            self.open.insert(bean_id.to_string(), file);
        }
        if let Some(file) = self.open.get_mut(bean_id) {
            writeln!(file, "{}", line)?;
        }
        Ok(())
    }

    /// Release the file handle once a run is over. The file stays on disk.
    pub fn close(&mut self, bean_id: &str) {
        self.open.remove(bean_id);
    }

    pub fn tail(&self, bean_id: &str, lines: usize) -> String {
        read_tail(&self.path(bean_id), lines)
    }
}

pub fn log_path(dir: &Path, bean_id: &str) -> PathBuf {
    dir.join(format!("{}.log", bean_id))
}

/// Last `lines` lines of a file. A missing or unreadable file reads as empty.
pub fn read_tail(path: &Path, lines: usize) -> String {
    let Ok(content) = fs::read_to_string(path) else {
        return String::new();
    };
    let all: Vec<&str> = content.lines().collect();
    let start = all.len().saturating_sub(lines);
    all[start..].join("\n")
}
