//! A simple file-based logger for workflow runs.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;

pub struct RunLogger {
    file: Option<File>,
    verbose: bool,
}

impl RunLogger {
    /// Creates a logger writing under `<data_dir>/logs/`. With no data
    /// directory configured the logger only echoes in verbose mode.
    pub fn new(data_dir: Option<&Path>, verbose: bool) -> io::Result<Self> {
        let file = match data_dir {
            Some(dir) => {
                let log_dir = dir.join("logs");
                fs::create_dir_all(&log_dir)?;
                let stamp = chrono::Local::now().format("%Y%m%d-%H%M%S");
                let path = log_dir.join(format!("run-{}.log", stamp));
                Some(OpenOptions::new().create(true).append(true).open(path)?)
            }
            None => None,
        };
        Ok(RunLogger { file, verbose })
    }

    pub fn disabled() -> Self {
        RunLogger {
            file: None,
            verbose: false,
        }
    }

    pub fn log(&mut self, message: &str) {
        let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
        if let Some(file) = &mut self.file {
            let _ = writeln!(file, "[{}] {}", timestamp, message);
        }
        if self.verbose {
            eprintln!("[{}] {}", timestamp, message);
        }
    }
}
