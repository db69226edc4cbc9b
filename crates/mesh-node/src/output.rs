use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;

/// Where JSONL events go: stdout always, plus an optional per-run file.
pub struct Output {
    file: Option<BufWriter<File>>,
}

impl Output {
    pub fn stdout() -> Self {
        Self { file: None }
    }

    /// Also append to `<dir>/mesh-node_<id>_<YYYYMMDD-HHMMSS>.jsonl`.
    pub fn with_dir(dir: &Path, id: &str) -> io::Result<(Self, PathBuf)> {
        fs::create_dir_all(dir)?;
        let timestamp = chrono::Local::now().format("%Y%m%d-%H%M%S");
        let path = unique_path(dir, &format!("mesh-node_{}_{timestamp}", file_stem(id)), "jsonl");
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok((
            Self {
                file: Some(BufWriter::new(file)),
            },
            path,
        ))
    }

    /// Write one event as a JSON line, flushed so piped readers see it at once.
    pub fn emit<T: Serialize>(&mut self, event: &T) {
        let Ok(json) = serde_json::to_string(event) else {
            return;
        };
        let stdout = io::stdout();
        let mut lock = stdout.lock();
        let _ = writeln!(lock, "{json}");
        let _ = lock.flush();

        if let Some(file) = self.file.as_mut() {
            if let Err(e) = writeln!(file, "{json}").and_then(|()| file.flush()) {
                tracing::warn!("output: dropping JSONL file after write error: {e}");
                self.file = None;
            }
        }
    }
}

/// Identity made safe for a file name.
fn file_stem(id: &str) -> String {
    if id.is_empty() {
        return "dial-only".to_string();
    }
    id.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' { c } else { '-' })
        .collect()
}

/// First of `base.ext`, `base_2.ext`, `base_3.ext`, ... that does not exist.
fn unique_path(dir: &Path, base: &str, ext: &str) -> PathBuf {
    let mut candidate = dir.join(format!("{base}.{ext}"));
    let mut n = 2;
    while candidate.exists() {
        candidate = dir.join(format!("{base}_{n}.{ext}"));
        n += 1;
    }
    candidate
}
