//! File-based diagnostics sink.
//!
//! Used for wire-traffic tracing (`--trace-dap`) and as the destination for
//! the backend's structured log channel when `logDest` names a file.
//! Writes are line-oriented and append-only; the adapter's own stdout is
//! never touched, since it may carry protocol framing.

use anyhow::Context;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

#[derive(Clone)]
pub struct FileTracer {
    path: PathBuf,
    file: Arc<Mutex<File>>,
}

impl FileTracer {
    pub fn new(path: &Path) -> anyhow::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("open diagnostics file {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Arc::new(Mutex::new(file)),
        })
    }

    /// Destination path, kept for log lines about the tracer itself.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one line. Write failures are swallowed: tracing must never
    /// take the session down.
    pub fn line(&self, text: &str) {
        if let Ok(mut file) = self.file.lock() {
            let _ = writeln!(file, "{text}");
        }
    }

    /// Push pending bytes to disk; called at session boundaries.
    pub fn flush(&self) {
        if let Ok(mut file) = self.file.lock() {
            let _ = file.flush();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appends_lines_across_clones() {
        let path = std::env::temp_dir().join(format!(
            "daprox-tracer-test-{}.log",
            std::process::id()
        ));
        let _ = std::fs::remove_file(&path);

        let tracer = FileTracer::new(&path).unwrap();
        assert_eq!(tracer.path(), path.as_path());
        tracer.line("first");
        let clone = tracer.clone();
        clone.line("second");
        tracer.flush();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, "first\nsecond\n");
        let _ = std::fs::remove_file(&path);
    }
}
