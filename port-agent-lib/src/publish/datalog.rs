#![forbid(unsafe_code)]

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Local;
use tracing::{debug, info};

use crate::config::RotationInterval;
use crate::error::{AgentError, Result};

/// Append-safe log file with optional time-based rolling.
///
/// With an explicit filename the same file is always appended. With a base
/// name the target is derived as `{base}.{stamp}[.{ext}]`, so the file
/// rolls when the stamp changes. Every write re-checks that the open
/// handle still points at the right, still-existing file and reopens in
/// append mode when it does not. Files are extended, never truncated.
pub struct DataLog {
    filename: Option<PathBuf>,
    base: Option<PathBuf>,
    extension: Option<String>,
    rotation: RotationInterval,
    stream: Option<File>,
    open_path: Option<PathBuf>,
}

impl DataLog {
    pub fn with_filename(path: &Path) -> Self {
        Self {
            filename: Some(path.to_path_buf()),
            base: None,
            extension: None,
            rotation: RotationInterval::Daily,
            stream: None,
            open_path: None,
        }
    }

    pub fn with_base(base: &Path, extension: &str) -> Self {
        Self {
            filename: None,
            base: Some(base.to_path_buf()),
            extension: (!extension.is_empty()).then(|| extension.to_string()),
            rotation: RotationInterval::Daily,
            stream: None,
            open_path: None,
        }
    }

    pub fn set_rotation(&mut self, rotation: RotationInterval) {
        self.rotation = rotation;
    }

    /// Identity for duplicate detection in the publisher list.
    pub fn identity(&self) -> (Option<&Path>, Option<&Path>, Option<&str>) {
        (
            self.filename.as_deref(),
            self.base.as_deref(),
            self.extension.as_deref(),
        )
    }

    /// The file writes should currently land in.
    pub fn current_filename(&self) -> Result<PathBuf> {
        if let Some(name) = &self.filename {
            return Ok(name.clone());
        }

        if let Some(base) = &self.base {
            let stamp = match self.rotation {
                RotationInterval::Daily => Local::now().format("%Y%m%d").to_string(),
                RotationInterval::Hourly => Local::now().format("%Y%m%d%H").to_string(),
            };
            let mut name = base.as_os_str().to_owned();
            name.push(format!(".{stamp}"));
            if let Some(ext) = &self.extension {
                name.push(format!(".{ext}"));
            }
            return Ok(PathBuf::from(name));
        }

        Err(AgentError::LogFileNotSet)
    }

    /// Append raw bytes, reopening the stream when the target file rolled,
    /// was removed, or the handle went bad.
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        let target = self.current_filename()?;

        let stale = match (&self.stream, &self.open_path) {
            (Some(_), Some(open)) => open != &target || !target.exists(),
            _ => true,
        };

        if stale {
            debug!(path = %target.display(), "opening data log for append");
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&target)
                .map_err(|e| AgentError::LogOpenFailure(format!("{}: {e}", target.display())))?;
            if self.open_path.as_deref() != Some(target.as_path()) {
                info!(path = %target.display(), "data log file");
            }
            self.stream = Some(file);
            self.open_path = Some(target.clone());
        }

        let stream = self.stream.as_mut().ok_or(AgentError::LogFileNotSet)?;
        if let Err(e) = stream.write_all(data) {
            // Drop the handle so the next write reopens.
            self.stream = None;
            self.open_path = None;
            return Err(AgentError::LogWriteFailure(e.to_string()));
        }

        Ok(())
    }

    pub fn flush(&mut self) {
        if let Some(stream) = self.stream.as_mut() {
            let _ = stream.flush();
        }
    }
}
