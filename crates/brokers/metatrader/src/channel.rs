//! Shared-directory file channel.
//!
//! The bridge owns the command file, the terminal owns the response file.
//! Command writes go through a temp file in the same directory followed by a
//! rename, so the terminal never opens a half-written command.

use crate::protocol::{decode_response, Response};
use mtbridge_core::BridgeConfig;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, trace};

static TEMP_SEQ: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone)]
pub struct FileChannel {
    dir: PathBuf,
    command_file: String,
    command_path: PathBuf,
    response_path: PathBuf,
}

impl FileChannel {
    pub fn new(config: &BridgeConfig) -> Self {
        Self {
            dir: config.base_dir.clone(),
            command_file: config.command_file.clone(),
            command_path: config.command_path(),
            response_path: config.response_path(),
        }
    }

    pub fn command_path(&self) -> &Path {
        &self.command_path
    }

    pub fn response_path(&self) -> &Path {
        &self.response_path
    }

    pub fn ensure_dir(&self) -> io::Result<()> {
        fs::create_dir_all(&self.dir)
    }

    /// Atomically replace the command file with `bytes`.
    pub fn write_command(&self, bytes: &[u8]) -> io::Result<()> {
        let temp_path = self.temp_path();
        {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&temp_path)?;
            file.write_all(bytes)?;
            file.sync_all()?;
        }

        if let Err(e) = fs::rename(&temp_path, &self.command_path) {
            let _ = fs::remove_file(&temp_path);
            return Err(e);
        }
        trace!(path = %self.command_path.display(), bytes = bytes.len(), "Command file written");
        Ok(())
    }

    /// A command file that is still on disk has not been consumed by the terminal.
    pub fn command_exists(&self) -> bool {
        self.command_path.exists()
    }

    pub fn remove_command(&self) -> io::Result<bool> {
        remove_if_present(&self.command_path)
    }

    /// Read and decode the response file without consuming it.
    ///
    /// `None` when the file is missing, blank, or not decodable yet (the
    /// terminal may still be writing it). The file is left in place either way;
    /// deletion is the caller's decision once the id has been matched.
    pub fn try_read_response(&self) -> io::Result<Option<Response>> {
        let bytes = match fs::read(&self.response_path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };

        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(None);
        }

        match decode_response(&bytes) {
            Ok(response) => Ok(Some(response)),
            Err(e) => {
                trace!(error = %e, "Response file not readable yet");
                Ok(None)
            }
        }
    }

    pub fn remove_response(&self) -> io::Result<bool> {
        remove_if_present(&self.response_path)
    }

    /// Remove command, response, and leftover temp files from a previous run.
    pub fn clear_stale(&self) -> io::Result<usize> {
        let mut removed = 0;
        if self.remove_command()? {
            removed += 1;
        }
        if self.remove_response()? {
            removed += 1;
        }

        let temp_prefix = format!(".{}.", self.command_file);
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with(&temp_prefix) && name.ends_with(".tmp") {
                if remove_if_present(&entry.path())? {
                    removed += 1;
                }
            }
        }

        if removed > 0 {
            debug!(removed, dir = %self.dir.display(), "Cleared stale bridge files");
        }
        Ok(removed)
    }

    fn temp_path(&self) -> PathBuf {
        let seq = TEMP_SEQ.fetch_add(1, Ordering::Relaxed);
        self.dir
            .join(format!(".{}.{}.{}.tmp", self.command_file, process::id(), seq))
    }
}

fn remove_if_present(path: &Path) -> io::Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn channel(dir: &TempDir) -> FileChannel {
        FileChannel::new(&BridgeConfig::with_base_dir(dir.path()))
    }

    #[test]
    fn test_write_replaces_command_without_leftovers() {
        let dir = TempDir::new().unwrap();
        let channel = channel(&dir);

        channel.write_command(br#"{"id":"1"}"#).unwrap();
        channel.write_command(br#"{"id":"2"}"#).unwrap();

        assert_eq!(fs::read(channel.command_path()).unwrap(), br#"{"id":"2"}"#);
        let names: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["command.json".to_string()]);
    }

    #[test]
    fn test_missing_or_blank_response_is_absent() {
        let dir = TempDir::new().unwrap();
        let channel = channel(&dir);
        assert!(channel.try_read_response().unwrap().is_none());

        fs::write(channel.response_path(), "  \n").unwrap();
        assert!(channel.try_read_response().unwrap().is_none());
    }

    #[test]
    fn test_partial_response_stays_on_disk() {
        let dir = TempDir::new().unwrap();
        let channel = channel(&dir);

        fs::write(channel.response_path(), r#"{"id":"a1","resu"#).unwrap();
        assert!(channel.try_read_response().unwrap().is_none());
        assert!(channel.response_path().exists());

        fs::write(channel.response_path(), r#"{"id":"a1","result":"ok"}"#).unwrap();
        let response = channel.try_read_response().unwrap().unwrap();
        assert_eq!(response.result, Some(json!("ok")));
        assert!(channel.response_path().exists());
    }

    #[test]
    fn test_remove_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let channel = channel(&dir);

        fs::write(channel.response_path(), "{}").unwrap();
        assert!(channel.remove_response().unwrap());
        assert!(!channel.remove_response().unwrap());
        assert!(!channel.remove_command().unwrap());
    }

    #[test]
    fn test_clear_stale_removes_bridge_files_only() {
        let dir = TempDir::new().unwrap();
        let channel = channel(&dir);

        channel.write_command(b"{}").unwrap();
        fs::write(channel.response_path(), "{}").unwrap();
        fs::write(dir.path().join(".command.json.999.0.tmp"), "{").unwrap();
        fs::write(dir.path().join("journal.log"), "keep").unwrap();

        assert_eq!(channel.clear_stale().unwrap(), 3);
        assert!(!channel.command_exists());
        assert!(!channel.response_path().exists());
        assert!(dir.path().join("journal.log").exists());
    }
}
