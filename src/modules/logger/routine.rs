use crate::modules::error::{code::ErrorCode, MailVaultResult};
use crate::modules::settings::cli::SETTINGS;
use crate::modules::settings::dir::DATA_DIR_MANAGER;
use crate::raise_error;
use chrono::Local;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

/// Size-rotated log stream for one fetching routine.
///
/// Each routine writes to `<data>/logs/routines/<uuid>.log`; when the file
/// exceeds the configured size it is rotated to `.log.1` .. `.log.N` with
/// the oldest backup dropped. tracing-appender only rotates by time, so the
/// rotation is done here. The writer is opened per cycle and flushed and
/// closed when the cycle ends, independent of the archive database.
pub struct RoutineLogWriter {
    path: PathBuf,
    file: File,
    max_bytes: u64,
    backups: usize,
}

impl RoutineLogWriter {
    pub fn open(routine_uuid: &str) -> MailVaultResult<Self> {
        let path = DATA_DIR_MANAGER.routine_log_file(routine_uuid);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::InternalError))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::InternalError))?;
        Ok(Self {
            path,
            file,
            max_bytes: SETTINGS.mailvault_routine_log_max_bytes,
            backups: SETTINGS.mailvault_routine_log_backups,
        })
    }

    pub fn log(&mut self, line: &str) {
        let stamped = format!(
            "{} {}\n",
            Local::now().format("%Y-%m-%dT%H:%M:%S%.3f%:z"),
            line
        );
        if self.file.write_all(stamped.as_bytes()).is_err() {
            return;
        }
        if let Ok(meta) = self.file.metadata() {
            if meta.len() >= self.max_bytes {
                self.rotate();
            }
        }
    }

    /// Flush and fsync; called at cycle end.
    pub fn finish(&mut self) {
        let _ = self.file.flush();
        let _ = self.file.sync_all();
    }

    fn rotate(&mut self) {
        let _ = self.file.flush();
        // Shift <uuid>.log.{N-1} -> <uuid>.log.N, dropping the oldest.
        for index in (1..self.backups).rev() {
            let from = self.backup_path(index);
            let to = self.backup_path(index + 1);
            if from.exists() {
                let _ = std::fs::rename(&from, &to);
            }
        }
        if self.backups > 0 {
            let _ = std::fs::rename(&self.path, self.backup_path(1));
        } else {
            let _ = std::fs::remove_file(&self.path);
        }
        if let Ok(file) = OpenOptions::new().create(true).append(true).open(&self.path) {
            self.file = file;
        }
    }

    fn backup_path(&self, index: usize) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(format!(".{}", index));
        PathBuf::from(name)
    }
}

impl Drop for RoutineLogWriter {
    fn drop(&mut self) {
        self.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn writer_in(dir: &std::path::Path, max_bytes: u64, backups: usize) -> RoutineLogWriter {
        let path = dir.join("test-routine.log");
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .unwrap();
        RoutineLogWriter {
            path,
            file,
            max_bytes,
            backups,
        }
    }

    #[test]
    fn test_log_lines_are_appended() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = writer_in(dir.path(), 1024 * 1024, 2);
        writer.log("cycle started");
        writer.log("cycle finished");
        writer.finish();
        let content = std::fs::read_to_string(dir.path().join("test-routine.log")).unwrap();
        assert!(content.contains("cycle started"));
        assert!(content.contains("cycle finished"));
    }

    #[test]
    fn test_rotation_keeps_bounded_backups() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = writer_in(dir.path(), 128, 2);
        for i in 0..200 {
            writer.log(&format!("line {}", i));
        }
        writer.finish();
        assert!(dir.path().join("test-routine.log").exists());
        assert!(dir.path().join("test-routine.log.1").exists());
        assert!(!dir.path().join("test-routine.log.3").exists());
    }
}
