use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use simplelog::{
    ColorChoice, CombinedLogger, ConfigBuilder, LevelFilter, SharedLogger, TermLogger,
    TerminalMode, WriteLogger,
};
use upgate_platform::AppPaths;

/// Append-only log file that is reopened when something deletes it while the
/// process is running.
struct ReopeningLogFile {
    path: PathBuf,
    file: Mutex<Option<File>>,
}

impl ReopeningLogFile {
    fn open(path: PathBuf) -> io::Result<Self> {
        let file = append_to(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(Some(file)),
        })
    }

    fn handle(&self) -> io::Result<MutexGuard<'_, Option<File>>> {
        let mut guard = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        if guard.is_none() || !self.path.exists() {
            if let Some(parent) = self.path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            *guard = Some(append_to(&self.path)?);
        }
        Ok(guard)
    }
}

fn append_to(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

impl Write for ReopeningLogFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.handle()?.as_mut() {
            Some(file) => file.write(buf),
            None => Err(io::Error::other("log file not available")),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut guard = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        guard.as_mut().map_or(Ok(()), File::flush)
    }
}

/// Drop the older half of the log, cutting at a line boundary. Returns whether
/// anything was trimmed.
fn trim_oversized_log(log_path: &Path, max_log_size: u64) -> bool {
    let oversized = std::fs::metadata(log_path).is_ok_and(|meta| meta.len() > max_log_size);
    if !oversized {
        return false;
    }
    let Ok(contents) = std::fs::read(log_path) else {
        return false;
    };

    let half = contents.len() / 2;
    let keep_from = contents[half..]
        .iter()
        .position(|&byte| byte == b'\n')
        .map_or(half, |offset| half + offset + 1);
    std::fs::write(log_path, &contents[keep_from..]).is_ok()
}

/// Install the global logger: a file logger at `paths.log_file()` and, when
/// `echo_to_terminal` is set or in debug builds, a terminal logger on stderr.
pub fn init_logging(
    paths: &AppPaths,
    debug_enabled: bool,
    echo_to_terminal: bool,
    max_log_size: u64,
) {
    let _ = paths.ensure_dirs();
    let log_path = paths.log_file();

    let trimmed = trim_oversized_log(&log_path, max_log_size);

    let config = ConfigBuilder::new()
        .set_time_format_rfc3339()
        .add_filter_allow_str("upgate")
        .build();

    let mut loggers: Vec<Box<dyn SharedLogger>> = Vec::new();
    if let Ok(writer) = ReopeningLogFile::open(log_path.clone()) {
        loggers.push(WriteLogger::new(LevelFilter::Debug, config.clone(), writer));
    }
    if echo_to_terminal || cfg!(debug_assertions) {
        loggers.push(TermLogger::new(
            LevelFilter::Debug,
            config,
            TerminalMode::Stderr,
            ColorChoice::Auto,
        ));
    }

    if !loggers.is_empty() {
        let _ = CombinedLogger::init(loggers);
    }

    set_logging_enabled(debug_enabled || echo_to_terminal);
    log::debug!("Logging initialized, log file: {}", log_path.display());
    if trimmed {
        log::debug!("Trimmed log file above {max_log_size} bytes");
    }
}

pub fn set_logging_enabled(enabled: bool) {
    log::set_max_level(if enabled {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Warn
    });
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use super::{ReopeningLogFile, set_logging_enabled, trim_oversized_log};

    #[test]
    fn log_file_is_recreated_after_deletion() {
        let temp_dir = tempfile::tempdir().expect("temporary directory should be created");
        let log_path = temp_dir.path().join("logs").join("debug.log");
        std::fs::create_dir_all(log_path.parent().expect("log path has a parent"))
            .expect("log dir should be created");
        let mut writer =
            ReopeningLogFile::open(log_path.clone()).expect("writer should open log file");

        writer
            .write_all(b"check started\n")
            .expect("initial write should succeed");
        std::fs::remove_dir_all(temp_dir.path().join("logs")).expect("log dir should be removable");
        writer
            .write_all(b"check finished\n")
            .expect("writer should recreate file after deletion");

        let contents =
            std::fs::read_to_string(&log_path).expect("recreated file should be readable");
        assert_eq!(contents, "check finished\n");
    }

    #[test]
    fn oversized_log_keeps_newest_lines() {
        let temp_dir = tempfile::tempdir().expect("temporary directory should be created");
        let log_path = temp_dir.path().join("debug.log");
        std::fs::write(&log_path, "a-1\na-2\na-3\na-4\na-5\na-6\n")
            .expect("test log file should be written");

        assert!(trim_oversized_log(&log_path, 8));

        let trimmed =
            std::fs::read_to_string(&log_path).expect("trimmed log file should be readable");
        assert_eq!(trimmed, "a-5\na-6\n");
    }

    #[test]
    fn small_or_missing_log_is_left_alone() {
        let temp_dir = tempfile::tempdir().expect("temporary directory should be created");
        let log_path = temp_dir.path().join("debug.log");
        assert!(!trim_oversized_log(&log_path, 8));

        std::fs::write(&log_path, "short\n").expect("test log file should be written");
        assert!(!trim_oversized_log(&log_path, 1024));
        assert_eq!(
            std::fs::read_to_string(&log_path).expect("log should be readable"),
            "short\n"
        );
    }

    #[test]
    fn disabling_logging_keeps_warnings() {
        set_logging_enabled(true);
        assert_eq!(log::max_level(), log::LevelFilter::Debug);

        set_logging_enabled(false);
        assert_eq!(log::max_level(), log::LevelFilter::Warn);
    }
}
