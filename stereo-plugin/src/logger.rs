use std::{fs, path::Path, sync::Once};

use thiserror::Error;

use crate::config::LogConfig;

static LOGGER_INITIALIZED: Once = Once::new();

#[derive(Debug, Error)]
pub enum LoggerError {
    #[error("Log adapter error: {0}")]
    Fern(#[from] fern::InitError),

    #[error("Logger was already initialized")]
    AlreadyInitialized,
}

/// Global logger
/// Based on crate "fern"
pub struct GlobalLogger;

impl GlobalLogger {
    /// Sets up stdout and file logging once per process
    pub fn init(config: &LogConfig) -> Result<(), LoggerError> {
        let mut result = Err(LoggerError::AlreadyInitialized);

        LOGGER_INITIALIZED.call_once(|| {
            result = Self::setup(config).map_err(LoggerError::from);
        });

        result
    }

    fn setup(config: &LogConfig) -> Result<(), fern::InitError> {
        let directory = Path::new(&config.directory);
        fs::create_dir_all(directory)?;

        let timestamp = chrono::Local::now().format("%Y-%m-%d_%H-%M-%S");
        let log_file = directory.join(format!("stereo_{timestamp}.log"));

        fern::Dispatch::new()
            .format(|out, message, record| {
                out.finish(format_args!(
                    "[{} {} {}] {}",
                    chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                    record.level(),
                    record.target(),
                    message
                ))
            })
            .level(config.level_filter())
            // goblin is chatty on malformed images
            .level_for("goblin", log::LevelFilter::Warn)
            .chain(std::io::stdout())
            .chain(fern::log_file(&log_file)?)
            .apply()?;

        log::info!("Logging initialized, writing to: {}", log_file.display());

        cleanup_old_logs(directory, config.keep_files);

        Ok(())
    }
}

/// Removes all but the `keep_count` most recent `.log` files in `log_dir`
fn cleanup_old_logs(log_dir: &Path, keep_count: usize) -> usize {
    let mut log_files: Vec<_> = match fs::read_dir(log_dir) {
        Ok(entries) => entries
            .filter_map(|entry| {
                let entry = entry.ok()?;
                let path = entry.path();

                if path.extension()? != "log" {
                    return None;
                }

                let modified = entry.metadata().ok()?.modified().ok()?;
                Some((path, modified))
            })
            .collect(),
        Err(e) => {
            log::warn!("Failed to read log directory: {}", e);
            return 0;
        }
    };

    if log_files.len() <= keep_count {
        return 0;
    }

    log_files.sort_by(|a, b| b.1.cmp(&a.1));

    let mut removed = 0;
    for (path, _) in log_files.into_iter().skip(keep_count) {
        match fs::remove_file(&path) {
            Ok(()) => {
                log::debug!("Removed old log file: {:?}", path);
                removed += 1;
            }
            Err(e) => log::warn!("Failed to remove old log file {:?}: {}", path, e),
        }
    }

    removed
}
