use chrono::Utc;
use slog::Drain;
use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

/// Root logger writing to the terminal.
pub fn create_root_logger_for_stdout(level: slog::Level) -> slog::Logger {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    let drain = slog::LevelFilter::new(drain, level).fuse();

    slog::Logger::root(drain, slog::o!())
}

/// Root logger writing to a fresh `<directory>/server_<id>/<timestamp>_info.log`.
pub fn create_root_logger_for_file<P: AsRef<Path>>(
    directory: P,
    server_id: u32,
    level: slog::Level,
) -> io::Result<slog::Logger> {
    let log_path = log_file_path(directory.as_ref(), server_id);
    if let Some(parent) = log_path.parent() {
        fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(log_path)?;

    let decorator = slog_term::PlainDecorator::new(file);
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    let drain = slog::LevelFilter::new(drain, level).fuse();

    Ok(slog::Logger::root(drain, slog::o!()))
}

fn log_file_path(directory: &Path, server_id: u32) -> PathBuf {
    let now = Utc::now().format("%Y-%m-%dT%H-%M-%SZ");
    directory
        .join(format!("server_{}", server_id))
        .join(format!("{}_info.log", now))
}
