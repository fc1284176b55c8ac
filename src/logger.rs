use std::any::Any;
use std::path::PathBuf;
use std::sync::OnceLock;

use crate::config;

const DEFAULT_FILTER: &str = "error,stockpulse=debug";

static ACTIVE_LOG_DIR: OnceLock<PathBuf> = OnceLock::new();

pub fn default_log_dir() -> PathBuf {
    if let Some(dir) = config::dir_override(config::LOG_DIR) {
        return dir;
    }
    let base = if cfg!(target_os = "macos") {
        dirs::home_dir().map(|home| home.join("Library/Logs"))
    } else {
        dirs::data_local_dir().or_else(|| dirs::home_dir().map(|home| home.join(".local/share")))
    };
    match base {
        Some(base) if cfg!(target_os = "macos") => base.join("StockPulse"),
        Some(base) => base.join("stockpulse").join("logs"),
        None => fallback_log_dir(),
    }
}

fn fallback_log_dir() -> PathBuf {
    std::env::temp_dir().join("stockpulse").join("logs")
}

#[must_use]
pub fn active_log_dir() -> PathBuf {
    ACTIVE_LOG_DIR
        .get()
        .cloned()
        .unwrap_or_else(default_log_dir)
}

fn local_offset() -> time::UtcOffset {
    time::UtcOffset::current_local_offset().unwrap_or(time::UtcOffset::UTC)
}

/// Filter directives: `STOCKPULSE_LOG` when set, the default otherwise
fn filter_directives() -> String {
    std::env::var("STOCKPULSE_LOG")
        .ok()
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_FILTER.to_string())
}

/// Install the file subscriber; keep the returned guard alive until exit
#[must_use]
pub fn init() -> impl Any {
    use tracing_appender::rolling::{RollingFileAppender, Rotation};
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;

    let primary_log_dir = default_log_dir();
    let log_dir = if std::fs::create_dir_all(&primary_log_dir).is_ok() {
        primary_log_dir
    } else {
        let fallback = fallback_log_dir();
        let _ = std::fs::create_dir_all(&fallback);
        fallback
    };

    let _ = ACTIVE_LOG_DIR.set(log_dir.clone());

    let writer = match RollingFileAppender::builder()
        .filename_prefix("stockpulse")
        .filename_suffix("log")
        .max_log_files(5)
        .rotation(Rotation::DAILY)
        .build(&log_dir)
    {
        Ok(writer) => writer,
        Err(err) => {
            eprintln!("日志初始化失败（目录: {}）：{}", log_dir.display(), err);
            std::process::exit(1);
        }
    };
    let (writer, guard) = tracing_appender::non_blocking(writer);

    let timer = fmt::time::OffsetTime::new(
        local_offset(),
        time::format_description::well_known::Rfc3339,
    );
    let file_line = cfg!(debug_assertions);

    let layer = fmt::layer()
        .with_ansi(false)
        .with_timer(timer)
        .with_thread_ids(true)
        .with_file(file_line)
        .with_line_number(file_line)
        .with_writer(writer)
        .with_filter(tracing_subscriber::EnvFilter::new(filter_directives()));

    tracing_subscriber::registry().with(layer).init();
    guard
}
