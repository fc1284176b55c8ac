use std::path::PathBuf;
use std::time::Duration;

use crate::orchestrator::OrchestratorConfig;

pub const API_URL: &str = "STOCKPULSE_API_URL";
pub const SEARCH_DEBOUNCE_MS: &str = "STOCKPULSE_SEARCH_DEBOUNCE_MS";
pub const STREAM_TIMEOUT_SECS: &str = "STOCKPULSE_STREAM_TIMEOUT_SECS";
pub const CACHE_CAPACITY: &str = "STOCKPULSE_CACHE_CAPACITY";
pub const RATE_LIMIT: &str = "STOCKPULSE_RATE_LIMIT";
pub const RATE_BURST: &str = "STOCKPULSE_RATE_BURST";
pub const LOG_DIR: &str = "STOCKPULSE_LOG_DIR";

const REQUIRED: [&str; 1] = [API_URL];

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("缺少必需环境变量：{}", .0.join(", "))]
    Missing(Vec<&'static str>),

    #[error("环境变量 {key} 的值无效：{value}")]
    Invalid { key: &'static str, value: String },
}

/// Runtime settings read from the environment (and `.env`)
#[derive(Clone, Debug)]
pub struct Config {
    pub api_url: String,
    pub rate_limit: u32,
    pub rate_burst: u32,
    pub orchestrator: OrchestratorConfig,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let missing = missing_required_env();
        if !missing.is_empty() {
            return Err(ConfigError::Missing(missing));
        }
        let api_url = env_value(API_URL).unwrap_or_default();

        let mut orchestrator = OrchestratorConfig::default();
        if let Some(ms) = parse_env::<u64>(SEARCH_DEBOUNCE_MS)? {
            orchestrator.search.quiet = Duration::from_millis(ms);
        }
        orchestrator.runner.soft_timeout = parse_env::<u64>(STREAM_TIMEOUT_SECS)?
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs);
        orchestrator.cache_capacity = parse_env::<usize>(CACHE_CAPACITY)?.filter(|cap| *cap > 0);

        Ok(Self {
            api_url,
            rate_limit: parse_env(RATE_LIMIT)?.unwrap_or(10),
            rate_burst: parse_env(RATE_BURST)?.unwrap_or(20),
            orchestrator,
        })
    }
}

#[must_use]
pub fn missing_required_env() -> Vec<&'static str> {
    REQUIRED
        .into_iter()
        .filter(|key| env_value(key).is_none())
        .collect()
}

/// Directory override from the environment; blank values count as unset
#[must_use]
pub fn dir_override(key: &str) -> Option<PathBuf> {
    env_value(key).map(PathBuf::from)
}

pub fn print_config_guide() {
    eprintln!("配置错误：缺少必需环境变量");
    eprintln!();
    eprintln!("请先配置以下环境变量：");
    eprintln!("  {API_URL}=<行情分析服务地址，如 http://localhost:8000>");
    eprintln!();
    eprintln!("可选：{SEARCH_DEBOUNCE_MS} 搜索防抖间隔（默认 250）");
    eprintln!("可选：{STREAM_TIMEOUT_SECS} 分析生成超时秒数（默认不限）");
    eprintln!("可选：{CACHE_CAPACITY} 缓存条目上限（默认不限）");
    eprintln!("可选：{RATE_LIMIT} / {RATE_BURST} 请求限速（默认 10 次/秒，突发 20）");
    eprintln!("可选：STOCKPULSE_LOG 调整日志过滤（如 error,stockpulse=info）");
    eprintln!("可选：{LOG_DIR} 指定日志目录");
    eprintln!();
    eprintln!("提示：你可以在项目根目录创建 .env 文件来管理这些变量");
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn parse_env<T: std::str::FromStr>(key: &'static str) -> Result<Option<T>, ConfigError> {
    env_value(key)
        .map(|value| {
            value
                .parse()
                .map_err(|_| ConfigError::Invalid { key, value })
        })
        .transpose()
}
