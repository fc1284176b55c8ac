use std::sync::Arc;

use stockpulse::api::{HttpTransport, RateLimiter};
use stockpulse::config::{self, Config};
use stockpulse::events::Notifier;
use stockpulse::{app, cli, logger, Orchestrator};

#[tokio::main]
async fn main() {
    let bin_name = std::env::args()
        .next()
        .unwrap_or_else(|| "stockpulse".to_string());

    let command = match cli::parse_args(std::env::args().skip(1)) {
        Ok(command) => command,
        Err(err) => {
            eprintln!("{}", err.message);
            std::process::exit(err.code);
        }
    };

    let args = match command {
        cli::Command::Help => {
            println!("{}", cli::help_text(&bin_name));
            return;
        }
        cli::Command::Version => {
            println!("{}", cli::version_text());
            return;
        }
        cli::Command::Run(args) => args,
    };

    dotenvy::dotenv().ok();

    let _guard = logger::init();
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = std::process::id(),
        log_dir = %logger::active_log_dir().display(),
        "应用启动"
    );

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(err @ config::ConfigError::Missing(_)) => {
            config::print_config_guide();
            eprintln!("\n{err}");
            std::process::exit(2);
        }
        Err(err) => {
            eprintln!("{err}");
            std::process::exit(2);
        }
    };

    let limiter = RateLimiter::new(config.rate_limit, config.rate_burst);
    let transport = match HttpTransport::new(&config.api_url, limiter) {
        Ok(transport) => transport,
        Err(err) => {
            eprintln!("HTTP 客户端初始化失败：{err}");
            tracing::error!(error = %err, "HTTP 客户端初始化失败");
            std::process::exit(2);
        }
    };
    tracing::info!(
        api_url = %config.api_url,
        rate_limit = config.rate_limit,
        burst = config.rate_burst,
        "服务地址已配置"
    );

    let (notifier, events) = Notifier::channel();
    let orchestrator = Arc::new(Orchestrator::new(
        Arc::new(transport),
        notifier,
        config.orchestrator,
    ));

    println!("{}", cli::version_text());
    println!("输入关键字搜索，/quit 退出，--help 查看全部命令");

    tokio::select! {
        result = app::run(args, orchestrator, events) => {
            match result {
                Ok(()) => tracing::info!("应用主循环已退出"),
                Err(err) => {
                    tracing::error!(error = %err, "应用主循环异常退出");
                    eprintln!("{err}");
                    std::process::exit(1);
                }
            }
        }
        _ = wait_for_shutdown_signal() => {
            tracing::warn!("收到退出信号，正在退出");
        }
    }
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use std::future::pending;
    use tokio::signal::unix::{signal, Signal, SignalKind};

    async fn recv_or_pending(signal: Option<Signal>) {
        let mut signal = signal;
        if let Some(sig) = signal.as_mut() {
            let _ = sig.recv().await;
            return;
        }
        pending::<()>().await;
    }

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = recv_or_pending(signal(SignalKind::terminate()).ok()) => {}
        _ = recv_or_pending(signal(SignalKind::hangup()).ok()) => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
