use crate::key::EntityKey;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Args {
    /// Stock to open on start
    pub entity: Option<EntityKey>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    Run(Args),
    Help,
    Version,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParseError {
    pub code: i32,
    pub message: String,
}

#[must_use]
pub fn help_text(bin_name: &str) -> String {
    indoc::formatdoc!(
        "
            StockPulse 行情分析控制台

            用法：
              {bin} [选项]

            选项：
              -h, --help           显示帮助信息
              -V, --version        显示版本信息
                  --entity <代码>  启动后直接打开该股票（如 600519.SH）

            控制台命令：
              直接输入文字         搜索股票或行业
              /enter               打开高亮（或第一个）搜索结果
              /up, /down           移动搜索高亮
              /open <代码>         打开股票
              /industry <名称>     打开行业
              /tab <标签>          切换标签页（trading, kline, news, volume, integrated）
              /sync                强制刷新当前标签页
              /lang                切换语言后从缓存重新渲染
              /analyze [天数]      生成 AI 分析
              /cancel              停止生成
              /retry               重试失败的分析
              /history             查看分析历史
              /reset               清除当前实体的缓存
              /quit                退出
        ",
        bin = bin_name
    )
}

#[must_use]
pub fn version_text() -> String {
    format!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))
}

pub fn parse_args<I, S>(args: I) -> Result<Command, ParseError>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut parsed = Args::default();
    let mut show_help = false;
    let mut show_version = false;

    let mut args = args.into_iter().map(Into::<String>::into);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-h" | "--help" => show_help = true,
            "-V" | "--version" => show_version = true,
            "--entity" => {
                let code = args.next().filter(|code| !code.trim().is_empty());
                let Some(code) = code else {
                    return Err(usage_error("--entity 需要一个股票代码"));
                };
                parsed.entity = Some(EntityKey::stock(&code));
            }
            _ if arg.starts_with("--entity=") => {
                let code = arg.trim_start_matches("--entity=");
                if code.trim().is_empty() {
                    return Err(usage_error("--entity 需要一个股票代码"));
                }
                parsed.entity = Some(EntityKey::stock(code));
            }
            _ if arg.starts_with('-') => {
                return Err(usage_error(&format!("未知选项：{arg}")));
            }
            _ => {
                return Err(usage_error(&format!("不支持的位置参数：{arg}")));
            }
        }
    }

    if show_help {
        return Ok(Command::Help);
    }

    if show_version {
        return Ok(Command::Version);
    }

    Ok(Command::Run(parsed))
}

fn usage_error(message: &str) -> ParseError {
    ParseError {
        code: 2,
        message: format!("{message}\n\n{}", help_text("stockpulse")),
    }
}

#[cfg(test)]
mod tests {
    use super::{parse_args, Command};
    use crate::key::EntityKey;

    #[test]
    fn parses_default_run_command() {
        let result = parse_args(Vec::<String>::new());
        assert_eq!(result, Ok(Command::Run(super::Args::default())));
    }

    #[test]
    fn parses_help_command() {
        assert_eq!(parse_args(["--help"]), Ok(Command::Help));
        assert_eq!(parse_args(["-V", "-h"]), Ok(Command::Help));
    }

    #[test]
    fn parses_version_command() {
        assert_eq!(parse_args(["--version"]), Ok(Command::Version));
    }

    #[test]
    fn parses_entity_in_both_forms() {
        for args in [vec!["--entity", "aapl.us"], vec!["--entity=AAPL.US"]] {
            match parse_args(args) {
                Ok(Command::Run(args)) => {
                    assert_eq!(args.entity, Some(EntityKey::stock("AAPL.US")));
                }
                other => panic!("expected run command, got {other:?}"),
            }
        }
    }

    #[test]
    fn entity_requires_a_value() {
        let err = parse_args(["--entity"]).expect_err("expected parse error");
        assert_eq!(err.code, 2);
        assert!(err.message.contains("--entity"));
    }

    #[test]
    fn fails_on_unknown_option() {
        let err = parse_args(["--logout"]).expect_err("expected parse error");
        assert_eq!(err.code, 2);
        assert!(err.message.contains("未知选项"));
    }

    #[test]
    fn fails_on_positional_argument() {
        let err = parse_args(["abc"]).expect_err("expected parse error");
        assert_eq!(err.code, 2);
        assert!(err.message.contains("不支持的位置参数"));
    }
}
