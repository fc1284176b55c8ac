use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio_stream::wrappers::LinesStream;
use tokio_stream::StreamExt;

use crate::api::SearchItem;
use crate::cache::CacheEntry;
use crate::cli::Args;
use crate::error::{ErrorInfo, ErrorKind};
use crate::events::{Event, TabEvent};
use crate::key::EntityKey;
use crate::model::{Payload, SessionState};
use crate::orchestrator::Orchestrator;
use crate::render::{DirtyFlags, RenderState};
use crate::runner::{AnalysisParams, RunSnapshot, RunState};
use crate::search::{SearchSnapshot, SearchStatus};
use crate::tabs::{TabId, TabView};

const PREVIEW_ROWS: usize = 5;
const ANALYSIS_TAIL_CHARS: usize = 120;

/// One line typed at the console
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConsoleCommand {
    /// Plain text feeds the search box
    Input(String),
    Enter,
    Up,
    Down,
    Open(EntityKey),
    Tab(TabId),
    Sync,
    Lang,
    Analyze(AnalysisParams),
    Cancel,
    Retry,
    History,
    Reset,
    Quit,
}

pub fn parse_command(line: &str) -> Result<ConsoleCommand, String> {
    let line = line.trim();
    let Some(rest) = line.strip_prefix('/') else {
        return Ok(ConsoleCommand::Input(line.to_string()));
    };
    let (name, arg) = match rest.split_once(char::is_whitespace) {
        Some((name, arg)) => (name, arg.trim()),
        None => (rest, ""),
    };
    let command = match name {
        "enter" => ConsoleCommand::Enter,
        "up" => ConsoleCommand::Up,
        "down" => ConsoleCommand::Down,
        "open" if !arg.is_empty() => ConsoleCommand::Open(EntityKey::stock(arg)),
        "industry" if !arg.is_empty() => ConsoleCommand::Open(EntityKey::industry(arg)),
        "tab" if !arg.is_empty() => ConsoleCommand::Tab(TabId::new(arg)),
        "sync" => ConsoleCommand::Sync,
        "lang" => ConsoleCommand::Lang,
        "analyze" if arg.is_empty() => ConsoleCommand::Analyze(AnalysisParams::default()),
        "analyze" => match arg.parse::<u32>() {
            Ok(days) if days > 0 => ConsoleCommand::Analyze(AnalysisParams::window(days)),
            _ => return Err(format!("无效的分析窗口：{arg}")),
        },
        "cancel" => ConsoleCommand::Cancel,
        "retry" => ConsoleCommand::Retry,
        "history" => ConsoleCommand::History,
        "reset" => ConsoleCommand::Reset,
        "quit" | "q" => return Ok(ConsoleCommand::Quit),
        "open" | "industry" | "tab" => return Err(format!("/{name} 需要一个参数")),
        _ => return Err(format!("未知命令：/{name}")),
    };
    Ok(command)
}

/// Latest state of every panel, as reported by events
#[derive(Default)]
pub struct View {
    session: SessionState,
    search: Option<SearchSnapshot>,
    run: Option<RunSnapshot>,
    tab: Option<TabPanel>,
    history: Option<Result<Arc<CacheEntry<Payload>>, ErrorInfo>>,
    error: Option<String>,
}

enum TabPanel {
    Loading(TabId),
    Ready(TabView),
    Failed(TabId, ErrorInfo),
}

impl View {
    pub fn apply(&mut self, event: Event) {
        match event {
            Event::Search(snapshot) => {
                if let SearchStatus::Failed(message) = &snapshot.status {
                    self.error = Some(format!("搜索失败：{message}"));
                }
                self.search = Some(snapshot);
            }
            Event::Run(run) => {
                if let Some(error) = run.error.as_ref().filter(|e| e.kind != ErrorKind::StreamAborted) {
                    self.error = Some(format!("分析失败：{}（/retry 重试）", error.message));
                }
                self.run = Some(run);
            }
            Event::Tab(TabEvent::Loading { tab, .. }) => self.tab = Some(TabPanel::Loading(tab)),
            Event::Tab(TabEvent::Ready(view)) => self.tab = Some(TabPanel::Ready(view)),
            Event::Tab(TabEvent::Failed { tab, error, .. }) => {
                self.error = Some(format!("{tab} 加载失败：{}", error.message));
                self.tab = Some(TabPanel::Failed(tab, error));
            }
            Event::History { result, .. } => self.history = Some(result),
            Event::Session(session) => {
                if session.active_entity != self.session.active_entity {
                    self.run = None;
                    self.history = None;
                    self.tab = None;
                }
                self.session = session;
            }
        }
    }

    pub fn note_error(&mut self, message: String) {
        self.error = Some(message);
    }

    /// Text for the panels in `flags`
    pub fn render(&mut self, flags: DirtyFlags) -> String {
        let mut out = String::new();
        if flags.contains(DirtyFlags::HEADER) {
            let entity = self
                .session
                .active_entity
                .as_ref()
                .map_or_else(|| "（未选择）".to_string(), ToString::to_string);
            let tab = self
                .session
                .active_tab
                .as_ref()
                .map_or("-", TabId::as_str);
            let _ = writeln!(out, "== {entity} · {tab} ==");
        }
        if flags.contains(DirtyFlags::SEARCH) {
            if let Some(search) = &self.search {
                render_search(&mut out, search);
            }
        }
        if flags.intersects(DirtyFlags::TAB | DirtyFlags::LOADING) {
            match &self.tab {
                Some(TabPanel::Loading(tab)) => {
                    let _ = writeln!(out, "[{tab}] 加载中…");
                }
                Some(TabPanel::Ready(view)) => render_tab(&mut out, view),
                Some(TabPanel::Failed(tab, error)) => {
                    let _ = writeln!(out, "[{tab}] 加载失败（{}），/sync 重试", error.message);
                }
                None => {}
            }
        }
        if flags.contains(DirtyFlags::ANALYSIS) {
            if let Some(run) = &self.run {
                render_run(&mut out, run);
            }
        }
        if flags.contains(DirtyFlags::HISTORY) {
            match &self.history {
                Some(Ok(entry)) => {
                    let count = entry.payload.rows().map_or(0, |page| page.items.len());
                    let _ = writeln!(out, "[历史] 共 {count} 条分析记录");
                }
                Some(Err(error)) => {
                    let _ = writeln!(out, "[历史] 加载失败：{}", error.message);
                }
                None => {}
            }
        }
        if flags.contains(DirtyFlags::ERROR) {
            if let Some(error) = self.error.take() {
                let _ = writeln!(out, "! {error}");
            }
        }
        out
    }
}

fn render_search(out: &mut String, search: &SearchSnapshot) {
    let status = match &search.status {
        SearchStatus::Idle => return,
        SearchStatus::Searching => "搜索中…",
        SearchStatus::Ready => "",
        SearchStatus::Empty => "无结果",
        SearchStatus::Failed(_) => "失败（保留上次结果）",
    };
    let _ = writeln!(out, "搜索「{}」{status}", search.keyword);
    for (idx, item) in search.results.iter().enumerate() {
        let marker = if search.highlight == Some(idx) { '>' } else { ' ' };
        let _ = writeln!(out, " {marker} {}", describe_item(item));
    }
}

fn describe_item(item: &SearchItem) -> String {
    if item.market.is_empty() {
        format!("{} {}", item.code, item.name)
    } else {
        format!("{} {} ({})", item.code, item.name, item.market)
    }
}

fn render_tab(out: &mut String, view: &TabView) {
    let source = if view.from_cache { "缓存" } else { "最新" };
    let rows = view.entry.payload.rows();
    let total = rows.map_or(0, |page| page.items.len());
    let _ = writeln!(out, "[{}] {} · {total} 行（{source}）", view.tab, view.entity);
    for row in rows.into_iter().flat_map(|page| page.items.iter()).take(PREVIEW_ROWS) {
        let _ = writeln!(out, "  {row}");
    }
}

fn render_run(out: &mut String, run: &RunSnapshot) {
    match run.state {
        RunState::Idle | RunState::Cancelled => {
            let _ = writeln!(out, "[分析] 已停止");
        }
        RunState::Running => {
            let chars = run.text.chars().count();
            let tail: String = run
                .text
                .chars()
                .skip(chars.saturating_sub(ANALYSIS_TAIL_CHARS))
                .collect();
            let _ = writeln!(out, "[分析] 生成中（{chars} 字）…{tail}");
        }
        RunState::Completed => {
            let _ = writeln!(out, "[分析] {}\n{}", run.key, run.text);
        }
        RunState::Failed => {
            let _ = writeln!(out, "[分析] 失败");
        }
    }
}

/// Line-oriented console: stdin commands in, rendered panels out
pub async fn run(
    args: Args,
    orchestrator: Arc<Orchestrator>,
    mut events: mpsc::UnboundedReceiver<Event>,
) -> anyhow::Result<()> {
    let mut stdout = tokio::io::stdout();
    let mut lines = LinesStream::new(BufReader::new(tokio::io::stdin()).lines());
    let mut view = View::default();
    let mut render_state = RenderState::new();
    scopeguard::defer! {
        tracing::info!("控制台主循环结束");
    }

    if let Some(entity) = args.entity {
        orchestrator.select_entity(entity);
        spawn_activate(&orchestrator, TabId::new("trading"), false);
    }
    render_state.mark_dirty(DirtyFlags::ALL);

    let mut render_tick = tokio::time::interval(Duration::from_millis(100));
    render_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = render_tick.tick() => {
                if render_state.needs_render() {
                    let text = view.render(render_state.take());
                    if !text.is_empty() {
                        stdout.write_all(text.as_bytes()).await.context("写入终端失败")?;
                        stdout.flush().await.context("写入终端失败")?;
                    }
                } else {
                    render_state.take();
                }
            }
            Some(event) = events.recv() => {
                render_state.observe(&event);
                view.apply(event);
            }
            line = lines.next() => {
                let Some(line) = line.transpose().context("读取标准输入失败")? else {
                    tracing::info!("标准输入已关闭");
                    break;
                };
                match parse_command(&line) {
                    Ok(ConsoleCommand::Quit) => break,
                    Ok(command) => dispatch(&orchestrator, command, &mut view),
                    Err(message) => view.note_error(message),
                }
                render_state.mark_dirty(DirtyFlags::ERROR);
            }
        }
    }

    tracing::info!(stats = %render_state.stats(), "渲染统计");
    Ok(())
}

fn dispatch(orchestrator: &Arc<Orchestrator>, command: ConsoleCommand, view: &mut View) {
    let active_tab = orchestrator.session().active_tab;
    match command {
        ConsoleCommand::Input(text) => orchestrator.search_input(&text),
        ConsoleCommand::Enter => {
            let orchestrator = Arc::clone(orchestrator);
            let keyword = orchestrator.search_snapshot().keyword;
            tokio::spawn(async move {
                match orchestrator.search_submit(&keyword).await {
                    Ok(Some(entity)) => {
                        let tab = orchestrator
                            .session()
                            .active_tab
                            .unwrap_or_else(|| TabId::new("trading"));
                        tracing::debug!(entity = %entity, "打开搜索结果");
                        if let Err(err) = orchestrator.activate_tab(&tab).await {
                            tracing::warn!(tab = %tab, error = %err, "标签页打开失败");
                        }
                    }
                    Ok(None) => {}
                    Err(err) => tracing::warn!(keyword = %keyword, error = %err, "搜索提交失败"),
                }
            });
        }
        ConsoleCommand::Up => {
            orchestrator.highlight_prev();
        }
        ConsoleCommand::Down => {
            orchestrator.highlight_next();
        }
        ConsoleCommand::Open(entity) => {
            orchestrator.select_entity(entity);
            let tab = active_tab.unwrap_or_else(|| TabId::new("trading"));
            spawn_activate(orchestrator, tab, false);
        }
        ConsoleCommand::Tab(tab) => spawn_activate(orchestrator, tab, false),
        ConsoleCommand::Sync => match active_tab {
            Some(tab) => spawn_activate(orchestrator, tab, true),
            None => view.note_error("请先用 /tab 打开一个标签页".to_string()),
        },
        ConsoleCommand::Lang => {
            if orchestrator.rerender_tab().is_none() {
                view.note_error("当前标签页没有可重绘的数据".to_string());
            }
        }
        ConsoleCommand::Analyze(params) => {
            if let Some(cached) = orchestrator.cached_analysis(&params) {
                tracing::debug!(key = %cached.key, "已有缓存的分析，重新生成");
            }
            if orchestrator.generate_analysis(params).is_none() {
                view.note_error("请先选择股票或行业".to_string());
            }
        }
        ConsoleCommand::Cancel => {
            if !orchestrator.cancel_analysis() {
                view.note_error("没有正在生成的分析".to_string());
            }
        }
        ConsoleCommand::Retry => {
            if orchestrator.retry_analysis().is_none() {
                view.note_error("没有可重试的分析".to_string());
            }
        }
        ConsoleCommand::History => {
            let orchestrator = Arc::clone(orchestrator);
            tokio::spawn(async move {
                if let Err(err) = orchestrator.history(false).await {
                    tracing::warn!(error = %err, "分析历史加载失败");
                }
            });
        }
        ConsoleCommand::Reset => {
            orchestrator.forget_entity();
            if let Some(tab) = active_tab {
                spawn_activate(orchestrator, tab, false);
            }
        }
        ConsoleCommand::Quit => {}
    }
}

fn spawn_activate(orchestrator: &Arc<Orchestrator>, tab: TabId, force: bool) {
    let orchestrator = Arc::clone(orchestrator);
    tokio::spawn(async move {
        let result = if force {
            orchestrator.refresh_tab(&tab).await
        } else {
            orchestrator.activate_tab(&tab).await
        };
        if let Err(err) = result {
            tracing::warn!(tab = %tab, error = %err, "标签页打开失败");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::Page;
    use crate::cache::CacheMeta;
    use time::OffsetDateTime;

    #[test]
    fn parses_console_commands() {
        assert_eq!(
            parse_command("  茅台 "),
            Ok(ConsoleCommand::Input("茅台".to_string()))
        );
        assert_eq!(parse_command(""), Ok(ConsoleCommand::Input(String::new())));
        assert_eq!(
            parse_command("/open aapl.us"),
            Ok(ConsoleCommand::Open(EntityKey::stock("AAPL.US")))
        );
        assert_eq!(
            parse_command("/industry  Semiconductors"),
            Ok(ConsoleCommand::Open(EntityKey::industry("Semiconductors")))
        );
        assert_eq!(
            parse_command("/tab News"),
            Ok(ConsoleCommand::Tab(TabId::new("news")))
        );
        assert_eq!(
            parse_command("/analyze 30"),
            Ok(ConsoleCommand::Analyze(AnalysisParams::window(30)))
        );
        assert_eq!(
            parse_command("/analyze"),
            Ok(ConsoleCommand::Analyze(AnalysisParams::default()))
        );
        assert_eq!(parse_command("/quit"), Ok(ConsoleCommand::Quit));
    }

    #[test]
    fn rejects_bad_commands() {
        assert!(parse_command("/analyze soon").is_err());
        assert!(parse_command("/open").is_err());
        assert!(parse_command("/bogus").is_err());
    }

    fn search(keyword: &str, status: SearchStatus, highlight: Option<usize>) -> SearchSnapshot {
        SearchSnapshot {
            keyword: keyword.to_string(),
            status,
            results: Arc::new(vec![
                SearchItem {
                    code: "600519.SH".to_string(),
                    name: "贵州茅台".to_string(),
                    market: "SH".to_string(),
                    kind: "stock".to_string(),
                    score: 1.0,
                },
                SearchItem {
                    code: "Semiconductors".to_string(),
                    name: "半导体".to_string(),
                    market: String::new(),
                    kind: "industry".to_string(),
                    score: 0.5,
                },
            ]),
            highlight,
        }
    }

    #[test]
    fn renders_only_dirty_panels() {
        let mut view = View::default();
        view.apply(Event::Search(search("茅台", SearchStatus::Ready, Some(1))));
        view.apply(Event::History {
            key: EntityKey::stock("600519.SH").facet("history"),
            result: Ok(Arc::new(CacheEntry {
                key: EntityKey::stock("600519.SH").facet("history"),
                payload: Payload::History(Page::default()),
                meta: CacheMeta::default(),
                stored_at: OffsetDateTime::UNIX_EPOCH,
            })),
        });

        let text = view.render(DirtyFlags::SEARCH);
        assert!(text.contains("搜索「茅台」"));
        assert!(text.contains(" > Semiconductors 半导体"));
        assert!(text.contains("   600519.SH 贵州茅台 (SH)"));
        assert!(!text.contains("[历史]"));

        assert!(view.render(DirtyFlags::HISTORY).contains("共 0 条"));
    }

    #[test]
    fn error_banner_is_shown_once() {
        let mut view = View::default();
        view.apply(Event::Search(search(
            "x",
            SearchStatus::Failed("timeout".to_string()),
            None,
        )));
        assert!(view.render(DirtyFlags::ERROR).contains("搜索失败：timeout"));
        assert!(view.render(DirtyFlags::ERROR).is_empty());
    }

    #[test]
    fn cancelled_run_shows_no_error() {
        let mut view = View::default();
        view.apply(Event::Run(RunSnapshot {
            id: 1,
            key: EntityKey::stock("AAPL.US").facet("analysis"),
            state: RunState::Cancelled,
            text: String::new(),
            error: Some(ErrorInfo::stream(&crate::error::FetchError::Aborted)),
        }));
        let text = view.render(DirtyFlags::ALL);
        assert!(text.contains("已停止"));
        assert!(!text.contains('!'));
    }

    #[test]
    fn switching_entity_resets_entity_panels() {
        let mut view = View::default();
        view.apply(Event::Run(RunSnapshot {
            id: 1,
            key: EntityKey::stock("A.US").facet("analysis"),
            state: RunState::Completed,
            text: "A".to_string(),
            error: None,
        }));
        view.apply(Event::Session(SessionState {
            active_entity: Some(EntityKey::stock("B.US")),
            active_tab: None,
        }));
        let text = view.render(DirtyFlags::ALL);
        assert!(text.contains("== stock:B.US · - =="));
        assert!(!text.contains("[分析]"));
    }

    #[test]
    fn failed_tab_panel_shows_the_reason() {
        let mut view = View::default();
        view.apply(Event::Tab(TabEvent::Failed {
            tab: TabId::new("news"),
            entity: EntityKey::stock("AAPL.US"),
            error: ErrorInfo {
                kind: ErrorKind::NetworkFailure,
                message: "maintenance".to_string(),
                retryable: true,
            },
        }));
        let text = view.render(DirtyFlags::TAB);
        assert!(text.contains("[news] 加载失败（maintenance），/sync 重试"));
    }
}
