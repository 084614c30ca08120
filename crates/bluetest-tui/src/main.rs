//! Bluetest TUI - 交互式终端界面
//!
//! 同时运行 central 和 peripheral 两个角色，用按键触发各项 GATT 操作。
//!
//! # 日志
//!
//! 日志默认显示在 TUI 的日志面板中。
//! 如需输出到文件进行调试，设置 RUST_LOG 环境变量：
//!
//! ```bash
//! RUST_LOG=debug cargo run -p bluetest-tui 2>> /tmp/bluetest.log
//! ```

mod app;
mod tui_log;
mod ui;

use anyhow::Result;
use bluetest_core::{AppSettings, CharacteristicRole};
use clap::Parser;
use crossterm::{
    event::{self, Event, KeyCode, KeyEventKind},
    execute,
    terminal::{EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode},
};
use ratatui::prelude::*;
use std::io;
use std::time::Duration;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use app::App;
use tui_log::TuiLogLayer;

#[derive(Parser)]
#[command(name = "bluetest-tui", version, about = "BLE GATT central/peripheral 演示")]
struct Cli {
    /// 覆盖广播的本地名称
    #[arg(short = 'n', long)]
    local_name: Option<String>,

    /// 覆盖扫描时匹配的名称
    #[arg(short, long)]
    filter: Option<String>,

    /// 默认显示 DEBUG 日志
    #[arg(short, long)]
    verbose: bool,

    /// 把当前设置写回配置文件
    #[arg(long)]
    save: bool,
}

impl Cli {
    fn apply(&self, settings: &mut AppSettings) {
        if let Some(name) = &self.local_name {
            settings.local_name = name.clone();
        }
        if let Some(filter) = &self.filter {
            settings.scan_filter = filter.clone();
        }
        settings.verbose |= self.verbose;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut settings = AppSettings::load();
    cli.apply(&mut settings);
    if cli.save {
        settings.save()?;
    }
    let mut app = App::new(settings);

    // 初始化日志系统，发送到 TUI 日志面板
    init_logging(app.event_tx.clone());
    app.start_radios().await;

    // Setup terminal
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let res = run_app(&mut terminal, app).await;

    // Restore terminal
    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;

    res
}

/// 日志同时进入 TUI 面板；设置了 RUST_LOG 时再输出一份到 stderr
fn init_logging(log_tx: tokio::sync::mpsc::Sender<app::AppEvent>) {
    // bluetest-core 走 log 门面
    let _ = tracing_log::LogTracer::init();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,bluetest_core=debug"));
    let stderr_layer = std::env::var_os("RUST_LOG").map(|_| {
        tracing_subscriber::fmt::layer()
            .with_writer(io::stderr)
            .with_target(true)
            .compact()
    });

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(TuiLogLayer::new(log_tx))
        .with(stderr_layer)
        .try_init();
}

async fn run_app<B: Backend>(terminal: &mut Terminal<B>, mut app: App) -> Result<()> {
    loop {
        terminal.draw(|f| ui::draw(f, &app))?;

        // 使用 poll 避免无限阻塞
        if event::poll(Duration::from_millis(100))?
            && let Event::Key(key) = event::read()?
            && key.kind == KeyEventKind::Press
        {
            match key.code {
                KeyCode::Char('q') | KeyCode::Esc => return Ok(()),
                // Central
                KeyCode::Char('s') => app.start_scan(),
                KeyCode::Char('t') => app.stop_scan(),
                KeyCode::Char('r') => app.read(),
                KeyCode::Char('w') => app.write(),
                KeyCode::Char('n') => app.subscribe(CharacteristicRole::Notify, true),
                KeyCode::Char('N') => app.subscribe(CharacteristicRole::Notify, false),
                KeyCode::Char('i') => app.subscribe(CharacteristicRole::Indicate, true),
                KeyCode::Char('I') => app.subscribe(CharacteristicRole::Indicate, false),
                KeyCode::Char('d') => app.disconnect(),
                // Peripheral
                KeyCode::Char('a') => app.start_advertising(),
                KeyCode::Char('x') => app.stop_advertising(),
                KeyCode::Char('p') => app.send_notify(),
                KeyCode::Char('o') => app.send_indicate(),
                // Log
                KeyCode::Char('l') => app.toggle_log_level(),
                KeyCode::Char('c') => app.clear_logs(),
                _ => {}
            }
        }

        // 处理后台事件
        app.tick();
    }
}
