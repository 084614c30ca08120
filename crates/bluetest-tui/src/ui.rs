//! UI rendering module

use bluetest_core::{AdapterState, CentralPhase, LogLevel, PeripheralPhase};
use ratatui::{
    prelude::*,
    widgets::{Block, Borders, List, ListItem, Paragraph, Wrap},
};

use crate::app::App;

pub fn draw(frame: &mut Frame, app: &App) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3), // Header
            Constraint::Length(9), // Role panels
            Constraint::Min(6),    // Log
            Constraint::Length(3), // Key help
        ])
        .split(frame.area());

    draw_header(frame, app, chunks[0]);
    draw_roles(frame, app, chunks[1]);
    draw_log(frame, app, chunks[2]);
    draw_help(frame, chunks[3]);
}

fn adapter_style(state: AdapterState) -> Style {
    match state {
        AdapterState::PoweredOn => Style::default().fg(Color::Green),
        AdapterState::PoweredOff | AdapterState::Resetting | AdapterState::Unknown => {
            Style::default().fg(Color::Yellow)
        }
        AdapterState::Unsupported | AdapterState::Unauthorized => Style::default().fg(Color::Red),
    }
}

fn draw_header(frame: &mut Frame, app: &App, area: Rect) {
    let line = Line::from(vec![
        Span::raw(" 适配器: "),
        Span::styled(app.adapter.name(), adapter_style(app.adapter).bold()),
        Span::raw(format!("  │  本地名称: {}", app.settings.local_name)),
    ]);
    let header = Paragraph::new(line).block(
        Block::default()
            .borders(Borders::ALL)
            .title(" Bluetest TUI "),
    );
    frame.render_widget(header, area);
}

fn draw_roles(frame: &mut Frame, app: &App, area: Rect) {
    let chunks = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(50), Constraint::Percentage(50)])
        .split(area);

    let central = &app.central;
    let phase_icon = match central.phase {
        CentralPhase::Scanning => "🔍",
        CentralPhase::Connecting | CentralPhase::Discovering => "🔄",
        CentralPhase::Ready => "✅",
        CentralPhase::Idle | CentralPhase::Disconnected => "⏸️",
    };
    let bound: Vec<&str> = central.bound.iter().map(|r| r.name()).collect();
    let subscribed: Vec<&str> = central.subscribed.iter().map(|r| r.name()).collect();
    let text = format!(
        "{} 阶段: {}\n外设: {}\n已绑定: {}\n已订阅: {}\n最近的值: {}",
        phase_icon,
        central.phase.name(),
        central.peer.as_deref().unwrap_or("--"),
        if bound.is_empty() { "--".to_string() } else { bound.join(", ") },
        if subscribed.is_empty() { "--".to_string() } else { subscribed.join(", ") },
        central.last_value.as_deref().unwrap_or("--"),
    );
    let panel = Paragraph::new(text)
        .block(Block::default().borders(Borders::ALL).title(" 📡 Central "))
        .wrap(Wrap { trim: true });
    frame.render_widget(panel, chunks[0]);

    let peripheral = &app.peripheral;
    let advertising = if peripheral.phase == PeripheralPhase::Advertising {
        "是"
    } else {
        "否"
    };
    let text = format!(
        "阶段: {}\n广播中: {}\n订阅数: {}\n最近写入: {}",
        peripheral.phase.name(),
        advertising,
        peripheral.subscribers,
        peripheral.last_write.as_deref().unwrap_or("--"),
    );
    let panel = Paragraph::new(text)
        .block(Block::default().borders(Borders::ALL).title(" 📶 Peripheral "))
        .wrap(Wrap { trim: true });
    frame.render_widget(panel, chunks[1]);
}

fn draw_log(frame: &mut Frame, app: &App, area: Rect) {
    let height = area.height.saturating_sub(2) as usize;
    let lines: Vec<_> = app.visible_logs().collect();
    let items: Vec<ListItem> = lines
        .iter()
        .skip(lines.len().saturating_sub(height))
        .map(|line| {
            let style = match line.level {
                LogLevel::Error => Style::default().fg(Color::Red),
                LogLevel::Warn => Style::default().fg(Color::Yellow),
                LogLevel::Info => Style::default(),
                LogLevel::Debug | LogLevel::Trace => Style::default().fg(Color::DarkGray),
            };
            ListItem::new(format!("{} {}", line.level.icon(), line.message)).style(style)
        })
        .collect();

    let title = if app.show_debug {
        " 📋 日志 (DEBUG) "
    } else {
        " 📋 日志 "
    };
    let list = List::new(items).block(Block::default().borders(Borders::ALL).title(title));
    frame.render_widget(list, area);
}

fn draw_help(frame: &mut Frame, area: Rect) {
    let help = Paragraph::new(
        "[s]扫描 [t]停止 [r]读 [w]写 [n/N]notify [i/I]indicate [d]断开 │ \
         [a]广播 [x]停止广播 [p]notify [o]indicate │ [l]日志级别 [c]清空 [q]退出",
    )
    .block(Block::default().borders(Borders::ALL))
    .wrap(Wrap { trim: true });
    frame.render_widget(help, area);
}
