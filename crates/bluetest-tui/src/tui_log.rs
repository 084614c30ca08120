//! TUI 日志层
//!
//! 把 tracing 事件（包括经 `LogTracer` 桥接过来的 `log` 记录）转成日志面板的行。
//! 引擎的事件日志已经自带 `[central]` / `[peripheral]` 前缀，其余记录按模块路径加前缀。

use crate::app::{AppEvent, LogLine};
use bluetest_core::{LogForwarder, LogLevel};
use std::fmt::{self, Write as _};
use tokio::sync::mpsc;
use tracing::{Event, Level, Subscriber};
use tracing_log::NormalizeEvent;
use tracing_subscriber::Layer;
use tracing_subscriber::layer::Context;

/// 发送日志到 TUI 的 Layer
pub struct TuiLogLayer {
    tx: mpsc::Sender<AppEvent>,
}

impl TuiLogLayer {
    pub fn new(tx: mpsc::Sender<AppEvent>) -> Self {
        Self { tx }
    }
}

impl<S> Layer<S> for TuiLogLayer
where
    S: Subscriber,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        // `log` 记录的真实 target/level 藏在 `log.*` 字段里
        let normalized = event.normalized_metadata();
        let metadata = normalized.as_ref().unwrap_or_else(|| event.metadata());

        let mut visitor = LineVisitor::default();
        event.record(&mut visitor);

        let line = LogLine {
            level: level_of(metadata.level()),
            message: visitor.finish(source_tag(metadata.target())),
        };
        // 面板跟不上时直接丢弃
        let _ = self.tx.try_send(AppEvent::Log(line));
    }
}

fn level_of(level: &Level) -> LogLevel {
    match *level {
        Level::ERROR => LogLevel::Error,
        Level::WARN => LogLevel::Warn,
        Level::INFO => LogLevel::Info,
        Level::DEBUG => LogLevel::Debug,
        _ => LogLevel::Trace,
    }
}

/// 面板上显示的来源；引擎事件日志返回 `None`
fn source_tag(target: &str) -> Option<&str> {
    if target == LogForwarder::TARGET {
        return None;
    }
    Some(target.strip_prefix("bluetest_core::").unwrap_or(target))
}

/// 收集 message 字段，其余字段以 `key=value` 追加在后面
#[derive(Default)]
struct LineVisitor {
    message: String,
    fields: String,
}

impl LineVisitor {
    fn finish(self, source: Option<&str>) -> String {
        let mut line = match source {
            Some(source) => format!("[{}] {}", source, self.message),
            None => self.message,
        };
        line.push_str(&self.fields);
        line
    }

    fn push_field(&mut self, name: &str, value: fmt::Arguments<'_>) {
        if name.starts_with("log.") {
            return;
        }
        let _ = write!(self.fields, " {}={}", name, value);
    }
}

impl tracing::field::Visit for LineVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{:?}", value);
        } else {
            self.push_field(field.name(), format_args!("{:?}", value));
        }
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.push_field(field.name(), format_args!("{}", value));
        }
    }
}
