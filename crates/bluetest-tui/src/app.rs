//! Application state

use bluetest_core::event::CentralOperation;
use bluetest_core::platform::{AdapterSinks, BluerPeripheral, BtleplugCentral, watch_adapter};
use bluetest_core::runtime::{spawn_central, spawn_peripheral};
use bluetest_core::{
    AdapterState, AppSettings, BleError, CentralEngine, CentralHandle, CentralOutcome,
    CentralPhase, CharacteristicRole, LogForwarder, LogLevel, PeripheralEngine, PeripheralHandle,
    PeripheralOutcome, PeripheralPhase, default_service,
};
use std::collections::BTreeSet;
use tokio::sync::mpsc;

/// 日志面板最多保留的条数
const MAX_LOGS: usize = 500;

/// 异步事件（从后台任务发送到 UI）
#[derive(Debug)]
pub enum AppEvent {
    Log(LogLine),
    Central(CentralOutcome),
    Peripheral(PeripheralOutcome),
}

#[derive(Debug, Clone)]
pub struct LogLine {
    pub level: LogLevel,
    pub message: String,
}

/// central 面板显示的状态
#[derive(Debug, Clone)]
pub struct CentralStatus {
    pub phase: CentralPhase,
    pub peer: Option<String>,
    pub bound: Vec<CharacteristicRole>,
    pub subscribed: BTreeSet<CharacteristicRole>,
    pub last_value: Option<String>,
}

/// peripheral 面板显示的状态
#[derive(Debug, Clone)]
pub struct PeripheralStatus {
    pub phase: PeripheralPhase,
    pub subscribers: usize,
    pub last_write: Option<String>,
}

pub struct App {
    pub settings: AppSettings,
    pub adapter: AdapterState,
    pub central: CentralStatus,
    pub peripheral: PeripheralStatus,
    pub logs: Vec<LogLine>,
    pub show_debug: bool,
    pub event_tx: mpsc::Sender<AppEvent>,
    event_rx: mpsc::Receiver<AppEvent>,
    central_handle: Option<CentralHandle>,
    peripheral_handle: Option<PeripheralHandle>,
}

impl App {
    pub fn new(settings: AppSettings) -> Self {
        let (event_tx, event_rx) = mpsc::channel(settings.event_buffer.max(16));
        Self {
            show_debug: settings.verbose,
            settings,
            adapter: AdapterState::Unknown,
            central: CentralStatus {
                phase: CentralPhase::Idle,
                peer: None,
                bound: vec![],
                subscribed: BTreeSet::new(),
                last_value: None,
            },
            peripheral: PeripheralStatus {
                phase: PeripheralPhase::Idle,
                subscribers: 0,
                last_write: None,
            },
            logs: vec![LogLine {
                level: LogLevel::Info,
                message: "Bluetest TUI 启动，按 's' 扫描, 'a' 广播, 'q' 退出".to_string(),
            }],
            event_tx,
            event_rx,
            central_handle: None,
            peripheral_handle: None,
        }
    }

    /// 创建平台绑定和两个角色引擎
    pub async fn start_radios(&mut self) {
        let buffer = self.settings.event_buffer.max(1);
        let (central_tx, central_rx) = mpsc::channel(buffer);
        let (peripheral_tx, peripheral_rx) = mpsc::channel(buffer);

        match BtleplugCentral::new(central_tx.clone()).await {
            Ok(radio) => {
                let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();
                let engine = CentralEngine::new(
                    radio,
                    default_service(),
                    outcome_tx,
                    Box::new(LogForwarder),
                );
                let (handle, _task) = spawn_central(engine, central_rx, buffer);
                self.central_handle = Some(handle);
                forward(outcome_rx, self.event_tx.clone(), AppEvent::Central);
            }
            Err(e) => self.add_log(LogLevel::Error, format!("Central 不可用: {}", e)),
        }

        match BluerPeripheral::new(peripheral_tx.clone()).await {
            Ok(radio) => {
                let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();
                let engine = PeripheralEngine::new(
                    radio,
                    default_service(),
                    self.settings.peripheral_config(),
                    outcome_tx,
                    Box::new(LogForwarder),
                );
                let (handle, _task) = spawn_peripheral(engine, peripheral_rx, buffer);
                self.peripheral_handle = Some(handle);
                forward(outcome_rx, self.event_tx.clone(), AppEvent::Peripheral);
            }
            Err(e) => self.add_log(LogLevel::Error, format!("Peripheral 不可用: {}", e)),
        }

        watch_adapter(AdapterSinks {
            central: Some(central_tx),
            peripheral: Some(peripheral_tx),
        });
    }

    pub fn add_log(&mut self, level: LogLevel, message: impl Into<String>) {
        self.logs.push(LogLine {
            level,
            message: message.into(),
        });
        if self.logs.len() > MAX_LOGS {
            let overflow = self.logs.len() - MAX_LOGS;
            self.logs.drain(..overflow);
        }
    }

    pub fn clear_logs(&mut self) {
        self.logs.clear();
    }

    pub fn toggle_log_level(&mut self) {
        self.show_debug = !self.show_debug;
        let level = if self.show_debug { "DEBUG" } else { "INFO" };
        self.add_log(LogLevel::Info, format!("日志级别: {}", level));
    }

    /// 当前级别下可见的日志
    pub fn visible_logs(&self) -> impl Iterator<Item = &LogLine> {
        let max = if self.show_debug {
            LogLevel::Trace
        } else {
            LogLevel::Info
        };
        self.logs.iter().filter(move |line| line.level <= max)
    }

    // ---------------------------------------------------------------------
    // 按键动作
    // ---------------------------------------------------------------------

    fn with_central(&mut self, action: impl FnOnce(&CentralHandle) -> Result<(), BleError>) {
        let result = match &self.central_handle {
            Some(handle) => action(handle),
            None => Err(BleError::EngineStopped),
        };
        if let Err(e) = result {
            self.add_log(LogLevel::Warn, format!("[central] {}", e));
        }
    }

    fn with_peripheral(&mut self, action: impl FnOnce(&PeripheralHandle) -> Result<(), BleError>) {
        let result = match &self.peripheral_handle {
            Some(handle) => action(handle),
            None => Err(BleError::EngineStopped),
        };
        if let Err(e) = result {
            self.add_log(LogLevel::Warn, format!("[peripheral] {}", e));
        }
    }

    pub fn start_scan(&mut self) {
        let filter = self.settings.scan_filter.clone();
        self.with_central(|c| c.scan_when_ready(filter));
    }

    pub fn stop_scan(&mut self) {
        self.with_central(CentralHandle::stop_scan);
    }

    pub fn read(&mut self) {
        self.with_central(CentralHandle::read);
    }

    pub fn write(&mut self) {
        let payload = self.settings.write_payload.clone();
        self.with_central(|c| c.write(payload));
    }

    pub fn subscribe(&mut self, role: CharacteristicRole, enabled: bool) {
        if enabled {
            self.with_central(|c| c.subscribe(role));
        } else {
            self.with_central(|c| c.unsubscribe(role));
        }
    }

    pub fn disconnect(&mut self) {
        self.with_central(CentralHandle::disconnect);
    }

    pub fn start_advertising(&mut self) {
        self.with_peripheral(PeripheralHandle::advertise_when_ready);
    }

    pub fn stop_advertising(&mut self) {
        self.with_peripheral(PeripheralHandle::stop_advertising);
    }

    pub fn send_notify(&mut self) {
        let payload = self.settings.notify_payload.clone();
        self.with_peripheral(|p| p.send_notify(payload));
    }

    pub fn send_indicate(&mut self) {
        let payload = self.settings.indicate_payload.clone();
        self.with_peripheral(|p| p.send_indicate(payload));
    }

    // ---------------------------------------------------------------------
    // 后台事件
    // ---------------------------------------------------------------------

    /// 处理所有已到达的后台事件
    pub fn tick(&mut self) {
        while let Ok(event) = self.event_rx.try_recv() {
            match event {
                AppEvent::Log(line) => self.add_log(line.level, line.message),
                AppEvent::Central(outcome) => self.on_central(outcome),
                AppEvent::Peripheral(outcome) => self.on_peripheral(outcome),
            }
        }
    }

    fn on_central(&mut self, outcome: CentralOutcome) {
        let status = &mut self.central;
        match outcome {
            CentralOutcome::PhaseChanged { to, .. } => status.phase = to,
            CentralOutcome::AdapterChanged(state) => self.adapter = state,
            CentralOutcome::PeerFound { name, peer, .. } => {
                status.peer = Some(format!("{} ({})", name, peer));
            }
            CentralOutcome::DiscoveryComplete { bound } => status.bound = bound,
            CentralOutcome::DiscoveryIncomplete { missing } => {
                let missing: Vec<&str> = missing.iter().map(|r| r.name()).collect();
                self.add_log(LogLevel::Warn, format!("缺少特征: {}", missing.join(", ")));
            }
            CentralOutcome::ValueRead { role, value }
            | CentralOutcome::ValueNotified { role, value } => {
                status.last_value = Some(format!("{}: {}", role, String::from_utf8_lossy(&value)));
            }
            CentralOutcome::NotifyStateChanged { role, enabled } => {
                if enabled {
                    status.subscribed.insert(role);
                } else {
                    status.subscribed.remove(&role);
                }
            }
            CentralOutcome::Disconnected { .. } => {
                status.peer = None;
                status.bound.clear();
                status.subscribed.clear();
            }
            CentralOutcome::ConnectionFailed { peer, cause } => {
                self.add_log(LogLevel::Warn, format!("连接 {} 失败: {}", peer, cause));
            }
            CentralOutcome::OperationFailed {
                operation, cause, ..
            } => {
                let operation = match operation {
                    CentralOperation::Discover => "discover",
                    CentralOperation::Read => "read",
                    CentralOperation::Write => "write",
                    CentralOperation::Subscribe => "subscribe",
                };
                self.add_log(LogLevel::Warn, format!("{} 失败: {}", operation, cause));
            }
            CentralOutcome::Rejected(e) => self.add_log(LogLevel::Warn, format!("[central] {}", e)),
            CentralOutcome::Connected(_) | CentralOutcome::WriteCompleted { .. } => {}
        }
    }

    fn on_peripheral(&mut self, outcome: PeripheralOutcome) {
        let status = &mut self.peripheral;
        match outcome {
            PeripheralOutcome::PhaseChanged { to, .. } => status.phase = to,
            PeripheralOutcome::AdapterChanged(state) => {
                self.adapter = state;
                if state != AdapterState::PoweredOn {
                    status.subscribers = 0;
                }
            }
            PeripheralOutcome::Subscribed { .. } => status.subscribers += 1,
            PeripheralOutcome::Unsubscribed { .. } => {
                status.subscribers = status.subscribers.saturating_sub(1);
            }
            PeripheralOutcome::WriteApplied { writes } => {
                status.last_write = writes
                    .last()
                    .map(|(_, value)| String::from_utf8_lossy(value).into_owned());
            }
            PeripheralOutcome::RegistrationFailed(cause)
            | PeripheralOutcome::AdvertisingFailed(cause) => {
                self.add_log(LogLevel::Error, format!("[peripheral] {}", cause));
            }
            PeripheralOutcome::Rejected(e) => {
                self.add_log(LogLevel::Warn, format!("[peripheral] {}", e));
            }
            _ => {}
        }
    }
}

/// 把引擎的 outcome 转发到 UI 事件通道
fn forward<T: Send + 'static>(
    mut rx: mpsc::UnboundedReceiver<T>,
    tx: mpsc::Sender<AppEvent>,
    wrap: fn(T) -> AppEvent,
) {
    tokio::spawn(async move {
        while let Some(outcome) = rx.recv().await {
            if tx.send(wrap(outcome)).await.is_err() {
                break;
            }
        }
    });
}
