//! Bluetest Core Library
//!
//! 单服务 BLE GATT 演示的两个角色：central (扫描、连接、发现、读写、订阅)
//! 和 peripheral (注册服务、广播、应答读写、推送 notify/indicate)。
//!
//! # 模块
//!
//! - **gatt**: 服务和特征的标识、操作、权限，ATT 结果码
//! - **adapter**: 适配器状态监视和挂起的意图
//! - **radio**: 平台服务接口 (`CentralRadio` / `PeripheralRadio`)
//! - **central** / **peripheral**: 两个角色的状态机引擎
//! - **runtime**: 每个角色一个事件循环
//! - **platform**: btleplug / bluer 绑定
//!
//! # 使用示例
//!
//! ```ignore
//! use bluetest_core::{AppSettings, CentralEngine, LogForwarder, default_service};
//! use bluetest_core::platform::{AdapterSinks, BtleplugCentral, watch_adapter};
//! use bluetest_core::runtime::spawn_central;
//!
//! let settings = AppSettings::load();
//! let (event_tx, event_rx) = tokio::sync::mpsc::channel(settings.event_buffer);
//! let (outcome_tx, mut outcomes) = tokio::sync::mpsc::unbounded_channel();
//!
//! let radio = BtleplugCentral::new(event_tx.clone()).await?;
//! let engine = CentralEngine::new(radio, default_service(), outcome_tx, Box::new(LogForwarder));
//! let (central, _task) = spawn_central(engine, event_rx, settings.event_buffer);
//! watch_adapter(AdapterSinks { central: Some(event_tx), peripheral: None });
//!
//! central.scan_when_ready(settings.scan_filter.clone())?;
//! while let Some(outcome) = outcomes.recv().await {
//!     println!("{:?}", outcome);
//! }
//! ```

pub mod adapter;
pub mod central;
pub mod config;
pub mod error;
pub mod event;
pub mod gatt;
pub mod logging;
pub mod peripheral;
pub mod platform;
pub mod radio;
pub mod runtime;

pub use adapter::{AdapterMonitor, AdapterState};
pub use central::{CentralEngine, RemotePeer};
pub use config::AppSettings;
pub use error::BleError;
pub use event::{
    CentralEvent, CentralOutcome, CentralPhase, DisconnectCause, PeripheralEvent,
    PeripheralOutcome, PeripheralPhase,
};
pub use gatt::{
    CharacteristicRole, INDICATE_CHAR_UUID, NOTIFY_CHAR_UUID, READ_CHAR_UUID, SERVICE_UUID,
    WRITE_CHAR_UUID, default_service,
};
pub use logging::{EventLog, LogEntry, LogForwarder, LogLevel, MemoryLog};
pub use peripheral::{PeripheralConfig, PeripheralEngine};
pub use radio::{CentralRadio, PeripheralRadio};
pub use runtime::{CentralHandle, PeripheralHandle};
