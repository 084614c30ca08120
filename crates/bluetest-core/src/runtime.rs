//! 事件循环
//!
//! 每个角色一个单消费者循环：平台事件和应用命令在同一个任务里串行处理，
//! 引擎本身不需要任何锁。

use log::{debug, info};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;

use crate::central::CentralEngine;
use crate::error::BleError;
use crate::event::{CentralEvent, PeripheralEvent};
use crate::gatt::CharacteristicRole;
use crate::peripheral::PeripheralEngine;
use crate::radio::{CentralRadio, PeripheralRadio};

/// 提交给 central 循环的命令
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CentralCommand {
    StartScan(String),
    /// 适配器未就绪时挂起，开启后自动扫描
    ScanWhenReady(String),
    StopScan,
    Read(CharacteristicRole),
    Write(Vec<u8>),
    Subscribe(CharacteristicRole),
    Unsubscribe(CharacteristicRole),
    Disconnect,
    Rediscover,
}

impl CentralCommand {
    fn apply<R: CentralRadio>(self, engine: &mut CentralEngine<R>) -> Result<(), BleError> {
        match self {
            CentralCommand::StartScan(filter) => engine.start_scan(&filter),
            CentralCommand::ScanWhenReady(filter) => engine.request_scan(&filter),
            CentralCommand::StopScan => engine.stop_scan(),
            CentralCommand::Read(role) => engine.read(role),
            CentralCommand::Write(value) => engine.write_characteristic(&value),
            CentralCommand::Subscribe(role) => engine.set_subscription(role, true),
            CentralCommand::Unsubscribe(role) => engine.set_subscription(role, false),
            CentralCommand::Disconnect => engine.disconnect(),
            CentralCommand::Rediscover => engine.rediscover(),
        }
    }
}

/// 提交给 peripheral 循环的命令
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeripheralCommand {
    StartAdvertising,
    AdvertiseWhenReady,
    StopAdvertising,
    SendNotify(Vec<u8>),
    SendIndicate(Vec<u8>),
}

impl PeripheralCommand {
    fn apply<R: PeripheralRadio>(self, engine: &mut PeripheralEngine<R>) -> Result<(), BleError> {
        match self {
            PeripheralCommand::StartAdvertising => engine.start_advertising(),
            PeripheralCommand::AdvertiseWhenReady => engine.request_advertising(),
            PeripheralCommand::StopAdvertising => {
                engine.stop_advertising();
                Ok(())
            }
            PeripheralCommand::SendNotify(value) => engine.send_notify(&value),
            PeripheralCommand::SendIndicate(value) => engine.send_indicate(&value),
        }
    }
}

/// 运行 central 循环，命令通道关闭后返回引擎
pub async fn run_central<R: CentralRadio>(
    mut engine: CentralEngine<R>,
    mut events: mpsc::Receiver<CentralEvent>,
    mut commands: mpsc::Receiver<CentralCommand>,
) -> CentralEngine<R> {
    debug!("Central loop started");
    loop {
        tokio::select! {
            biased;
            Some(event) = events.recv() => engine.handle_event(event),
            command = commands.recv() => match command {
                Some(command) => {
                    if let Err(e) = command.apply(&mut engine) {
                        engine.reject(e);
                    }
                }
                None => break,
            },
        }
    }
    info!("Central loop stopped");
    engine
}

/// 运行 peripheral 循环，命令通道关闭后返回引擎
pub async fn run_peripheral<R: PeripheralRadio>(
    mut engine: PeripheralEngine<R>,
    mut events: mpsc::Receiver<PeripheralEvent>,
    mut commands: mpsc::Receiver<PeripheralCommand>,
) -> PeripheralEngine<R> {
    debug!("Peripheral loop started");
    loop {
        tokio::select! {
            biased;
            Some(event) = events.recv() => engine.handle_event(event),
            command = commands.recv() => match command {
                Some(command) => {
                    if let Err(e) = command.apply(&mut engine) {
                        engine.reject(e);
                    }
                }
                None => break,
            },
        }
    }
    info!("Peripheral loop stopped");
    engine
}

fn map_send_error<T>(e: TrySendError<T>) -> BleError {
    match e {
        TrySendError::Full(_) => BleError::OperationFailed("command queue is full".to_string()),
        TrySendError::Closed(_) => BleError::EngineStopped,
    }
}

/// central 循环的命令句柄，可以随意克隆
#[derive(Debug, Clone)]
pub struct CentralHandle {
    commands: mpsc::Sender<CentralCommand>,
}

impl CentralHandle {
    pub fn send(&self, command: CentralCommand) -> Result<(), BleError> {
        self.commands.try_send(command).map_err(map_send_error)
    }

    pub fn start_scan(&self, filter: impl Into<String>) -> Result<(), BleError> {
        self.send(CentralCommand::StartScan(filter.into()))
    }

    pub fn scan_when_ready(&self, filter: impl Into<String>) -> Result<(), BleError> {
        self.send(CentralCommand::ScanWhenReady(filter.into()))
    }

    pub fn stop_scan(&self) -> Result<(), BleError> {
        self.send(CentralCommand::StopScan)
    }

    pub fn read(&self) -> Result<(), BleError> {
        self.send(CentralCommand::Read(CharacteristicRole::Read))
    }

    pub fn write(&self, value: impl Into<Vec<u8>>) -> Result<(), BleError> {
        self.send(CentralCommand::Write(value.into()))
    }

    pub fn subscribe(&self, role: CharacteristicRole) -> Result<(), BleError> {
        self.send(CentralCommand::Subscribe(role))
    }

    pub fn unsubscribe(&self, role: CharacteristicRole) -> Result<(), BleError> {
        self.send(CentralCommand::Unsubscribe(role))
    }

    pub fn disconnect(&self) -> Result<(), BleError> {
        self.send(CentralCommand::Disconnect)
    }

    pub fn rediscover(&self) -> Result<(), BleError> {
        self.send(CentralCommand::Rediscover)
    }
}

/// peripheral 循环的命令句柄
#[derive(Debug, Clone)]
pub struct PeripheralHandle {
    commands: mpsc::Sender<PeripheralCommand>,
}

impl PeripheralHandle {
    pub fn send(&self, command: PeripheralCommand) -> Result<(), BleError> {
        self.commands.try_send(command).map_err(map_send_error)
    }

    pub fn start_advertising(&self) -> Result<(), BleError> {
        self.send(PeripheralCommand::StartAdvertising)
    }

    pub fn advertise_when_ready(&self) -> Result<(), BleError> {
        self.send(PeripheralCommand::AdvertiseWhenReady)
    }

    pub fn stop_advertising(&self) -> Result<(), BleError> {
        self.send(PeripheralCommand::StopAdvertising)
    }

    pub fn send_notify(&self, value: impl Into<Vec<u8>>) -> Result<(), BleError> {
        self.send(PeripheralCommand::SendNotify(value.into()))
    }

    pub fn send_indicate(&self, value: impl Into<Vec<u8>>) -> Result<(), BleError> {
        self.send(PeripheralCommand::SendIndicate(value.into()))
    }
}

/// 在 tokio 任务里运行 central 循环
pub fn spawn_central<R>(
    engine: CentralEngine<R>,
    events: mpsc::Receiver<CentralEvent>,
    capacity: usize,
) -> (CentralHandle, JoinHandle<CentralEngine<R>>)
where
    R: CentralRadio + 'static,
{
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let task = tokio::spawn(run_central(engine, events, rx));
    (CentralHandle { commands: tx }, task)
}

/// 在 tokio 任务里运行 peripheral 循环
pub fn spawn_peripheral<R>(
    engine: PeripheralEngine<R>,
    events: mpsc::Receiver<PeripheralEvent>,
    capacity: usize,
) -> (PeripheralHandle, JoinHandle<PeripheralEngine<R>>)
where
    R: PeripheralRadio + 'static,
{
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let task = tokio::spawn(run_peripheral(engine, events, rx));
    (PeripheralHandle { commands: tx }, task)
}
