//! 事件定义
//!
//! 入站事件由平台推送给引擎；outcome 由引擎推送给上层应用。
//! 成功与失败走同一条流，用不同的变体区分。

use uuid::Uuid;

use crate::adapter::AdapterState;
use crate::error::BleError;
use crate::gatt::{AttResult, CharacteristicRole};
use crate::radio::{PeerId, RadioFailure, RemoteCharacteristic, RequestId, SubscriberId};

/// 扫描到的一条广播
#[derive(Debug, Clone, PartialEq)]
pub struct Advertisement {
    pub peer: PeerId,
    pub local_name: Option<String>,
    pub service_uuids: Vec<Uuid>,
    pub rssi: Option<i16>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CentralEvent {
    StateChanged(AdapterState),
    AdvertisementReceived(Advertisement),
    Connected(PeerId),
    ConnectFailed {
        peer: PeerId,
        cause: RadioFailure,
    },
    ServicesDiscovered {
        peer: PeerId,
        result: Result<Vec<Uuid>, RadioFailure>,
    },
    CharacteristicsDiscovered {
        peer: PeerId,
        service: Uuid,
        result: Result<Vec<RemoteCharacteristic>, RadioFailure>,
    },
    /// 读结果或 notify/indicate 推送
    ValueUpdated {
        peer: PeerId,
        characteristic: Uuid,
        result: Result<Vec<u8>, RadioFailure>,
    },
    WriteCompleted {
        peer: PeerId,
        characteristic: Uuid,
        result: Result<(), RadioFailure>,
    },
    NotifyStateChanged {
        peer: PeerId,
        characteristic: Uuid,
        result: Result<bool, RadioFailure>,
    },
    Disconnected {
        peer: PeerId,
        reason: Option<RadioFailure>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadRequest {
    pub id: RequestId,
    pub central: SubscriberId,
    pub characteristic: Uuid,
    pub offset: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRequest {
    pub characteristic: Uuid,
    pub offset: usize,
    pub value: Vec<u8>,
}

/// 一批写请求，整体应答一次
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteBatch {
    pub id: RequestId,
    pub central: SubscriberId,
    pub requests: Vec<WriteRequest>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PeripheralEvent {
    StateChanged(AdapterState),
    ServiceAdded {
        service: Uuid,
        result: Result<(), RadioFailure>,
    },
    AdvertisingStarted(Result<(), RadioFailure>),
    ReadRequest(ReadRequest),
    WriteRequest(WriteBatch),
    Subscribed {
        central: SubscriberId,
        characteristic: Uuid,
    },
    Unsubscribed {
        central: SubscriberId,
        characteristic: Uuid,
    },
    ReadyToUpdateSubscribers,
}

/// central 引擎的阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CentralPhase {
    Idle,
    Scanning,
    Connecting,
    Discovering,
    Ready,
    Disconnected,
}

impl CentralPhase {
    pub fn name(&self) -> &'static str {
        match self {
            CentralPhase::Idle => "idle",
            CentralPhase::Scanning => "scanning",
            CentralPhase::Connecting => "connecting",
            CentralPhase::Discovering => "discovering",
            CentralPhase::Ready => "ready",
            CentralPhase::Disconnected => "disconnected",
        }
    }
}

/// 断开连接的原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectCause {
    /// 调用方主动断开
    Local,
    /// 对端断开 (或链路丢失)
    Remote(Option<RadioFailure>),
    /// 适配器离开 `PoweredOn`
    AdapterLost(AdapterState),
}

/// 失败的 central 侧数据操作
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CentralOperation {
    Discover,
    Read,
    Write,
    Subscribe,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CentralOutcome {
    PhaseChanged {
        from: CentralPhase,
        to: CentralPhase,
    },
    AdapterChanged(AdapterState),
    PeerFound {
        peer: PeerId,
        name: String,
        rssi: Option<i16>,
    },
    Connected(PeerId),
    ConnectionFailed {
        peer: PeerId,
        cause: RadioFailure,
    },
    DiscoveryComplete {
        bound: Vec<CharacteristicRole>,
    },
    DiscoveryIncomplete {
        missing: Vec<CharacteristicRole>,
    },
    ValueRead {
        role: CharacteristicRole,
        value: Vec<u8>,
    },
    /// 未经请求的值推送 (notify / indicate)
    ValueNotified {
        role: CharacteristicRole,
        value: Vec<u8>,
    },
    WriteCompleted {
        role: CharacteristicRole,
    },
    NotifyStateChanged {
        role: CharacteristicRole,
        enabled: bool,
    },
    OperationFailed {
        operation: CentralOperation,
        characteristic: Uuid,
        cause: RadioFailure,
    },
    Disconnected {
        peer: PeerId,
        cause: DisconnectCause,
    },
    /// 通过命令通道提交的请求被拒绝
    Rejected(BleError),
}

/// peripheral 引擎的阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeripheralPhase {
    Idle,
    ServiceRegistered,
    Advertising,
}

impl PeripheralPhase {
    pub fn name(&self) -> &'static str {
        match self {
            PeripheralPhase::Idle => "idle",
            PeripheralPhase::ServiceRegistered => "service registered",
            PeripheralPhase::Advertising => "advertising",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PeripheralOutcome {
    PhaseChanged {
        from: PeripheralPhase,
        to: PeripheralPhase,
    },
    AdapterChanged(AdapterState),
    ServiceRegistered(Uuid),
    RegistrationFailed(RadioFailure),
    AdvertisingStarted,
    AdvertisingFailed(RadioFailure),
    AdvertisingStopped,
    ReadServed {
        characteristic: Uuid,
        value: Vec<u8>,
    },
    ReadRejected {
        characteristic: Uuid,
        result: AttResult,
    },
    WriteApplied {
        writes: Vec<(Uuid, Vec<u8>)>,
    },
    /// 整批写入被拒绝，没有任何值被修改
    WriteRejected {
        characteristic: Uuid,
        result: AttResult,
    },
    Subscribed {
        central: SubscriberId,
        characteristic: Uuid,
    },
    Unsubscribed {
        central: SubscriberId,
        characteristic: Uuid,
    },
    ValueSent {
        characteristic: Uuid,
        subscribers: usize,
    },
    /// 发送队列已满，等待平台通知后重发
    ValueDeferred {
        characteristic: Uuid,
    },
    Rejected(BleError),
}
