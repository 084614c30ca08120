//! 无线电 / GATT 平台服务抽象
//!
//! 引擎只通过这两个 trait 向平台发出请求。所有方法都是非阻塞的：
//! 立即返回，结果稍后以事件形式送回对应角色的事件通道。

use std::collections::BTreeSet;
use std::fmt;
use uuid::Uuid;

use crate::gatt::{AttResponse, GattOperation, ServiceDescriptor};

/// 远端外设的不透明句柄
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// central 的不透明句柄
///
/// 平台只保证同一来源内稳定：读写请求和订阅会话可能用不同的句柄表示同一个设备。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriberId(pub u64);

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "central#{}", self.0)
    }
}

/// 入站 ATT 请求的编号，用于一次且仅一次的应答
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req#{}", self.0)
    }
}

/// 发现阶段解析出的远端特征
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCharacteristic {
    pub service: Uuid,
    pub uuid: Uuid,
    pub operations: BTreeSet<GattOperation>,
}

impl RemoteCharacteristic {
    pub fn new(
        service: Uuid,
        uuid: Uuid,
        operations: impl IntoIterator<Item = GattOperation>,
    ) -> Self {
        Self {
            service,
            uuid,
            operations: operations.into_iter().collect(),
        }
    }

    pub fn supports(&self, op: GattOperation) -> bool {
        self.operations.contains(&op)
    }
}

/// 外设广播内容
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvertisementData {
    pub local_name: String,
    pub service_uuids: Vec<Uuid>,
}

/// 平台返回的失败原因
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct RadioFailure(pub String);

impl RadioFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

pub trait CentralRadio: Send {
    fn start_scan(&mut self);
    fn stop_scan(&mut self);
    fn connect(&mut self, peer: &PeerId);
    fn cancel_connection(&mut self, peer: &PeerId);
    /// 只发现给定的服务
    fn discover_services(&mut self, peer: &PeerId, services: &[Uuid]);
    /// 只发现给定服务下的给定特征
    fn discover_characteristics(&mut self, peer: &PeerId, service: Uuid, characteristics: &[Uuid]);
    fn read(&mut self, peer: &PeerId, characteristic: &RemoteCharacteristic);
    /// write-with-response，完成后平台送回 `WriteCompleted`
    fn write(&mut self, peer: &PeerId, characteristic: &RemoteCharacteristic, value: &[u8]);
    fn set_notify(&mut self, peer: &PeerId, characteristic: &RemoteCharacteristic, enabled: bool);
}

pub trait PeripheralRadio: Send {
    /// 注册服务，完成后平台送回 `ServiceAdded`
    fn add_service(&mut self, service: &ServiceDescriptor);
    fn start_advertising(&mut self, advertisement: &AdvertisementData);
    fn stop_advertising(&mut self);
    /// 应答一次入站请求
    fn respond(&mut self, request: RequestId, response: AttResponse);
    /// 向订阅者推送新值
    ///
    /// 返回 `false` 表示发送队列已满，什么都没有发出；
    /// 平台会在有空间时送回 `ReadyToUpdateSubscribers`。
    fn update_value(
        &mut self,
        characteristic: Uuid,
        value: &[u8],
        subscribers: &[SubscriberId],
    ) -> bool;
}
