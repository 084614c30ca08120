//! 测试用的记录型平台服务
#![allow(dead_code)]

use bluetest_core::gatt::{
    AttResponse, GattOperation, INDICATE_CHAR_UUID, NOTIFY_CHAR_UUID, READ_CHAR_UUID,
    SERVICE_UUID, ServiceDescriptor, WRITE_CHAR_UUID, default_service,
};
use bluetest_core::radio::{
    AdvertisementData, CentralRadio, PeerId, PeripheralRadio, RemoteCharacteristic, RequestId,
    SubscriberId,
};
use bluetest_core::{
    AdapterState, CentralEngine, CentralEvent, CentralOutcome, MemoryLog, PeripheralConfig,
    PeripheralEngine, PeripheralEvent, PeripheralOutcome,
};
use bluetest_core::event::Advertisement;
use tokio::sync::mpsc;
use uuid::Uuid;

pub const TARGET: &str = "Test Peripheral";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CentralCall {
    StartScan,
    StopScan,
    Connect(PeerId),
    CancelConnection(PeerId),
    DiscoverServices(PeerId, Vec<Uuid>),
    DiscoverCharacteristics(PeerId, Uuid, Vec<Uuid>),
    Read(PeerId, Uuid),
    Write(PeerId, Uuid, Vec<u8>),
    SetNotify(PeerId, Uuid, bool),
}

#[derive(Debug, Default)]
pub struct MockCentral {
    pub calls: Vec<CentralCall>,
}

impl MockCentral {
    pub fn count(&self, call: &CentralCall) -> usize {
        self.calls.iter().filter(|c| *c == call).count()
    }

    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.calls
            .iter()
            .filter_map(|c| match c {
                CentralCall::Write(_, _, value) => Some(value.clone()),
                _ => None,
            })
            .collect()
    }
}

impl CentralRadio for MockCentral {
    fn start_scan(&mut self) {
        self.calls.push(CentralCall::StartScan);
    }

    fn stop_scan(&mut self) {
        self.calls.push(CentralCall::StopScan);
    }

    fn connect(&mut self, peer: &PeerId) {
        self.calls.push(CentralCall::Connect(peer.clone()));
    }

    fn cancel_connection(&mut self, peer: &PeerId) {
        self.calls.push(CentralCall::CancelConnection(peer.clone()));
    }

    fn discover_services(&mut self, peer: &PeerId, services: &[Uuid]) {
        self.calls
            .push(CentralCall::DiscoverServices(peer.clone(), services.to_vec()));
    }

    fn discover_characteristics(&mut self, peer: &PeerId, service: Uuid, characteristics: &[Uuid]) {
        self.calls.push(CentralCall::DiscoverCharacteristics(
            peer.clone(),
            service,
            characteristics.to_vec(),
        ));
    }

    fn read(&mut self, peer: &PeerId, characteristic: &RemoteCharacteristic) {
        self.calls
            .push(CentralCall::Read(peer.clone(), characteristic.uuid));
    }

    fn write(&mut self, peer: &PeerId, characteristic: &RemoteCharacteristic, value: &[u8]) {
        self.calls.push(CentralCall::Write(
            peer.clone(),
            characteristic.uuid,
            value.to_vec(),
        ));
    }

    fn set_notify(&mut self, peer: &PeerId, characteristic: &RemoteCharacteristic, enabled: bool) {
        self.calls
            .push(CentralCall::SetNotify(peer.clone(), characteristic.uuid, enabled));
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeripheralCall {
    AddService(Uuid),
    StartAdvertising(AdvertisementData),
    StopAdvertising,
    Respond(RequestId, AttResponse),
    UpdateValue(Uuid, Vec<u8>, Vec<SubscriberId>),
}

#[derive(Debug, Default)]
pub struct MockPeripheral {
    pub calls: Vec<PeripheralCall>,
    /// 为 true 时 `update_value` 报告发送队列已满
    pub queue_full: bool,
}

impl MockPeripheral {
    pub fn responses(&self) -> Vec<(RequestId, AttResponse)> {
        self.calls
            .iter()
            .filter_map(|c| match c {
                PeripheralCall::Respond(id, response) => Some((*id, response.clone())),
                _ => None,
            })
            .collect()
    }

    pub fn updates(&self) -> Vec<(Uuid, Vec<u8>, Vec<SubscriberId>)> {
        self.calls
            .iter()
            .filter_map(|c| match c {
                PeripheralCall::UpdateValue(uuid, value, subscribers) => {
                    Some((*uuid, value.clone(), subscribers.clone()))
                }
                _ => None,
            })
            .collect()
    }

    pub fn advertising_calls(&self) -> usize {
        self.calls
            .iter()
            .filter(|c| matches!(c, PeripheralCall::StartAdvertising(_)))
            .count()
    }
}

impl PeripheralRadio for MockPeripheral {
    fn add_service(&mut self, service: &ServiceDescriptor) {
        self.calls.push(PeripheralCall::AddService(service.uuid));
    }

    fn start_advertising(&mut self, advertisement: &AdvertisementData) {
        self.calls
            .push(PeripheralCall::StartAdvertising(advertisement.clone()));
    }

    fn stop_advertising(&mut self) {
        self.calls.push(PeripheralCall::StopAdvertising);
    }

    fn respond(&mut self, request: RequestId, response: AttResponse) {
        self.calls.push(PeripheralCall::Respond(request, response));
    }

    fn update_value(
        &mut self,
        characteristic: Uuid,
        value: &[u8],
        subscribers: &[SubscriberId],
    ) -> bool {
        if self.queue_full {
            return false;
        }
        self.calls.push(PeripheralCall::UpdateValue(
            characteristic,
            value.to_vec(),
            subscribers.to_vec(),
        ));
        true
    }
}

/// 取出通道里已有的全部消息
pub fn drain<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> Vec<T> {
    let mut items = Vec::new();
    while let Ok(item) = rx.try_recv() {
        items.push(item);
    }
    items
}

pub fn peer(id: &str) -> PeerId {
    PeerId::new(id)
}

pub fn advertisement(id: &str, name: &str) -> CentralEvent {
    CentralEvent::AdvertisementReceived(Advertisement {
        peer: peer(id),
        local_name: Some(name.to_string()),
        service_uuids: vec![SERVICE_UUID],
        rssi: Some(-50),
    })
}

/// 外设上四个特征的远端视图
pub fn remote_characteristics() -> Vec<RemoteCharacteristic> {
    vec![
        RemoteCharacteristic::new(SERVICE_UUID, READ_CHAR_UUID, [GattOperation::Read]),
        RemoteCharacteristic::new(
            SERVICE_UUID,
            WRITE_CHAR_UUID,
            [GattOperation::Read, GattOperation::Write],
        ),
        RemoteCharacteristic::new(SERVICE_UUID, NOTIFY_CHAR_UUID, [GattOperation::Notify]),
        RemoteCharacteristic::new(SERVICE_UUID, INDICATE_CHAR_UUID, [GattOperation::Indicate]),
    ]
}

pub struct CentralHarness {
    pub engine: CentralEngine<MockCentral>,
    pub outcomes: mpsc::UnboundedReceiver<CentralOutcome>,
    pub log: MemoryLog,
}

impl CentralHarness {
    pub fn new() -> Self {
        let (tx, outcomes) = mpsc::unbounded_channel();
        let log = MemoryLog::new();
        let engine = CentralEngine::new(
            MockCentral::default(),
            default_service(),
            tx,
            Box::new(log.clone()),
        );
        Self {
            engine,
            outcomes,
            log,
        }
    }

    pub fn powered() -> Self {
        let mut harness = Self::new();
        harness
            .engine
            .handle_event(CentralEvent::StateChanged(AdapterState::PoweredOn));
        harness.drain();
        harness
    }

    /// 从扫描一路推进到已连接、等待服务发现
    pub fn connected(id: &str) -> Self {
        let mut harness = Self::powered();
        harness.engine.start_scan(TARGET).unwrap();
        harness.engine.handle_event(advertisement(id, TARGET));
        harness.engine.handle_event(CentralEvent::Connected(peer(id)));
        harness.drain();
        harness
    }

    /// 完成服务和特征发现，进入 Ready
    pub fn ready(id: &str) -> Self {
        let mut harness = Self::connected(id);
        harness.discover(id, remote_characteristics());
        harness.drain();
        harness
    }

    pub fn discover(&mut self, id: &str, characteristics: Vec<RemoteCharacteristic>) {
        self.engine.handle_event(CentralEvent::ServicesDiscovered {
            peer: peer(id),
            result: Ok(vec![SERVICE_UUID]),
        });
        self.engine
            .handle_event(CentralEvent::CharacteristicsDiscovered {
                peer: peer(id),
                service: SERVICE_UUID,
                result: Ok(characteristics),
            });
    }

    pub fn calls(&self) -> &[CentralCall] {
        &self.engine.radio().calls
    }

    pub fn drain(&mut self) -> Vec<CentralOutcome> {
        drain(&mut self.outcomes)
    }
}

pub struct PeripheralHarness {
    pub engine: PeripheralEngine<MockPeripheral>,
    pub outcomes: mpsc::UnboundedReceiver<PeripheralOutcome>,
    pub log: MemoryLog,
}

impl PeripheralHarness {
    pub fn new() -> Self {
        let (tx, outcomes) = mpsc::unbounded_channel();
        let log = MemoryLog::new();
        let config = PeripheralConfig::new(TARGET).with_value(READ_CHAR_UUID, b"World".to_vec());
        let engine = PeripheralEngine::new(
            MockPeripheral::default(),
            default_service(),
            config,
            tx,
            Box::new(log.clone()),
        );
        Self {
            engine,
            outcomes,
            log,
        }
    }

    /// 适配器开启且服务已注册
    pub fn registered() -> Self {
        let mut harness = Self::new();
        harness
            .engine
            .handle_event(PeripheralEvent::StateChanged(AdapterState::PoweredOn));
        harness.engine.handle_event(PeripheralEvent::ServiceAdded {
            service: SERVICE_UUID,
            result: Ok(()),
        });
        harness.drain();
        harness
    }

    pub fn subscribe(&mut self, central: u64, characteristic: Uuid) {
        self.engine.handle_event(PeripheralEvent::Subscribed {
            central: SubscriberId(central),
            characteristic,
        });
    }

    pub fn calls(&self) -> &[PeripheralCall] {
        &self.engine.radio().calls
    }

    pub fn drain(&mut self) -> Vec<PeripheralOutcome> {
        drain(&mut self.outcomes)
    }
}
