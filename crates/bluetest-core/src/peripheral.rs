//! Peripheral 角色引擎
//!
//! 状态机: `Idle → ServiceRegistered → Advertising` (停止广播回到 `ServiceRegistered`)
//!
//! 构造时即注册服务；注册完成前提交的广播请求会排队，收到 `ServiceAdded` 后再发出。
//! 每个入站 ATT 请求恰好应答一次；写请求按批次整体接受或整体拒绝。

use log::{debug, error, trace, warn};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use crate::adapter::{AdapterMonitor, AdapterState, Deferral};
use crate::error::BleError;
use crate::event::{
    PeripheralEvent, PeripheralOutcome, PeripheralPhase, ReadRequest, WriteBatch,
};
use crate::gatt::{AttResponse, AttResult, CharacteristicRole, ServiceDescriptor};
use crate::logging::{EventLog, LogEntry, LogLevel};
use crate::radio::{AdvertisementData, PeripheralRadio, RadioFailure, RequestId, SubscriberId};

const SOURCE: &str = "peripheral";
/// 记住最近应答过的请求编号，用于识别重复投递
const ANSWERED_HISTORY: usize = 64;

/// 等待适配器就绪后再执行的意图
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeripheralIntent {
    StartAdvertising,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Registration {
    Pending,
    Registered,
    Failed,
}

/// 外设配置：广播名和各特征的初始值
#[derive(Debug, Clone, Default)]
pub struct PeripheralConfig {
    pub local_name: String,
    pub initial_values: HashMap<Uuid, Vec<u8>>,
}

impl PeripheralConfig {
    pub fn new(local_name: impl Into<String>) -> Self {
        Self {
            local_name: local_name.into(),
            initial_values: HashMap::new(),
        }
    }

    pub fn with_value(mut self, characteristic: Uuid, value: impl Into<Vec<u8>>) -> Self {
        self.initial_values.insert(characteristic, value.into());
        self
    }
}

pub struct PeripheralEngine<R> {
    radio: R,
    service: ServiceDescriptor,
    local_name: String,
    adapter: AdapterMonitor<PeripheralIntent>,
    phase: PeripheralPhase,
    registration: Registration,
    advertise_queued: bool,
    values: HashMap<Uuid, Vec<u8>>,
    subscribers: BTreeMap<Uuid, BTreeSet<SubscriberId>>,
    deferred: VecDeque<(Uuid, Vec<u8>)>,
    in_flight: HashSet<RequestId>,
    answered: VecDeque<RequestId>,
    outcomes: mpsc::UnboundedSender<PeripheralOutcome>,
    log: Box<dyn EventLog>,
}

impl<R: PeripheralRadio> PeripheralEngine<R> {
    /// 创建引擎并立即向平台注册服务
    pub fn new(
        radio: R,
        service: ServiceDescriptor,
        config: PeripheralConfig,
        outcomes: mpsc::UnboundedSender<PeripheralOutcome>,
        log: Box<dyn EventLog>,
    ) -> Self {
        let mut initial_values = config.initial_values;
        let values = service
            .characteristics
            .iter()
            .map(|c| (c.uuid, initial_values.remove(&c.uuid).unwrap_or_default()))
            .collect();

        let mut engine = Self {
            radio,
            service,
            local_name: config.local_name,
            adapter: AdapterMonitor::new(),
            phase: PeripheralPhase::Idle,
            registration: Registration::Pending,
            advertise_queued: false,
            values,
            subscribers: BTreeMap::new(),
            deferred: VecDeque::new(),
            in_flight: HashSet::new(),
            answered: VecDeque::with_capacity(ANSWERED_HISTORY),
            outcomes,
            log,
        };
        engine.register();
        engine
    }

    pub fn radio(&self) -> &R {
        &self.radio
    }

    pub fn radio_mut(&mut self) -> &mut R {
        &mut self.radio
    }

    pub fn phase(&self) -> PeripheralPhase {
        self.phase
    }

    pub fn local_name(&self) -> &str {
        &self.local_name
    }

    pub fn adapter_state(&self) -> AdapterState {
        self.adapter.current_state()
    }

    pub fn subscribe_adapter(&self) -> watch::Receiver<AdapterState> {
        self.adapter.subscribe()
    }

    pub fn value(&self, characteristic: Uuid) -> Option<&[u8]> {
        self.values.get(&characteristic).map(Vec::as_slice)
    }

    pub fn subscribers(&self, characteristic: Uuid) -> Vec<SubscriberId> {
        self.subscribers
            .get(&characteristic)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    /// 所有特征上的订阅总数
    pub fn subscription_count(&self) -> usize {
        self.subscribers.values().map(BTreeSet::len).sum()
    }

    pub fn is_registered(&self) -> bool {
        self.registration == Registration::Registered
    }

    // ---------------------------------------------------------------------
    // 公开操作
    // ---------------------------------------------------------------------

    /// 开始广播本地名称和服务 UUID
    ///
    /// 适配器未开启时静默忽略；服务尚未注册完成时排队。
    pub fn start_advertising(&mut self) -> Result<(), BleError> {
        if !self.adapter.is_powered_on() {
            warn!(
                "start_advertising ignored, adapter is {}",
                self.adapter.current_state()
            );
            return Ok(());
        }

        match self.registration {
            Registration::Pending => {
                self.advertise_queued = true;
                self.note(
                    LogLevel::Info,
                    "Advertising will start once the service is registered",
                );
                return Ok(());
            }
            Registration::Failed => {
                return Err(BleError::invalid_state(
                    "start_advertising",
                    "service registration failed",
                ));
            }
            Registration::Registered => {}
        }

        if self.phase == PeripheralPhase::Advertising {
            return Ok(());
        }

        let advertisement = AdvertisementData {
            local_name: self.local_name.clone(),
            service_uuids: vec![self.service.uuid],
        };
        self.radio.start_advertising(&advertisement);
        self.note(
            LogLevel::Info,
            format!("Advertising started as '{}'", self.local_name),
        );
        self.set_phase(PeripheralPhase::Advertising);
        Ok(())
    }

    /// 适配器就绪时立即广播，否则挂起到 `PoweredOn` 再执行
    pub fn request_advertising(&mut self) -> Result<(), BleError> {
        if self.adapter.is_powered_on() {
            return self.start_advertising();
        }
        if self.adapter.defer(PeripheralIntent::StartAdvertising)? == Deferral::Queued {
            self.note(
                LogLevel::Info,
                format!(
                    "Adapter is {}, advertising will start once powered on",
                    self.adapter.current_state()
                ),
            );
        }
        Ok(())
    }

    /// 停止广播，可重复调用
    pub fn stop_advertising(&mut self) {
        self.advertise_queued = false;
        if self.phase != PeripheralPhase::Advertising {
            return;
        }
        self.radio.stop_advertising();
        self.note(LogLevel::Info, "Advertising stopped");
        self.set_phase(PeripheralPhase::ServiceRegistered);
        self.emit(PeripheralOutcome::AdvertisingStopped);
    }

    pub fn send_notify(&mut self, value: &[u8]) -> Result<(), BleError> {
        self.send_update(CharacteristicRole::Notify, value)
    }

    pub fn send_indicate(&mut self, value: &[u8]) -> Result<(), BleError> {
        self.send_update(CharacteristicRole::Indicate, value)
    }

    /// 更新特征值并推送给所有订阅者
    ///
    /// 没有订阅者时什么都不做。平台发送队列满时保留该值，
    /// 收到 `ReadyToUpdateSubscribers` 后按原顺序重发。
    pub fn send_update(&mut self, role: CharacteristicRole, value: &[u8]) -> Result<(), BleError> {
        let characteristic = role.uuid();
        if !self
            .service
            .characteristic(characteristic)
            .is_some_and(|c| c.allows_subscribe())
        {
            return Err(BleError::CharacteristicUnavailable(role));
        }
        if self.subscribers(characteristic).is_empty() {
            debug!("No subscribers on {}, update skipped", role);
            return Ok(());
        }

        self.values.insert(characteristic, value.to_vec());
        if !self.deferred.is_empty() || !self.try_push(characteristic, value) {
            self.deferred.push_back((characteristic, value.to_vec()));
            self.note(
                LogLevel::Debug,
                format!("Transmit queue full, {} update deferred", role),
            );
            self.emit(PeripheralOutcome::ValueDeferred { characteristic });
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // 事件处理
    // ---------------------------------------------------------------------

    pub fn handle_event(&mut self, event: PeripheralEvent) {
        trace!("peripheral event: {:?}", event);
        match event {
            PeripheralEvent::StateChanged(state) => self.on_adapter_state(state),
            PeripheralEvent::ServiceAdded { service, result } => {
                self.on_service_added(service, result)
            }
            PeripheralEvent::AdvertisingStarted(result) => self.on_advertising_started(result),
            PeripheralEvent::ReadRequest(request) => self.on_read_request(request),
            PeripheralEvent::WriteRequest(batch) => self.on_write_request(batch),
            PeripheralEvent::Subscribed {
                central,
                characteristic,
            } => self.on_subscribed(central, characteristic),
            PeripheralEvent::Unsubscribed {
                central,
                characteristic,
            } => self.on_unsubscribed(central, characteristic),
            PeripheralEvent::ReadyToUpdateSubscribers => self.flush_deferred(),
        }
    }

    fn on_adapter_state(&mut self, state: AdapterState) {
        self.note(LogLevel::Info, state.name());
        self.emit(PeripheralOutcome::AdapterChanged(state));
        let replay = self.adapter.update(state);

        if state == AdapterState::PoweredOn {
            if self.registration == Registration::Failed {
                self.register();
            }
        } else {
            if self.phase == PeripheralPhase::Advertising {
                self.set_phase(PeripheralPhase::ServiceRegistered);
            }
            self.subscribers.clear();
            self.deferred.clear();
        }

        for intent in replay {
            match intent {
                PeripheralIntent::StartAdvertising => {
                    if let Err(e) = self.start_advertising() {
                        warn!("Deferred advertising could not start: {}", e);
                        self.emit(PeripheralOutcome::Rejected(e));
                    }
                }
            }
        }
    }

    fn on_service_added(&mut self, service: Uuid, result: Result<(), RadioFailure>) {
        if service != self.service.uuid {
            debug!("Ignoring registration result for foreign service {}", service);
            return;
        }

        match result {
            Ok(()) => {
                self.registration = Registration::Registered;
                self.note(LogLevel::Info, "Service added");
                self.emit(PeripheralOutcome::ServiceRegistered(service));
                if self.phase == PeripheralPhase::Idle {
                    self.set_phase(PeripheralPhase::ServiceRegistered);
                }
                if std::mem::take(&mut self.advertise_queued) {
                    if let Err(e) = self.start_advertising() {
                        self.emit(PeripheralOutcome::Rejected(e));
                    }
                }
            }
            Err(cause) => {
                self.registration = Registration::Failed;
                self.advertise_queued = false;
                self.note(LogLevel::Error, format!("Adding service failed: {}", cause));
                self.emit(PeripheralOutcome::RegistrationFailed(cause));
            }
        }
    }

    fn on_advertising_started(&mut self, result: Result<(), RadioFailure>) {
        match result {
            Ok(()) => {
                self.note(LogLevel::Info, "Advertising succeeded");
                self.emit(PeripheralOutcome::AdvertisingStarted);
            }
            Err(cause) => {
                self.note(LogLevel::Warn, format!("Advertising failed: {}", cause));
                if self.phase == PeripheralPhase::Advertising {
                    self.set_phase(PeripheralPhase::ServiceRegistered);
                }
                self.emit(PeripheralOutcome::AdvertisingFailed(cause));
            }
        }
    }

    fn on_read_request(&mut self, request: ReadRequest) {
        if !self.track(request.id) {
            return;
        }
        self.note(
            LogLevel::Info,
            format!("Read request received from {}", request.central),
        );

        let response = self.answer_read(&request);
        match (&response.result, &response.value) {
            (AttResult::Success, value) => self.emit(PeripheralOutcome::ReadServed {
                characteristic: request.characteristic,
                value: value.clone().unwrap_or_default(),
            }),
            (result, _) => self.emit(PeripheralOutcome::ReadRejected {
                characteristic: request.characteristic,
                result: *result,
            }),
        }
        self.finish(request.id, response);
    }

    fn answer_read(&self, request: &ReadRequest) -> AttResponse {
        let Some(descriptor) = self.service.characteristic(request.characteristic) else {
            return AttResponse::error(AttResult::AttributeNotFound);
        };
        if !descriptor.allows_read() {
            return AttResponse::error(AttResult::ReadNotPermitted);
        }

        let value = self
            .values
            .get(&request.characteristic)
            .map(Vec::as_slice)
            .unwrap_or_default();
        match value.get(request.offset..) {
            Some(tail) => AttResponse::success(Some(tail.to_vec())),
            None => AttResponse::error(AttResult::InvalidOffset),
        }
    }

    fn on_write_request(&mut self, batch: WriteBatch) {
        if !self.track(batch.id) {
            return;
        }
        self.note(
            LogLevel::Info,
            format!(
                "Write request received from {} ({} item(s))",
                batch.central,
                batch.requests.len()
            ),
        );

        let response = match self.stage_batch(&batch) {
            Ok(staged) => {
                for (characteristic, value) in &staged {
                    self.note(
                        LogLevel::Info,
                        format!(
                            "Value written to {}: {:?}",
                            characteristic,
                            String::from_utf8_lossy(value)
                        ),
                    );
                    self.values.insert(*characteristic, value.clone());
                }
                self.emit(PeripheralOutcome::WriteApplied {
                    writes: staged.into_iter().collect(),
                });
                AttResponse::success(None)
            }
            Err((characteristic, result)) => {
                self.note(
                    LogLevel::Warn,
                    format!("Write batch rejected on {}: {}", characteristic, result),
                );
                self.emit(PeripheralOutcome::WriteRejected {
                    characteristic,
                    result,
                });
                AttResponse::error(result)
            }
        };
        self.finish(batch.id, response);
    }

    /// 在副本上依次应用整批写入，任何一项失败则整批作废
    fn stage_batch(&self, batch: &WriteBatch) -> Result<BTreeMap<Uuid, Vec<u8>>, (Uuid, AttResult)> {
        if batch.requests.is_empty() {
            return Err((self.service.uuid, AttResult::RequestNotSupported));
        }

        let mut staged: BTreeMap<Uuid, Vec<u8>> = BTreeMap::new();
        for request in &batch.requests {
            let uuid = request.characteristic;
            let Some(descriptor) = self.service.characteristic(uuid) else {
                return Err((uuid, AttResult::AttributeNotFound));
            };
            if !descriptor.allows_write() {
                return Err((uuid, AttResult::WriteNotPermitted));
            }

            let current = staged
                .entry(uuid)
                .or_insert_with(|| self.values.get(&uuid).cloned().unwrap_or_default());
            if request.offset > current.len() {
                return Err((uuid, AttResult::InvalidOffset));
            }
            current.truncate(request.offset);
            current.extend_from_slice(&request.value);
        }
        Ok(staged)
    }

    fn on_subscribed(&mut self, central: SubscriberId, characteristic: Uuid) {
        if !self
            .service
            .characteristic(characteristic)
            .is_some_and(|c| c.allows_subscribe())
        {
            warn!(
                "{} tried to subscribe to non-subscribable {}",
                central, characteristic
            );
            return;
        }
        if self
            .subscribers
            .entry(characteristic)
            .or_default()
            .insert(central)
        {
            self.note(
                LogLevel::Info,
                format!("{} subscribed to {}", central, characteristic),
            );
            self.emit(PeripheralOutcome::Subscribed {
                central,
                characteristic,
            });
        }
    }

    fn on_unsubscribed(&mut self, central: SubscriberId, characteristic: Uuid) {
        let removed = self
            .subscribers
            .get_mut(&characteristic)
            .is_some_and(|set| set.remove(&central));
        if !removed {
            return;
        }
        self.note(
            LogLevel::Info,
            format!("{} unsubscribed from {}", central, characteristic),
        );
        self.emit(PeripheralOutcome::Unsubscribed {
            central,
            characteristic,
        });

        // 没有订阅者的特征不再等待重发，其余排队的值立即重试
        if self.subscribers(characteristic).is_empty() {
            let before = self.deferred.len();
            self.deferred.retain(|(uuid, _)| *uuid != characteristic);
            let dropped = before - self.deferred.len();
            if dropped > 0 {
                debug!(
                    "Dropped {} deferred update(s) for {}, no subscribers left",
                    dropped, characteristic
                );
            }
        }
        self.flush_deferred();
    }

    fn flush_deferred(&mut self) {
        while let Some((characteristic, value)) = self.deferred.pop_front() {
            if !self.try_push(characteristic, &value) {
                self.deferred.push_front((characteristic, value));
                break;
            }
        }
    }

    // ---------------------------------------------------------------------
    // 内部工具
    // ---------------------------------------------------------------------

    fn register(&mut self) {
        self.registration = Registration::Pending;
        self.radio.add_service(&self.service);
        self.note(
            LogLevel::Debug,
            format!("Registering service {}", self.service.uuid),
        );
    }

    /// 推送给当前订阅者；返回 `false` 表示平台队列已满
    fn try_push(&mut self, characteristic: Uuid, value: &[u8]) -> bool {
        let subscribers = self.subscribers(characteristic);
        if subscribers.is_empty() {
            debug!("Subscribers of {} left, dropping update", characteristic);
            return true;
        }
        if !self
            .radio
            .update_value(characteristic, value, &subscribers)
        {
            return false;
        }
        self.note(
            LogLevel::Info,
            format!(
                "Sent {} byte(s) on {} to {} subscriber(s)",
                value.len(),
                characteristic,
                subscribers.len()
            ),
        );
        self.emit(PeripheralOutcome::ValueSent {
            characteristic,
            subscribers: subscribers.len(),
        });
        true
    }

    /// 记录入站请求；在途或最近已应答的编号再次到达视为平台错误，不再应答
    fn track(&mut self, id: RequestId) -> bool {
        if !self.answered.contains(&id) && self.in_flight.insert(id) {
            return true;
        }
        let violation = BleError::ProtocolViolation(format!("{} delivered twice", id));
        error!("{}", violation);
        self.emit(PeripheralOutcome::Rejected(violation));
        false
    }

    fn finish(&mut self, id: RequestId, response: AttResponse) {
        if let Err(violation) = self.respond(id, response) {
            error!("{}", violation);
            self.emit(PeripheralOutcome::Rejected(violation));
        }
    }

    /// 应答请求；每个请求只能应答一次
    fn respond(&mut self, id: RequestId, response: AttResponse) -> Result<(), BleError> {
        if !self.in_flight.remove(&id) {
            debug_assert!(false, "{} answered twice or never received", id);
            return Err(BleError::ProtocolViolation(format!(
                "{} answered twice or never received",
                id
            )));
        }
        self.radio.respond(id, response);
        if self.answered.len() == ANSWERED_HISTORY {
            self.answered.pop_front();
        }
        self.answered.push_back(id);
        Ok(())
    }

    fn set_phase(&mut self, to: PeripheralPhase) {
        let from = self.phase;
        self.phase = to;
        if from != to {
            debug!("peripheral: {} -> {}", from.name(), to.name());
            self.emit(PeripheralOutcome::PhaseChanged { from, to });
        }
    }

    /// 报告一个被拒绝的请求
    pub(crate) fn reject(&self, error: BleError) {
        warn!("{} request rejected: {}", SOURCE, error);
        self.emit(PeripheralOutcome::Rejected(error));
    }

    fn emit(&self, outcome: PeripheralOutcome) {
        let _ = self.outcomes.send(outcome);
    }

    fn note(&self, level: LogLevel, message: impl Into<String>) {
        self.log.append(LogEntry::new(level, SOURCE, message));
    }
}
