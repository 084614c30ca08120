//! Central 角色引擎
//!
//! 状态机: `Idle → Scanning → Connecting → Discovering → Ready → Disconnected → Idle`
//!
//! 只跟踪一个远端外设。按本地名称过滤广播，第一个匹配的广播胜出；
//! 连接后只发现约定的服务和四个特征。所有公开操作在校验前置条件后立即返回，
//! 结果通过 [`CentralOutcome`] 通道送出。

use log::{debug, trace, warn};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use crate::adapter::{AdapterMonitor, AdapterState, Deferral};
use crate::error::BleError;
use crate::event::{
    Advertisement, CentralEvent, CentralOperation, CentralOutcome, CentralPhase, DisconnectCause,
};
use crate::gatt::{CharacteristicRole, ServiceDescriptor};
use crate::logging::{EventLog, LogEntry, LogLevel};
use crate::radio::{CentralRadio, PeerId, RadioFailure, RemoteCharacteristic};

const SOURCE: &str = "central";

/// 等待适配器就绪后再执行的意图
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CentralIntent {
    StartScan(String),
}

/// 当前连接的外设及其已绑定的特征
#[derive(Debug, Clone)]
pub struct RemotePeer {
    id: PeerId,
    name: String,
    bindings: BTreeMap<CharacteristicRole, RemoteCharacteristic>,
    pending_discoveries: usize,
    pending_reads: BTreeSet<Uuid>,
    write_queue: VecDeque<Vec<u8>>,
    write_in_flight: bool,
}

impl RemotePeer {
    fn new(id: PeerId, name: String) -> Self {
        Self {
            id,
            name,
            bindings: BTreeMap::new(),
            pending_discoveries: 0,
            pending_reads: BTreeSet::new(),
            write_queue: VecDeque::new(),
            write_in_flight: false,
        }
    }

    pub fn id(&self) -> &PeerId {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn binding(&self, role: CharacteristicRole) -> Option<&RemoteCharacteristic> {
        self.bindings.get(&role)
    }

    pub fn bound_roles(&self) -> Vec<CharacteristicRole> {
        self.bindings.keys().copied().collect()
    }

    /// 排队中尚未发出的写请求数
    pub fn queued_writes(&self) -> usize {
        self.write_queue.len()
    }

    fn role_of(&self, characteristic: Uuid) -> Option<CharacteristicRole> {
        self.bindings
            .iter()
            .find(|(_, c)| c.uuid == characteristic)
            .map(|(role, _)| *role)
    }

    fn reset_session(&mut self) {
        self.bindings.clear();
        self.pending_discoveries = 0;
        self.pending_reads.clear();
        self.write_queue.clear();
        self.write_in_flight = false;
    }
}

enum CentralState {
    Idle,
    Scanning { filter: String },
    Connecting { peer: PeerId, name: String },
    Discovering(RemotePeer),
    Ready(RemotePeer),
}

impl CentralState {
    fn phase(&self) -> CentralPhase {
        match self {
            CentralState::Idle => CentralPhase::Idle,
            CentralState::Scanning { .. } => CentralPhase::Scanning,
            CentralState::Connecting { .. } => CentralPhase::Connecting,
            CentralState::Discovering(_) => CentralPhase::Discovering,
            CentralState::Ready(_) => CentralPhase::Ready,
        }
    }

    fn peer_id(&self) -> Option<&PeerId> {
        match self {
            CentralState::Connecting { peer, .. } => Some(peer),
            CentralState::Discovering(remote) | CentralState::Ready(remote) => Some(&remote.id),
            _ => None,
        }
    }
}

fn ready_peer<'a>(
    state: &'a mut CentralState,
    operation: &'static str,
) -> Result<&'a mut RemotePeer, BleError> {
    match state {
        CentralState::Ready(remote) => Ok(remote),
        other => Err(BleError::invalid_state(operation, other.phase().name())),
    }
}

pub struct CentralEngine<R> {
    radio: R,
    service: ServiceDescriptor,
    adapter: AdapterMonitor<CentralIntent>,
    state: CentralState,
    outcomes: mpsc::UnboundedSender<CentralOutcome>,
    log: Box<dyn EventLog>,
}

impl<R: CentralRadio> CentralEngine<R> {
    pub fn new(
        radio: R,
        service: ServiceDescriptor,
        outcomes: mpsc::UnboundedSender<CentralOutcome>,
        log: Box<dyn EventLog>,
    ) -> Self {
        Self {
            radio,
            service,
            adapter: AdapterMonitor::new(),
            state: CentralState::Idle,
            outcomes,
            log,
        }
    }

    pub fn radio(&self) -> &R {
        &self.radio
    }

    pub fn radio_mut(&mut self) -> &mut R {
        &mut self.radio
    }

    pub fn phase(&self) -> CentralPhase {
        self.state.phase()
    }

    pub fn adapter_state(&self) -> AdapterState {
        self.adapter.current_state()
    }

    pub fn subscribe_adapter(&self) -> watch::Receiver<AdapterState> {
        self.adapter.subscribe()
    }

    pub fn pending_intents(&self) -> &[CentralIntent] {
        self.adapter.pending()
    }

    /// 正在发现或已就绪的外设
    pub fn peer(&self) -> Option<&RemotePeer> {
        match &self.state {
            CentralState::Discovering(remote) | CentralState::Ready(remote) => Some(remote),
            _ => None,
        }
    }

    // ---------------------------------------------------------------------
    // 公开操作
    // ---------------------------------------------------------------------

    /// 开始扫描，只接受本地名称等于 `filter` 的广播
    pub fn start_scan(&mut self, filter: &str) -> Result<(), BleError> {
        self.adapter.ensure_powered()?;
        if !matches!(self.state, CentralState::Idle) {
            return Err(BleError::invalid_state("start_scan", self.phase().name()));
        }

        self.radio.start_scan();
        self.note(LogLevel::Info, format!("Scan started, looking for '{filter}'"));
        self.set_state(
            CentralPhase::Idle,
            CentralState::Scanning {
                filter: filter.to_string(),
            },
        );
        Ok(())
    }

    /// 适配器就绪时立即扫描，否则挂起到 `PoweredOn` 再执行
    pub fn request_scan(&mut self, filter: &str) -> Result<(), BleError> {
        if self.adapter.is_powered_on() {
            return self.start_scan(filter);
        }
        if self.adapter.defer(CentralIntent::StartScan(filter.to_string()))? == Deferral::Queued {
            self.note(
                LogLevel::Info,
                format!(
                    "Adapter is {}, scan will start once powered on",
                    self.adapter.current_state()
                ),
            );
        }
        Ok(())
    }

    pub fn stop_scan(&mut self) -> Result<(), BleError> {
        if !matches!(self.state, CentralState::Scanning { .. }) {
            return Err(BleError::invalid_state("stop_scan", self.phase().name()));
        }
        self.radio.stop_scan();
        self.note(LogLevel::Info, "Scan stopped");
        self.set_state(CentralPhase::Scanning, CentralState::Idle);
        Ok(())
    }

    pub fn read_characteristic(&mut self) -> Result<(), BleError> {
        self.read(CharacteristicRole::Read)
    }

    /// 读取指定角色的特征，结果以 `ValueRead` 送出
    pub fn read(&mut self, role: CharacteristicRole) -> Result<(), BleError> {
        let remote = ready_peer(&mut self.state, "read")?;
        let characteristic = remote
            .bindings
            .get(&role)
            .cloned()
            .ok_or(BleError::CharacteristicUnavailable(role))?;

        remote.pending_reads.insert(characteristic.uuid);
        self.radio.read(&remote.id, &characteristic);
        debug!("Read requested on {} ({})", role, characteristic.uuid);
        Ok(())
    }

    /// 写入 write 特征 (write-with-response)
    ///
    /// 同一时间只有一个写请求在途，其余按提交顺序排队。
    pub fn write_characteristic(&mut self, value: &[u8]) -> Result<(), BleError> {
        let remote = ready_peer(&mut self.state, "write_characteristic")?;
        let characteristic = remote
            .bindings
            .get(&CharacteristicRole::Write)
            .cloned()
            .ok_or(BleError::CharacteristicUnavailable(CharacteristicRole::Write))?;

        if remote.write_in_flight {
            remote.write_queue.push_back(value.to_vec());
            debug!(
                "Write queued behind in-flight request ({} pending)",
                remote.write_queue.len()
            );
            return Ok(());
        }

        remote.write_in_flight = true;
        self.radio.write(&remote.id, &characteristic, value);
        debug!("Write of {} byte(s) issued", value.len());
        Ok(())
    }

    pub fn subscribe_notify(&mut self) -> Result<(), BleError> {
        self.set_subscription(CharacteristicRole::Notify, true)
    }

    pub fn unsubscribe_notify(&mut self) -> Result<(), BleError> {
        self.set_subscription(CharacteristicRole::Notify, false)
    }

    pub fn subscribe_indicate(&mut self) -> Result<(), BleError> {
        self.set_subscription(CharacteristicRole::Indicate, true)
    }

    pub fn unsubscribe_indicate(&mut self) -> Result<(), BleError> {
        self.set_subscription(CharacteristicRole::Indicate, false)
    }

    pub fn set_subscription(
        &mut self,
        role: CharacteristicRole,
        enabled: bool,
    ) -> Result<(), BleError> {
        let operation = if enabled { "subscribe" } else { "unsubscribe" };
        let remote = ready_peer(&mut self.state, operation)?;
        let characteristic = remote
            .bindings
            .get(&role)
            .cloned()
            .ok_or(BleError::CharacteristicUnavailable(role))?;

        self.radio.set_notify(&remote.id, &characteristic, enabled);
        Ok(())
    }

    /// 断开当前外设 (或停止扫描)，清除所有绑定
    pub fn disconnect(&mut self) -> Result<(), BleError> {
        let from = self.phase();
        match std::mem::replace(&mut self.state, CentralState::Idle) {
            CentralState::Idle => Err(BleError::invalid_state("disconnect", from.name())),
            CentralState::Scanning { .. } => {
                self.radio.stop_scan();
                self.note(LogLevel::Info, "Scan stopped");
                self.emit(CentralOutcome::PhaseChanged {
                    from,
                    to: CentralPhase::Idle,
                });
                Ok(())
            }
            CentralState::Connecting { peer, .. } => {
                self.radio.cancel_connection(&peer);
                self.finish_disconnect(from, peer, DisconnectCause::Local);
                Ok(())
            }
            CentralState::Discovering(remote) | CentralState::Ready(remote) => {
                self.radio.cancel_connection(&remote.id);
                self.finish_disconnect(from, remote.id, DisconnectCause::Local);
                Ok(())
            }
        }
    }

    /// 在已连接的外设上重新发现服务和特征
    pub fn rediscover(&mut self) -> Result<(), BleError> {
        let from = self.phase();
        match std::mem::replace(&mut self.state, CentralState::Idle) {
            CentralState::Ready(mut remote) => {
                remote.reset_session();
                self.begin_discovery(from, remote);
                Ok(())
            }
            other => {
                self.state = other;
                Err(BleError::invalid_state("rediscover", from.name()))
            }
        }
    }

    // ---------------------------------------------------------------------
    // 事件处理
    // ---------------------------------------------------------------------

    pub fn handle_event(&mut self, event: CentralEvent) {
        trace!("central event: {:?}", event);
        match event {
            CentralEvent::StateChanged(state) => self.on_adapter_state(state),
            CentralEvent::AdvertisementReceived(adv) => self.on_advertisement(adv),
            CentralEvent::Connected(peer) => self.on_connected(peer),
            CentralEvent::ConnectFailed { peer, cause } => self.on_connect_failed(peer, cause),
            CentralEvent::ServicesDiscovered { peer, result } => {
                self.on_services_discovered(peer, result)
            }
            CentralEvent::CharacteristicsDiscovered {
                peer,
                service,
                result,
            } => self.on_characteristics_discovered(peer, service, result),
            CentralEvent::ValueUpdated {
                peer,
                characteristic,
                result,
            } => self.on_value_updated(peer, characteristic, result),
            CentralEvent::WriteCompleted {
                peer,
                characteristic,
                result,
            } => self.on_write_completed(peer, characteristic, result),
            CentralEvent::NotifyStateChanged {
                peer,
                characteristic,
                result,
            } => self.on_notify_state(peer, characteristic, result),
            CentralEvent::Disconnected { peer, reason } => self.on_disconnected(peer, reason),
        }
    }

    fn on_adapter_state(&mut self, state: AdapterState) {
        self.note(LogLevel::Info, state.name());
        self.emit(CentralOutcome::AdapterChanged(state));
        let replay = self.adapter.update(state);

        if state != AdapterState::PoweredOn {
            let from = self.phase();
            match std::mem::replace(&mut self.state, CentralState::Idle) {
                CentralState::Idle => {}
                CentralState::Scanning { .. } => {
                    self.emit(CentralOutcome::PhaseChanged {
                        from,
                        to: CentralPhase::Idle,
                    });
                }
                CentralState::Connecting { peer, .. } => {
                    self.finish_disconnect(from, peer, DisconnectCause::AdapterLost(state));
                }
                CentralState::Discovering(remote) | CentralState::Ready(remote) => {
                    self.finish_disconnect(from, remote.id, DisconnectCause::AdapterLost(state));
                }
            }
        }

        for intent in replay {
            match intent {
                CentralIntent::StartScan(filter) => {
                    if let Err(e) = self.start_scan(&filter) {
                        warn!("Deferred scan could not start: {}", e);
                        self.emit(CentralOutcome::Rejected(e));
                    }
                }
            }
        }
    }

    fn on_advertisement(&mut self, adv: Advertisement) {
        let CentralState::Scanning { filter } = &self.state else {
            trace!("Ignoring advertisement from {} while {}", adv.peer, self.phase().name());
            return;
        };
        if adv.local_name.as_deref() != Some(filter.as_str()) {
            return;
        }

        let name = filter.clone();
        self.radio.stop_scan();
        self.radio.connect(&adv.peer);
        self.note(
            LogLevel::Info,
            format!("Found target peripheral '{}', connecting", name),
        );
        self.emit(CentralOutcome::PeerFound {
            peer: adv.peer.clone(),
            name: name.clone(),
            rssi: adv.rssi,
        });
        self.set_state(
            CentralPhase::Scanning,
            CentralState::Connecting {
                peer: adv.peer,
                name,
            },
        );
    }

    fn on_connected(&mut self, peer: PeerId) {
        let from = self.phase();
        match std::mem::replace(&mut self.state, CentralState::Idle) {
            CentralState::Connecting {
                peer: expected,
                name,
            } if expected == peer => {
                self.note(LogLevel::Info, "Connected");
                self.emit(CentralOutcome::Connected(peer.clone()));
                self.begin_discovery(from, RemotePeer::new(peer, name));
            }
            other => {
                self.state = other;
                debug!("Ignoring stale connect event for {}", peer);
            }
        }
    }

    fn on_connect_failed(&mut self, peer: PeerId, cause: RadioFailure) {
        if !matches!(&self.state, CentralState::Connecting { peer: expected, .. } if *expected == peer)
        {
            debug!("Ignoring stale connect failure for {}", peer);
            return;
        }
        self.note(LogLevel::Warn, format!("Connection failed: {}", cause));
        self.emit(CentralOutcome::ConnectionFailed { peer, cause });
        self.set_state(CentralPhase::Connecting, CentralState::Idle);
    }

    fn begin_discovery(&mut self, from: CentralPhase, remote: RemotePeer) {
        self.radio.discover_services(&remote.id, &[self.service.uuid]);
        self.set_state(from, CentralState::Discovering(remote));
    }

    fn on_services_discovered(&mut self, peer: PeerId, result: Result<Vec<Uuid>, RadioFailure>) {
        let CentralState::Discovering(remote) = &mut self.state else {
            debug!("Ignoring service discovery result outside discovery");
            return;
        };
        if remote.id != peer {
            return;
        }

        let wanted = self.service.characteristic_uuids();
        let complete = match result {
            Ok(services) => {
                remote.pending_discoveries = services.len();
                for service in &services {
                    self.radio
                        .discover_characteristics(&remote.id, *service, &wanted);
                }
                self.note(
                    LogLevel::Info,
                    format!("Found {} service(s)", services.len()),
                );
                services.is_empty()
            }
            Err(cause) => {
                warn!("Service discovery failed: {}", cause);
                self.emit(CentralOutcome::OperationFailed {
                    operation: CentralOperation::Discover,
                    characteristic: self.service.uuid,
                    cause,
                });
                true
            }
        };

        if complete {
            self.complete_discovery();
        }
    }

    fn on_characteristics_discovered(
        &mut self,
        peer: PeerId,
        service: Uuid,
        result: Result<Vec<RemoteCharacteristic>, RadioFailure>,
    ) {
        let expected = self.expected_roles();
        let CentralState::Discovering(remote) = &mut self.state else {
            debug!("Ignoring characteristic discovery result outside discovery");
            return;
        };
        if remote.id != peer {
            return;
        }
        remote.pending_discoveries = remote.pending_discoveries.saturating_sub(1);

        let mut failure = None;
        match result {
            Ok(characteristics) => {
                let found = characteristics.len();
                for characteristic in characteristics {
                    match CharacteristicRole::from_uuid(characteristic.uuid)
                        .filter(|role| expected.contains(role))
                    {
                        Some(role) => {
                            remote.bindings.insert(role, characteristic);
                        }
                        None => trace!("Dropping unknown characteristic {}", characteristic.uuid),
                    }
                }
                self.log.append(LogEntry::new(
                    LogLevel::Info,
                    SOURCE,
                    format!("Found {} characteristic(s) in {}", found, service),
                ));
            }
            Err(cause) => failure = Some(cause),
        }

        let all_bound = expected.iter().all(|role| remote.bindings.contains_key(role));
        let complete = all_bound || remote.pending_discoveries == 0;

        if let Some(cause) = failure {
            warn!("Characteristic discovery failed for {}: {}", service, cause);
            self.emit(CentralOutcome::OperationFailed {
                operation: CentralOperation::Discover,
                characteristic: service,
                cause,
            });
        }
        if complete {
            self.complete_discovery();
        }
    }

    fn complete_discovery(&mut self) {
        let from = self.phase();
        let remote = match std::mem::replace(&mut self.state, CentralState::Idle) {
            CentralState::Discovering(remote) => remote,
            other => {
                self.state = other;
                return;
            }
        };

        let bound = remote.bound_roles();
        let missing: Vec<CharacteristicRole> = self
            .expected_roles()
            .into_iter()
            .filter(|role| !bound.contains(role))
            .collect();

        if !missing.is_empty() {
            self.note(
                LogLevel::Warn,
                format!("Discovery incomplete, missing {:?}", missing),
            );
            self.emit(CentralOutcome::DiscoveryIncomplete { missing });
        }
        self.emit(CentralOutcome::DiscoveryComplete { bound });
        self.set_state(from, CentralState::Ready(remote));
    }

    fn on_value_updated(
        &mut self,
        peer: PeerId,
        characteristic: Uuid,
        result: Result<Vec<u8>, RadioFailure>,
    ) {
        let CentralState::Ready(remote) = &mut self.state else {
            debug!("Ignoring value update outside ready state");
            return;
        };
        if remote.id != peer {
            return;
        }
        let Some(role) = remote.role_of(characteristic) else {
            debug!("Ignoring value for unbound characteristic {}", characteristic);
            return;
        };
        let requested = remote.pending_reads.remove(&characteristic);

        match result {
            Ok(value) => {
                self.note(
                    LogLevel::Info,
                    format!("Value received on {}: {:?}", role, String::from_utf8_lossy(&value)),
                );
                if requested {
                    self.emit(CentralOutcome::ValueRead { role, value });
                } else {
                    self.emit(CentralOutcome::ValueNotified { role, value });
                }
            }
            Err(cause) => {
                self.note(LogLevel::Warn, format!("Read on {} failed: {}", role, cause));
                self.emit(CentralOutcome::OperationFailed {
                    operation: CentralOperation::Read,
                    characteristic,
                    cause,
                });
            }
        }
    }

    fn on_write_completed(
        &mut self,
        peer: PeerId,
        characteristic: Uuid,
        result: Result<(), RadioFailure>,
    ) {
        let CentralState::Ready(remote) = &mut self.state else {
            debug!("Ignoring write completion outside ready state");
            return;
        };
        if remote.id != peer {
            return;
        }
        remote.write_in_flight = false;
        let role = remote.role_of(characteristic);

        // 发出排队中的下一个写请求
        if let Some(next) = remote.write_queue.pop_front() {
            if let Some(target) = remote.bindings.get(&CharacteristicRole::Write).cloned() {
                remote.write_in_flight = true;
                self.radio.write(&remote.id, &target, &next);
            }
        }

        match (result, role) {
            (Ok(()), Some(role)) => {
                self.note(LogLevel::Info, "Write succeeded");
                self.emit(CentralOutcome::WriteCompleted { role });
            }
            (Ok(()), None) => debug!("Write completed on unbound {}", characteristic),
            (Err(cause), _) => {
                self.note(LogLevel::Warn, format!("Write failed: {}", cause));
                self.emit(CentralOutcome::OperationFailed {
                    operation: CentralOperation::Write,
                    characteristic,
                    cause,
                });
            }
        }
    }

    fn on_notify_state(
        &mut self,
        peer: PeerId,
        characteristic: Uuid,
        result: Result<bool, RadioFailure>,
    ) {
        let CentralState::Ready(remote) = &self.state else {
            return;
        };
        if remote.id != peer {
            return;
        }
        let Some(role) = remote.role_of(characteristic) else {
            return;
        };

        match result {
            Ok(enabled) => {
                let verb = if enabled { "enabled" } else { "disabled" };
                self.note(LogLevel::Info, format!("{} updates {}", role, verb));
                self.emit(CentralOutcome::NotifyStateChanged { role, enabled });
            }
            Err(cause) => {
                self.note(
                    LogLevel::Warn,
                    format!("Changing {} subscription failed: {}", role, cause),
                );
                self.emit(CentralOutcome::OperationFailed {
                    operation: CentralOperation::Subscribe,
                    characteristic,
                    cause,
                });
            }
        }
    }

    fn on_disconnected(&mut self, peer: PeerId, reason: Option<RadioFailure>) {
        if self.state.peer_id() != Some(&peer) {
            debug!("Ignoring disconnect of {} (not the current peer)", peer);
            return;
        }
        let from = self.phase();
        self.state = CentralState::Idle;
        self.finish_disconnect(from, peer, DisconnectCause::Remote(reason));
    }

    // ---------------------------------------------------------------------
    // 内部工具
    // ---------------------------------------------------------------------

    /// 注册表里能映射到角色的特征
    fn expected_roles(&self) -> Vec<CharacteristicRole> {
        CharacteristicRole::ALL
            .into_iter()
            .filter(|role| self.service.characteristic(role.uuid()).is_some())
            .collect()
    }

    /// 调用前 `self.state` 必须已经是 `Idle`
    fn finish_disconnect(&mut self, from: CentralPhase, peer: PeerId, cause: DisconnectCause) {
        let message = match &cause {
            DisconnectCause::Local => format!("Disconnected from {}", peer),
            DisconnectCause::Remote(_) => format!("Peripheral {} disconnected", peer),
            DisconnectCause::AdapterLost(state) => {
                format!("Lost {} because adapter is {}", peer, state)
            }
        };
        self.note(LogLevel::Info, message);
        self.emit(CentralOutcome::PhaseChanged {
            from,
            to: CentralPhase::Disconnected,
        });
        self.emit(CentralOutcome::Disconnected { peer, cause });
        self.emit(CentralOutcome::PhaseChanged {
            from: CentralPhase::Disconnected,
            to: CentralPhase::Idle,
        });
    }

    fn set_state(&mut self, from: CentralPhase, next: CentralState) {
        self.state = next;
        let to = self.state.phase();
        if from != to {
            debug!("central: {} -> {}", from.name(), to.name());
            self.emit(CentralOutcome::PhaseChanged { from, to });
        }
    }

    /// 报告一个被拒绝的请求
    pub(crate) fn reject(&self, error: BleError) {
        warn!("{} request rejected: {}", SOURCE, error);
        self.emit(CentralOutcome::Rejected(error));
    }

    fn emit(&self, outcome: CentralOutcome) {
        let _ = self.outcomes.send(outcome);
    }

    fn note(&self, level: LogLevel, message: impl Into<String>) {
        self.log.append(LogEntry::new(level, SOURCE, message));
    }
}
