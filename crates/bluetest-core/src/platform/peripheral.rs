//! bluer (BlueZ) peripheral 绑定
//!
//! GATT 回调把每个读写请求编号后送进引擎，再在 oneshot 上等待引擎的应答。
//! 每个 notify/indicate 会话有自己的发送队列，队列满时引擎会收到
//! `ReadyToUpdateSubscribers` 再重发。

use bluer::adv::{Advertisement, AdvertisementHandle, Type as AdvertisementType};
use bluer::gatt::local::{
    Application, ApplicationHandle, Characteristic, CharacteristicNotifier, CharacteristicNotify,
    CharacteristicNotifyMethod, CharacteristicRead, CharacteristicWrite,
    CharacteristicWriteMethod, ReqError, Service,
};
use futures_util::FutureExt;
use log::{debug, error, info, trace, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::event::{PeripheralEvent, ReadRequest, WriteBatch, WriteRequest};
use crate::gatt::{AttResponse, AttResult, CharacteristicDescriptor, GattOperation, ServiceDescriptor};
use crate::radio::{AdvertisementData, PeripheralRadio, RadioFailure, RequestId, SubscriberId};

/// 每个订阅会话的待发队列长度
const NOTIFY_QUEUE: usize = 8;
/// 检查订阅会话是否已被对端关闭的间隔
const STOP_POLL: Duration = Duration::from_millis(500);
/// 订阅会话句柄的编号区间，与按地址得到的句柄不重叠
///
/// BlueZ 的 StartNotify 不带设备地址，所以订阅句柄只在一个会话内有效。
const SESSION_ID_BASE: u64 = 1 << 63;

impl From<bluer::Error> for RadioFailure {
    fn from(e: bluer::Error) -> Self {
        RadioFailure::new(e.to_string())
    }
}

fn req_error(result: AttResult) -> ReqError {
    match result {
        AttResult::ReadNotPermitted | AttResult::WriteNotPermitted => ReqError::NotPermitted,
        AttResult::RequestNotSupported => ReqError::NotSupported,
        _ => ReqError::Failed,
    }
}

/// 读写请求的来源句柄，直接由设备地址得到
fn central_id(address: bluer::Address) -> SubscriberId {
    let mut bytes = [0u8; 8];
    bytes[2..].copy_from_slice(&address.0);
    SubscriberId(u64::from_be_bytes(bytes))
}

fn session_id(sequence: u64) -> SubscriberId {
    SubscriberId(SESSION_ID_BASE | sequence)
}

#[derive(Default)]
struct Shared {
    next_id: AtomicU64,
    /// 等待引擎应答的请求
    pending: Mutex<HashMap<RequestId, oneshot::Sender<AttResponse>>>,
    sessions: Mutex<HashMap<(Uuid, SubscriberId), mpsc::Sender<Vec<u8>>>>,
    congested: AtomicBool,
    app: Mutex<Option<ApplicationHandle>>,
    advertisement: Mutex<Option<AdvertisementHandle>>,
    advertise_generation: AtomicU64,
}

impl Shared {
    fn next(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn track(&self) -> (RequestId, oneshot::Receiver<AttResponse>) {
        let id = RequestId(self.next());
        let (tx, rx) = oneshot::channel();
        if let Ok(mut pending) = self.pending.lock() {
            pending.insert(id, tx);
        }
        (id, rx)
    }

    fn forget(&self, id: RequestId) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.remove(&id);
        }
    }
}

/// 把请求送进引擎并等待应答
async fn exchange(
    shared: &Shared,
    events: &mpsc::Sender<PeripheralEvent>,
    id: RequestId,
    rx: oneshot::Receiver<AttResponse>,
    event: PeripheralEvent,
) -> Result<AttResponse, ReqError> {
    if events.send(event).await.is_err() {
        shared.forget(id);
        return Err(ReqError::Failed);
    }
    rx.await.map_err(|_| ReqError::Failed)
}

/// 基于 bluer 的 peripheral 平台服务
pub struct BluerPeripheral {
    _session: bluer::Session,
    adapter: bluer::Adapter,
    events: mpsc::Sender<PeripheralEvent>,
    shared: Arc<Shared>,
}

impl BluerPeripheral {
    pub async fn new(events: mpsc::Sender<PeripheralEvent>) -> anyhow::Result<Self> {
        debug!("Initializing BLE session...");
        let session = bluer::Session::new().await?;
        let adapter = session.default_adapter().await?;
        debug!("Using adapter: {}", adapter.name());

        Ok(Self {
            _session: session,
            adapter,
            events,
            shared: Arc::new(Shared::default()),
        })
    }

    fn characteristic(&self, descriptor: &CharacteristicDescriptor) -> Characteristic {
        let uuid = descriptor.uuid;

        let read = descriptor.allows_read().then(|| {
            let shared = self.shared.clone();
            let events = self.events.clone();
            CharacteristicRead {
                read: true,
                fun: Box::new(move |req| {
                    let shared = shared.clone();
                    let events = events.clone();
                    async move {
                        let (id, rx) = shared.track();
                        let event = PeripheralEvent::ReadRequest(ReadRequest {
                            id,
                            central: central_id(req.device_address),
                            characteristic: uuid,
                            offset: usize::from(req.offset),
                        });
                        let response = exchange(&shared, &events, id, rx, event).await?;
                        match response.result {
                            AttResult::Success => Ok(response.value.unwrap_or_default()),
                            other => Err(req_error(other)),
                        }
                    }
                    .boxed()
                }),
                ..Default::default()
            }
        });

        let write = descriptor.allows_write().then(|| {
            let shared = self.shared.clone();
            let events = self.events.clone();
            CharacteristicWrite {
                write: descriptor.supports(GattOperation::Write),
                write_without_response: descriptor.supports(GattOperation::WriteWithoutResponse),
                method: CharacteristicWriteMethod::Fun(Box::new(move |value, req| {
                    let shared = shared.clone();
                    let events = events.clone();
                    async move {
                        let (id, rx) = shared.track();
                        let event = PeripheralEvent::WriteRequest(WriteBatch {
                            id,
                            central: central_id(req.device_address),
                            requests: vec![WriteRequest {
                                characteristic: uuid,
                                offset: usize::from(req.offset),
                                value,
                            }],
                        });
                        let response = exchange(&shared, &events, id, rx, event).await?;
                        match response.result {
                            AttResult::Success => Ok(()),
                            other => Err(req_error(other)),
                        }
                    }
                    .boxed()
                })),
                ..Default::default()
            }
        });

        let notify = descriptor.allows_subscribe().then(|| {
            let shared = self.shared.clone();
            let events = self.events.clone();
            CharacteristicNotify {
                notify: descriptor.supports(GattOperation::Notify),
                indicate: descriptor.supports(GattOperation::Indicate),
                method: CharacteristicNotifyMethod::Fun(Box::new(move |notifier| {
                    let shared = shared.clone();
                    let events = events.clone();
                    async move {
                        tokio::spawn(serve_session(shared, events, uuid, notifier));
                    }
                    .boxed()
                })),
                ..Default::default()
            }
        });

        Characteristic {
            uuid,
            read,
            write,
            notify,
            ..Default::default()
        }
    }
}

/// 一个订阅会话：把引擎推送的值转发给对端，直到对端取消订阅
async fn serve_session(
    shared: Arc<Shared>,
    events: mpsc::Sender<PeripheralEvent>,
    characteristic: Uuid,
    mut notifier: CharacteristicNotifier,
) {
    let central = session_id(shared.next());
    let (tx, mut rx) = mpsc::channel::<Vec<u8>>(NOTIFY_QUEUE);
    if let Ok(mut sessions) = shared.sessions.lock() {
        sessions.insert((characteristic, central), tx);
    }
    let _ = events
        .send(PeripheralEvent::Subscribed {
            central,
            characteristic,
        })
        .await;

    let mut poll = tokio::time::interval(STOP_POLL);
    loop {
        tokio::select! {
            value = rx.recv() => {
                let Some(value) = value else { break };
                if let Err(e) = notifier.notify(value).await {
                    debug!("Notification to {} failed: {}", central, e);
                    break;
                }
                if shared.congested.swap(false, Ordering::AcqRel) {
                    let _ = events.send(PeripheralEvent::ReadyToUpdateSubscribers).await;
                }
            }
            _ = poll.tick() => {
                if notifier.is_stopped() {
                    break;
                }
            }
        }
    }

    if let Ok(mut sessions) = shared.sessions.lock() {
        sessions.remove(&(characteristic, central));
    }
    trace!("Session {} on {} closed", central, characteristic);
    let _ = events
        .send(PeripheralEvent::Unsubscribed {
            central,
            characteristic,
        })
        .await;
    // 堵住发送的可能正是这个会话，结束后让引擎重试排队的值
    if shared.congested.swap(false, Ordering::AcqRel) {
        let _ = events.send(PeripheralEvent::ReadyToUpdateSubscribers).await;
    }
}

impl PeripheralRadio for BluerPeripheral {
    fn add_service(&mut self, service: &ServiceDescriptor) {
        let app = Application {
            services: vec![Service {
                uuid: service.uuid,
                primary: service.primary,
                characteristics: service
                    .characteristics
                    .iter()
                    .map(|c| self.characteristic(c))
                    .collect(),
                ..Default::default()
            }],
            ..Default::default()
        };

        let adapter = self.adapter.clone();
        let events = self.events.clone();
        let shared = self.shared.clone();
        let service_uuid = service.uuid;
        tokio::spawn(async move {
            debug!("Registering GATT application with service_uuid={}", service_uuid);
            let result = match adapter.serve_gatt_application(app).await {
                Ok(handle) => {
                    if let Ok(mut app) = shared.app.lock() {
                        *app = Some(handle);
                    }
                    Ok(())
                }
                Err(e) => {
                    error!("Failed to register GATT application: {}", e);
                    Err(RadioFailure::from(e))
                }
            };
            let _ = events
                .send(PeripheralEvent::ServiceAdded {
                    service: service_uuid,
                    result,
                })
                .await;
        });
    }

    fn start_advertising(&mut self, advertisement: &AdvertisementData) {
        let adv = Advertisement {
            advertisement_type: AdvertisementType::Peripheral,
            service_uuids: advertisement.service_uuids.iter().copied().collect(),
            local_name: Some(advertisement.local_name.clone()),
            discoverable: Some(true),
            ..Default::default()
        };

        let adapter = self.adapter.clone();
        let events = self.events.clone();
        let shared = self.shared.clone();
        let generation = shared.advertise_generation.load(Ordering::Acquire);
        tokio::spawn(async move {
            let result = match adapter.advertise(adv).await {
                Ok(handle) => {
                    if shared.advertise_generation.load(Ordering::Acquire) != generation {
                        debug!("Advertising was stopped before it started");
                        return;
                    }
                    if let Ok(mut slot) = shared.advertisement.lock() {
                        *slot = Some(handle);
                    }
                    info!("BLE advertisement started");
                    Ok(())
                }
                Err(e) => Err(RadioFailure::from(e)),
            };
            let _ = events.send(PeripheralEvent::AdvertisingStarted(result)).await;
        });
    }

    fn stop_advertising(&mut self) {
        self.shared
            .advertise_generation
            .fetch_add(1, Ordering::AcqRel);
        if let Ok(mut slot) = self.shared.advertisement.lock() {
            if slot.take().is_some() {
                debug!("BLE advertisement stopped");
            }
        }
    }

    fn respond(&mut self, request: RequestId, response: AttResponse) {
        let waiter = self
            .shared
            .pending
            .lock()
            .ok()
            .and_then(|mut pending| pending.remove(&request));
        match waiter {
            Some(tx) => {
                if tx.send(response).is_err() {
                    debug!("{} was abandoned by BlueZ", request);
                }
            }
            None => warn!("No pending request {}", request),
        }
    }

    fn update_value(
        &mut self,
        characteristic: Uuid,
        value: &[u8],
        subscribers: &[SubscriberId],
    ) -> bool {
        let Ok(sessions) = self.shared.sessions.lock() else {
            return false;
        };
        let targets: Vec<&mpsc::Sender<Vec<u8>>> = subscribers
            .iter()
            .filter_map(|s| sessions.get(&(characteristic, *s)))
            .collect();

        if targets.iter().any(|tx| tx.capacity() == 0) {
            self.shared.congested.store(true, Ordering::Release);
            return false;
        }
        for tx in targets {
            let _ = tx.try_send(value.to_vec());
        }
        true
    }
}
