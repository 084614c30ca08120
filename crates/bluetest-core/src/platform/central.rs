//! btleplug central 绑定
//!
//! 每个 [`CentralRadio`] 请求都在独立的 tokio 任务中执行，完成后把结果作为
//! [`CentralEvent`] 送回引擎的事件通道。

use btleplug::api::{
    Central, CentralEvent as BtleEvent, CharPropFlags, Characteristic, Manager as _,
    Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral as PlatformPeripheral, PeripheralId};
use futures_util::StreamExt;
use log::{debug, info, trace, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::event::{Advertisement, CentralEvent};
use crate::gatt::GattOperation;
use crate::radio::{CentralRadio, PeerId, RadioFailure, RemoteCharacteristic};

impl From<btleplug::Error> for RadioFailure {
    fn from(e: btleplug::Error) -> Self {
        RadioFailure::new(e.to_string())
    }
}

fn operations(properties: CharPropFlags) -> Vec<GattOperation> {
    [
        (CharPropFlags::READ, GattOperation::Read),
        (CharPropFlags::WRITE, GattOperation::Write),
        (
            CharPropFlags::WRITE_WITHOUT_RESPONSE,
            GattOperation::WriteWithoutResponse,
        ),
        (CharPropFlags::NOTIFY, GattOperation::Notify),
        (CharPropFlags::INDICATE, GattOperation::Indicate),
    ]
    .into_iter()
    .filter(|(flag, _)| properties.contains(*flag))
    .map(|(_, op)| op)
    .collect()
}

#[derive(Clone)]
struct Shared {
    adapter: Adapter,
    events: mpsc::Sender<CentralEvent>,
    /// 地址 → btleplug 外设 ID
    known: Arc<Mutex<HashMap<PeerId, PeripheralId>>>,
    scanning: Arc<AtomicBool>,
}

impl Shared {
    async fn emit(&self, event: CentralEvent) {
        if self.events.send(event).await.is_err() {
            trace!("central event channel closed");
        }
    }

    fn remember(&self, peer: PeerId, id: PeripheralId) {
        if let Ok(mut known) = self.known.lock() {
            known.insert(peer, id);
        }
    }

    fn peer_for(&self, id: &PeripheralId) -> Option<PeerId> {
        let known = self.known.lock().ok()?;
        known
            .iter()
            .find(|(_, known_id)| *known_id == id)
            .map(|(peer, _)| peer.clone())
    }

    async fn peripheral(&self, peer: &PeerId) -> Result<PlatformPeripheral, RadioFailure> {
        let id = self
            .known
            .lock()
            .ok()
            .and_then(|known| known.get(peer).cloned())
            .ok_or_else(|| RadioFailure::new(format!("unknown peer {}", peer)))?;
        Ok(self.adapter.peripheral(&id).await?)
    }

    async fn characteristic(
        &self,
        peer: &PeerId,
        target: &RemoteCharacteristic,
    ) -> Result<(PlatformPeripheral, Characteristic), RadioFailure> {
        let peripheral = self.peripheral(peer).await?;
        let characteristic = peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == target.uuid && c.service_uuid == target.service)
            .ok_or_else(|| RadioFailure::new(format!("characteristic {} gone", target.uuid)))?;
        Ok((peripheral, characteristic))
    }

    async fn on_discovered(&self, id: PeripheralId) -> Result<(), RadioFailure> {
        if !self.scanning.load(Ordering::Relaxed) {
            return Ok(());
        }
        let peripheral = self.adapter.peripheral(&id).await?;
        let Some(props) = peripheral.properties().await? else {
            return Ok(());
        };
        let peer = PeerId::new(props.address.to_string());
        self.remember(peer.clone(), id);
        self.emit(CentralEvent::AdvertisementReceived(Advertisement {
            peer,
            local_name: props.local_name,
            service_uuids: props.services,
            rssi: props.rssi,
        }))
        .await;
        Ok(())
    }
}

/// 基于 btleplug 的 central 平台服务
pub struct BtleplugCentral {
    shared: Shared,
    pump: tokio::task::JoinHandle<()>,
}

impl BtleplugCentral {
    /// 使用第一个可用适配器，并开始转发广播和断开事件
    pub async fn new(events: mpsc::Sender<CentralEvent>) -> anyhow::Result<Self> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("No Bluetooth adapters found"))?;
        debug!("Using adapter: {:?}", adapter.adapter_info().await.ok());

        let shared = Shared {
            adapter,
            events,
            known: Arc::new(Mutex::new(HashMap::new())),
            scanning: Arc::new(AtomicBool::new(false)),
        };

        let mut stream = shared.adapter.events().await?;
        let pump_shared = shared.clone();
        let pump = tokio::spawn(async move {
            while let Some(event) = stream.next().await {
                match event {
                    BtleEvent::DeviceDiscovered(id) | BtleEvent::DeviceUpdated(id) => {
                        if let Err(e) = pump_shared.on_discovered(id).await {
                            debug!("Ignoring advertisement: {}", e);
                        }
                    }
                    BtleEvent::DeviceDisconnected(id) => {
                        if let Some(peer) = pump_shared.peer_for(&id) {
                            pump_shared
                                .emit(CentralEvent::Disconnected { peer, reason: None })
                                .await;
                        }
                    }
                    _ => {}
                }
            }
            debug!("btleplug event stream ended");
        });

        Ok(Self { shared, pump })
    }

    fn spawn<F, Fut>(&self, task: F)
    where
        F: FnOnce(Shared) -> Fut,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        tokio::spawn(task(self.shared.clone()));
    }
}

impl Drop for BtleplugCentral {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

impl CentralRadio for BtleplugCentral {
    fn start_scan(&mut self) {
        self.shared.scanning.store(true, Ordering::Relaxed);
        self.spawn(|shared| async move {
            if let Err(e) = shared.adapter.start_scan(ScanFilter::default()).await {
                warn!("Failed to start scan: {}", e);
            }
        });
    }

    fn stop_scan(&mut self) {
        self.shared.scanning.store(false, Ordering::Relaxed);
        self.spawn(|shared| async move {
            if let Err(e) = shared.adapter.stop_scan().await {
                warn!("Failed to stop scan: {}", e);
            }
        });
    }

    fn connect(&mut self, peer: &PeerId) {
        let peer = peer.clone();
        self.spawn(|shared| async move {
            info!("Connecting to {}", peer);
            let connected = async {
                let peripheral = shared.peripheral(&peer).await?;
                peripheral.connect().await?;
                let notifications = peripheral.notifications().await?;
                Ok::<_, RadioFailure>(notifications)
            }
            .await;

            match connected {
                Ok(mut notifications) => {
                    shared.emit(CentralEvent::Connected(peer.clone())).await;
                    tokio::spawn(async move {
                        while let Some(notification) = notifications.next().await {
                            shared
                                .emit(CentralEvent::ValueUpdated {
                                    peer: peer.clone(),
                                    characteristic: notification.uuid,
                                    result: Ok(notification.value),
                                })
                                .await;
                        }
                        trace!("notification stream for {} ended", peer);
                    });
                }
                Err(cause) => {
                    shared
                        .emit(CentralEvent::ConnectFailed { peer, cause })
                        .await;
                }
            }
        });
    }

    fn cancel_connection(&mut self, peer: &PeerId) {
        let peer = peer.clone();
        self.spawn(|shared| async move {
            let result = async {
                let peripheral = shared.peripheral(&peer).await?;
                peripheral.disconnect().await?;
                Ok::<_, RadioFailure>(())
            }
            .await;
            if let Err(e) = result {
                debug!("Disconnect of {} failed: {}", peer, e);
            }
        });
    }

    fn discover_services(&mut self, peer: &PeerId, services: &[Uuid]) {
        let peer = peer.clone();
        let wanted = services.to_vec();
        self.spawn(|shared| async move {
            let result = async {
                let peripheral = shared.peripheral(&peer).await?;
                peripheral.discover_services().await?;
                Ok::<_, RadioFailure>(
                    peripheral
                        .services()
                        .into_iter()
                        .map(|s| s.uuid)
                        .filter(|uuid| wanted.contains(uuid))
                        .collect(),
                )
            }
            .await;
            shared
                .emit(CentralEvent::ServicesDiscovered { peer, result })
                .await;
        });
    }

    fn discover_characteristics(&mut self, peer: &PeerId, service: Uuid, characteristics: &[Uuid]) {
        let peer = peer.clone();
        let wanted = characteristics.to_vec();
        self.spawn(|shared| async move {
            let result = async {
                let peripheral = shared.peripheral(&peer).await?;
                let found = peripheral
                    .services()
                    .into_iter()
                    .find(|s| s.uuid == service)
                    .ok_or_else(|| RadioFailure::new(format!("service {} gone", service)))?;
                Ok::<_, RadioFailure>(
                    found
                        .characteristics
                        .into_iter()
                        .filter(|c| wanted.contains(&c.uuid))
                        .map(|c| RemoteCharacteristic::new(service, c.uuid, operations(c.properties)))
                        .collect(),
                )
            }
            .await;
            shared
                .emit(CentralEvent::CharacteristicsDiscovered {
                    peer,
                    service,
                    result,
                })
                .await;
        });
    }

    fn read(&mut self, peer: &PeerId, characteristic: &RemoteCharacteristic) {
        let peer = peer.clone();
        let target = characteristic.clone();
        self.spawn(|shared| async move {
            let result = async {
                let (peripheral, characteristic) = shared.characteristic(&peer, &target).await?;
                Ok::<_, RadioFailure>(peripheral.read(&characteristic).await?)
            }
            .await;
            shared
                .emit(CentralEvent::ValueUpdated {
                    peer,
                    characteristic: target.uuid,
                    result,
                })
                .await;
        });
    }

    fn write(&mut self, peer: &PeerId, characteristic: &RemoteCharacteristic, value: &[u8]) {
        let peer = peer.clone();
        let target = characteristic.clone();
        let value = value.to_vec();
        self.spawn(|shared| async move {
            let result = async {
                let (peripheral, characteristic) = shared.characteristic(&peer, &target).await?;
                peripheral
                    .write(&characteristic, &value, WriteType::WithResponse)
                    .await?;
                Ok::<_, RadioFailure>(())
            }
            .await;
            shared
                .emit(CentralEvent::WriteCompleted {
                    peer,
                    characteristic: target.uuid,
                    result,
                })
                .await;
        });
    }

    fn set_notify(&mut self, peer: &PeerId, characteristic: &RemoteCharacteristic, enabled: bool) {
        let peer = peer.clone();
        let target = characteristic.clone();
        self.spawn(|shared| async move {
            let result = async {
                let (peripheral, characteristic) = shared.characteristic(&peer, &target).await?;
                if enabled {
                    peripheral.subscribe(&characteristic).await?;
                } else {
                    peripheral.unsubscribe(&characteristic).await?;
                }
                Ok::<_, RadioFailure>(enabled)
            }
            .await;
            shared
                .emit(CentralEvent::NotifyStateChanged {
                    peer,
                    characteristic: target.uuid,
                    result,
                })
                .await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operations_from_properties() {
        let ops = operations(CharPropFlags::READ | CharPropFlags::WRITE);
        assert_eq!(ops, vec![GattOperation::Read, GattOperation::Write]);

        let ops = operations(CharPropFlags::NOTIFY);
        assert_eq!(ops, vec![GattOperation::Notify]);
        assert!(operations(CharPropFlags::empty()).is_empty());
    }
}
