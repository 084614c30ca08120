//! 适配器电源状态监听
//!
//! 通过 BlueZ 的 `Powered` 属性推导 [`AdapterState`]，同时推送给两个角色的事件通道。

use bluer::{AdapterEvent, AdapterProperty, ErrorKind};
use futures_util::StreamExt;
use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::adapter::AdapterState;
use crate::event::{CentralEvent, PeripheralEvent};

/// 把 BlueZ 错误映射为适配器状态
fn state_from_error(e: &bluer::Error) -> AdapterState {
    match e.kind {
        ErrorKind::NotAuthorized | ErrorKind::NotPermitted => AdapterState::Unauthorized,
        ErrorKind::NotSupported | ErrorKind::NotAvailable => AdapterState::Unsupported,
        _ => AdapterState::Unknown,
    }
}

fn state_from_powered(powered: bool) -> AdapterState {
    if powered {
        AdapterState::PoweredOn
    } else {
        AdapterState::PoweredOff
    }
}

/// 两个角色的事件入口
#[derive(Debug, Clone, Default)]
pub struct AdapterSinks {
    pub central: Option<mpsc::Sender<CentralEvent>>,
    pub peripheral: Option<mpsc::Sender<PeripheralEvent>>,
}

impl AdapterSinks {
    async fn publish(&self, state: AdapterState) {
        info!("Adapter state: {}", state);
        if let Some(tx) = &self.central {
            let _ = tx.send(CentralEvent::StateChanged(state)).await;
        }
        if let Some(tx) = &self.peripheral {
            let _ = tx.send(PeripheralEvent::StateChanged(state)).await;
        }
    }
}

/// 启动监听任务；任务会先推送一次当前状态
pub fn watch_adapter(sinks: AdapterSinks) -> JoinHandle<()> {
    tokio::spawn(async move {
        let session = match bluer::Session::new().await {
            Ok(session) => session,
            Err(e) => {
                warn!("BlueZ session unavailable: {}", e);
                sinks.publish(AdapterState::Unsupported).await;
                return;
            }
        };
        let adapter = match session.default_adapter().await {
            Ok(adapter) => adapter,
            Err(e) => {
                warn!("No default adapter: {}", e);
                sinks.publish(state_from_error(&e)).await;
                return;
            }
        };

        let mut last = match adapter.is_powered().await {
            Ok(powered) => state_from_powered(powered),
            Err(e) => state_from_error(&e),
        };
        sinks.publish(last).await;

        let mut events = match adapter.events().await {
            Ok(events) => Box::pin(events),
            Err(e) => {
                warn!("Cannot watch adapter {}: {}", adapter.name(), e);
                return;
            }
        };

        while let Some(event) = events.next().await {
            if let AdapterEvent::PropertyChanged(AdapterProperty::Powered(powered)) = event {
                let state = state_from_powered(powered);
                if state != last {
                    last = state;
                    sinks.publish(state).await;
                }
            }
        }
        debug!("Adapter event stream ended");
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_powered_mapping() {
        assert_eq!(state_from_powered(true), AdapterState::PoweredOn);
        assert_eq!(state_from_powered(false), AdapterState::PoweredOff);
    }
}
