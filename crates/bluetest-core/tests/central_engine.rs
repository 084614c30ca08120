//! 集成测试 - central 角色引擎
//!
//! 使用记录型平台服务驱动引擎，检查发出的平台请求和 outcome 流。

mod common;

use bluetest_core::event::CentralOperation;
use bluetest_core::gatt::{NOTIFY_CHAR_UUID, READ_CHAR_UUID, SERVICE_UUID, WRITE_CHAR_UUID};
use bluetest_core::radio::RadioFailure;
use bluetest_core::{
    AdapterState, BleError, CentralEvent, CentralOutcome, CentralPhase, CharacteristicRole,
    DisconnectCause,
};
use common::{CentralCall, CentralHarness, TARGET, advertisement, peer, remote_characteristics};

#[test]
fn test_scan_requires_powered_adapter() {
    let mut h = CentralHarness::new();
    assert_eq!(
        h.engine.start_scan(TARGET),
        Err(BleError::AdapterUnavailable(AdapterState::Unknown))
    );
    assert!(h.calls().is_empty());
    assert_eq!(h.engine.phase(), CentralPhase::Idle);
}

#[test]
fn test_first_matching_advertisement_wins() {
    let mut h = CentralHarness::powered();
    h.engine.start_scan(TARGET).unwrap();

    h.engine.handle_event(advertisement("11:11", "Someone Else"));
    assert_eq!(h.engine.phase(), CentralPhase::Scanning);

    h.engine.handle_event(advertisement("AA:AA", TARGET));
    h.engine.handle_event(advertisement("BB:BB", TARGET));

    assert_eq!(
        h.calls(),
        &[
            CentralCall::StartScan,
            CentralCall::StopScan,
            CentralCall::Connect(peer("AA:AA")),
        ]
    );
    assert_eq!(h.engine.phase(), CentralPhase::Connecting);

    let outcomes = h.drain();
    let found: Vec<_> = outcomes
        .iter()
        .filter(|o| matches!(o, CentralOutcome::PeerFound { .. }))
        .collect();
    assert_eq!(found.len(), 1);
    assert!(matches!(
        found[0],
        CentralOutcome::PeerFound { peer: p, .. } if *p == peer("AA:AA")
    ));
}

#[test]
fn test_advertisement_without_name_is_ignored() {
    let mut h = CentralHarness::powered();
    h.engine.start_scan(TARGET).unwrap();
    h.engine
        .handle_event(CentralEvent::AdvertisementReceived(
            bluetest_core::event::Advertisement {
                peer: peer("AA:AA"),
                local_name: None,
                service_uuids: vec![SERVICE_UUID],
                rssi: None,
            },
        ));
    assert_eq!(h.engine.phase(), CentralPhase::Scanning);
}

#[test]
fn test_stop_scan_returns_to_idle() {
    let mut h = CentralHarness::powered();
    assert!(h.engine.stop_scan().is_err());

    h.engine.start_scan(TARGET).unwrap();
    h.engine.stop_scan().unwrap();
    assert_eq!(h.engine.phase(), CentralPhase::Idle);
    assert_eq!(h.calls().last(), Some(&CentralCall::StopScan));

    // 停止后到达的广播不再触发连接
    h.engine.handle_event(advertisement("AA:AA", TARGET));
    assert_eq!(h.engine.phase(), CentralPhase::Idle);
}

#[test]
fn test_discovery_is_scoped_to_registry() {
    let mut h = CentralHarness::connected("AA:AA");
    assert_eq!(h.engine.phase(), CentralPhase::Discovering);
    assert_eq!(
        h.calls().last(),
        Some(&CentralCall::DiscoverServices(peer("AA:AA"), vec![SERVICE_UUID]))
    );

    h.discover("AA:AA", remote_characteristics());
    assert!(h.calls().contains(&CentralCall::DiscoverCharacteristics(
        peer("AA:AA"),
        SERVICE_UUID,
        bluetest_core::default_service().characteristic_uuids(),
    )));

    assert_eq!(h.engine.phase(), CentralPhase::Ready);
    let outcomes = h.drain();
    assert!(outcomes.contains(&CentralOutcome::DiscoveryComplete {
        bound: CharacteristicRole::ALL.to_vec(),
    }));
    assert!(outcomes.contains(&CentralOutcome::PhaseChanged {
        from: CentralPhase::Discovering,
        to: CentralPhase::Ready,
    }));

    let remote = h.engine.peer().unwrap();
    assert_eq!(remote.name(), TARGET);
    for role in CharacteristicRole::ALL {
        assert_eq!(remote.binding(role).map(|c| c.uuid), Some(role.uuid()));
    }
}

#[test]
fn test_missing_characteristics_are_reported() {
    let mut h = CentralHarness::connected("AA:AA");
    let partial = remote_characteristics().into_iter().take(2).collect();
    h.discover("AA:AA", partial);

    assert_eq!(h.engine.phase(), CentralPhase::Ready);
    let outcomes = h.drain();
    assert!(outcomes.contains(&CentralOutcome::DiscoveryIncomplete {
        missing: vec![CharacteristicRole::Notify, CharacteristicRole::Indicate],
    }));
    assert_eq!(
        h.engine.subscribe_notify(),
        Err(BleError::CharacteristicUnavailable(CharacteristicRole::Notify))
    );
    // 已绑定的特征照常可用
    assert!(h.engine.read_characteristic().is_ok());
}

#[test]
fn test_empty_service_list_completes_discovery() {
    let mut h = CentralHarness::connected("AA:AA");
    h.engine.handle_event(CentralEvent::ServicesDiscovered {
        peer: peer("AA:AA"),
        result: Ok(vec![]),
    });
    assert_eq!(h.engine.phase(), CentralPhase::Ready);
    assert!(h.engine.peer().unwrap().bound_roles().is_empty());
}

#[test]
fn test_write_rejected_unless_ready() {
    let mut h = CentralHarness::powered();
    assert_eq!(
        h.engine.write_characteristic(b"Hello"),
        Err(BleError::InvalidState {
            operation: "write_characteristic",
            phase: "idle",
        })
    );

    let mut h = CentralHarness::connected("AA:AA");
    let before = h.calls().len();
    assert!(matches!(
        h.engine.write_characteristic(b"Hello"),
        Err(BleError::InvalidState { phase: "discovering", .. })
    ));
    assert_eq!(h.calls().len(), before);
}

#[test]
fn test_read_surfaces_bytes_unchanged() {
    let mut h = CentralHarness::ready("AA:AA");
    h.engine.read_characteristic().unwrap();
    assert_eq!(
        h.calls().last(),
        Some(&CentralCall::Read(peer("AA:AA"), READ_CHAR_UUID))
    );

    let payload = vec![0x00, 0xFF, b'W', 0x80];
    h.engine.handle_event(CentralEvent::ValueUpdated {
        peer: peer("AA:AA"),
        characteristic: READ_CHAR_UUID,
        result: Ok(payload.clone()),
    });
    assert_eq!(
        h.drain(),
        vec![CentralOutcome::ValueRead {
            role: CharacteristicRole::Read,
            value: payload,
        }]
    );
}

#[test]
fn test_unrequested_value_is_a_notification() {
    let mut h = CentralHarness::ready("AA:AA");
    h.engine.subscribe_notify().unwrap();
    assert_eq!(
        h.calls().last(),
        Some(&CentralCall::SetNotify(peer("AA:AA"), NOTIFY_CHAR_UUID, true))
    );

    h.engine.handle_event(CentralEvent::NotifyStateChanged {
        peer: peer("AA:AA"),
        characteristic: NOTIFY_CHAR_UUID,
        result: Ok(true),
    });
    h.engine.handle_event(CentralEvent::ValueUpdated {
        peer: peer("AA:AA"),
        characteristic: NOTIFY_CHAR_UUID,
        result: Ok(b"Notify".to_vec()),
    });

    assert_eq!(
        h.drain(),
        vec![
            CentralOutcome::NotifyStateChanged {
                role: CharacteristicRole::Notify,
                enabled: true,
            },
            CentralOutcome::ValueNotified {
                role: CharacteristicRole::Notify,
                value: b"Notify".to_vec(),
            },
        ]
    );
}

#[test]
fn test_read_failure_is_reported() {
    let mut h = CentralHarness::ready("AA:AA");
    h.engine.read_characteristic().unwrap();
    h.engine.handle_event(CentralEvent::ValueUpdated {
        peer: peer("AA:AA"),
        characteristic: READ_CHAR_UUID,
        result: Err(RadioFailure::new("insufficient authentication")),
    });
    assert!(matches!(
        h.drain().as_slice(),
        [CentralOutcome::OperationFailed {
            operation: CentralOperation::Read,
            ..
        }]
    ));
    assert_eq!(h.engine.phase(), CentralPhase::Ready);
}

#[test]
fn test_writes_are_serialized() {
    let mut h = CentralHarness::ready("AA:AA");
    h.engine.write_characteristic(b"one").unwrap();
    h.engine.write_characteristic(b"two").unwrap();

    assert_eq!(h.engine.radio().writes(), vec![b"one".to_vec()]);
    assert_eq!(h.engine.peer().unwrap().queued_writes(), 1);
    assert!(matches!(
        h.calls().last(),
        Some(CentralCall::Write(_, uuid, _)) if *uuid == WRITE_CHAR_UUID
    ));

    h.engine.handle_event(CentralEvent::WriteCompleted {
        peer: peer("AA:AA"),
        characteristic: WRITE_CHAR_UUID,
        result: Ok(()),
    });
    assert_eq!(
        h.engine.radio().writes(),
        vec![b"one".to_vec(), b"two".to_vec()]
    );

    h.engine.handle_event(CentralEvent::WriteCompleted {
        peer: peer("AA:AA"),
        characteristic: WRITE_CHAR_UUID,
        result: Ok(()),
    });
    let completed = h
        .drain()
        .into_iter()
        .filter(|o| {
            *o == CentralOutcome::WriteCompleted {
                role: CharacteristicRole::Write,
            }
        })
        .count();
    assert_eq!(completed, 2);
}

#[test]
fn test_disconnect_while_discovering() {
    let mut h = CentralHarness::connected("AA:AA");
    h.engine.disconnect().unwrap();

    assert_eq!(h.engine.phase(), CentralPhase::Idle);
    assert!(h.engine.peer().is_none());
    assert_eq!(
        h.calls().last(),
        Some(&CentralCall::CancelConnection(peer("AA:AA")))
    );
    assert_eq!(
        h.drain(),
        vec![
            CentralOutcome::PhaseChanged {
                from: CentralPhase::Discovering,
                to: CentralPhase::Disconnected,
            },
            CentralOutcome::Disconnected {
                peer: peer("AA:AA"),
                cause: DisconnectCause::Local,
            },
            CentralOutcome::PhaseChanged {
                from: CentralPhase::Disconnected,
                to: CentralPhase::Idle,
            },
        ]
    );

    // 晚到的发现结果被忽略
    h.discover("AA:AA", remote_characteristics());
    assert_eq!(h.engine.phase(), CentralPhase::Idle);
    assert!(h.drain().is_empty());
}

#[test]
fn test_peer_initiated_disconnect() {
    let mut h = CentralHarness::ready("AA:AA");

    // 其他设备的断开事件不影响当前连接
    h.engine.handle_event(CentralEvent::Disconnected {
        peer: peer("BB:BB"),
        reason: None,
    });
    assert_eq!(h.engine.phase(), CentralPhase::Ready);

    let reason = RadioFailure::new("connection timeout");
    h.engine.handle_event(CentralEvent::Disconnected {
        peer: peer("AA:AA"),
        reason: Some(reason.clone()),
    });
    assert_eq!(h.engine.phase(), CentralPhase::Idle);
    assert!(h.drain().contains(&CentralOutcome::Disconnected {
        peer: peer("AA:AA"),
        cause: DisconnectCause::Remote(Some(reason)),
    }));
    assert!(!h.calls().iter().any(|c| matches!(c, CentralCall::CancelConnection(_))));
    assert_eq!(
        h.engine.read_characteristic(),
        Err(BleError::InvalidState {
            operation: "read",
            phase: "idle",
        })
    );
}

#[test]
fn test_connect_failure_returns_to_idle() {
    let mut h = CentralHarness::powered();
    h.engine.start_scan(TARGET).unwrap();
    h.engine.handle_event(advertisement("AA:AA", TARGET));
    h.engine.handle_event(CentralEvent::ConnectFailed {
        peer: peer("AA:AA"),
        cause: RadioFailure::new("page timeout"),
    });

    assert_eq!(h.engine.phase(), CentralPhase::Idle);
    assert!(
        h.drain()
            .iter()
            .any(|o| matches!(o, CentralOutcome::ConnectionFailed { .. }))
    );
    // 可以重新扫描
    assert!(h.engine.start_scan(TARGET).is_ok());
}

#[test]
fn test_rediscovery_is_idempotent() {
    let mut h = CentralHarness::ready("AA:AA");
    let first: Vec<_> = CharacteristicRole::ALL
        .iter()
        .map(|r| h.engine.peer().unwrap().binding(*r).cloned())
        .collect();

    h.engine.rediscover().unwrap();
    assert_eq!(h.engine.phase(), CentralPhase::Discovering);
    assert!(h.engine.peer().unwrap().bound_roles().is_empty());

    h.discover("AA:AA", remote_characteristics());
    assert_eq!(h.engine.phase(), CentralPhase::Ready);
    let second: Vec<_> = CharacteristicRole::ALL
        .iter()
        .map(|r| h.engine.peer().unwrap().binding(*r).cloned())
        .collect();
    assert_eq!(first, second);
}

#[test]
fn test_deferred_scan_replays_once() {
    let mut h = CentralHarness::new();
    h.engine.request_scan(TARGET).unwrap();
    h.engine.request_scan(TARGET).unwrap();
    assert_eq!(h.engine.pending_intents().len(), 1);
    assert!(h.calls().is_empty());

    h.engine
        .handle_event(CentralEvent::StateChanged(AdapterState::PoweredOff));
    assert!(h.calls().is_empty());

    h.engine
        .handle_event(CentralEvent::StateChanged(AdapterState::PoweredOn));
    assert_eq!(h.calls(), &[CentralCall::StartScan]);
    assert_eq!(h.engine.phase(), CentralPhase::Scanning);
    assert!(h.engine.pending_intents().is_empty());

    h.engine
        .handle_event(CentralEvent::StateChanged(AdapterState::PoweredOff));
    h.engine
        .handle_event(CentralEvent::StateChanged(AdapterState::PoweredOn));
    assert_eq!(h.engine.radio().count(&CentralCall::StartScan), 1);
    assert_eq!(h.engine.phase(), CentralPhase::Idle);
}

#[test]
fn test_terminal_adapter_state_drops_intents() {
    let mut h = CentralHarness::new();
    h.engine.request_scan(TARGET).unwrap();
    h.engine
        .handle_event(CentralEvent::StateChanged(AdapterState::Unauthorized));

    assert!(h.engine.pending_intents().is_empty());
    assert_eq!(
        h.engine.request_scan(TARGET),
        Err(BleError::AdapterUnavailable(AdapterState::Unauthorized))
    );
}

#[test]
fn test_adapter_loss_tears_down_connection() {
    let mut h = CentralHarness::ready("AA:AA");
    let mut adapter = h.engine.subscribe_adapter();

    h.engine
        .handle_event(CentralEvent::StateChanged(AdapterState::PoweredOff));
    assert_eq!(h.engine.phase(), CentralPhase::Idle);
    assert_eq!(*adapter.borrow_and_update(), AdapterState::PoweredOff);
    assert!(h.drain().contains(&CentralOutcome::Disconnected {
        peer: peer("AA:AA"),
        cause: DisconnectCause::AdapterLost(AdapterState::PoweredOff),
    }));
}

#[test]
fn test_adapter_states_are_logged_by_name() {
    let mut h = CentralHarness::new();
    h.engine
        .handle_event(CentralEvent::StateChanged(AdapterState::PoweredOn));
    assert!(h.log.contains("poweredOn"));
}
