//! 集成测试 - 会话状态机
//!
//! 用记录调用的传输层驱动 `LinkCore`，手动送入传输层事件，
//! 验证连接、写队列、响应重组和命令调度的协作。

mod common;

use common::{
    ADDRESS, Call, MockTransport, information_service, mldp_handle, mldp_service, name_response,
    rx_handle, status_response, transparent_service, tx_handle,
};
use pfxlink_core::ble::{
    CCCD_UUID, ENABLE_NOTIFICATION_VALUE, MANUFACTURER_NAME_UUID, SERIAL_NUMBER_UUID,
};
use pfxlink_core::pfx::protocol;
use pfxlink_core::{
    DiscoveredService, GattStatus, LinkCore, LinkId, LinkState, Output, PfxError, PfxResponse,
    QueueKind, Role, SessionEvent, TransportEvent, WriteMode,
};

type Core = LinkCore<MockTransport>;

fn events(core: &mut Core) -> Vec<SessionEvent> {
    core.drain_outbox()
        .into_iter()
        .filter_map(|o| match o {
            Output::Event(e) => Some(e),
            Output::RetryWrite { .. } => None,
        })
        .collect()
}

/// 已连接并完成服务发现、通知已开启的会话
fn connected(services: Vec<DiscoveredService>, auto_query: bool) -> (MockTransport, Core, LinkId) {
    let mock = MockTransport::new();
    let mut core = LinkCore::new(mock.clone(), auto_query);

    let link = core.connect(ADDRESS).unwrap();
    core.handle_event(TransportEvent::Connected { link });
    core.handle_event(TransportEvent::ServicesDiscovered {
        link,
        status: GattStatus::Success,
        services,
    });
    if let Some((ticket, _, _)) = mock.descriptor_writes().last() {
        core.handle_event(TransportEvent::DescriptorWritten {
            link,
            ticket: *ticket,
            status: GattStatus::Success,
        });
    }
    core.drain_outbox();
    (mock, core, link)
}

fn notify(core: &mut Core, link: LinkId, data: &[u8]) {
    for fragment in data.chunks(20) {
        core.handle_event(TransportEvent::Notification {
            link,
            handle: tx_handle(),
            value: fragment.to_vec(),
        });
    }
}

fn complete_last_write(mock: &MockTransport, core: &mut Core, link: LinkId) {
    let (ticket, _) = mock.characteristic_writes().last().cloned().unwrap();
    core.handle_event(TransportEvent::CharacteristicWritten {
        link,
        ticket,
        status: GattStatus::Success,
    });
}

#[test]
fn test_connect_preconditions() {
    let mock = MockTransport::new();
    let mut core = LinkCore::new(mock.clone(), false);

    assert!(matches!(core.connect("   "), Err(PfxError::NotReady(_))));

    mock.set_unavailable();
    assert!(matches!(
        core.connect(ADDRESS),
        Err(PfxError::TransportUnavailable)
    ));
    assert_eq!(core.state(), LinkState::Disconnected);
    assert!(mock.calls().is_empty());
}

/// Connecting 期间再次 connect 会拆掉旧链路并重新开始
#[test]
fn test_connect_while_connecting_restarts() {
    let mock = MockTransport::new();
    let mut core = LinkCore::new(mock.clone(), false);

    let first = core.connect(ADDRESS).unwrap();
    let second = core.connect(ADDRESS).unwrap();
    assert_ne!(first, second);
    assert_eq!(
        mock.calls(),
        vec![
            Call::Connect(first, ADDRESS.to_string()),
            Call::Disconnect(first),
            Call::Connect(second, ADDRESS.to_string()),
        ]
    );
    assert_eq!(core.state(), LinkState::Connecting);

    // 旧链路的事件全部被忽略
    core.handle_event(TransportEvent::Connected { link: first });
    core.handle_event(TransportEvent::Disconnected { link: first });
    assert_eq!(core.state(), LinkState::Connecting);
    assert!(events(&mut core).is_empty());

    core.handle_event(TransportEvent::Connected { link: second });
    assert_eq!(core.state(), LinkState::Connected);
    assert_eq!(
        events(&mut core),
        vec![SessionEvent::Connected {
            address: ADDRESS.to_string()
        }]
    );
    assert_eq!(mock.calls().last(), Some(&Call::Discover(second)));
}

#[test]
fn test_discovery_enables_notifications() {
    let mock = MockTransport::new();
    let mut core = LinkCore::new(mock.clone(), false);

    let link = core.connect(ADDRESS).unwrap();
    core.handle_event(TransportEvent::Connected { link });
    core.drain_outbox();
    core.handle_event(TransportEvent::ServicesDiscovered {
        link,
        status: GattStatus::Success,
        services: vec![information_service(), transparent_service()],
    });

    let writes = mock.descriptor_writes();
    assert_eq!(writes.len(), 1);
    assert_eq!(writes[0].1, tx_handle().descriptor(CCCD_UUID));
    assert_eq!(writes[0].2, ENABLE_NOTIFICATION_VALUE.to_vec());

    assert_eq!(
        events(&mut core),
        vec![SessionEvent::DiscoveryComplete {
            complete: true,
            roles: vec![
                Role::InformationService,
                Role::DataService,
                Role::TxCharacteristic,
                Role::RxCharacteristic,
            ],
        }]
    );
}

/// 服务发现失败时链路保持连接，但没有任何角色
#[test]
fn test_discovery_failure_keeps_link() {
    let mock = MockTransport::new();
    let mut core = LinkCore::new(mock.clone(), true);

    let link = core.connect(ADDRESS).unwrap();
    core.handle_event(TransportEvent::Connected { link });
    core.drain_outbox();
    core.handle_event(TransportEvent::ServicesDiscovered {
        link,
        status: GattStatus::Failure("GATT error 133".to_string()),
        services: Vec::new(),
    });

    assert_eq!(
        events(&mut core),
        vec![SessionEvent::DiscoveryFailed {
            reason: "GATT error 133".to_string()
        }]
    );
    assert_eq!(core.state(), LinkState::Connected);
    assert!(core.roles().is_empty());
    assert!(matches!(
        core.send_command(vec![1]),
        Err(PfxError::RoleUnavailable(Role::DataService))
    ));
    assert!(matches!(
        core.query_device_info(),
        Err(PfxError::NotReady(_))
    ));
}

#[test]
fn test_mldp_only_device() {
    let (mock, mut core, _) = connected(vec![mldp_service()], false);

    assert!(core.roles().has(Role::MldpData));
    assert!(!core.roles().has(Role::TxCharacteristic));
    assert!(!core.roles().has(Role::RxCharacteristic));
    assert_eq!(
        mock.descriptor_writes()[0].1,
        mldp_handle().descriptor(CCCD_UUID)
    );

    core.send_command(vec![9]).unwrap();
    let last = mock.calls().last().cloned().unwrap();
    assert!(matches!(
        last,
        Call::WriteCharacteristic { handle, mode: WriteMode::WithResponse, .. } if handle == mldp_handle()
    ));
}

#[test]
fn test_transparent_writes_without_response() {
    let (mock, mut core, _) = connected(vec![transparent_service()], false);

    core.send_command(vec![9]).unwrap();
    let last = mock.calls().last().cloned().unwrap();
    assert!(matches!(
        last,
        Call::WriteCharacteristic { handle, mode: WriteMode::WithoutResponse, .. } if handle == rx_handle()
    ));
}

/// 同一时间只有一个特征写在途，完成顺序与提交顺序一致
#[test]
fn test_single_characteristic_write_in_flight() {
    let (mock, mut core, link) = connected(vec![transparent_service()], false);

    for v in 1..=3 {
        core.send_command(vec![v]).unwrap();
    }
    assert_eq!(mock.characteristic_writes().len(), 1);
    assert_eq!(core.writes().characteristics().len(), 3);

    while mock.characteristic_writes().len() < 3 {
        let before = mock.characteristic_writes().len();
        complete_last_write(&mock, &mut core, link);
        assert_eq!(mock.characteristic_writes().len(), before + 1);
    }
    complete_last_write(&mock, &mut core, link);

    let values: Vec<_> = mock
        .characteristic_writes()
        .into_iter()
        .map(|(_, v)| v[0])
        .collect();
    assert_eq!(values, vec![1, 2, 3]);
    assert!(core.writes().characteristics().is_empty());
}

/// 首次被拒绝、重试成功的写只产生一次完成事件
#[test]
fn test_rejected_then_accepted_completes_once() {
    let (mock, mut core, link) = connected(vec![transparent_service()], false);
    mock.reject_writes(1);

    core.send_command(vec![1, 2, 3]).unwrap();
    let outputs = core.drain_outbox();
    let [
        Output::RetryWrite {
            kind: QueueKind::Characteristic,
            link: retry_link,
            ticket,
        },
    ] = outputs.as_slice()
    else {
        panic!("expected a single retry, got {outputs:?}");
    };
    assert_eq!(*retry_link, link);
    assert!(mock.characteristic_writes().is_empty());

    core.retry_write(QueueKind::Characteristic, link, *ticket);
    assert_eq!(mock.characteristic_writes(), vec![(*ticket, vec![1, 2, 3])]);

    for _ in 0..2 {
        core.handle_event(TransportEvent::CharacteristicWritten {
            link,
            ticket: *ticket,
            status: GattStatus::Success,
        });
    }
    assert_eq!(
        events(&mut core),
        vec![SessionEvent::WriteCompleted {
            kind: QueueKind::Characteristic
        }]
    );
}

/// 重试后仍被拒绝的命令被丢弃，下一个命令继续发送
#[test]
fn test_rejected_twice_releases_dispatcher() {
    let (mock, mut core, link) = connected(vec![transparent_service()], false);
    mock.reject_writes(2);

    core.push_command(protocol::get_name()).unwrap();
    core.push_command(protocol::get_status()).unwrap();
    let ticket = core
        .drain_outbox()
        .into_iter()
        .find_map(|o| match o {
            Output::RetryWrite { ticket, .. } => Some(ticket),
            Output::Event(_) => None,
        })
        .unwrap();

    core.retry_write(QueueKind::Characteristic, link, ticket);

    let events = events(&mut core);
    assert!(events.iter().any(|e| matches!(
        e,
        SessionEvent::WriteFailed {
            kind: QueueKind::Characteristic,
            ..
        }
    )));
    let writes = mock.characteristic_writes();
    assert_eq!(writes.len(), 1);
    assert_eq!(writes[0].1, protocol::get_status());
}

/// 重连后旧链路和旧票据的完成回调都不影响新的队头
#[test]
fn test_late_completion_after_reconnect() {
    let (mock, mut core, old_link) = connected(vec![transparent_service()], false);
    core.send_command(vec![1]).unwrap();
    let (old_ticket, _) = mock.characteristic_writes()[0].clone();

    let link = core.connect(ADDRESS).unwrap();
    core.handle_event(TransportEvent::Connected { link });
    core.handle_event(TransportEvent::ServicesDiscovered {
        link,
        status: GattStatus::Success,
        services: vec![transparent_service()],
    });
    assert!(core.writes().characteristics().is_empty());

    core.send_command(vec![2]).unwrap();
    let (new_ticket, value) = mock.characteristic_writes().last().cloned().unwrap();
    assert_eq!(value, vec![2]);
    assert_ne!(old_ticket, new_ticket);
    core.drain_outbox();

    for stale_link in [old_link, link] {
        core.handle_event(TransportEvent::CharacteristicWritten {
            link: stale_link,
            ticket: old_ticket,
            status: GattStatus::Success,
        });
    }
    assert!(events(&mut core).is_empty());
    assert_eq!(core.writes().characteristics().in_flight(), Some(new_ticket));
}

/// 响应重组未完成时不会释放第二个命令
#[test]
fn test_dispatcher_waits_for_response() {
    let (mock, mut core, link) = connected(vec![transparent_service()], false);

    core.push_command(protocol::get_name()).unwrap();
    core.push_command(protocol::get_status()).unwrap();
    assert_eq!(mock.characteristic_writes().len(), 1);
    complete_last_write(&mock, &mut core, link);

    let name = name_response("Brick");
    core.handle_event(TransportEvent::Notification {
        link,
        handle: tx_handle(),
        value: name[..20].to_vec(),
    });
    assert_eq!(mock.characteristic_writes().len(), 1);
    assert_eq!(core.correlator().pending_opcode(), Some(0x87));

    core.handle_event(TransportEvent::Notification {
        link,
        handle: tx_handle(),
        value: name[20..].to_vec(),
    });
    assert!(events(&mut core).contains(&SessionEvent::ResponseReady(PfxResponse::Name {
        name: "Brick".to_string()
    })));

    let writes = mock.characteristic_writes();
    assert_eq!(writes.len(), 2);
    assert_eq!(writes[1].1, protocol::get_status());
}

/// 自动查询：先名称和状态，再读取设备信息服务，最后报告队列空闲
#[test]
fn test_device_info_query_flow() {
    let (mock, mut core, link) =
        connected(vec![information_service(), transparent_service()], true);

    assert_eq!(mock.characteristic_writes()[0].1, protocol::get_name());
    complete_last_write(&mock, &mut core, link);
    notify(&mut core, link, &name_response("Brick"));

    assert_eq!(mock.characteristic_writes()[1].1, protocol::get_status());
    complete_last_write(&mock, &mut core, link);
    notify(&mut core, link, &status_response());

    // 命令全部完成后才开始读取
    let mut served = 0;
    while let Some(handle) = mock.reads().get(served).copied() {
        let value = if handle.characteristic == MANUFACTURER_NAME_UUID {
            b"Fx Bricks".to_vec()
        } else {
            b"PFX-0042".to_vec()
        };
        core.handle_event(TransportEvent::CharacteristicRead {
            link,
            handle,
            status: GattStatus::Success,
            value,
        });
        served += 1;
    }
    assert_eq!(served, 2);

    let events = events(&mut core);
    assert_eq!(events.last(), Some(&SessionEvent::QueueIdle));
    assert!(events.contains(&SessionEvent::ResponseReady(PfxResponse::Status {
        hardware_version: "1234".to_string(),
        firmware_version: "2.05".to_string(),
    })));

    let info = core.brick_info();
    assert_eq!(info.name.as_deref(), Some("Brick"));
    assert_eq!(info.hardware_version.as_deref(), Some("1234"));
    assert_eq!(info.firmware_version.as_deref(), Some("2.05"));
    assert_eq!(info.manufacturer_name.as_deref(), Some("Fx Bricks"));
    assert_eq!(info.serial_number.as_deref(), Some("PFX-0042"));
    assert_eq!(
        core.gatt_values().get(&MANUFACTURER_NAME_UUID),
        Some("Fx Bricks")
    );

    // 新的连接尝试清空会话数据
    core.connect(ADDRESS).unwrap();
    assert!(core.gatt_values().is_empty());
    assert!(core.brick_info().is_empty());
}

/// 被传输层拒绝的读取直接跳过，不阻塞调度
#[test]
fn test_rejected_read_is_skipped() {
    let (mock, mut core, _) = connected(vec![information_service()], false);
    mock.reject_reads();

    core.query_device_info().unwrap();
    assert!(mock.reads().is_empty());
    assert!(core.dispatcher().is_idle());
    assert_eq!(events(&mut core), vec![SessionEvent::QueueIdle]);
}

#[test]
fn test_read_characteristic_by_role() {
    let (mock, mut core, _) = connected(vec![transparent_service()], false);

    core.read_characteristic(Role::TxCharacteristic).unwrap();
    assert_eq!(mock.reads(), vec![tx_handle()]);
    assert!(matches!(
        core.read_characteristic(Role::MldpData),
        Err(PfxError::RoleUnavailable(Role::MldpData))
    ));
}

/// 非数据特征的通知不进入响应重组
#[test]
fn test_notification_from_other_characteristic() {
    let (_, mut core, link) = connected(vec![transparent_service()], false);

    core.handle_event(TransportEvent::Notification {
        link,
        handle: rx_handle(),
        value: vec![0x87, b'X'],
    });
    assert!(!core.correlator().is_busy());
    assert_eq!(
        events(&mut core),
        vec![SessionEvent::DataAvailable {
            characteristic: rx_handle().characteristic,
            role: Some(Role::RxCharacteristic),
            value: vec![0x87, b'X'],
        }]
    );
}

#[test]
fn test_disconnect_clears_everything() {
    let (mock, mut core, link) = connected(vec![transparent_service()], false);

    core.push_command(protocol::get_name()).unwrap();
    core.push_command(protocol::get_status()).unwrap();
    core.send_command(vec![1]).unwrap();
    core.handle_event(TransportEvent::Notification {
        link,
        handle: tx_handle(),
        value: vec![0x87, b'B'],
    });
    core.drain_outbox();

    assert!(core.disconnect());
    assert_eq!(mock.calls().last(), Some(&Call::Disconnect(link)));
    // 状态只在断开事件到达时改变
    assert_eq!(core.state(), LinkState::Connected);

    core.handle_event(TransportEvent::Disconnected { link });
    assert_eq!(events(&mut core), vec![SessionEvent::Disconnected]);
    assert_eq!(core.state(), LinkState::Disconnected);
    assert!(core.roles().is_empty());
    assert!(core.dispatcher().is_idle());
    assert!(core.writes().characteristics().is_empty());
    assert!(!core.correlator().is_busy());

    assert!(matches!(
        core.push_command(vec![1]),
        Err(PfxError::NotConnected)
    ));
    assert!(!core.disconnect());
}

fn fail_write(core: &mut Core, link: LinkId, ticket: pfxlink_core::WriteTicket) {
    core.handle_event(TransportEvent::CharacteristicWritten {
        link,
        ticket,
        status: GattStatus::Failure("GATT error 0x85".to_string()),
    });
}

/// 失败的写完成仍然弹出队头，下一个写立即提交
#[test]
fn test_failed_characteristic_write_advances_queue() {
    let (mock, mut core, link) = connected(vec![transparent_service()], false);

    core.send_command(vec![1]).unwrap();
    core.send_command(vec![2]).unwrap();
    let (first, _) = mock.characteristic_writes()[0].clone();
    fail_write(&mut core, link, first);

    assert_eq!(
        events(&mut core),
        vec![SessionEvent::WriteFailed {
            kind: QueueKind::Characteristic,
            reason: "GATT error 0x85".to_string(),
        }]
    );
    let writes = mock.characteristic_writes();
    assert_eq!(writes.len(), 2);
    assert_eq!(writes[1].1, vec![2]);
    assert_eq!(core.writes().characteristics().len(), 1);
}

/// 命令的写失败后调度器释放槽位，下一个命令被发送
#[test]
fn test_failed_command_write_releases_dispatcher() {
    let (mock, mut core, link) = connected(vec![transparent_service()], false);

    core.push_command(protocol::get_name()).unwrap();
    core.push_command(protocol::get_status()).unwrap();
    assert_eq!(mock.characteristic_writes().len(), 1);

    let (ticket, _) = mock.characteristic_writes()[0].clone();
    fail_write(&mut core, link, ticket);

    let values: Vec<_> = mock
        .characteristic_writes()
        .into_iter()
        .map(|(_, v)| v)
        .collect();
    assert_eq!(values, vec![protocol::get_name(), protocol::get_status()]);
    assert!(events(&mut core).contains(&SessionEvent::WriteFailed {
        kind: QueueKind::Characteristic,
        reason: "GATT error 0x85".to_string(),
    }));
    assert!(core.dispatcher().has_in_flight());
    assert_eq!(core.dispatcher().pending_commands(), 0);
}

/// 开启通知的描述符写失败只上报，不影响特征写
#[test]
fn test_failed_descriptor_write_reported() {
    let mock = MockTransport::new();
    let mut core = LinkCore::new(mock.clone(), false);

    let link = core.connect(ADDRESS).unwrap();
    core.handle_event(TransportEvent::Connected { link });
    core.handle_event(TransportEvent::ServicesDiscovered {
        link,
        status: GattStatus::Success,
        services: vec![transparent_service()],
    });
    core.drain_outbox();

    let (ticket, _, _) = mock.descriptor_writes()[0].clone();
    core.handle_event(TransportEvent::DescriptorWritten {
        link,
        ticket,
        status: GattStatus::Failure("insufficient authentication".to_string()),
    });
    assert_eq!(
        events(&mut core),
        vec![SessionEvent::WriteFailed {
            kind: QueueKind::Descriptor,
            reason: "insufficient authentication".to_string(),
        }]
    );
    assert!(core.writes().descriptors().is_empty());

    // 迟到的重复完成被忽略
    core.handle_event(TransportEvent::DescriptorWritten {
        link,
        ticket,
        status: GattStatus::Success,
    });
    assert!(events(&mut core).is_empty());

    core.send_command(vec![1]).unwrap();
    assert_eq!(mock.characteristic_writes().len(), 1);
}

/// 读取失败时释放读取槽位，继续读下一个特征
#[test]
fn test_failed_read_releases_dispatcher() {
    let (mock, mut core, link) = connected(vec![information_service()], false);

    core.query_device_info().unwrap();
    let reads = mock.reads();
    assert_eq!(reads.len(), 1);
    assert_eq!(reads[0].characteristic, MANUFACTURER_NAME_UUID);

    core.handle_event(TransportEvent::CharacteristicRead {
        link,
        handle: reads[0],
        status: GattStatus::Failure("read not permitted".to_string()),
        value: Vec::new(),
    });
    let reads = mock.reads();
    assert_eq!(reads.len(), 2);
    assert_eq!(reads[1].characteristic, SERIAL_NUMBER_UUID);
    assert!(events(&mut core).is_empty());

    core.handle_event(TransportEvent::CharacteristicRead {
        link,
        handle: reads[1],
        status: GattStatus::Success,
        value: b"PFX-0042".to_vec(),
    });
    let events = events(&mut core);
    assert_eq!(events.last(), Some(&SessionEvent::QueueIdle));
    assert_eq!(core.gatt_values().len(), 1);
    assert!(core.brick_info().manufacturer_name.is_none());
    assert_eq!(core.brick_info().serial_number.as_deref(), Some("PFX-0042"));
}

/// 没有可查询的内容时立即报告 QueueIdle
#[test]
fn test_empty_device_info_query_goes_idle() {
    let mock = MockTransport::new();
    let mut core = LinkCore::new(mock.clone(), true);

    let link = core.connect(ADDRESS).unwrap();
    core.handle_event(TransportEvent::Connected { link });
    core.drain_outbox();
    core.handle_event(TransportEvent::ServicesDiscovered {
        link,
        status: GattStatus::Success,
        services: Vec::new(),
    });
    assert_eq!(
        events(&mut core),
        vec![
            SessionEvent::DiscoveryComplete {
                complete: false,
                roles: Vec::new(),
            },
            SessionEvent::QueueIdle,
        ]
    );

    core.query_device_info().unwrap();
    assert_eq!(events(&mut core), vec![SessionEvent::QueueIdle]);
    assert!(mock.reads().is_empty());
    assert!(mock.characteristic_writes().is_empty());
}
