use nbd_client_core::{
    errno, AddressFamily, BlockDevice, BlockRequest, ConnectionState, ControlRequest,
    ControlResponse, DataPath, DeviceErrorKind, DeviceTable, Direction, LinkState, OpenerId,
    ServerEndpoint, SocketType, TableConfig, TcpConnector, TcpConnectorConfig,
};
use nbd_export::{serve, BlockSource, PatternBlockSource};
use nbd_proto::{Hello, HELLO_LEN};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpListener,
};

const WAIT: Duration = Duration::from_secs(5);
const POLL: Duration = Duration::from_millis(5);

async fn spawn_export(blocks: u64) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let source: Arc<dyn BlockSource> = Arc::new(PatternBlockSource::new(512, blocks).unwrap());
    tokio::spawn(serve(listener, source));
    addr
}

/// Accepts one client and sends it `greeting`, then holds the socket open.
async fn spawn_raw_greeter(greeting: [u8; HELLO_LEN]) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        stream.write_all(&greeting).await.unwrap();
        let mut sink = Vec::new();
        let _ = stream.read_to_end(&mut sink).await;
    });
    addr
}

/// Accepts one client, sends it a valid greeting and hangs up.
async fn spawn_hangup_greeter(blocks: u64) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        stream
            .write_all(&Hello::read_only(blocks * 512).encode())
            .await
            .unwrap();
        stream.shutdown().await.unwrap();
    });
    addr
}

fn table(data_path: DataPath) -> Arc<DeviceTable> {
    let connector = TcpConnector::new(TcpConnectorConfig {
        data_path,
        ..TcpConnectorConfig::default()
    });
    Arc::new(DeviceTable::new(TableConfig::default(), Arc::new(connector)).unwrap())
}

async fn connect_and_handshake(table: &DeviceTable, unit: usize, addr: SocketAddr) {
    let controller = table.controller();
    controller
        .connect(unit, ServerEndpoint::from_socket_addr(addr))
        .await
        .unwrap();
    controller.wait_connected(unit, WAIT, POLL).await.unwrap();
    controller.validate_handshake(unit).await.unwrap();
}

#[tokio::test]
async fn reads_blocks_from_loopback_export() -> anyhow::Result<()> {
    let addr = spawn_export(64).await;
    let table = table(DataPath::Nbd);
    let monitor = table.spawn_connectivity_monitor()?;

    let controller = table.controller();
    controller
        .connect(0, ServerEndpoint::from_socket_addr(addr))
        .await?;
    controller.wait_connected(0, WAIT, POLL).await?;
    assert_eq!(
        controller.connection_state(0).await?,
        ConnectionState::Connected
    );
    let handshake = controller.validate_handshake(0).await?;
    assert!(handshake.oldstyle);
    assert!(!handshake.writable);
    assert_eq!(handshake.capacity_bytes, 64 * 512);
    assert_eq!(
        table.control(0, ControlRequest::GetBlockCount).await?,
        ControlResponse::BlockCount(64)
    );

    let mut buf = vec![0u8; 1536];
    let done = table
        .dispatcher()
        .dispatch(BlockRequest::read(0, 5, 1536), &mut buf)
        .await?;
    assert_eq!(done.transferred, 1536);
    assert_eq!(done.residual, 0);
    for (i, byte) in buf.iter().enumerate() {
        assert_eq!(*byte, ((5 * 512 + i) % 256) as u8);
    }

    controller.teardown(0).await?;
    assert_eq!(controller.connection_state(0).await?, ConnectionState::Idle);
    monitor.abort();
    Ok(())
}

#[tokio::test]
async fn pattern_path_matches_wire_reads() {
    let addr = spawn_export(16).await;
    let wire = table(DataPath::Nbd);
    let local = table(DataPath::Pattern);
    connect_and_handshake(&wire, 1, addr).await;
    connect_and_handshake(&local, 1, addr).await;

    let mut from_wire = vec![0u8; 700];
    let mut from_pattern = vec![0u8; 700];
    wire.dispatcher()
        .dispatch(BlockRequest::read(1, 3, 700), &mut from_wire)
        .await
        .unwrap();
    local
        .dispatcher()
        .dispatch(BlockRequest::read(1, 3, 700), &mut from_pattern)
        .await
        .unwrap();
    assert_eq!(from_wire, from_pattern);
}

#[tokio::test]
async fn server_errors_fail_the_request_only() {
    let addr = spawn_export(4).await;
    let table = table(DataPath::Nbd);
    connect_and_handshake(&table, 2, addr).await;

    let mut buf = vec![0u8; 1024];
    let err = table
        .dispatcher()
        .dispatch(BlockRequest::read(2, 3, 1024), &mut buf)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), DeviceErrorKind::Io);
    assert_eq!(err.errno(), errno::EINVAL);

    assert!(table.controller().check_connectivity(2).await.unwrap());
    table
        .dispatcher()
        .dispatch(BlockRequest::read(2, 0, 1024), &mut buf)
        .await
        .unwrap();
}

#[tokio::test]
async fn bad_greeting_shuts_transport_down() {
    let mut greeting = Hello::read_only(4096).encode();
    greeting[..8].copy_from_slice(b"NBDMAGIX");
    let bad = spawn_raw_greeter(greeting).await;
    let good = spawn_export(8).await;
    let table = table(DataPath::Nbd);
    let controller = table.controller();

    controller
        .connect(0, ServerEndpoint::from_socket_addr(bad))
        .await
        .unwrap();
    controller.wait_connected(0, WAIT, POLL).await.unwrap();
    let err = controller.validate_handshake(0).await.unwrap_err();
    assert_eq!(err.kind(), DeviceErrorKind::ProtocolError);
    assert!(!controller.check_connectivity(0).await.unwrap());

    let mut buf = [0u8; 512];
    let err = table
        .dispatcher()
        .dispatch(BlockRequest::read(0, 0, 512), &mut buf)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), DeviceErrorKind::DeviceNotReady);

    connect_and_handshake(&table, 0, good).await;
    assert!(controller.check_connectivity(0).await.unwrap());
}

#[tokio::test]
async fn refused_connect_surfaces_through_wait() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let table = table(DataPath::Nbd);
    let controller = table.controller();
    controller
        .connect(0, ServerEndpoint::from_socket_addr(addr))
        .await
        .unwrap();
    let err = controller.wait_connected(0, WAIT, POLL).await.unwrap_err();
    assert_eq!(err.kind(), DeviceErrorKind::ConnectFailed);
    assert!(err.code().is_some());
    assert_eq!(
        controller.connection_state(0).await.unwrap(),
        ConnectionState::Disconnected
    );
    let err = controller.validate_handshake(0).await.unwrap_err();
    assert_eq!(err.kind(), DeviceErrorKind::DeviceNotReady);
    let err = table
        .control(0, ControlRequest::Handshake)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), DeviceErrorKind::DeviceNotReady);

    // The dead transport is replaced by the next connect.
    let good = spawn_export(8).await;
    connect_and_handshake(&table, 0, good).await;
}

#[tokio::test]
async fn unreachable_connect_fails_immediately() {
    let table = table(DataPath::Nbd);
    let controller = table.controller();
    let endpoint = ServerEndpoint::from_socket_addr(([255, 255, 255, 255], 10809).into());

    let err = controller.connect(0, endpoint).await.unwrap_err();
    assert_eq!(err.kind(), DeviceErrorKind::ConnectFailed);
    assert!(err.code().is_some());
    assert_eq!(
        controller.connection_state(0).await.unwrap(),
        ConnectionState::Idle
    );
    assert!(controller
        .check_connectivity(0)
        .await
        .unwrap_err()
        .kind()
        .is_not_ready());
    assert_eq!(
        table.get(0).unwrap().lock().await.server_endpoint(),
        Some(&endpoint)
    );
}

#[tokio::test]
async fn peer_hangup_after_greeting_is_noticed() {
    let addr = spawn_hangup_greeter(8).await;
    let table = table(DataPath::Nbd);
    let mut events = table.take_connectivity_events().unwrap();
    connect_and_handshake(&table, 3, addr).await;

    let controller = table.controller();
    let deadline = tokio::time::Instant::now() + WAIT;
    while controller.check_connectivity(3).await.unwrap() {
        assert!(tokio::time::Instant::now() < deadline, "hangup never noticed");
        tokio::time::sleep(POLL).await;
    }
    assert_eq!(
        controller.connection_state(3).await.unwrap(),
        ConnectionState::Disconnected
    );

    let mut buf = [0u8; 512];
    let err = table
        .dispatcher()
        .dispatch(BlockRequest::read(3, 0, 512), &mut buf)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), DeviceErrorKind::DeviceNotReady);

    let mut states = Vec::new();
    while let Ok(event) = events.try_recv() {
        assert_eq!(event.unit, 3);
        states.push(event.state);
    }
    assert_eq!(states, [LinkState::Connected, LinkState::Disconnected]);
}

#[tokio::test]
async fn non_tcp_endpoints_are_rejected() {
    let table = table(DataPath::Nbd);
    let endpoint = ServerEndpoint::from_raw(
        AddressFamily::Inet,
        SocketType::Datagram,
        17,
        &[0x2A, 0x29, 127, 0, 0, 1],
    )
    .unwrap();
    let err = table
        .control(0, ControlRequest::Connect(endpoint))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), DeviceErrorKind::ConnectFailed);
    assert_eq!(err.errno(), errno::EPROTONOSUPPORT);
    assert_eq!(
        table.controller().connection_state(0).await.unwrap(),
        ConnectionState::Idle
    );
}

#[tokio::test]
async fn unit_handle_serves_host_requests() {
    let addr = spawn_export(32).await;
    let table = table(DataPath::Nbd);
    let device = table.handle(4).unwrap();

    device.open(OpenerId(10)).await.unwrap();
    assert_eq!(
        device.open(OpenerId(11)).await.unwrap_err().kind(),
        DeviceErrorKind::Busy
    );
    device
        .ioctl(ControlRequest::Connect(ServerEndpoint::from_socket_addr(addr)))
        .await
        .unwrap();
    table.controller().wait_connected(4, WAIT, POLL).await.unwrap();
    device.ioctl(ControlRequest::Handshake).await.unwrap();

    let mut buf = vec![0u8; 512];
    device.strategy(1, Direction::Read, &mut buf).await.unwrap();
    assert_eq!(buf[1], 1);
    let err = device
        .strategy(1, Direction::Write, &mut buf)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), DeviceErrorKind::ReadOnly);

    device.close(OpenerId(10)).await.unwrap();
    assert_eq!(
        device.ioctl(ControlRequest::Teardown).await.unwrap(),
        ControlResponse::Ack
    );
    table.shutdown().await;
}
