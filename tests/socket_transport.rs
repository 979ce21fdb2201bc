//! Raw LAN socket transport against a local fake instrument.

use std::time::Duration;

use daq_driver_keithley::transport::simulator::SimulatedInstrument;
use daq_driver_keithley::{Backend, ConnectionConfig, Controller, KeithleyError};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;

/// Serve one connection, answering each line from a simulated 2600.
async fn spawn_instrument() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let port = listener.local_addr().expect("addr").port();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.expect("accept");
        let (reader, mut writer) = stream.into_split();
        let mut lines = BufReader::new(reader).lines();
        let mut instrument = SimulatedInstrument::default();

        while let Ok(Some(line)) = lines.next_line().await {
            if let Some(reply) = instrument.execute(&line) {
                writer
                    .write_all(format!("{}\n", reply).as_bytes())
                    .await
                    .expect("write reply");
            }
        }
    });

    format!("TCPIP0::127.0.0.1::{}::SOCKET", port)
}

/// Accept one connection and never answer.
async fn spawn_silent_instrument() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let port = listener.local_addr().expect("addr").port();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.expect("accept");
        tokio::time::sleep(Duration::from_secs(5)).await;
        drop(stream);
    });

    format!("TCPIP0::127.0.0.1::{}::SOCKET", port)
}

#[tokio::test]
async fn test_socket_resource_selects_socket_backend() {
    let config = ConnectionConfig::new("TCPIP0::192.168.1.50::5025::SOCKET");
    assert_eq!(config.resolved_backend(), Backend::Socket);
}

#[tokio::test]
async fn test_sweep_over_socket() {
    let resource = spawn_instrument().await;
    let controller = Controller::open(&ConnectionConfig::new(resource.clone()))
        .await
        .expect("open");
    assert_eq!(controller.resource(), resource);

    let channel = controller.create_channel("A", true).await.expect("channel");
    channel.set_current_limit(1e-2).await.expect("limit");
    assert!((channel.current_limit().await.expect("limit query") - 1e-2).abs() < 1e-12);

    let sweep = channel
        .sweep_voltage_measure_current(0.0, 1.0, 1e-3, 5)
        .await
        .expect("sweep");
    assert_eq!(sweep.len(), 5);
    assert!((sweep.voltages[2] - 0.5).abs() < 1e-9);
    assert!((sweep.currents[4] - 1e-3).abs() < 1e-9);

    channel.source_voltage(2.0).await.expect("source");
    let (i, v) = channel.measure_iv().await.expect("measure");
    assert!((i - 2e-3).abs() < 1e-9);
    assert!((v - 2.0).abs() < 1e-9);

    controller.close().await.expect("close");
}

#[tokio::test]
async fn test_silent_instrument_times_out() {
    let resource = spawn_silent_instrument().await;
    let config = ConnectionConfig::new(resource).with_timeout(Duration::from_millis(100));
    let controller = Controller::open(&config).await.expect("open");
    let channel = controller.create_channel("A", false).await.expect("channel");

    let err = channel.measure_current().await.expect_err("no reply");
    assert!(matches!(err, KeithleyError::Timeout(cmd) if cmd == "print(smua.measure.i())"));
}

#[tokio::test]
async fn test_refused_connection() {
    // Bind then drop to get a port nothing listens on
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let port = listener.local_addr().expect("addr").port();
    drop(listener);

    let config = ConnectionConfig::new(format!("TCPIP0::127.0.0.1::{}::SOCKET", port))
        .with_timeout(Duration::from_millis(500));
    let err = Controller::open(&config).await.expect_err("refused");
    assert!(matches!(err, KeithleyError::Connection { .. }));
}
