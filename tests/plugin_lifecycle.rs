//! Plugin lifecycle against the simulated instrument.

use daq_driver_keithley::plugin::{DataRecord, PluginKind, PluginRegistry, RECORD_SOURCE};
use daq_driver_keithley::KeithleyError;

fn sweep_config() -> toml::Value {
    toml::toml! {
        channel = "A"
        start_v = 0.0
        stop_v = 2.0
        points = 21
        current_limit_a = 0.1

        [connection]
        resource = "SIM::2614B"
    }
    .into()
}

#[tokio::test]
async fn test_registry_lists_both_plugins() {
    let registry = PluginRegistry::with_defaults();
    let kinds: Vec<_> = registry
        .plugin_types()
        .filter_map(|t| registry.factory(t).map(|f| f.kind()))
        .collect();
    assert_eq!(kinds, vec![PluginKind::Actuator, PluginKind::Detector]);
}

#[tokio::test]
async fn test_master_viewer_and_slave_actuator_share_connection() {
    let registry = PluginRegistry::with_defaults();
    let mut viewer = registry
        .build_detector("keithley2600_sweep", sweep_config())
        .await
        .expect("build viewer");
    let mut source = registry
        .build_actuator(
            "keithley2600_source",
            toml::toml! {
                channel = "B"
                source_type = "Current"
                bounds = [-1.0e-3, 1.0e-3]
            }
            .into(),
        )
        .await
        .expect("build actuator");

    let controller = viewer.initialize(None).await.expect("init viewer");
    source
        .initialize(Some(controller.clone()))
        .await
        .expect("init actuator");

    // Channel B sources into the 1 kΩ load; the bound clamps the request
    let applied = source.move_abs(5e-3).await.expect("move");
    assert_eq!(applied, 1e-3);
    let read = source.read_value().await.expect("read");
    assert!((read - 1e-3).abs() < 1e-9);

    let record = viewer.grab().await.expect("grab");
    match record {
        DataRecord::Sweep {
            source,
            voltages,
            currents,
        } => {
            assert_eq!(source, RECORD_SOURCE);
            assert_eq!(voltages.len(), 21);
            assert!((voltages[20] - 2.0).abs() < 1e-9);
            assert!((currents[10] - 1e-3).abs() < 1e-9);
        }
        other => panic!("unexpected record {:?}", other),
    }

    // Slave close keeps the instrument open for the master
    source.close().await.expect("close actuator");
    assert!(controller.is_open().await);
    viewer.grab().await.expect("grab after slave close");

    viewer.close().await.expect("close viewer");
    assert!(!controller.is_open().await);
}

#[tokio::test]
async fn test_grab_emits_on_subscription() {
    let registry = PluginRegistry::with_defaults();
    let mut viewer = registry
        .build_detector("keithley2600_sweep", sweep_config())
        .await
        .expect("build viewer");
    let mut rx = viewer.subscribe();

    viewer.initialize(None).await.expect("init");
    let placeholder = rx.recv().await.expect("placeholder");
    assert!(matches!(placeholder, DataRecord::Sweep { ref voltages, .. } if voltages.len() == 101));

    let returned = viewer.grab().await.expect("grab");
    let emitted = rx.recv().await.expect("record");
    assert_eq!(returned, emitted);

    viewer.close().await.expect("close");
}

#[tokio::test]
async fn test_failed_sweep_is_reported() {
    let registry = PluginRegistry::with_defaults();
    let mut viewer = registry
        .build_detector("keithley2600_sweep", sweep_config())
        .await
        .expect("build viewer");
    viewer.initialize(None).await.expect("init");

    // The instrument refuses a one-point sweep
    viewer
        .commit_setting("points", toml::Value::Integer(1))
        .await
        .expect("commit");
    let err = viewer.grab().await.expect_err("sweep should fail");
    assert!(matches!(err, KeithleyError::Sweep { ref status } if status.starts_with('0')));

    viewer.close().await.expect("close");
}

#[tokio::test]
async fn test_unknown_setting_is_rejected() {
    let registry = PluginRegistry::with_defaults();
    let mut source = registry
        .build_actuator("keithley2600_source", toml::toml! { source_type = "Voltage" }.into())
        .await
        .expect("build actuator");

    assert!(source
        .commit_setting("compliance", toml::Value::Float(1.0))
        .await
        .is_err());
    assert!(source
        .commit_setting("bounds", toml::Value::Array(vec![1.0.into(), 0.0.into()]))
        .await
        .is_err());
}

#[tokio::test]
async fn test_build_rejects_invalid_config() {
    let registry = PluginRegistry::with_defaults();
    let result = registry
        .build_detector(
            "keithley2600_sweep",
            toml::toml! {
                channel = "AB"
            }
            .into(),
        )
        .await;
    assert!(result.is_err());
}
