use async_trait::async_trait;
use tokio::sync::broadcast;

use super::{emit, update_setting, DataRecord, Detector, Session, DATA_CHANNEL_CAPACITY, RECORD_SOURCE};
use crate::config::SweepSettings;
use crate::error::{KeithleyError, Result};
use crate::keithley2600::{Channel, Controller};

/// Points in the record emitted at initialization.
const PLACEHOLDER_POINTS: usize = 101;

/// I-V sweep detector (1D viewer).
///
/// Each grab runs `SweepVLinMeasureI` on the configured channel and emits the
/// applied voltages as x axis and measured currents as data. With idle
/// polarization enabled the channel is left sourcing `idle_voltage_v` after
/// every sweep.
pub struct SweepViewer {
    settings: SweepSettings,
    session: Option<Session>,
    channel: Option<Channel>,
    sender: broadcast::Sender<DataRecord>,
}

impl SweepViewer {
    /// Create an uninitialised viewer.
    #[must_use]
    pub fn new(settings: SweepSettings) -> Self {
        let (sender, _) = broadcast::channel(DATA_CHANNEL_CAPACITY);
        Self {
            settings,
            session: None,
            channel: None,
            sender,
        }
    }

    /// Current settings.
    #[must_use]
    pub fn settings(&self) -> &SweepSettings {
        &self.settings
    }

    /// Whether this viewer opened (and will close) the connection.
    #[must_use]
    pub fn is_master(&self) -> bool {
        self.session.as_ref().is_some_and(|s| s.master)
    }

    fn channel(&self) -> Result<&Channel> {
        self.channel.as_ref().ok_or(KeithleyError::NotConnected)
    }

    /// Record describing the data shape before the first sweep.
    fn placeholder() -> DataRecord {
        let step = 1.0 / (PLACEHOLDER_POINTS - 1) as f64;
        DataRecord::Sweep {
            source: RECORD_SOURCE.to_string(),
            voltages: (0..PLACEHOLDER_POINTS).map(|n| n as f64 * step).collect(),
            currents: vec![0.0; PLACEHOLDER_POINTS],
        }
    }
}

#[async_trait]
impl Detector for SweepViewer {
    async fn initialize(&mut self, shared: Option<Controller>) -> Result<Controller> {
        self.channel = None;
        if let Some(previous) = self.session.take() {
            previous.abandon().await;
        }

        let session = Session::attach(shared, &self.settings.connection).await?;
        let setup = async {
            let channel = session
                .controller
                .create_channel(&self.settings.channel, self.settings.autorange)
                .await?;
            channel.set_current_limit(self.settings.current_limit_a).await?;
            Ok::<_, KeithleyError>(channel)
        };
        let channel = match setup.await {
            Ok(channel) => channel,
            Err(e) => {
                session.abandon().await;
                return Err(e);
            }
        };

        let controller = session.controller.clone();
        tracing::info!(
            "Sweep viewer initialised on {} channel {} ({})",
            controller.resource(),
            channel.name(),
            if session.master { "master" } else { "slave" }
        );
        self.session = Some(session);
        self.channel = Some(channel);

        emit(&self.sender, &Self::placeholder());
        Ok(controller)
    }

    async fn commit_setting(&mut self, name: &str, value: toml::Value) -> Result<()> {
        let updated: SweepSettings = update_setting(&self.settings, &[], name, value)?;
        updated.validate().map_err(KeithleyError::Config)?;
        self.settings = updated;

        match (name, self.channel.as_ref()) {
            ("current_limit_a", Some(channel)) => {
                channel.set_current_limit(self.settings.current_limit_a).await?;
            }
            ("channel" | "autorange" | "connection", Some(_)) => {
                tracing::debug!("Setting '{}' takes effect at the next initialize", name);
            }
            _ => {}
        }
        Ok(())
    }

    async fn grab(&mut self) -> Result<DataRecord> {
        let channel = self.channel()?;
        let s = &self.settings;

        let sweep = channel
            .sweep_voltage_measure_current(s.start_v, s.stop_v, s.stabilization_s, s.points)
            .await?;

        if s.idle_polarization {
            channel.source_voltage(s.idle_voltage_v).await?;
        }

        let record = DataRecord::Sweep {
            source: RECORD_SOURCE.to_string(),
            voltages: sweep.voltages,
            currents: sweep.currents,
        };
        emit(&self.sender, &record);
        Ok(record)
    }

    async fn stop(&mut self) -> Result<()> {
        // A sweep runs to completion on the instrument; nothing to abort
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.channel = None;
        match self.session.take() {
            Some(session) => session.release().await,
            None => Ok(()),
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<DataRecord> {
        self.sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionConfig;
    use crate::transport::MockTransport;

    fn sim_settings() -> SweepSettings {
        SweepSettings {
            connection: ConnectionConfig::new("SIM::2614B"),
            points: 11,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn initialize_emits_placeholder() {
        let mut viewer = SweepViewer::new(sim_settings());
        let mut rx = viewer.subscribe();

        viewer.initialize(None).await.unwrap();
        assert!(viewer.is_master());

        match rx.recv().await.unwrap() {
            DataRecord::Sweep {
                voltages, currents, ..
            } => {
                assert_eq!(voltages.len(), 101);
                assert_eq!(voltages[0], 0.0);
                assert!((voltages[100] - 1.0).abs() < 1e-12);
                assert!(currents.iter().all(|c| *c == 0.0));
            }
            other => panic!("unexpected record {:?}", other),
        }
    }

    #[tokio::test]
    async fn grab_before_initialize_fails() {
        let mut viewer = SweepViewer::new(sim_settings());
        assert!(matches!(
            viewer.grab().await,
            Err(KeithleyError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn grab_returns_sweep_from_simulator() {
        let mut viewer = SweepViewer::new(sim_settings());
        viewer.initialize(None).await.unwrap();

        let record = viewer.grab().await.unwrap();
        match record {
            DataRecord::Sweep {
                voltages, currents, ..
            } => {
                assert_eq!(voltages.len(), 11);
                assert_eq!(currents.len(), 11);
                // 1 kΩ load
                assert!((currents[10] - 1e-3).abs() < 1e-9);
            }
            other => panic!("unexpected record {:?}", other),
        }
        viewer.close().await.unwrap();
    }

    #[tokio::test]
    async fn idle_polarization_sources_after_sweep() {
        let mock = MockTransport::with_replies(
            "MOCK::1",
            ["2", "0.0, 1.0", "0.0, 1.0e-3"],
        );
        let controller = Controller::from_transport(mock.clone());

        let mut viewer = SweepViewer::new(SweepSettings {
            points: 2,
            autorange: false,
            idle_polarization: true,
            idle_voltage_v: 0.25,
            ..Default::default()
        });
        viewer.initialize(Some(controller.clone())).await.unwrap();
        assert!(!viewer.is_master());
        mock.clear_commands().await;

        viewer.grab().await.unwrap();
        let commands = mock.commands().await;
        assert_eq!(
            &commands[commands.len() - 3..],
            &[
                "smua.source.func = 1",
                "smua.source.output = 1",
                "smua.source.levelv = 2.500000e-01",
            ]
        );

        // Slave close leaves the shared connection open
        viewer.close().await.unwrap();
        assert!(controller.is_open().await);
    }

    #[tokio::test]
    async fn current_limit_change_is_written() {
        let mock = MockTransport::new("MOCK::1");
        let controller = Controller::from_transport(mock.clone());
        let mut viewer = SweepViewer::new(SweepSettings {
            autorange: false,
            ..Default::default()
        });
        viewer.initialize(Some(controller)).await.unwrap();
        assert_eq!(mock.commands().await, vec!["smua.source.limiti = 1.000000e-01"]);

        viewer
            .commit_setting("current_limit_a", toml::Value::Float(0.02))
            .await
            .unwrap();
        assert_eq!(viewer.settings().current_limit_a, 0.02);
        assert_eq!(
            mock.commands().await.last().map(String::as_str),
            Some("smua.source.limiti = 2.000000e-02")
        );

        assert!(viewer
            .commit_setting("current_limit_a", toml::Value::Float(-1.0))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn reinitialize_releases_previous_connection() {
        let mut viewer = SweepViewer::new(sim_settings());
        let first = viewer.initialize(None).await.unwrap();
        let second = viewer.initialize(None).await.unwrap();

        assert!(!first.is_open().await);
        assert!(second.is_open().await);
        viewer.close().await.unwrap();
        assert!(!second.is_open().await);
    }

    #[tokio::test]
    async fn failed_initialize_leaves_no_session() {
        let mut viewer = SweepViewer::new(SweepSettings {
            channel: "1".to_string(),
            ..sim_settings()
        });
        let err = viewer.initialize(None).await.unwrap_err();
        assert!(matches!(err, KeithleyError::InvalidChannel(_)));
        assert!(!viewer.is_master());
        assert!(matches!(viewer.grab().await, Err(KeithleyError::NotConnected)));
        viewer.close().await.unwrap();
    }
}
