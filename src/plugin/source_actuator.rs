use async_trait::async_trait;
use tokio::sync::broadcast;

use super::{emit, update_setting, Actuator, DataRecord, Session, DATA_CHANNEL_CAPACITY, RECORD_SOURCE};
use crate::config::SourceSettings;
use crate::error::{KeithleyError, Result};
use crate::keithley2600::{Channel, Controller, SourceMode};

/// Axis name of the actuator records.
const AXIS_NAME: &str = "Source";

/// Sourcemeter channel driven as an actuator.
///
/// The position is the sourced quantity: volts for a voltage source, amps for a
/// current source. Reading the position measures that same quantity at the
/// terminals. Every move reads the position back, so relative moves start from
/// where the last move landed.
pub struct SourceActuator {
    settings: SourceSettings,
    mode: Option<SourceMode>,
    session: Option<Session>,
    channel: Option<Channel>,
    current_value: f64,
    target_value: Option<f64>,
    sender: broadcast::Sender<DataRecord>,
}

impl SourceActuator {
    /// Create an uninitialised actuator.
    #[must_use]
    pub fn new(settings: SourceSettings) -> Self {
        let (sender, _) = broadcast::channel(DATA_CHANNEL_CAPACITY);
        Self {
            settings,
            mode: None,
            session: None,
            channel: None,
            current_value: 0.0,
            target_value: None,
            sender,
        }
    }

    /// Current settings.
    #[must_use]
    pub fn settings(&self) -> &SourceSettings {
        &self.settings
    }

    /// Source mode resolved at the last initialize or `source_type` change.
    #[must_use]
    pub fn mode(&self) -> Option<SourceMode> {
        self.mode
    }

    /// Last value read from hardware.
    #[must_use]
    pub fn current_value(&self) -> f64 {
        self.current_value
    }

    /// Last target sent to the instrument.
    #[must_use]
    pub fn target_value(&self) -> Option<f64> {
        self.target_value
    }

    /// Whether this actuator opened (and will close) the connection.
    #[must_use]
    pub fn is_master(&self) -> bool {
        self.session.as_ref().is_some_and(|s| s.master)
    }

    fn channel(&self) -> Result<&Channel> {
        self.channel.as_ref().ok_or(KeithleyError::NotConnected)
    }

    fn clamp(&self, value: f64) -> f64 {
        match self.settings.bounds {
            Some([min, max]) => value.clamp(min, max),
            None => value,
        }
    }

    /// Resolve `source_type`, then read and emit the value in the new mode.
    async fn apply_source_type(&mut self) -> Result<()> {
        let mode: SourceMode = self.settings.source_type.parse()?;
        self.mode = Some(mode);
        tracing::debug!("Source type set to {} ({})", mode, mode.unit());
        self.read_value().await?;
        Ok(())
    }

    async fn drive(&mut self, target: f64) -> Result<f64> {
        let mode = self
            .mode
            .ok_or_else(|| KeithleyError::UnsupportedMode(self.settings.source_type.clone()))?;
        self.channel()?.source_mode(mode, target).await?;
        self.target_value = Some(target);
        tracing::debug!("Sourcing {} {}", target, mode.unit());
        self.read_value().await?;
        Ok(target)
    }
}

#[async_trait]
impl Actuator for SourceActuator {
    async fn initialize(&mut self, shared: Option<Controller>) -> Result<Controller> {
        self.channel = None;
        if let Some(previous) = self.session.take() {
            previous.abandon().await;
        }

        let session = Session::attach(shared, &self.settings.connection).await?;
        let channel = match session
            .controller
            .create_channel(&self.settings.channel, self.settings.autorange)
            .await
        {
            Ok(channel) => channel,
            Err(e) => {
                session.abandon().await;
                return Err(e);
            }
        };

        let controller = session.controller.clone();
        tracing::info!(
            "Source actuator initialised on {} channel {} ({})",
            controller.resource(),
            channel.name(),
            if session.master { "master" } else { "slave" }
        );
        self.session = Some(session);
        self.channel = Some(channel);

        if let Err(e) = self.apply_source_type().await {
            self.channel = None;
            if let Some(session) = self.session.take() {
                session.abandon().await;
            }
            return Err(e);
        }
        Ok(controller)
    }

    async fn commit_setting(&mut self, name: &str, value: toml::Value) -> Result<()> {
        let updated: SourceSettings = update_setting(&self.settings, &["bounds"], name, value)?;
        if name != "source_type" {
            updated.validate().map_err(KeithleyError::Config)?;
        }
        self.settings = updated;

        if name == "source_type" && self.channel.is_some() {
            self.apply_source_type().await?;
        }
        Ok(())
    }

    async fn read_value(&mut self) -> Result<f64> {
        let channel = self.channel()?;
        let mode = self
            .mode
            .ok_or_else(|| KeithleyError::UnsupportedMode(self.settings.source_type.clone()))?;
        let value = match mode {
            SourceMode::Voltage => channel.measure_voltage().await?,
            SourceMode::Current => channel.measure_current().await?,
        };
        self.current_value = value;

        emit(
            &self.sender,
            &DataRecord::Scalar {
                source: RECORD_SOURCE.to_string(),
                label: AXIS_NAME.to_string(),
                value,
                unit: mode.unit().to_string(),
            },
        );
        Ok(value)
    }

    async fn move_abs(&mut self, target: f64) -> Result<f64> {
        let target = self.clamp(target);
        self.drive(target).await
    }

    async fn move_rel(&mut self, delta: f64) -> Result<f64> {
        let target = self.clamp(self.current_value + delta);
        self.drive(target).await
    }

    async fn stop(&mut self) -> Result<()> {
        self.channel()?.off(false).await?;
        tracing::info!("Source output switched off");
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

    async fn mock_actuator(
        source_type: &str,
        bounds: Option<[f64; 2]>,
        replies: &[&str],
    ) -> (SourceActuator, MockTransport) {
        let mock = MockTransport::with_replies("MOCK::1", replies.iter().copied());
        let controller = Controller::from_transport(mock.clone());
        let mut actuator = SourceActuator::new(SourceSettings {
            source_type: source_type.to_string(),
            autorange: false,
            bounds,
            ..Default::default()
        });
        actuator.initialize(Some(controller)).await.unwrap();
        mock.clear_commands().await;
        (actuator, mock)
    }

    #[tokio::test]
    async fn initialize_reads_current_value() {
        let (actuator, _mock) = mock_actuator("Current", None, &["1.00000e-04"]).await;
        assert_eq!(actuator.mode(), Some(SourceMode::Current));
        assert_eq!(actuator.current_value(), 1e-4);
    }

    #[tokio::test]
    async fn unsupported_source_type() {
        let mock = MockTransport::new("MOCK::1");
        let mut actuator = SourceActuator::new(SourceSettings {
            source_type: "Power".to_string(),
            ..Default::default()
        });
        let err = actuator
            .initialize(Some(Controller::from_transport(mock)))
            .await
            .unwrap_err();
        assert!(matches!(err, KeithleyError::UnsupportedMode(mode) if mode == "Power"));
    }

    #[tokio::test]
    async fn move_abs_clamps_to_bounds() {
        let (mut actuator, mock) =
            mock_actuator("Voltage", Some([-1.0, 1.0]), &["0.0", "1.00000e+00"]).await;

        let applied = actuator.move_abs(5.0).await.unwrap();
        assert_eq!(applied, 1.0);
        assert_eq!(actuator.current_value(), 1.0);
        assert_eq!(
            mock.commands().await,
            vec![
                "smua.source.func = 1",
                "smua.source.output = 1",
                "smua.source.levelv = 1.000000e+00",
                "print(smua.measure.v())",
            ]
        );
    }

    #[tokio::test]
    async fn move_rel_starts_from_last_position() {
        let (mut actuator, mock) =
            mock_actuator("Voltage", None, &["0.0", "1.00000e+00", "1.50000e+00"]).await;

        actuator.move_abs(1.0).await.unwrap();
        let applied = actuator.move_rel(0.5).await.unwrap();
        assert_eq!(applied, 1.5);
        assert_eq!(actuator.target_value(), Some(1.5));
        assert_eq!(actuator.current_value(), 1.5);

        let commands = mock.commands().await;
        assert_eq!(commands[6], "smua.source.levelv = 1.500000e+00");
        assert_eq!(commands.len(), 8);
    }

    #[tokio::test]
    async fn move_emits_position_record() {
        let (mut actuator, _mock) = mock_actuator("Current", None, &["0.0", "2.00000e-03"]).await;
        let mut rx = actuator.subscribe();

        actuator.move_abs(2e-3).await.unwrap();
        match rx.recv().await.unwrap() {
            DataRecord::Scalar { value, unit, .. } => {
                assert_eq!(value, 2e-3);
                assert_eq!(unit, "A");
            }
            other => panic!("unexpected record {:?}", other),
        }
    }

    #[tokio::test]
    async fn stop_turns_output_off() {
        let (mut actuator, mock) = mock_actuator("Current", None, &["0.0"]).await;
        actuator.stop().await.unwrap();
        assert_eq!(mock.commands().await, vec!["smua.source.output = 0"]);
    }

    #[tokio::test]
    async fn source_type_change_remeasures() {
        let (mut actuator, mock) = mock_actuator("Voltage", None, &["1.0", "2.00000e-03"]).await;
        let mut rx = actuator.subscribe();

        actuator
            .commit_setting("source_type", toml::Value::String("Current".into()))
            .await
            .unwrap();
        assert_eq!(actuator.mode(), Some(SourceMode::Current));
        assert_eq!(mock.commands().await, vec!["print(smua.measure.i())"]);

        match rx.recv().await.unwrap() {
            DataRecord::Scalar { value, unit, .. } => {
                assert_eq!(value, 2e-3);
                assert_eq!(unit, "A");
            }
            other => panic!("unexpected record {:?}", other),
        }
    }

    #[tokio::test]
    async fn failed_reinitialize_closes_both_connections() {
        let mut actuator = SourceActuator::new(SourceSettings {
            connection: ConnectionConfig::new("SIM::2614B"),
            ..Default::default()
        });
        let first = actuator.initialize(None).await.unwrap();
        assert!(actuator.is_master());

        assert!(actuator
            .commit_setting("source_type", toml::Value::String("Power".into()))
            .await
            .is_err());

        let err = actuator.initialize(None).await.unwrap_err();
        assert!(matches!(err, KeithleyError::UnsupportedMode(_)));
        assert!(!first.is_open().await);
        assert!(!actuator.is_master());
        assert!(matches!(
            actuator.read_value().await,
            Err(KeithleyError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn relative_move_on_simulator() {
        let mut actuator = SourceActuator::new(SourceSettings {
            connection: ConnectionConfig::new("SIM::2614B"),
            ..Default::default()
        });
        actuator.initialize(None).await.unwrap();

        actuator.move_abs(1.0).await.unwrap();
        let applied = actuator.move_rel(0.5).await.unwrap();
        assert_eq!(applied, 1.5);
        assert!((actuator.read_value().await.unwrap() - 1.5).abs() < 1e-9);
        actuator.close().await.unwrap();
    }
}
