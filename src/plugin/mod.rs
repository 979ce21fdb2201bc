//! Acquisition-host plugins for Keithley 2600 sourcemeters.
//!
//! Two plugins translate host lifecycle hooks into driver calls:
//! - [`SweepViewer`]: a detector that returns one I-V sweep per grab
//! - [`SourceActuator`]: an actuator whose position is the sourced voltage or current
//!
//! Plugins are built by [`PluginFactory`] implementations from TOML tables and
//! looked up by type name in a [`PluginRegistry`]. Every acquisition hook emits
//! exactly one [`DataRecord`] on the plugin's broadcast channel and also returns it.
//!
//! # Master and slave
//!
//! `initialize(None)` opens the instrument and makes the plugin its master.
//! `initialize(Some(controller))` adopts a connection opened by another plugin;
//! only the master closes it.
//!
//! ```rust,no_run
//! use daq_driver_keithley::plugin::{Actuator, Detector, PluginRegistry};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let registry = PluginRegistry::with_defaults();
//! let mut viewer = registry
//!     .build_detector("keithley2600_sweep", toml::toml! {
//!         [connection]
//!         resource = "SIM::2614B"
//!     }.into())
//!     .await?;
//! let mut source = registry
//!     .build_actuator("keithley2600_source", toml::toml! { channel = "B" }.into())
//!     .await?;
//!
//! let controller = viewer.initialize(None).await?;
//! source.initialize(Some(controller)).await?;
//! source.move_abs(0.5).await?;
//! let record = viewer.grab().await?;
//! # let _ = record;
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::error::{KeithleyError, Result};
use crate::keithley2600::Controller;

mod registry;
mod source_actuator;
mod sweep_viewer;

pub use registry::{
    Plugin, PluginFactory, PluginKind, PluginRegistry, SourceActuatorFactory, SweepViewerFactory,
};
pub use source_actuator::SourceActuator;
pub use sweep_viewer::SweepViewer;

/// Name attached to every record these plugins emit.
pub const RECORD_SOURCE: &str = "Keithley2600";

/// Capacity of each plugin's data broadcast channel.
pub const DATA_CHANNEL_CAPACITY: usize = 64;

/// One acquisition result handed to the host.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DataRecord {
    /// Single reading of an actuator
    Scalar {
        /// Emitting instrument
        source: String,
        /// Axis name
        label: String,
        /// Reading value
        value: f64,
        /// Reading unit ("V" or "A")
        unit: String,
    },
    /// One I-V curve; `voltages` is the x axis
    Sweep {
        /// Emitting instrument
        source: String,
        /// Applied voltages (V)
        voltages: Vec<f64>,
        /// Measured currents (A)
        currents: Vec<f64>,
    },
}

/// Detector lifecycle hooks.
#[async_trait]
pub trait Detector: Send + Sync {
    /// Open the instrument (`None`, master) or adopt a shared controller (slave).
    ///
    /// Returns the controller so further plugins can share it.
    async fn initialize(&mut self, shared: Option<Controller>) -> Result<Controller>;

    /// Apply a changed setting.
    async fn commit_setting(&mut self, name: &str, value: toml::Value) -> Result<()>;

    /// Acquire once and emit the record.
    async fn grab(&mut self) -> Result<DataRecord>;

    /// Abort an acquisition in progress.
    async fn stop(&mut self) -> Result<()>;

    /// Release hardware. Only a master closes the connection.
    async fn close(&mut self) -> Result<()>;

    /// Subscribe to emitted records.
    fn subscribe(&self) -> broadcast::Receiver<DataRecord>;
}

/// Actuator lifecycle hooks.
#[async_trait]
pub trait Actuator: Send + Sync {
    /// Open the instrument (`None`, master) or adopt a shared controller (slave).
    ///
    /// Returns the controller so further plugins can share it.
    async fn initialize(&mut self, shared: Option<Controller>) -> Result<Controller>;

    /// Apply a changed setting.
    async fn commit_setting(&mut self, name: &str, value: toml::Value) -> Result<()>;

    /// Read the actuator value from hardware and emit it.
    async fn read_value(&mut self) -> Result<f64>;

    /// Move to `target` (clamped to bounds). Returns the applied target.
    async fn move_abs(&mut self, target: f64) -> Result<f64>;

    /// Move by `delta` from the last position read back (clamped). Returns the
    /// applied target.
    async fn move_rel(&mut self, delta: f64) -> Result<f64>;

    /// Stop driving the output.
    async fn stop(&mut self) -> Result<()>;

    /// Release hardware. Only a master closes the connection.
    async fn close(&mut self) -> Result<()>;

    /// Subscribe to emitted records.
    fn subscribe(&self) -> broadcast::Receiver<DataRecord>;
}

/// Controller ownership of a plugin.
#[derive(Debug, Clone)]
pub(crate) struct Session {
    pub(crate) controller: Controller,
    pub(crate) master: bool,
}

impl Session {
    /// Adopt `shared`, or open the connection described by `connection`.
    pub(crate) async fn attach(
        shared: Option<Controller>,
        connection: &crate::config::ConnectionConfig,
    ) -> Result<Self> {
        match shared {
            Some(controller) => {
                tracing::info!("Adopting shared controller on {}", controller.resource());
                Ok(Self {
                    controller,
                    master: false,
                })
            }
            None => {
                let mut connection = connection.clone();
                if connection.resource.is_empty() {
                    connection.resource = crate::discovery::default_resource()
                        .await?
                        .ok_or_else(|| {
                            KeithleyError::Config(
                                "no resource configured and none discovered".to_string(),
                            )
                        })?;
                }
                Ok(Self {
                    controller: Controller::open(&connection).await?,
                    master: true,
                })
            }
        }
    }

    /// Close the connection if this plugin owns it.
    pub(crate) async fn release(self) -> Result<()> {
        if self.master {
            self.controller.close().await
        } else {
            Ok(())
        }
    }

    /// Release without failing; used when another error is already on its way
    /// out or the session is being replaced.
    pub(crate) async fn abandon(self) {
        let resource = self.controller.resource().to_string();
        if let Err(e) = self.release().await {
            tracing::warn!("Failed to release connection to {}: {}", resource, e);
        }
    }
}

/// Replace one top-level field of a settings struct from a TOML value.
///
/// `optional` lists fields that may be absent from the serialized form (`None`).
pub(crate) fn update_setting<T>(
    settings: &T,
    optional: &[&str],
    name: &str,
    value: toml::Value,
) -> Result<T>
where
    T: Serialize + serde::de::DeserializeOwned,
{
    let mut table = match toml::Value::try_from(settings) {
        Ok(toml::Value::Table(table)) => table,
        Ok(_) => return Err(KeithleyError::Config("settings are not a table".to_string())),
        Err(e) => return Err(KeithleyError::Config(e.to_string())),
    };
    if !table.contains_key(name) && !optional.contains(&name) {
        return Err(KeithleyError::Config(format!("unknown setting '{}'", name)));
    }
    table.insert(name.to_string(), value);
    toml::Value::Table(table)
        .try_into()
        .map_err(|e| KeithleyError::Config(format!("invalid value for '{}': {}", name, e)))
}

pub(crate) fn emit(sender: &broadcast::Sender<DataRecord>, record: &DataRecord) {
    // No subscribers is fine; the record is also returned to the caller
    if sender.send(record.clone()).is_err() {
        tracing::trace!("No subscribers for data record");
    }
}
