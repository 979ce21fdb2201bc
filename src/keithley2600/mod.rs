//! Keithley 2600-series sourcemeter driver.
//!
//! A [`Controller`] owns the connection to one instrument and hands out
//! [`Channel`]s, one per SMU. Channels translate typed operations into TSP and
//! parse the single-line replies.
//!
//! Instrument-side state (autorange, limits, source function, output) is never
//! cached here. Reads re-query the instrument and writes are not read back, so
//! the last command sent wins.
//!
//! # Usage
//!
//! ```rust,no_run
//! use daq_driver_keithley::config::ConnectionConfig;
//! use daq_driver_keithley::keithley2600::Controller;
//!
//! # async fn run() -> daq_driver_keithley::Result<()> {
//! let controller = Controller::open(&ConnectionConfig::new("SIM::2614B")).await?;
//! let smua = controller.create_channel("A", true).await?;
//! smua.set_current_limit(1e-3).await?;
//! let sweep = smua.sweep_voltage_measure_current(0.0, 1.0, 1e-3, 101).await?;
//! println!("{} points", sweep.len());
//! controller.close().await?;
//! # Ok(())
//! # }
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};

use crate::error::{KeithleyError, Result};
use crate::transport::Transport;

mod channel;
mod controller;

pub use channel::{Channel, SweepResult};
pub use controller::Controller;

/// Quantity driven by the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceMode {
    /// Source voltage, measure current
    Voltage,
    /// Source current, measure voltage
    Current,
}

impl SourceMode {
    /// SI unit of the sourced quantity.
    #[must_use]
    pub fn unit(self) -> &'static str {
        match self {
            SourceMode::Voltage => "V",
            SourceMode::Current => "A",
        }
    }
}

impl fmt::Display for SourceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceMode::Voltage => write!(f, "Voltage"),
            SourceMode::Current => write!(f, "Current"),
        }
    }
}

impl FromStr for SourceMode {
    type Err = KeithleyError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "voltage" => Ok(SourceMode::Voltage),
            "current" => Ok(SourceMode::Current),
            _ => Err(KeithleyError::UnsupportedMode(s.to_string())),
        }
    }
}

/// Connection shared by a controller, its clones, and every channel it created.
///
/// The mutex is the single-flight guard: the protocol carries no request IDs,
/// so a command and its reply must not interleave with another exchange.
#[derive(Clone)]
pub(crate) struct Link {
    inner: Arc<Mutex<Option<Box<dyn Transport>>>>,
}

impl Link {
    pub(crate) fn new(transport: Box<dyn Transport>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Some(transport))),
        }
    }

    /// Exclusive access to the open transport.
    pub(crate) async fn lock(&self) -> Result<LinkGuard<'_>> {
        let guard = self.inner.lock().await;
        if guard.is_none() {
            return Err(KeithleyError::NotConnected);
        }
        Ok(LinkGuard(guard))
    }

    pub(crate) async fn write(&self, command: &str) -> Result<()> {
        self.lock().await?.write(command).await
    }

    pub(crate) async fn query(&self, command: &str) -> Result<String> {
        self.lock().await?.query(command).await
    }

    pub(crate) async fn is_open(&self) -> bool {
        self.inner.lock().await.is_some()
    }

    /// Take the transport out and close it. Fails if already closed.
    pub(crate) async fn close(&self) -> Result<()> {
        let transport = self.inner.lock().await.take();
        match transport {
            Some(mut transport) => transport.close().await,
            None => Err(KeithleyError::NotConnected),
        }
    }
}

/// Held lock on an open [`Link`]. Nothing else reaches the instrument until it
/// is dropped.
pub(crate) struct LinkGuard<'a>(MutexGuard<'a, Option<Box<dyn Transport>>>);

impl LinkGuard<'_> {
    fn transport(&mut self) -> Result<&mut Box<dyn Transport>> {
        self.0.as_mut().ok_or(KeithleyError::NotConnected)
    }

    pub(crate) async fn write(&mut self, command: &str) -> Result<()> {
        self.transport()?.write(command).await
    }

    pub(crate) async fn query(&mut self, command: &str) -> Result<String> {
        self.transport()?.query(command).await
    }
}
