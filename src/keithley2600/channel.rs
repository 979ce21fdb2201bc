use serde::{Deserialize, Serialize};
use tracing::instrument;

use super::{Link, SourceMode};
use crate::error::{KeithleyError, Result};
use crate::tsp::{self, OutputMode, Smu, SourceFunction};

/// Result of one linear voltage sweep.
///
/// Both sequences come from the same sweep and are index-aligned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepResult {
    /// Applied source voltages (V)
    pub voltages: Vec<f64>,
    /// Measured currents (A)
    pub currents: Vec<f64>,
}

impl SweepResult {
    /// Number of sweep points.
    #[must_use]
    pub fn len(&self) -> usize {
        self.voltages.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.voltages.is_empty()
    }

    /// `(voltage, current)` pairs in sweep order.
    pub fn points(&self) -> impl Iterator<Item = (f64, f64)> + '_ {
        self.voltages.iter().copied().zip(self.currents.iter().copied())
    }
}

/// One SMU channel of a 2600-series instrument.
///
/// Holds a reference to the controller's connection, not the connection itself.
/// All calls fail with `NotConnected` once the controller is closed.
#[derive(Clone)]
pub struct Channel {
    name: String,
    smu: Smu,
    link: Link,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.name)
            .field("smu", &self.smu.name())
            .finish_non_exhaustive()
    }
}

impl Channel {
    pub(crate) fn new(name: &str, link: Link) -> Result<Self> {
        Ok(Self {
            name: name.to_string(),
            smu: Smu::from_channel(name)?,
            link,
        })
    }

    /// Channel letter as given at creation.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// TSP name of the SMU (`smua`, `smub`).
    #[must_use]
    pub fn smu_name(&self) -> &str {
        self.smu.name()
    }

    async fn query_number(&self, command: &str) -> Result<f64> {
        let reply = self.link.query(command).await?;
        tsp::parse_number(&reply)
    }

    /// Enable current and voltage measurement autorange.
    pub async fn autorange(&self) -> Result<()> {
        let mut transport = self.link.lock().await?;
        transport.write(&self.smu.autorange_current()).await?;
        transport.write(&self.smu.autorange_voltage()).await
    }

    /// Measure the terminal current (A).
    pub async fn measure_current(&self) -> Result<f64> {
        self.query_number(&self.smu.measure_current()).await
    }

    /// Measure the terminal voltage (V).
    pub async fn measure_voltage(&self) -> Result<f64> {
        self.query_number(&self.smu.measure_voltage()).await
    }

    /// Measure current and voltage in one reading, returned as `(current, voltage)`.
    pub async fn measure_iv(&self) -> Result<(f64, f64)> {
        let reply = self.link.query(&self.smu.measure_iv()).await?;
        tsp::parse_pair(&reply)
    }

    /// Programmed source current compliance (A).
    pub async fn current_limit(&self) -> Result<f64> {
        self.query_number(&self.smu.query_current_limit()).await
    }

    /// Set the source current compliance (A). Not read back.
    pub async fn set_current_limit(&self, amps: f64) -> Result<()> {
        self.link.write(&self.smu.set_current_limit(amps)).await
    }

    /// Programmed source voltage compliance (V).
    pub async fn voltage_limit(&self) -> Result<f64> {
        self.query_number(&self.smu.query_voltage_limit()).await
    }

    /// Set the source voltage compliance (V). Not read back.
    pub async fn set_voltage_limit(&self, volts: f64) -> Result<()> {
        self.link.write(&self.smu.set_voltage_limit(volts)).await
    }

    /// Source a DC voltage and turn the output on.
    pub async fn source_voltage(&self, volts: f64) -> Result<()> {
        self.source(SourceFunction::Voltage, volts).await
    }

    /// Source a DC current and turn the output on.
    pub async fn source_current(&self, amps: f64) -> Result<()> {
        self.source(SourceFunction::Current, amps).await
    }

    /// Source `value` in the given mode.
    pub async fn source_mode(&self, mode: SourceMode, value: f64) -> Result<()> {
        match mode {
            SourceMode::Voltage => self.source_voltage(value).await,
            SourceMode::Current => self.source_current(value).await,
        }
    }

    async fn source(&self, function: SourceFunction, value: f64) -> Result<()> {
        let mut transport = self.link.lock().await?;
        transport.write(&self.smu.source_function(function)).await?;
        transport.write(&self.smu.output(OutputMode::On)).await?;
        transport.write(&self.smu.level(function, value)).await
    }

    /// Turn the output off, optionally in high-impedance mode.
    pub async fn off(&self, high_impedance: bool) -> Result<()> {
        let mode = if high_impedance {
            OutputMode::HighImpedance
        } else {
            OutputMode::Off
        };
        self.link.write(&self.smu.output(mode)).await
    }

    /// Run the instrument's linear voltage sweep and collect both buffers.
    ///
    /// `num_points` is passed through unchecked; the instrument reports invalid
    /// values through the buffer status, which surfaces as `Sweep`.
    ///
    /// # Errors
    /// - `Sweep` when the buffer status is not 2
    /// - `Parse` on a malformed status or table, or a table whose length is not
    ///   `num_points`
    /// - `Timeout` when a reply does not arrive
    #[instrument(skip(self), fields(smu = %self.smu.name()), err)]
    pub async fn sweep_voltage_measure_current(
        &self,
        start: f64,
        stop: f64,
        stabilization_time: f64,
        num_points: u32,
    ) -> Result<SweepResult> {
        // Held for the whole sweep so nothing lands between trigger and dumps
        let mut transport = self.link.lock().await?;

        transport
            .write(&self.smu.sweep_v_lin_measure_i(start, stop, stabilization_time, num_points))
            .await?;

        let status_reply = transport.query(&self.smu.buffer_status()).await?;
        let status = tsp::parse_status(&status_reply)?;
        if status != tsp::BUFFERS_READY {
            tracing::warn!("Sweep on {} failed with buffer status {}", self.smu.name(), status_reply);
            return Err(KeithleyError::Sweep {
                status: status_reply,
            });
        }

        let reply = transport.query(&self.smu.dump_source_values(num_points)).await?;
        let voltages = parse_buffer(&reply, num_points)?;

        let reply = transport.query(&self.smu.dump_readings(num_points)).await?;
        let currents = parse_buffer(&reply, num_points)?;

        tracing::debug!("Sweep on {} returned {} points", self.smu.name(), voltages.len());
        Ok(SweepResult { voltages, currents })
    }
}

fn parse_buffer(reply: &str, expected: u32) -> Result<Vec<f64>> {
    let values = tsp::parse_table(reply)?;
    if values.len() != expected as usize {
        return Err(KeithleyError::parse(
            reply,
            format!("expected {} values, got {}", expected, values.len()),
        ));
    }
    Ok(values)
}
