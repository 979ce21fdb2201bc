//! TSP wire format for Keithley 2600 sourcemeters.
//!
//! Reference: Keithley Series 2600B System SourceMeter Reference Manual
//! (2600BS-901-01).
//!
//! Protocol Overview:
//! - Format: flat TSP statements, one per line (NOT SCPI)
//! - Terminator: LF only (\n)
//! - Setpoints: C-style `%.6e` (e.g., "1.000000e-03")
//! - Queries: `print(<expr>)` returns one line
//! - Buffer dumps: `printbuffer(1, N, <buffer>)` returns a `", "`-joined line
//! - Sweep status: `status.measurement.buffer_available.SMUX` is 2 once both the
//!   source-value and reading buffers are filled
//!
//! Buffer indices are 1-based, exactly as the instrument defines them.

use crate::error::{KeithleyError, Result};

/// Buffer-availability status reported once both sweep buffers are filled.
pub const BUFFERS_READY: i64 = 2;

/// Separator used by `printbuffer` between values.
pub const TABLE_SEPARATOR: &str = ", ";

/// Format a value the way C `printf("%.6e")` does.
///
/// Six mantissa decimals and a signed exponent of at least two digits:
/// `1e-3` becomes `"1.000000e-03"`, `-2.5` becomes `"-2.500000e+00"`.
#[must_use]
pub fn format_exp(value: f64) -> String {
    format_exp_with(value, 6)
}

/// `printf("%.*e")` with an explicit mantissa precision.
///
/// The instrument itself prints readings with five decimals.
#[must_use]
pub fn format_exp_with(value: f64, precision: usize) -> String {
    if value.is_nan() {
        return "nan".to_string();
    }
    if value.is_infinite() {
        return if value > 0.0 { "inf" } else { "-inf" }.to_string();
    }

    // Rust renders "1.000000e-3"; only the exponent needs reshaping.
    let formatted = format!("{:.*e}", precision, value);
    match formatted.split_once('e') {
        Some((mantissa, exponent)) => {
            let exponent: i32 = exponent.parse().unwrap_or_default();
            let sign = if exponent < 0 { '-' } else { '+' };
            format!("{}e{}{:02}", mantissa, sign, exponent.abs())
        }
        None => formatted,
    }
}

/// Parse a single-line numeric reply.
pub fn parse_number(reply: &str) -> Result<f64> {
    let trimmed = reply.trim();
    if trimmed.is_empty() {
        return Err(KeithleyError::parse(reply, "empty reply"));
    }
    trimmed
        .parse::<f64>()
        .map_err(|e| KeithleyError::parse(reply, e.to_string()))
}

/// Parse a numeric status reply, truncated toward zero.
///
/// The instrument prints status codes as floats ("2.00000e+00").
pub fn parse_status(reply: &str) -> Result<i64> {
    let value = parse_number(reply)?;
    if !value.is_finite() {
        return Err(KeithleyError::parse(reply, "status is not finite"));
    }
    Ok(value.trunc() as i64)
}

/// Parse a `printbuffer` reply into an ordered sequence.
///
/// # Example
/// ```
/// use daq_driver_keithley::tsp::parse_table;
///
/// let values = parse_table("1.000000e+00, 2.000000e+00, 3.000000e+00")?;
/// assert_eq!(values, vec![1.0, 2.0, 3.0]);
/// # Ok::<(), daq_driver_keithley::KeithleyError>(())
/// ```
pub fn parse_table(reply: &str) -> Result<Vec<f64>> {
    reply
        .trim_end_matches(['\r', '\n'])
        .split(TABLE_SEPARATOR)
        .map(|token| {
            token.trim().parse::<f64>().map_err(|_| {
                KeithleyError::parse(reply, format!("non-numeric table entry '{}'", token))
            })
        })
        .collect()
}

/// Parse a two-value reply such as the output of `smua.measure.iv()`.
pub fn parse_pair(reply: &str) -> Result<(f64, f64)> {
    let mut tokens = reply.split_whitespace();
    match (tokens.next(), tokens.next(), tokens.next()) {
        (Some(first), Some(second), None) => Ok((parse_number(first)?, parse_number(second)?)),
        _ => Err(KeithleyError::parse(reply, "expected exactly two values")),
    }
}

/// Source function selected with `smuX.source.func`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceFunction {
    /// `smuX.OUTPUT_DCAMPS` (0)
    Current,
    /// `smuX.OUTPUT_DCVOLTS` (1)
    Voltage,
}

impl SourceFunction {
    /// Numeric code written to `smuX.source.func`.
    #[must_use]
    pub fn code(self) -> u8 {
        match self {
            SourceFunction::Current => 0,
            SourceFunction::Voltage => 1,
        }
    }
}

/// Output state written to `smuX.source.output`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// Output off (0)
    Off,
    /// Output on (1)
    On,
    /// Output off in high-impedance mode (2)
    HighImpedance,
}

impl OutputMode {
    /// Numeric code written to `smuX.source.output`.
    #[must_use]
    pub fn code(self) -> u8 {
        match self {
            OutputMode::Off => 0,
            OutputMode::On => 1,
            OutputMode::HighImpedance => 2,
        }
    }
}

/// Command builder for one SMU (`smua`, `smub`, ...).
///
/// Every TSP statement sent by the drivers is produced here so the exact wire
/// text lives in a single place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Smu {
    name: String,
}

impl Smu {
    /// Build the SMU addressed by a channel letter ("A" -> `smua`).
    pub fn from_channel(channel: &str) -> Result<Self> {
        let mut chars = channel.chars();
        match (chars.next(), chars.next()) {
            (Some(letter), None) if letter.is_ascii_alphabetic() => Ok(Self {
                name: format!("smu{}", letter.to_ascii_lowercase()),
            }),
            _ => Err(KeithleyError::InvalidChannel(channel.to_string())),
        }
    }

    /// TSP name of the SMU, e.g. `smua`.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn autorange_current(&self) -> String {
        format!("{0}.measure.autorangei = {0}.AUTORANGE_ON", self.name)
    }

    pub fn autorange_voltage(&self) -> String {
        format!("{0}.measure.autorangev = {0}.AUTORANGE_ON", self.name)
    }

    pub fn query_current_limit(&self) -> String {
        format!("print({}.source.limiti)", self.name)
    }

    pub fn set_current_limit(&self, amps: f64) -> String {
        format!("{}.source.limiti = {}", self.name, format_exp(amps))
    }

    pub fn query_voltage_limit(&self) -> String {
        format!("print({}.source.limitv)", self.name)
    }

    pub fn set_voltage_limit(&self, volts: f64) -> String {
        format!("{}.source.limitv = {}", self.name, format_exp(volts))
    }

    pub fn measure_current(&self) -> String {
        format!("print({}.measure.i())", self.name)
    }

    pub fn measure_voltage(&self) -> String {
        format!("print({}.measure.v())", self.name)
    }

    pub fn measure_iv(&self) -> String {
        format!("print({}.measure.iv())", self.name)
    }

    pub fn source_function(&self, function: SourceFunction) -> String {
        format!("{}.source.func = {}", self.name, function.code())
    }

    pub fn output(&self, mode: OutputMode) -> String {
        format!("{}.source.output = {}", self.name, mode.code())
    }

    pub fn level(&self, function: SourceFunction, value: f64) -> String {
        let attribute = match function {
            SourceFunction::Current => "leveli",
            SourceFunction::Voltage => "levelv",
        };
        format!("{}.source.{} = {}", self.name, attribute, format_exp(value))
    }

    /// Trigger of the factory `SweepVLinMeasureI` script.
    pub fn sweep_v_lin_measure_i(
        &self,
        start: f64,
        stop: f64,
        stabilization_time: f64,
        points: u32,
    ) -> String {
        format!(
            "SweepVLinMeasureI({}, {}, {}, {}, {})",
            self.name,
            format_exp(start),
            format_exp(stop),
            format_exp(stabilization_time),
            points
        )
    }

    pub fn buffer_status(&self) -> String {
        format!(
            "print(status.measurement.buffer_available.{})",
            self.name.to_ascii_uppercase()
        )
    }

    pub fn dump_source_values(&self, points: u32) -> String {
        format!("printbuffer(1, {}, {}.nvbuffer1.sourcevalues)", points, self.name)
    }

    pub fn dump_readings(&self, points: u32) -> String {
        format!("printbuffer(1, {}, {}.nvbuffer1.readings)", points, self.name)
    }
}
