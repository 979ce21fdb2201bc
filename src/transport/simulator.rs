//! In-process model of a 2600-series sourcemeter.
//!
//! Interprets the subset of TSP the drivers emit and answers `print` and
//! `printbuffer` queries the way the instrument does. Each SMU drives a purely
//! resistive load (1 kΩ unless configured), with source compliance applied.
//!
//! Resources starting with `SIM` select this backend, e.g. `SIM::2614B`.

use async_trait::async_trait;
use std::collections::{BTreeMap, VecDeque};

use super::Transport;
use crate::error::{KeithleyError, Result};
use crate::tsp::{format_exp_with, BUFFERS_READY, TABLE_SEPARATOR};

/// Default load resistance in ohms.
pub const DEFAULT_LOAD_OHMS: f64 = 1_000.0;

const REPLY_PRECISION: usize = 5;
const IDN: &str = "Keithley Instruments Inc., Model 2614B, SIMULATED, 4.0.0";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Function {
    Amps,
    Volts,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Output {
    Off,
    On,
    HighZ,
}

/// State of one simulated SMU.
#[derive(Debug, Clone)]
pub struct SmuState {
    autorange_i: bool,
    autorange_v: bool,
    limit_i: f64,
    limit_v: f64,
    function: Function,
    output: Output,
    level_i: f64,
    level_v: f64,
    source_values: Vec<f64>,
    readings: Vec<f64>,
    buffer_available: i64,
}

impl Default for SmuState {
    fn default() -> Self {
        // Reset values of a 2614B channel
        Self {
            autorange_i: false,
            autorange_v: false,
            limit_i: 0.1,
            limit_v: 20.0,
            function: Function::Volts,
            output: Output::Off,
            level_i: 0.0,
            level_v: 0.0,
            source_values: Vec::new(),
            readings: Vec::new(),
            buffer_available: 0,
        }
    }
}

impl SmuState {
    /// Whether both measurement autoranges are enabled.
    #[must_use]
    pub fn autorange(&self) -> bool {
        self.autorange_i && self.autorange_v
    }

    /// Whether the output relay is on.
    #[must_use]
    pub fn output_on(&self) -> bool {
        self.output == Output::On
    }

    /// Whether the output was last turned off in high-impedance mode.
    #[must_use]
    pub fn high_impedance(&self) -> bool {
        self.output == Output::HighZ
    }

    /// Programmed current compliance.
    #[must_use]
    pub fn current_limit(&self) -> f64 {
        self.limit_i
    }

    /// (current, voltage) at the terminals for the given load.
    fn terminals(&self, load_ohms: f64) -> (f64, f64) {
        if self.output != Output::On {
            return (0.0, 0.0);
        }
        match self.function {
            Function::Volts => {
                let current = (self.level_v / load_ohms).clamp(-self.limit_i, self.limit_i);
                (current, current * load_ohms)
            }
            Function::Amps => {
                let voltage = (self.level_i * load_ohms).clamp(-self.limit_v, self.limit_v);
                (voltage / load_ohms, voltage)
            }
        }
    }
}

/// TSP interpreter behind [`SimulatedTransport`].
#[derive(Debug, Clone)]
pub struct SimulatedInstrument {
    load_ohms: f64,
    smus: BTreeMap<String, SmuState>,
}

impl Default for SimulatedInstrument {
    fn default() -> Self {
        Self::new(DEFAULT_LOAD_OHMS)
    }
}

impl SimulatedInstrument {
    /// Instrument with two channels driving `load_ohms`.
    #[must_use]
    pub fn new(load_ohms: f64) -> Self {
        let mut smus = BTreeMap::new();
        smus.insert("smua".to_string(), SmuState::default());
        smus.insert("smub".to_string(), SmuState::default());
        Self { load_ohms, smus }
    }

    /// State of one SMU (`"smua"`, `"smub"`).
    #[must_use]
    pub fn smu(&self, name: &str) -> Option<&SmuState> {
        self.smus.get(name)
    }

    /// Execute one TSP line. Returns the printed reply, if the line prints one.
    pub fn execute(&mut self, line: &str) -> Option<String> {
        let line = line.trim();

        if line == "*IDN?" {
            return Some(IDN.to_string());
        }
        if let Some(args) = call_args(line, "printbuffer") {
            return self.print_buffer(&args);
        }
        if let Some(args) = call_args(line, "SweepVLinMeasureI") {
            self.sweep_v_lin_measure_i(&args);
            return None;
        }
        if let Some(expr) = call_args(line, "print") {
            return self.print(expr.trim());
        }
        if let Some((target, value)) = line.split_once('=') {
            self.assign(target.trim(), value.trim());
            return None;
        }

        tracing::warn!("Simulator ignoring unrecognised statement: {}", line);
        None
    }

    fn print(&mut self, expr: &str) -> Option<String> {
        if let Some(smu) = expr.strip_prefix("status.measurement.buffer_available.") {
            let state = self.smus.get(&smu.to_ascii_lowercase())?;
            return Some(number(state.buffer_available as f64));
        }

        let (smu, attribute) = expr.split_once('.')?;
        let load = self.load_ohms;
        let state = self.smus.get(smu)?;
        match attribute {
            "source.limiti" => Some(number(state.limit_i)),
            "source.limitv" => Some(number(state.limit_v)),
            "source.leveli" => Some(number(state.level_i)),
            "source.levelv" => Some(number(state.level_v)),
            "measure.i()" => Some(number(state.terminals(load).0)),
            "measure.v()" => Some(number(state.terminals(load).1)),
            "measure.iv()" => {
                let (i, v) = state.terminals(load);
                Some(format!("{}\t{}", number(i), number(v)))
            }
            _ => {
                tracing::warn!("Simulator cannot print '{}'", expr);
                None
            }
        }
    }

    fn assign(&mut self, target: &str, value: &str) {
        let Some((smu, attribute)) = target.split_once('.') else {
            tracing::warn!("Simulator ignoring assignment to '{}'", target);
            return;
        };
        let Some(state) = self.smus.get_mut(smu) else {
            tracing::warn!("Simulator has no SMU named '{}'", smu);
            return;
        };

        let autorange_on = value.ends_with(".AUTORANGE_ON") || value == "1";
        let numeric = value.parse::<f64>().ok();

        match (attribute, numeric) {
            ("measure.autorangei", _) => state.autorange_i = autorange_on,
            ("measure.autorangev", _) => state.autorange_v = autorange_on,
            ("source.limiti", Some(v)) => state.limit_i = v.abs(),
            ("source.limitv", Some(v)) => state.limit_v = v.abs(),
            ("source.leveli", Some(v)) => state.level_i = v,
            ("source.levelv", Some(v)) => state.level_v = v,
            ("source.func", Some(v)) => {
                state.function = if v == 0.0 {
                    Function::Amps
                } else {
                    Function::Volts
                }
            }
            ("source.output", Some(v)) => {
                state.output = match v as i64 {
                    1 => Output::On,
                    2 => Output::HighZ,
                    _ => Output::Off,
                }
            }
            _ => tracing::warn!("Simulator ignoring '{} = {}'", target, value),
        }
    }

    fn sweep_v_lin_measure_i(&mut self, args: &str) {
        let parts: Vec<&str> = args.split(',').map(str::trim).collect();
        let [smu, start, stop, _settle, points] = parts.as_slice() else {
            tracing::warn!("SweepVLinMeasureI expects 5 arguments, got '{}'", args);
            return;
        };
        let load = self.load_ohms;
        let Some(state) = self.smus.get_mut(*smu) else {
            return;
        };

        let parsed = (
            start.parse::<f64>(),
            stop.parse::<f64>(),
            points.parse::<i64>(),
        );
        let (Ok(start), Ok(stop), Ok(points)) = parsed else {
            state.buffer_available = 0;
            return;
        };

        state.source_values.clear();
        state.readings.clear();
        // The factory script needs more than two points
        if points < 3 {
            state.buffer_available = 0;
            return;
        }

        let step = (stop - start) / (points - 1) as f64;
        state.function = Function::Volts;
        state.output = Output::On;
        for n in 0..points {
            state.level_v = start + step * n as f64;
            let (current, _) = state.terminals(load);
            state.source_values.push(state.level_v);
            state.readings.push(current);
        }
        state.output = Output::Off;
        state.buffer_available = BUFFERS_READY;
    }

    fn print_buffer(&self, args: &str) -> Option<String> {
        let parts: Vec<&str> = args.split(',').map(str::trim).collect();
        let [first, last, buffer] = parts.as_slice() else {
            return None;
        };
        let first: usize = first.parse().ok()?;
        let last: usize = last.parse().ok()?;
        let (smu, field) = buffer.split_once(".nvbuffer1.")?;
        let state = self.smus.get(smu)?;
        let values = match field {
            "sourcevalues" => &state.source_values,
            "readings" => &state.readings,
            _ => return None,
        };

        // 1-based inclusive range, truncated to what the buffer holds
        let end = last.min(values.len());
        let start = first.max(1);
        if start > end {
            return Some(String::new());
        }
        Some(
            values[start - 1..end]
                .iter()
                .map(|v| number(*v))
                .collect::<Vec<_>>()
                .join(TABLE_SEPARATOR),
        )
    }
}

fn number(value: f64) -> String {
    format_exp_with(value, REPLY_PRECISION)
}

/// `name(args)` -> `args`
fn call_args<'a>(line: &'a str, name: &str) -> Option<&'a str> {
    line.strip_prefix(name)?
        .trim_start()
        .strip_prefix('(')?
        .strip_suffix(')')
}

/// Transport answering from a [`SimulatedInstrument`].
pub struct SimulatedTransport {
    resource: String,
    instrument: SimulatedInstrument,
    replies: VecDeque<String>,
    last_command: String,
    closed: bool,
}

impl SimulatedTransport {
    /// Simulated instrument with the default load.
    pub fn new(resource: impl Into<String>) -> Self {
        Self::with_instrument(resource, SimulatedInstrument::default())
    }

    /// Simulated transport around a prepared instrument model.
    pub fn with_instrument(resource: impl Into<String>, instrument: SimulatedInstrument) -> Self {
        let resource = resource.into();
        tracing::info!("Opened simulated instrument {}", resource);
        Self {
            resource,
            instrument,
            replies: VecDeque::new(),
            last_command: String::new(),
            closed: false,
        }
    }

    /// Instrument model, for inspection.
    #[must_use]
    pub fn instrument(&self) -> &SimulatedInstrument {
        &self.instrument
    }
}

#[async_trait]
impl Transport for SimulatedTransport {
    fn resource(&self) -> &str {
        &self.resource
    }

    async fn write(&mut self, command: &str) -> Result<()> {
        if self.closed {
            return Err(KeithleyError::NotConnected);
        }
        tracing::debug!("Simulated TSP write: {}", command);
        self.last_command = command.to_string();
        if let Some(reply) = self.instrument.execute(command) {
            self.replies.push_back(reply);
        }
        Ok(())
    }

    async fn read_line(&mut self) -> Result<String> {
        if self.closed {
            return Err(KeithleyError::NotConnected);
        }
        self.replies
            .pop_front()
            .ok_or_else(|| KeithleyError::Timeout(self.last_command.clone()))
    }

    async fn close(&mut self) -> Result<()> {
        self.closed = true;
        tracing::info!("Closed simulated instrument {}", self.resource);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tsp::{parse_number, parse_pair, parse_table};

    #[test]
    fn voltage_source_into_load() {
        let mut sim = SimulatedInstrument::default();
        sim.execute("smua.source.func = 1");
        sim.execute("smua.source.output = 1");
        sim.execute("smua.source.levelv = 2.000000e+00");

        let current = parse_number(&sim.execute("print(smua.measure.i())").unwrap()).unwrap();
        assert!((current - 2e-3).abs() < 1e-9);

        let (i, v) = parse_pair(&sim.execute("print(smua.measure.iv())").unwrap()).unwrap();
        assert!((i - 2e-3).abs() < 1e-9);
        assert!((v - 2.0).abs() < 1e-9);
    }

    #[test]
    fn current_compliance_clamps() {
        let mut sim = SimulatedInstrument::default();
        sim.execute("smua.source.limiti = 1.000000e-03");
        sim.execute("smua.source.func = 1");
        sim.execute("smua.source.output = 1");
        sim.execute("smua.source.levelv = 1.000000e+01");

        let current = parse_number(&sim.execute("print(smua.measure.i())").unwrap()).unwrap();
        assert!((current - 1e-3).abs() < 1e-9);
        assert_eq!(
            sim.execute("print(smua.source.limiti)").as_deref(),
            Some("1.00000e-03")
        );
    }

    #[test]
    fn output_off_reads_zero() {
        let mut sim = SimulatedInstrument::default();
        sim.execute("smua.source.levelv = 5.0");
        sim.execute("smua.source.output = 2");
        assert!(sim.smu("smua").unwrap().high_impedance());
        let current = parse_number(&sim.execute("print(smua.measure.i())").unwrap()).unwrap();
        assert_eq!(current, 0.0);
    }

    #[test]
    fn autorange_statements() {
        let mut sim = SimulatedInstrument::default();
        sim.execute("smub.measure.autorangei = smub.AUTORANGE_ON");
        assert!(!sim.smu("smub").unwrap().autorange());
        sim.execute("smub.measure.autorangev = smub.AUTORANGE_ON");
        assert!(sim.smu("smub").unwrap().autorange());
    }

    #[test]
    fn sweep_fills_both_buffers() {
        let mut sim = SimulatedInstrument::default();
        sim.execute("SweepVLinMeasureI(smua, 0.000000e+00, 1.000000e+00, 1.000000e-03, 11)");
        assert_eq!(
            sim.execute("print(status.measurement.buffer_available.SMUA)")
                .as_deref(),
            Some("2.00000e+00")
        );

        let voltages =
            parse_table(&sim.execute("printbuffer(1, 11, smua.nvbuffer1.sourcevalues)").unwrap())
                .unwrap();
        let currents =
            parse_table(&sim.execute("printbuffer(1, 11, smua.nvbuffer1.readings)").unwrap())
                .unwrap();
        assert_eq!(voltages.len(), 11);
        assert_eq!(currents.len(), 11);
        assert!((voltages[10] - 1.0).abs() < 1e-9);
        assert!((currents[5] - 0.5e-3).abs() < 1e-9);
        assert!(!sim.smu("smua").unwrap().output_on());
    }

    #[test]
    fn degenerate_sweep_reports_unavailable() {
        let mut sim = SimulatedInstrument::default();
        for points in [1, 2] {
            sim.execute(&format!(
                "SweepVLinMeasureI(smua, 0.000000e+00, 1.000000e+00, 1.000000e-03, {})",
                points
            ));
            assert_eq!(
                sim.execute("print(status.measurement.buffer_available.SMUA)")
                    .as_deref(),
                Some("0.00000e+00")
            );
        }

        sim.execute("SweepVLinMeasureI(smua, 0.000000e+00, 1.000000e+00, 1.000000e-03, 3)");
        assert_eq!(
            sim.execute("print(status.measurement.buffer_available.SMUA)")
                .as_deref(),
            Some("2.00000e+00")
        );
    }

    #[tokio::test]
    async fn unknown_query_times_out() {
        let mut transport = SimulatedTransport::new("SIM::1");
        let err = transport.query("print(smuz.measure.i())").await.unwrap_err();
        assert!(matches!(err, KeithleyError::Timeout(_)));
    }
}
