//! # Keithley 2600 Sourcemeter Drivers
//!
//! Drivers and acquisition plugins for Keithley 2600-series SMUs, talking the
//! instrument's ASCII TSP language over VISA, a raw LAN socket, or an in-process
//! simulator.
//!
//! ## Crate Structure
//!
//! - **`tsp`**: exact wire text. `%.6e` setpoint formatting, reply parsing, and
//!   builders for every TSP statement the drivers send.
//! - **`transport`**: line-oriented connections (`visa`, `stream`/socket,
//!   `simulator`, `mock`) behind the `Transport` trait.
//! - **`keithley2600`**: `Controller` (one per instrument) and `Channel` (one per
//!   SMU), including the linear voltage sweep.
//! - **`plugin`**: host lifecycle glue. A sweep detector and a source actuator,
//!   built by factories from TOML.
//! - **`discovery`**: ordered resource listing.
//! - **`config`**: Figment-based configuration (TOML file plus `KEITHLEY_` env).
//! - **`logging`**: `tracing-subscriber` initialisation.
//! - **`error`**: the `KeithleyError` enum.
//!
//! ## Feature Flags
//!
//! - `instrument_visa`: VISA transport and resource discovery through `visa-rs`.

pub mod config;
pub mod discovery;
pub mod error;
pub mod keithley2600;
pub mod logging;
pub mod plugin;
pub mod transport;
pub mod tsp;

pub use config::{AppConfig, Backend, ConnectionConfig, SourceSettings, SweepSettings};
pub use error::{KeithleyError, Result};
pub use keithley2600::{Channel, Controller, SourceMode, SweepResult};
pub use plugin::{Actuator, DataRecord, Detector, PluginRegistry};
