//! CLI Entry Point for keithley-daq
//!
//! Command-line access to a Keithley 2600 sourcemeter:
//! - List VISA resources
//! - Take a single reading
//! - Source a voltage or current (or switch the output off)
//! - Run an I-V sweep and print it as CSV or JSON
//!
//! Settings come from `config/keithley.toml` (or `--config`), environment
//! variables prefixed with `KEITHLEY_`, then command-line flags.
//!
//! # Usage
//!
//! ```bash
//! keithley-daq list
//! keithley-daq --resource SIM::2614B sweep --start 0 --stop 2 --points 21
//! keithley-daq --resource TCPIP0::192.168.1.50::5025::SOCKET source --type Current --value 1e-3
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use daq_driver_keithley::config::{AppConfig, Backend, ConnectionConfig, DEFAULT_CONFIG_PATH};
use daq_driver_keithley::keithley2600::{Controller, SourceMode, SweepResult};
use daq_driver_keithley::{discovery, logging};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "keithley-daq")]
#[command(about = "Keithley 2600 sourcemeter control", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Resource identifier (overrides the configuration)
    #[arg(long, global = true)]
    resource: Option<String>,

    /// Transport backend (overrides the configuration)
    #[arg(long, global = true, value_enum)]
    backend: Option<BackendArg>,

    /// Reply timeout in milliseconds (overrides the configuration)
    #[arg(long, global = true)]
    timeout_ms: Option<u64>,

    /// Log level (overrides the configuration)
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List VISA resources, USB first
    List,

    /// Take one reading
    Measure {
        /// SMU channel letter
        #[arg(long, default_value = "A")]
        channel: String,

        /// Quantity to measure
        #[arg(long, value_enum, default_value_t = Quantity::Current)]
        quantity: Quantity,
    },

    /// Source a voltage or current, or switch the output off
    Source {
        /// SMU channel letter
        #[arg(long)]
        channel: Option<String>,

        /// Voltage or Current
        #[arg(long = "type")]
        source_type: Option<String>,

        /// Setpoint in V or A
        #[arg(long, required_unless_present = "off", allow_negative_numbers = true)]
        value: Option<f64>,

        /// Switch the output off instead of sourcing
        #[arg(long, conflicts_with = "value")]
        off: bool,

        /// With --off, leave the output in high-impedance mode
        #[arg(long, requires = "off")]
        high_z: bool,
    },

    /// Run a linear voltage sweep and print the I-V curve
    Sweep {
        /// SMU channel letter
        #[arg(long)]
        channel: Option<String>,

        /// Start voltage (V)
        #[arg(long, allow_negative_numbers = true)]
        start: Option<f64>,

        /// Stop voltage (V)
        #[arg(long, allow_negative_numbers = true)]
        stop: Option<f64>,

        /// Stabilization time per point (s)
        #[arg(long)]
        stime: Option<f64>,

        /// Number of points
        #[arg(long)]
        points: Option<u32>,

        /// Current limit (A)
        #[arg(long)]
        ilimit: Option<f64>,

        /// Output format
        #[arg(long, value_enum, default_value_t = OutputFormat::Csv)]
        format: OutputFormat,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum BackendArg {
    Auto,
    Visa,
    Socket,
    Simulated,
}

impl From<BackendArg> for Backend {
    fn from(arg: BackendArg) -> Self {
        match arg {
            BackendArg::Auto => Backend::Auto,
            BackendArg::Visa => Backend::Visa,
            BackendArg::Socket => Backend::Socket,
            BackendArg::Simulated => Backend::Simulated,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum Quantity {
    Current,
    Voltage,
    Both,
}

#[derive(Clone, Copy, ValueEnum)]
enum OutputFormat {
    Csv,
    Json,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = AppConfig::load_from(&cli.config)
        .with_context(|| format!("Failed to load {}", cli.config.display()))?;
    if let Some(level) = &cli.log_level {
        config.application.log_level = level.clone();
    }
    config.validate().map_err(anyhow::Error::msg)?;
    logging::init_from_config(&config).map_err(anyhow::Error::msg)?;

    match &cli.command {
        Commands::List => list().await,
        Commands::Measure { channel, quantity } => measure(&cli, &config, channel, *quantity).await,
        Commands::Source {
            channel,
            source_type,
            value,
            off,
            high_z,
        } => {
            let settings = config.source.clone().unwrap_or_default();
            let channel = channel.clone().unwrap_or(settings.channel);
            let controller = open(&cli, settings.connection).await?;
            let result = if *off {
                source_off(&controller, &channel, *high_z).await
            } else {
                let source_type = source_type.clone().unwrap_or(settings.source_type);
                source(&controller, &channel, &source_type, value.unwrap_or_default()).await
            };
            controller.close().await?;
            result
        }
        Commands::Sweep {
            channel,
            start,
            stop,
            stime,
            points,
            ilimit,
            format,
        } => {
            let mut settings = config.sweep.clone().unwrap_or_default();
            if let Some(channel) = channel {
                settings.channel = channel.clone();
            }
            settings.start_v = start.unwrap_or(settings.start_v);
            settings.stop_v = stop.unwrap_or(settings.stop_v);
            settings.stabilization_s = stime.unwrap_or(settings.stabilization_s);
            settings.points = points.unwrap_or(settings.points);
            settings.current_limit_a = ilimit.unwrap_or(settings.current_limit_a);
            settings.validate().map_err(anyhow::Error::msg)?;

            let controller = open(&cli, settings.connection.clone()).await?;
            let channel = controller
                .create_channel(&settings.channel, settings.autorange)
                .await?;
            channel.set_current_limit(settings.current_limit_a).await?;
            let sweep = channel
                .sweep_voltage_measure_current(
                    settings.start_v,
                    settings.stop_v,
                    settings.stabilization_s,
                    settings.points,
                )
                .await
                .context("Sweep failed");
            controller.close().await?;
            print_sweep(&sweep?, *format)
        }
    }
}

/// Apply command-line overrides and open the controller.
async fn open(cli: &Cli, mut connection: ConnectionConfig) -> Result<Controller> {
    if let Some(resource) = &cli.resource {
        connection.resource = resource.clone();
    }
    if let Some(backend) = cli.backend {
        connection.backend = backend.into();
    }
    if let Some(timeout_ms) = cli.timeout_ms {
        connection.timeout_ms = timeout_ms;
    }
    if connection.resource.is_empty() {
        connection.resource = discovery::default_resource()
            .await?
            .context("No resource given and none discovered; use --resource")?;
    }

    Controller::open(&connection)
        .await
        .with_context(|| format!("Failed to open {}", connection.resource))
}

async fn list() -> Result<()> {
    let resources = discovery::list_resources().await?;
    if resources.is_empty() {
        eprintln!("No VISA resources found");
    }
    for resource in resources {
        println!("{}", resource);
    }
    Ok(())
}

async fn measure(cli: &Cli, config: &AppConfig, channel: &str, quantity: Quantity) -> Result<()> {
    let connection = config
        .sweep
        .as_ref()
        .map(|s| s.connection.clone())
        .unwrap_or_default();
    let controller = open(cli, connection).await?;
    let smu = controller.create_channel(channel, true).await?;

    let result = match quantity {
        Quantity::Current => smu.measure_current().await.map(|i| println!("{:e} A", i)),
        Quantity::Voltage => smu.measure_voltage().await.map(|v| println!("{:e} V", v)),
        Quantity::Both => smu
            .measure_iv()
            .await
            .map(|(i, v)| println!("{:e} A\t{:e} V", i, v)),
    };
    controller.close().await?;
    Ok(result?)
}

async fn source(controller: &Controller, channel: &str, source_type: &str, value: f64) -> Result<()> {
    let mode: SourceMode = source_type.parse()?;
    let smu = controller.create_channel(channel, true).await?;
    smu.source_mode(mode, value).await?;
    eprintln!("{} {}: sourcing {} {}", controller.resource(), smu.smu_name(), value, mode.unit());
    Ok(())
}

async fn source_off(controller: &Controller, channel: &str, high_z: bool) -> Result<()> {
    let smu = controller.create_channel(channel, false).await?;
    smu.off(high_z).await?;
    eprintln!("{} {}: output off", controller.resource(), smu.smu_name());
    Ok(())
}

fn print_sweep(sweep: &SweepResult, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Csv => {
            println!("voltage_v,current_a");
            for (v, i) in sweep.points() {
                println!("{:e},{:e}", v, i);
            }
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(sweep)?);
        }
    }
    Ok(())
}
