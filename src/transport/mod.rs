//! Instrument transports.
//!
//! A transport owns one open connection to an instrument addressed by a resource
//! identifier and moves ASCII lines across it. It knows nothing about TSP; the
//! controller and channel layers build and parse the command text.
//!
//! Backends:
//! - [`stream`]: any tokio byte stream; raw LAN sockets use it through
//!   [`stream::SocketTransport`]
//! - [`visa`]: the system VISA library (feature `instrument_visa`)
//! - [`simulator`]: in-process 2600-series model
//! - [`mock`]: scripted replies for protocol tests

use async_trait::async_trait;

use crate::config::{Backend, ConnectionConfig};
use crate::error::{KeithleyError, Result};

pub mod mock;
pub mod simulator;
pub mod stream;
pub mod visa;

pub use mock::MockTransport;
pub use simulator::SimulatedTransport;
pub use stream::{SocketTransport, StreamTransport};

/// Line-oriented connection to one instrument.
///
/// Callers serialise access; a transport never sees two interleaved
/// command/reply exchanges.
#[async_trait]
pub trait Transport: Send {
    /// Resource identifier this transport was opened on.
    fn resource(&self) -> &str;

    /// Send one command line. The terminator is appended by the transport.
    async fn write(&mut self, command: &str) -> Result<()>;

    /// Read one reply line with its terminator stripped.
    async fn read_line(&mut self) -> Result<String>;

    /// Release the underlying connection.
    async fn close(&mut self) -> Result<()>;

    /// Write a command and read exactly one reply line.
    async fn query(&mut self, command: &str) -> Result<String> {
        self.write(command).await?;
        self.read_line().await
    }
}

/// Open a transport for `config`, choosing the backend it names.
pub async fn open_transport(config: &ConnectionConfig) -> Result<Box<dyn Transport>> {
    if config.resource.is_empty() {
        return Err(KeithleyError::Config(
            "connection.resource is empty".to_string(),
        ));
    }

    let backend = config.resolved_backend();
    tracing::debug!(resource = %config.resource, ?backend, "Opening transport");

    let transport: Box<dyn Transport> = match backend {
        Backend::Simulated => Box::new(SimulatedTransport::new(&config.resource)),
        Backend::Socket => {
            Box::new(SocketTransport::connect(&config.resource, config.timeout()).await?)
        }
        Backend::Visa | Backend::Auto => {
            Box::new(visa::VisaTransport::open(&config.resource, config.timeout()).await?)
        }
    };
    Ok(transport)
}
