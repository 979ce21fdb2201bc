//! VISA transport (feature `instrument_visa`).
//!
//! Wraps `visa-rs`. VISA calls block, so every read and write runs on tokio's
//! blocking pool against a session held in `Arc<std::sync::Mutex<..>>`.
//!
//! Supports resource strings like:
//! - "USB0::0x05E6::0x2614::4103593::INSTR" (USB-TMC)
//! - "GPIB0::26::INSTR" (GPIB)
//! - "TCPIP0::192.168.1.50::inst0::INSTR" (VXI-11 / LXI)

#[cfg(feature = "instrument_visa")]
pub use enabled::{find_resources, VisaTransport};

#[cfg(not(feature = "instrument_visa"))]
pub use disabled::{find_resources, VisaTransport};

#[cfg(feature = "instrument_visa")]
mod enabled {
    use async_trait::async_trait;
    use std::ffi::CString;
    use std::io::{BufRead, BufReader, Write};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::time::timeout;
    use visa_rs::prelude::*;

    use crate::error::{KeithleyError, Result};
    use crate::transport::Transport;

    struct Session {
        // Dropping the resource manager closes every session it opened
        _rm: DefaultRM,
        reader: BufReader<Instrument>,
    }

    /// Transport over a VISA session.
    pub struct VisaTransport {
        resource: String,
        session: Option<Arc<Mutex<Session>>>,
        timeout: Duration,
        last_command: String,
    }

    fn visa_string(resource: &str) -> Result<VisaString> {
        let c_string = CString::new(resource)
            .map_err(|e| KeithleyError::connection(resource, format!("invalid resource: {}", e)))?;
        Ok(c_string.into())
    }

    impl VisaTransport {
        /// Open `resource` through the default VISA resource manager.
        pub async fn open(resource: &str, reply_timeout: Duration) -> Result<Self> {
            let resource_owned = resource.to_string();
            let session = tokio::task::spawn_blocking(move || -> Result<Session> {
                let rm = DefaultRM::new().map_err(|e| {
                    KeithleyError::connection(&resource_owned, format!("VISA unavailable: {:?}", e))
                })?;
                let name = visa_string(&resource_owned)?;
                let instrument = rm
                    .open(&name, AccessMode::NO_LOCK, reply_timeout)
                    .map_err(|e| KeithleyError::connection(&resource_owned, format!("{:?}", e)))?;
                Ok(Session {
                    _rm: rm,
                    reader: BufReader::new(instrument),
                })
            })
            .await
            .map_err(|e| KeithleyError::connection(resource, format!("VISA open task failed: {}", e)))??;

            tracing::info!("Opened VISA resource {}", resource);
            Ok(Self {
                resource: resource.to_string(),
                session: Some(Arc::new(Mutex::new(session))),
                timeout: reply_timeout,
                last_command: String::new(),
            })
        }

        fn session(&self) -> Result<Arc<Mutex<Session>>> {
            self.session.clone().ok_or(KeithleyError::NotConnected)
        }

        /// Run a blocking operation on the session within the reply timeout.
        async fn blocking<T, F>(&self, op: F) -> Result<T>
        where
            T: Send + 'static,
            F: FnOnce(&mut Session) -> std::io::Result<T> + Send + 'static,
        {
            let session = self.session()?;
            let task = tokio::task::spawn_blocking(move || {
                let mut guard = session
                    .lock()
                    .map_err(|_| std::io::Error::other("VISA session lock poisoned"))?;
                op(&mut guard)
            });

            match timeout(self.timeout, task).await {
                Ok(Ok(result)) => result.map_err(KeithleyError::from),
                Ok(Err(join)) => Err(KeithleyError::Io(std::io::Error::other(format!(
                    "VISA task failed: {}",
                    join
                )))),
                Err(_) => Err(KeithleyError::Timeout(self.last_command.clone())),
            }
        }
    }

    #[async_trait]
    impl Transport for VisaTransport {
        fn resource(&self) -> &str {
            &self.resource
        }

        async fn write(&mut self, command: &str) -> Result<()> {
            tracing::debug!("VISA write: {}", command);
            self.last_command = command.to_string();
            let line = format!("{}\n", command);
            self.blocking(move |session| {
                let instrument = session.reader.get_mut();
                instrument.write_all(line.as_bytes())?;
                instrument.flush()
            })
            .await
        }

        async fn read_line(&mut self) -> Result<String> {
            let line = self
                .blocking(|session| {
                    let mut line = String::new();
                    session.reader.read_line(&mut line)?;
                    Ok(line)
                })
                .await?;
            let line = line.trim_end_matches(['\r', '\n']).to_string();
            tracing::debug!("VISA reply: {}", line);
            Ok(line)
        }

        async fn close(&mut self) -> Result<()> {
            if self.session.take().is_some() {
                tracing::info!("Closed VISA resource {}", self.resource);
            }
            Ok(())
        }
    }

    /// Enumerate every resource the VISA library can see.
    pub async fn find_resources() -> Result<Vec<String>> {
        tokio::task::spawn_blocking(|| -> Result<Vec<String>> {
            let rm = DefaultRM::new()
                .map_err(|e| KeithleyError::connection("VISA", format!("{:?}", e)))?;
            let expr = visa_string("?*INSTR")?;
            let mut list = match rm.find_res_list(&expr) {
                Ok(list) => list,
                // VI_ERROR_RSRC_NFOUND: nothing attached
                Err(e) => {
                    tracing::debug!("VISA resource search found nothing: {:?}", e);
                    return Ok(Vec::new());
                }
            };

            let mut resources = Vec::new();
            while let Ok(Some(name)) = list.find_next() {
                resources.push(name.to_string());
            }
            Ok(resources)
        })
        .await
        .map_err(|e| KeithleyError::Io(std::io::Error::other(e.to_string())))?
    }
}

#[cfg(not(feature = "instrument_visa"))]
mod disabled {
    use async_trait::async_trait;
    use std::time::Duration;

    use crate::error::{KeithleyError, Result};
    use crate::transport::Transport;

    const FEATURE: &str = "instrument_visa";

    /// Placeholder when VISA support is compiled out; `open` always fails.
    pub struct VisaTransport {
        resource: String,
    }

    impl VisaTransport {
        /// Always fails with `FeatureNotEnabled`.
        pub async fn open(resource: &str, _timeout: Duration) -> Result<Self> {
            tracing::warn!(
                "Cannot open {}: VISA support not enabled. Rebuild with --features {}",
                resource,
                FEATURE
            );
            Err(KeithleyError::FeatureNotEnabled(FEATURE.to_string()))
        }
    }

    #[async_trait]
    impl Transport for VisaTransport {
        fn resource(&self) -> &str {
            &self.resource
        }

        async fn write(&mut self, _command: &str) -> Result<()> {
            Err(KeithleyError::FeatureNotEnabled(FEATURE.to_string()))
        }

        async fn read_line(&mut self) -> Result<String> {
            Err(KeithleyError::FeatureNotEnabled(FEATURE.to_string()))
        }

        async fn close(&mut self) -> Result<()> {
            Ok(())
        }
    }

    /// No VISA library: nothing to enumerate.
    pub async fn find_resources() -> Result<Vec<String>> {
        Ok(Vec::new())
    }
}
