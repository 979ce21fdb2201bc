use super::{Channel, Link};
use crate::config::ConnectionConfig;
use crate::error::Result;
use crate::transport::{open_transport, Transport};
use tracing::instrument;

/// Connection to one 2600-series instrument.
///
/// Cheap to clone: clones share the same connection, which is how a second
/// plugin reuses the instrument opened by the first. Closing through any clone
/// closes it for all of them.
#[derive(Clone)]
pub struct Controller {
    resource: String,
    link: Link,
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("resource", &self.resource)
            .finish_non_exhaustive()
    }
}

impl Controller {
    /// Open the instrument named by `config` on the backend it selects.
    ///
    /// # Errors
    /// `Connection` if the resource cannot be opened, `FeatureNotEnabled` for a
    /// VISA resource in a build without VISA support.
    #[instrument(skip(config), fields(resource = %config.resource), err)]
    pub async fn open(config: &ConnectionConfig) -> Result<Self> {
        let transport = open_transport(config).await?;
        tracing::info!("Keithley 2600 controller opened on {}", config.resource);
        Ok(Self::from_boxed(transport))
    }

    /// Wrap an already open transport.
    pub fn from_transport<T: Transport + 'static>(transport: T) -> Self {
        Self::from_boxed(Box::new(transport))
    }

    /// Wrap an already open boxed transport.
    pub fn from_boxed(transport: Box<dyn Transport>) -> Self {
        Self {
            resource: transport.resource().to_string(),
            link: Link::new(transport),
        }
    }

    /// Resource identifier the connection was opened on.
    #[must_use]
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Whether the connection is still open.
    pub async fn is_open(&self) -> bool {
        self.link.is_open().await
    }

    /// Create a handle to SMU channel `name` ("A", "B", ...).
    ///
    /// With `autorange`, current and voltage measurement autorange are enabled
    /// immediately (no read-back).
    ///
    /// # Errors
    /// `InvalidChannel` unless `name` is a single ASCII letter.
    pub async fn create_channel(&self, name: &str, autorange: bool) -> Result<Channel> {
        let channel = Channel::new(name, self.link.clone())?;
        if autorange {
            channel.autorange().await?;
        }
        tracing::debug!("Created channel {} on {}", channel.name(), self.resource);
        Ok(channel)
    }

    /// Release the connection.
    ///
    /// # Errors
    /// `NotConnected` if it was already closed.
    pub async fn close(&self) -> Result<()> {
        self.link.close().await?;
        tracing::info!("Keithley 2600 controller on {} closed", self.resource);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::KeithleyError;
    use crate::transport::MockTransport;

    #[tokio::test]
    async fn autorange_on_channel_creation() {
        let mock = MockTransport::new("MOCK::1");
        let controller = Controller::from_transport(mock.clone());

        controller.create_channel("A", true).await.unwrap();
        controller.create_channel("B", false).await.unwrap();

        assert_eq!(
            mock.commands().await,
            vec![
                "smua.measure.autorangei = smua.AUTORANGE_ON",
                "smua.measure.autorangev = smua.AUTORANGE_ON",
            ]
        );
    }

    #[tokio::test]
    async fn invalid_channel_name() {
        let controller = Controller::from_transport(MockTransport::new("MOCK::1"));
        let err = controller.create_channel("AB", true).await.unwrap_err();
        assert!(matches!(err, KeithleyError::InvalidChannel(name) if name == "AB"));
    }

    #[tokio::test]
    async fn close_twice_is_not_connected() {
        let mock = MockTransport::new("MOCK::1");
        let controller = Controller::from_transport(mock.clone());
        assert!(controller.is_open().await);
        assert_eq!(controller.resource(), "MOCK::1");

        controller.close().await.unwrap();
        assert!(mock.is_closed().await);
        assert!(!controller.is_open().await);
        assert!(matches!(
            controller.close().await,
            Err(KeithleyError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn clones_share_the_connection() {
        let controller = Controller::from_transport(MockTransport::new("MOCK::1"));
        let shared = controller.clone();
        let channel = shared.create_channel("A", false).await.unwrap();

        controller.close().await.unwrap();
        assert!(!shared.is_open().await);
        assert!(matches!(
            channel.off(false).await,
            Err(KeithleyError::NotConnected)
        ));
    }
}
