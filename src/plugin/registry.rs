//! Plugin factories and registry.
//!
//! Plugins are registered at startup with explicit
//! `registry.register_factory(Box::new(..))` calls and built from TOML tables:
//!
//! ```toml
//! [connection]
//! resource = "USB0::0x05E6::0x2614::4103593::INSTR"
//! channel = "A"
//! points = 201
//! ```

use anyhow::{anyhow, Context, Result};
use futures::future::BoxFuture;
use std::collections::BTreeMap;

use super::{Actuator, Detector, SourceActuator, SweepViewer};
use crate::config::{SourceSettings, SweepSettings};

/// Host role a plugin plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginKind {
    /// Acquires data (1D viewer)
    Detector,
    /// Has a settable position
    Actuator,
}

/// A built plugin, not yet initialised.
pub enum Plugin {
    /// Detector plugin
    Detector(Box<dyn Detector>),
    /// Actuator plugin
    Actuator(Box<dyn Actuator>),
}

impl Plugin {
    /// Role of this plugin.
    #[must_use]
    pub fn kind(&self) -> PluginKind {
        match self {
            Plugin::Detector(_) => PluginKind::Detector,
            Plugin::Actuator(_) => PluginKind::Actuator,
        }
    }
}

impl std::fmt::Debug for Plugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Plugin::{:?}", self.kind())
    }
}

/// Builds one plugin type from a TOML table.
pub trait PluginFactory: Send + Sync + 'static {
    /// Type name used in configuration.
    fn plugin_type(&self) -> &'static str;

    /// Human-readable name for listings and error messages.
    fn name(&self) -> &'static str;

    /// Role of the plugins this factory builds.
    fn kind(&self) -> PluginKind;

    /// Validate configuration without touching hardware.
    fn validate(&self, config: &toml::Value) -> Result<()>;

    /// Build the plugin. Hardware is opened later, by `initialize`.
    fn build(&self, config: toml::Value) -> BoxFuture<'static, Result<Plugin>>;
}

/// Factory for [`SweepViewer`].
pub struct SweepViewerFactory;

impl PluginFactory for SweepViewerFactory {
    fn plugin_type(&self) -> &'static str {
        "keithley2600_sweep"
    }

    fn name(&self) -> &'static str {
        "Keithley 2600 I-V Sweep Viewer"
    }

    fn kind(&self) -> PluginKind {
        PluginKind::Detector
    }

    fn validate(&self, config: &toml::Value) -> Result<()> {
        let settings: SweepSettings = config.clone().try_into()?;
        settings.validate().map_err(|e| anyhow!(e))
    }

    fn build(&self, config: toml::Value) -> BoxFuture<'static, Result<Plugin>> {
        Box::pin(async move {
            let settings: SweepSettings = config
                .try_into()
                .context("Invalid Keithley 2600 sweep config")?;
            Ok(Plugin::Detector(Box::new(SweepViewer::new(settings))))
        })
    }
}

/// Factory for [`SourceActuator`].
pub struct SourceActuatorFactory;

impl PluginFactory for SourceActuatorFactory {
    fn plugin_type(&self) -> &'static str {
        "keithley2600_source"
    }

    fn name(&self) -> &'static str {
        "Keithley 2600 Source Actuator"
    }

    fn kind(&self) -> PluginKind {
        PluginKind::Actuator
    }

    fn validate(&self, config: &toml::Value) -> Result<()> {
        let settings: SourceSettings = config.clone().try_into()?;
        settings.validate().map_err(|e| anyhow!(e))
    }

    fn build(&self, config: toml::Value) -> BoxFuture<'static, Result<Plugin>> {
        Box::pin(async move {
            let settings: SourceSettings = config
                .try_into()
                .context("Invalid Keithley 2600 source config")?;
            Ok(Plugin::Actuator(Box::new(SourceActuator::new(settings))))
        })
    }
}

/// Maps plugin type names to factories.
#[derive(Default)]
pub struct PluginRegistry {
    factories: BTreeMap<&'static str, Box<dyn PluginFactory>>,
}

impl PluginRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the sweep viewer and source actuator registered.
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register_factory(Box::new(SweepViewerFactory));
        registry.register_factory(Box::new(SourceActuatorFactory));
        registry
    }

    /// Register a factory, replacing any previous one of the same type.
    pub fn register_factory(&mut self, factory: Box<dyn PluginFactory>) {
        tracing::debug!("Registered plugin factory '{}'", factory.plugin_type());
        self.factories.insert(factory.plugin_type(), factory);
    }

    /// Registered type names, sorted.
    pub fn plugin_types(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.factories.keys().copied()
    }

    /// Factory for `plugin_type`.
    #[must_use]
    pub fn factory(&self, plugin_type: &str) -> Option<&dyn PluginFactory> {
        self.factories.get(plugin_type).map(|f| f.as_ref())
    }

    /// Validate then build a plugin of `plugin_type`.
    pub async fn build(&self, plugin_type: &str, config: toml::Value) -> Result<Plugin> {
        let factory = self
            .factory(plugin_type)
            .ok_or_else(|| anyhow!("Unknown plugin type '{}'", plugin_type))?;
        factory
            .validate(&config)
            .with_context(|| format!("Invalid configuration for '{}'", plugin_type))?;
        factory.build(config).await
    }

    /// Build a plugin that must be a detector.
    pub async fn build_detector(
        &self,
        plugin_type: &str,
        config: toml::Value,
    ) -> Result<Box<dyn Detector>> {
        match self.build(plugin_type, config).await? {
            Plugin::Detector(detector) => Ok(detector),
            other => Err(anyhow!("'{}' is not a detector ({:?})", plugin_type, other)),
        }
    }

    /// Build a plugin that must be an actuator.
    pub async fn build_actuator(
        &self,
        plugin_type: &str,
        config: toml::Value,
    ) -> Result<Box<dyn Actuator>> {
        match self.build(plugin_type, config).await? {
            Plugin::Actuator(actuator) => Ok(actuator),
            other => Err(anyhow!("'{}' is not an actuator ({:?})", plugin_type, other)),
        }
    }
}
