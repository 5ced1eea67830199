use super::ToolkitSettings;
use crate::{Result, ToolkitError};
use config::{Config, Environment};

impl ToolkitSettings {
    /// Load settings from `KAFKA_TOOLKIT_*` environment variables, e.g.
    /// `KAFKA_TOOLKIT_STARTUP_TIMEOUT_MS=120000`. Unset fields keep their
    /// defaults.
    pub fn from_env() -> Result<Self> {
        Self::from_source(Environment::with_prefix("KAFKA_TOOLKIT").try_parsing(true))
    }

    fn from_source(source: Environment) -> Result<Self> {
        let settings = Config::builder()
            .add_source(source)
            .build()
            .map_err(|e| ToolkitError::Settings(e.to_string()))?;

        let config = settings
            .try_deserialize::<ToolkitSettings>()
            .map_err(|e| ToolkitError::Settings(e.to_string()))?;

        config.validate().map_err(ToolkitError::Settings)?;
        Ok(config)
    }
}
