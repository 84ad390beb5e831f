//! Environment-based settings loading
//!
//! Settings structs live next to the components they configure; this module
//! only provides the loading mechanism. `.env` files are honored in
//! development via dotenvy.

use serde::de::DeserializeOwned;
use thiserror::Error;

/// Errors loading settings from the environment
#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

/// Load a settings struct from environment variables with the given prefix.
///
/// `CONFLUX_ASYNC_POOL_SIZE=4` maps onto a field `async_pool_size` when the
/// prefix is `CONFLUX`. Unset fields fall back to the struct's serde
/// defaults.
pub fn load_settings<T: DeserializeOwned>(prefix: &str) -> Result<T, SettingsError> {
    // Best effort: absence of a .env file is not an error.
    dotenvy::dotenv().ok();

    let loaded = config::Config::builder()
        .add_source(
            config::Environment::with_prefix(prefix)
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    Ok(loaded.try_deserialize()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    struct DemoSettings {
        #[serde(default = "default_pool")]
        pool_size: usize,
    }

    fn default_pool() -> usize {
        10
    }

    #[test]
    fn test_defaults_when_unset() {
        let settings: DemoSettings = load_settings("CONFLUX_TEST_NOPREFIX").unwrap();
        assert_eq!(settings.pool_size, 10);
    }

    #[test]
    fn test_env_override() {
        std::env::set_var("CONFLUX_DEMO_POOL_SIZE", "3");
        let settings: DemoSettings = load_settings("CONFLUX_DEMO").unwrap();
        assert_eq!(settings.pool_size, 3);
        std::env::remove_var("CONFLUX_DEMO_POOL_SIZE");
    }
}
