//! Configuration loader with environment variable expansion

use super::{Config, ConfigError};
use lazy_static::lazy_static;
use std::path::Path;

lazy_static! {
    // ${VAR} or ${VAR:-default}
    static ref ENV_VAR: regex_lite::Regex =
        regex_lite::Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}")
            .expect("environment variable pattern is valid");
}

/// Configuration loader
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from a file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse and validate configuration from a YAML string
    pub fn from_yaml(content: &str) -> Result<Config, ConfigError> {
        let expanded = Self::expand_env_vars(content);
        let config: Config = serde_yaml::from_str(&expanded)?;
        config.validate()?;
        Ok(config)
    }

    /// Expand environment variables in the format `${VAR}` or `${VAR:-default}`
    ///
    /// A variable that is unset and has no default keeps its placeholder, so
    /// validation reports it instead of silently using an empty value.
    pub(crate) fn expand_env_vars(content: &str) -> String {
        ENV_VAR
            .replace_all(content, |caps: &regex_lite::Captures<'_>| {
                match std::env::var(&caps[1]) {
                    Ok(value) => value,
                    Err(_) => match caps.get(2) {
                        Some(default) => default.as_str().to_string(),
                        None => caps[0].to_string(),
                    },
                }
            })
            .into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[serial_test::serial]
    fn test_expand_env_vars() {
        std::env::set_var("GATEKEEP_TEST_VAR", "test_value");
        let expanded = ConfigLoader::expand_env_vars("key: ${GATEKEEP_TEST_VAR}");
        assert_eq!(expanded, "key: test_value");
        std::env::remove_var("GATEKEEP_TEST_VAR");
    }

    #[test]
    #[serial_test::serial]
    fn test_expand_env_vars_default_and_missing() {
        std::env::remove_var("GATEKEEP_UNSET_VAR");
        assert_eq!(
            ConfigLoader::expand_env_vars("a: ${GATEKEEP_UNSET_VAR:-fallback}"),
            "a: fallback"
        );
        assert_eq!(
            ConfigLoader::expand_env_vars("a: ${GATEKEEP_UNSET_VAR}"),
            "a: ${GATEKEEP_UNSET_VAR}"
        );
    }
}
