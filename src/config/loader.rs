//! Configuration loading

use std::path::Path;

use tracing::debug;

use super::types::Options;
use crate::error::ConfigError;

/// Load and validate a configuration document from a JSON file
pub fn load_options(path: impl AsRef<Path>) -> Result<Options, ConfigError> {
    let path = path.as_ref();

    debug!("loading configuration from {:?}", path);

    if !path.exists() {
        return Err(ConfigError::FileNotFound {
            path: path.display().to_string(),
        });
    }

    let contents = std::fs::read_to_string(path)?;
    load_options_str(&contents)
}

/// Load and validate a configuration document from a JSON string
pub fn load_options_str(json: &str) -> Result<Options, ConfigError> {
    let options: Options =
        serde_json::from_str(json).map_err(|e| ConfigError::parse("config", e))?;
    options.validate()?;
    Ok(options)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(
            br#"{
                "inbounds": [{ "type": "mixed", "listen_port": 1080 }],
                "outbounds": [{ "type": "direct" }]
            }"#,
        )
        .unwrap();

        let options = load_options(file.path()).unwrap();
        assert_eq!(options.inbounds.len(), 1);
        assert_eq!(options.inbounds[0].inbound_type, "mixed");
    }

    #[test]
    fn test_missing_file() {
        let result = load_options("/nonexistent/config.json");
        assert!(matches!(result, Err(ConfigError::FileNotFound { .. })));
    }

    #[test]
    fn test_invalid_json() {
        let result = load_options_str("not json");
        assert!(matches!(result, Err(ConfigError::Parse { .. })));
    }
}
