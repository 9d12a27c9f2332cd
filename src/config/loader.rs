//! Configuration loading from disk.

use std::fs;
use std::path::Path;

use crate::config::schema::ProxyConfig;
use crate::config::validation::{validate_config, ValidationError};
use crate::dynamic::types::TopologyFragment;

/// Error type for configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {message}")]
    Parse { path: String, message: String },
    #[error("validation failed: {}", join(.0))]
    Validation(Vec<ValidationError>),
}

fn join(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

fn read(path: &Path) -> Result<String, ConfigError> {
    fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })
}

/// Load and validate configuration from a TOML file.
pub fn load_config(path: &Path) -> Result<ProxyConfig, ConfigError> {
    let content = read(path)?;
    let config: ProxyConfig = toml::from_str(&content).map_err(|e| ConfigError::Parse {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;

    validate_config(&config).map_err(ConfigError::Validation)?;

    Ok(config)
}

/// Load a topology fragment: JSON for `.json` files, TOML otherwise.
pub fn load_fragment(path: &Path) -> Result<TopologyFragment, ConfigError> {
    let content = read(path)?;
    let parse_error = |message: String| ConfigError::Parse {
        path: path.display().to_string(),
        message,
    };

    let is_json = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("json"));
    if is_json {
        serde_json::from_str(&content).map_err(|e| parse_error(e.to_string()))
    } else {
        toml::from_str(&content).map_err(|e| parse_error(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn loads_and_validates() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[listener]\nbind_address = \"127.0.0.1:18080\"").unwrap();
        let config = load_config(file.path()).unwrap();
        assert_eq!(config.listener.bind_address, "127.0.0.1:18080");

        let mut bad = tempfile::NamedTempFile::new().unwrap();
        writeln!(bad, "[timeouts]\nrequest_secs = 0").unwrap();
        assert!(matches!(load_config(bad.path()), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = load_config(Path::new("/nonexistent/edge.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn fragment_format_follows_extension() {
        let dir = tempfile::tempdir().unwrap();

        let toml_path = dir.path().join("a.toml");
        fs::write(
            &toml_path,
            "[routers.r1]\nrule = \"Host(`shop.test`)\"\nservice = \"svc1\"\n",
        )
        .unwrap();
        let fragment = load_fragment(&toml_path).unwrap();
        assert_eq!(fragment.routers.len(), 1);

        let json_path = dir.path().join("b.json");
        fs::write(
            &json_path,
            r#"{"services": {"svc1": {"load_balancer": {"servers": [{"url": "http://10.0.0.1:80"}]}}}}"#,
        )
        .unwrap();
        let fragment = load_fragment(&json_path).unwrap();
        assert_eq!(fragment.services.len(), 1);

        fs::write(&json_path, "{not json").unwrap();
        assert!(matches!(load_fragment(&json_path), Err(ConfigError::Parse { .. })));
    }
}
