//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (timeouts > 0, addresses parse)
//! - Check provider names are usable as source namespaces
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ProxyConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system
//! - Topology fragments are not validated here; bad entities are
//!   reported per reconciliation cycle instead

use std::collections::HashSet;
use std::fmt;
use std::net::SocketAddr;

use crate::config::schema::ProxyConfig;
use crate::dynamic::naming::check_local_name;

const ADMIN_KEY_PLACEHOLDER: &str = "CHANGE_ME_IN_PRODUCTION";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

pub fn validate_config(config: &ProxyConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    check_addr(&mut errors, "listener.bind_address", &config.listener.bind_address);
    if config.listener.max_connections == 0 {
        errors.push(ValidationError::new("listener.max_connections", "must be greater than 0"));
    }
    if let Some(tls) = &config.listener.tls {
        if tls.cert_path.is_empty() || tls.key_path.is_empty() {
            errors.push(ValidationError::new("listener.tls", "cert_path and key_path are required"));
        }
    }

    let mut sources = HashSet::new();
    for (i, provider) in config.providers.files.iter().enumerate() {
        let field = format!("providers.files[{}]", i);
        if let Err(reason) = check_local_name(&provider.name) {
            errors.push(ValidationError::new(format!("{}.name", field), reason));
        }
        if !sources.insert(provider.name.as_str()) {
            errors.push(ValidationError::new(
                format!("{}.name", field),
                format!("source `{}` is declared twice", provider.name),
            ));
        }
        if provider.path.is_empty() {
            errors.push(ValidationError::new(format!("{}.path", field), "must not be empty"));
        }
    }

    if !(100..=599).contains(&config.dispatch.no_route_status) {
        errors.push(ValidationError::new(
            "dispatch.no_route_status",
            "must be an HTTP status code",
        ));
    }
    if config.dispatch.max_connections_per_target == 0 {
        errors.push(ValidationError::new(
            "dispatch.max_connections_per_target",
            "must be greater than 0",
        ));
    }

    let hc = &config.health_check;
    if hc.interval_secs == 0 {
        errors.push(ValidationError::new("health_check.interval_secs", "must be greater than 0"));
    }
    if hc.timeout_secs == 0 {
        errors.push(ValidationError::new("health_check.timeout_secs", "must be greater than 0"));
    }
    if hc.timeout_secs > hc.interval_secs {
        errors.push(ValidationError::new(
            "health_check.timeout_secs",
            "must not exceed interval_secs",
        ));
    }
    if !hc.path.starts_with('/') {
        errors.push(ValidationError::new("health_check.path", "must start with '/'"));
    }
    if hc.healthy_threshold == 0 || hc.unhealthy_threshold == 0 {
        errors.push(ValidationError::new("health_check", "thresholds must be greater than 0"));
    }

    if config.timeouts.connect_secs == 0 {
        errors.push(ValidationError::new("timeouts.connect_secs", "must be greater than 0"));
    }
    if config.timeouts.request_secs == 0 {
        errors.push(ValidationError::new("timeouts.request_secs", "must be greater than 0"));
    }

    let retries = &config.retries;
    if !(0.0..=1.0).contains(&retries.budget_ratio) {
        errors.push(ValidationError::new("retries.budget_ratio", "must be within 0.0..=1.0"));
    }
    if retries.base_delay_ms > retries.max_delay_ms {
        errors.push(ValidationError::new(
            "retries.base_delay_ms",
            "must not exceed max_delay_ms",
        ));
    }

    let obs = &config.observability;
    if !matches!(obs.log_level.as_str(), "trace" | "debug" | "info" | "warn" | "error") {
        errors.push(ValidationError::new(
            "observability.log_level",
            format!("unknown level `{}`", obs.log_level),
        ));
    }
    if obs.metrics_enabled {
        check_addr(&mut errors, "observability.metrics_address", &obs.metrics_address);
    }

    if config.admin.enabled {
        check_addr(&mut errors, "admin.bind_address", &config.admin.bind_address);
        if config.admin.api_key.is_empty() || config.admin.api_key == ADMIN_KEY_PLACEHOLDER {
            errors.push(ValidationError::new("admin.api_key", "must be set when the admin API is enabled"));
        }
    }

    if config.security.max_body_size == 0 {
        errors.push(ValidationError::new("security.max_body_size", "must be greater than 0"));
    }

    for (i, cert) in config.certificates.iter().enumerate() {
        let field = format!("certificates[{}]", i);
        if cert.domains.is_empty() {
            errors.push(ValidationError::new(format!("{}.domains", field), "must not be empty"));
        }
        if cert.cert_path.is_empty() || cert.key_path.is_empty() {
            errors.push(ValidationError::new(field, "cert_path and key_path are required"));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn check_addr(errors: &mut Vec<ValidationError>, field: &str, value: &str) {
    if value.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new(
            field,
            format!("`{}` is not a socket address", value),
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::FileProviderConfig;

    #[test]
    fn defaults_are_valid() {
        assert_eq!(validate_config(&ProxyConfig::default()), Ok(()));
    }

    #[test]
    fn collects_every_problem() {
        let mut config = ProxyConfig::default();
        config.listener.bind_address = "nowhere".into();
        config.health_check.interval_secs = 0;
        config.retries.budget_ratio = 1.5;
        config.providers.files = vec![
            FileProviderConfig {
                name: "a@b".into(),
                path: "x.toml".into(),
                watch: true,
            },
            FileProviderConfig {
                name: "a@b".into(),
                path: String::new(),
                watch: false,
            },
        ];

        let errors = validate_config(&config).unwrap_err();
        let fields: Vec<_> = errors.iter().map(|e| e.field.as_str()).collect();
        assert!(fields.contains(&"listener.bind_address"));
        assert!(fields.contains(&"health_check.interval_secs"));
        assert!(fields.contains(&"retries.budget_ratio"));
        assert!(fields.contains(&"providers.files[0].name"));
        assert!(fields.contains(&"providers.files[1].path"));
    }

    #[test]
    fn admin_requires_real_key() {
        let mut config = ProxyConfig::default();
        config.admin.enabled = true;
        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors[0].field, "admin.api_key");

        config.admin.api_key = "s3cret".into();
        assert!(validate_config(&config).is_ok());
    }
}
