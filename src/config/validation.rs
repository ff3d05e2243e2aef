//! Bootstrap configuration validation logic.

use crate::config::schema::ProxyConfig;

/// Error type for configuration validation failures.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationError(pub String);

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Validation error: {}", self.0)
    }
}

/// Validate a ProxyConfig for semantic correctness.
pub fn validate_config(config: &ProxyConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.bind_address.parse::<std::net::SocketAddr>().is_err() {
        errors.push(ValidationError(format!(
            "listener.bind_address '{}' is not a valid socket address",
            config.listener.bind_address
        )));
    }

    if config.service.name.is_empty() {
        errors.push(ValidationError("service.name must not be empty".to_string()));
    }

    if !config.service.rpc_prefix.ends_with('.') {
        errors.push(ValidationError(
            "service.rpc_prefix must end with '.'".to_string(),
        ));
    }

    if config.paths.last_good_config.is_empty() {
        errors.push(ValidationError(
            "paths.last_good_config must not be empty".to_string(),
        ));
    }

    if config.timeouts.read_secs == 0 && config.timeouts.write_secs == 0 {
        // Technically they could be 0 but likely a mistake
        tracing::warn!("Timeouts are set to 0, requests might time out immediately");
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(validate_config(&ProxyConfig::default()).is_ok());
    }

    #[test]
    fn test_invalid_bind_address() {
        let mut config = ProxyConfig::default();
        config.listener.bind_address = "not-an-address".into();

        let errs = validate_config(&config).unwrap_err();
        assert_eq!(errs.len(), 1);
        assert!(errs[0].0.contains("bind_address"));
    }

    #[test]
    fn test_rpc_prefix_must_be_dotted() {
        let mut config = ProxyConfig::default();
        config.service.rpc_prefix = "com.hailo.api".into();

        let errs = validate_config(&config).unwrap_err();
        assert!(errs[0].0.contains("rpc_prefix"));
    }
}
