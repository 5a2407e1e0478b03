//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (clap and serde handle syntax)
//! - Check address lists parse and at least one listener is given
//! - Validate value ranges (TTLs and intervals > 0, limits > 0 when set)
//!
//! # Design Decisions
//! - Returns all validation errors, not just the first
//! - Pure function: NodeConfig → Result<(), Vec<ValidationError>>

use std::fmt;

use crate::config::schema::NodeConfig;
use crate::net::parse_address_list;

/// One invalid setting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: &'static str,
    pub message: String,
}

impl ValidationError {
    fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

impl std::error::Error for ValidationError {}

pub fn validate_config(config: &NodeConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    match parse_address_list(&config.network.listen) {
        Ok(addrs) if addrs.is_empty() => {
            errors.push(ValidationError::new("listen", "at least one address is required"))
        }
        Ok(_) => {}
        Err(e) => errors.push(ValidationError::new("listen", e.to_string())),
    }
    if let Err(e) = parse_address_list(&config.network.announce) {
        errors.push(ValidationError::new("announce", e.to_string()));
    }
    if config.network.max_connections == 0 {
        errors.push(ValidationError::new("max-connections", "must be greater than 0"));
    }

    if config.store.location.trim().is_empty() {
        errors.push(ValidationError::new("db", "must not be empty"));
    }
    if config.store.max_ttl_secs == 0 {
        errors.push(ValidationError::new("max-ttl", "must be greater than 0"));
    }
    if config.store.sweep_interval_secs == 0 {
        errors.push(ValidationError::new("sweep-interval", "must be greater than 0"));
    }

    let emitter = &config.sync.emitter;
    if emitter.is_enabled() {
        if let Some(server) = &emitter.server {
            if let Err(e) = crate::sync::broker::normalize_endpoint(server) {
                errors.push(ValidationError::new("emitter-server", e.to_string()));
            }
        }
        if emitter.queue_capacity == 0 {
            errors.push(ValidationError::new("emitter-queue", "must be greater than 0"));
        }
    } else if emitter.mandatory {
        errors.push(ValidationError::new(
            "emitter-mandatory",
            "requires emitter-server and emitter-admin-key",
        ));
    }

    let relay = &config.relay;
    if relay.max_circuits == Some(0) {
        errors.push(ValidationError::new("relay-max-circuits", "must be greater than 0"));
    }
    if relay.max_data_bytes == Some(0) {
        errors.push(ValidationError::new("relay-max-data", "must be greater than 0"));
    }
    if relay.max_duration_secs == Some(0) {
        errors.push(ValidationError::new("relay-max-duration", "must be greater than 0"));
    }

    if let Some(listen) = &config.metrics.listen {
        if listen.trim().is_empty() || !listen.contains(':') {
            errors.push(ValidationError::new("metrics", format!("'{listen}' is not host:port")));
        }
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
        assert!(validate_config(&NodeConfig::default()).is_ok());
    }

    #[test]
    fn test_reports_every_problem() {
        let mut config = NodeConfig::default();
        config.network.listen = "not-an-addr".into();
        config.store.max_ttl_secs = 0;
        config.relay.max_circuits = Some(0);
        config.sync.emitter.mandatory = true;

        let errors = validate_config(&config).unwrap_err();
        let fields: Vec<_> = errors.iter().map(|e| e.field).collect();
        assert_eq!(
            fields,
            vec!["listen", "max-ttl", "emitter-mandatory", "relay-max-circuits"]
        );
    }

    #[test]
    fn test_empty_listen_rejected() {
        let mut config = NodeConfig::default();
        config.network.listen = " , ".into();
        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors[0].field, "listen");
    }

    #[test]
    fn test_bad_emitter_scheme() {
        let mut config = NodeConfig::default();
        config.sync.emitter.server = Some("https://broker".into());
        config.sync.emitter.admin_key = Some("k".into());
        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors[0].field, "emitter-server");
    }
}
