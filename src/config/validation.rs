//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Check both backend URLs are usable plain-HTTP base URLs
//! - Validate value ranges (timeouts > 0, ports valid)
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ProxyConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use thiserror::Error;
use url::Url;

use crate::config::schema::ProxyConfig;

/// A single semantic problem with a configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("{role} backend URL is missing")]
    MissingBackend { role: &'static str },

    #[error("{role} backend URL {url:?} is invalid: {reason}")]
    InvalidBackend {
        role: &'static str,
        url: String,
        reason: String,
    },

    #[error("bind address {0:?} must end in a port")]
    InvalidBindAddress(String),

    #[error("timeouts.{0} must be greater than zero")]
    ZeroTimeout(&'static str),

    #[error("timeouts.response_header_secs ({header}) exceeds timeouts.request_secs ({request})")]
    HeaderTimeoutExceedsRequest { header: u64, request: u64 },

    #[error("capture.dir must not be empty")]
    EmptyCaptureDir,

    #[error("capture.max_body_bytes must be greater than zero")]
    ZeroBodyLimit,
}

/// Validate a configuration, collecting every error found.
pub fn validate_config(config: &ProxyConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    for (role, url) in [
        ("primary", &config.backends.primary),
        ("secondary", &config.backends.secondary),
    ] {
        if let Err(e) = validate_backend(role, url) {
            errors.push(e);
        }
    }

    let bind = &config.listener.bind_address;
    let port_ok = bind
        .rsplit_once(':')
        .map(|(_, port)| port.parse::<u16>().is_ok())
        .unwrap_or(false);
    if !port_ok {
        errors.push(ValidationError::InvalidBindAddress(bind.clone()));
    }

    let timeouts = &config.timeouts;
    if timeouts.response_header_secs == 0 {
        errors.push(ValidationError::ZeroTimeout("response_header_secs"));
    }
    if timeouts.request_secs == 0 {
        errors.push(ValidationError::ZeroTimeout("request_secs"));
    }
    if timeouts.response_header_secs > timeouts.request_secs {
        errors.push(ValidationError::HeaderTimeoutExceedsRequest {
            header: timeouts.response_header_secs,
            request: timeouts.request_secs,
        });
    }

    if config.capture.dir.as_os_str().is_empty() {
        errors.push(ValidationError::EmptyCaptureDir);
    }
    if config.capture.max_body_bytes == 0 {
        errors.push(ValidationError::ZeroBodyLimit);
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn validate_backend(role: &'static str, raw: &str) -> Result<(), ValidationError> {
    if raw.trim().is_empty() {
        return Err(ValidationError::MissingBackend { role });
    }
    let invalid = |reason: String| ValidationError::InvalidBackend {
        role,
        url: raw.to_string(),
        reason,
    };
    let url = Url::parse(raw).map_err(|e| invalid(e.to_string()))?;
    if url.scheme() != "http" {
        return Err(invalid(format!("unsupported scheme {:?}", url.scheme())));
    }
    if url.host_str().is_none() {
        return Err(invalid("no host".to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> ProxyConfig {
        let mut config = ProxyConfig::default();
        config.backends.primary = "http://127.0.0.1:3000".into();
        config.backends.secondary = "http://127.0.0.1:4000/v2".into();
        config
    }

    #[test]
    fn accepts_valid_config() {
        assert_eq!(validate_config(&valid()), Ok(()));
    }

    #[test]
    fn reports_every_error() {
        let mut config = valid();
        config.backends.primary.clear();
        config.backends.secondary = "https://example.com".into();
        config.listener.bind_address = "localhost".into();
        config.timeouts.request_secs = 0;

        let errors = validate_config(&config).unwrap_err();
        assert!(errors.contains(&ValidationError::MissingBackend { role: "primary" }));
        assert!(errors
            .iter()
            .any(|e| matches!(e, ValidationError::InvalidBackend { role: "secondary", .. })));
        assert!(errors.contains(&ValidationError::InvalidBindAddress("localhost".into())));
        assert!(errors.contains(&ValidationError::ZeroTimeout("request_secs")));
        assert!(errors.contains(&ValidationError::HeaderTimeoutExceedsRequest {
            header: 30,
            request: 0
        }));
    }

    #[test]
    fn header_timeout_may_equal_request_timeout() {
        let mut config = valid();
        config.timeouts.response_header_secs = 5;
        config.timeouts.request_secs = 5;
        assert_eq!(validate_config(&config), Ok(()));
    }

    #[test]
    fn port_only_bind_address_is_valid() {
        let mut config = valid();
        config.listener.bind_address = ":0".into();
        assert_eq!(validate_config(&config), Ok(()));
    }
}
