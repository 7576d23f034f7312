//! Configuration validation.

use crate::config::Config;
use crate::model::{ForwardMode, validate_check, validate_destination, validate_service};
use std::collections::HashSet;

/// Longest interface name that still fits the VIP label suffix.
const MAX_INTERFACE_LEN: usize = 11;

/// iptables limit on chain names.
const MAX_CHAIN_LEN: usize = 28;

/// Validate the configuration.
///
/// Every problem is collected; the returned message joins them with `; `.
pub fn validate_config(config: &Config) -> Result<(), String> {
    let mut errors = Vec::new();

    let valid_levels = ["trace", "debug", "info", "warn", "error"];
    if !valid_levels.contains(&config.global.log_level.to_lowercase().as_str()) {
        errors.push(format!(
            "invalid log level '{}', must be one of: {}",
            config.global.log_level,
            valid_levels.join(", ")
        ));
    }

    let node = &config.node;
    if node.id.is_empty() {
        errors.push("node id cannot be empty".to_string());
    }
    if node.interface.is_empty() {
        errors.push("node interface cannot be empty".to_string());
    } else if node.interface.len() > MAX_INTERFACE_LEN {
        errors.push(format!(
            "interface name '{}' is longer than {} characters",
            node.interface, MAX_INTERFACE_LEN
        ));
    }
    if node.nat_chain.is_empty() || node.nat_chain.len() > MAX_CHAIN_LEN {
        errors.push(format!(
            "nat chain name must be 1 to {} characters",
            MAX_CHAIN_LEN
        ));
    }
    if node.command_timeout.is_zero() {
        errors.push("command timeout must be greater than zero".to_string());
    }
    if node.metrics_interval.is_zero() {
        errors.push("metrics interval must be greater than zero".to_string());
    }

    let defaults = &config.health_check_defaults;
    if defaults.interval.is_zero() || defaults.timeout.is_zero() {
        errors.push("health check defaults must be greater than zero".to_string());
    }

    if !config.services.is_empty() && node.vip_ranges.is_empty() {
        errors.push("services are configured but no vip_ranges are defined".to_string());
    }

    let mut service_names = HashSet::new();
    let mut destination_names = HashSet::new();
    for seed in &config.services {
        let svc = &seed.service;
        if let Err(e) = validate_service(svc) {
            errors.push(format!("service '{}': {}", svc.name, e));
        }
        if !service_names.insert(svc.name.as_str()) {
            errors.push(format!("duplicate service name: {}", svc.name));
        }
        if svc.mode == ForwardMode::Nat && node.outbound_address.is_none() {
            errors.push(format!(
                "service '{}' uses nat mode but node.outbound_address is not set",
                svc.name
            ));
        }

        let mut endpoints = HashSet::new();
        for dst in seed.bound_destinations() {
            if let Err(e) = validate_destination(&dst) {
                errors.push(format!("destination '{}': {}", dst.name, e));
            }
            if !destination_names.insert(dst.name.clone()) {
                errors.push(format!("duplicate destination name: {}", dst.name));
            }
            if !endpoints.insert((dst.address, dst.port)) {
                errors.push(format!(
                    "service '{}' has more than one destination at {}",
                    svc.name,
                    dst.socket_addr()
                ));
            }
        }

        for check in seed.bound_checks() {
            if let Err(e) = validate_check(&check) {
                errors.push(format!("check on service '{}': {}", svc.name, e));
            }
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors.join("; "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::*;
    use crate::model::{Destination, Service};

    fn minimal_config() -> Config {
        let mut config = Config::default();
        config.node.outbound_address = Some("10.0.0.2".parse().unwrap());
        config.node.vip_ranges = vec!["192.168.0.0/28".parse().unwrap()];
        config.services = vec![ServiceSeed {
            service: Service::new("web", 80),
            destinations: vec![Destination::new(
                "web-1",
                "",
                "10.0.0.10".parse().unwrap(),
                8080,
            )],
            checks: vec![],
        }];
        config
    }

    #[test]
    fn test_valid_config() {
        assert!(validate_config(&minimal_config()).is_ok());
    }

    #[test]
    fn test_empty_config_is_valid() {
        assert!(validate_config(&Config::default()).is_ok());
    }

    #[test]
    fn test_services_without_ranges() {
        let mut config = minimal_config();
        config.node.vip_ranges.clear();
        let result = validate_config(&config);
        assert!(result.unwrap_err().contains("no vip_ranges"));
    }

    #[test]
    fn test_nat_requires_outbound_address() {
        let mut config = minimal_config();
        config.node.outbound_address = None;
        let result = validate_config(&config);
        assert!(result.unwrap_err().contains("outbound_address"));
    }

    #[test]
    fn test_duplicate_service_names() {
        let mut config = minimal_config();
        let mut other = config.services[0].clone();
        other.destinations.clear();
        config.services.push(other);
        let result = validate_config(&config);
        assert!(result.unwrap_err().contains("duplicate service name"));
    }

    #[test]
    fn test_duplicate_destination_endpoint() {
        let mut config = minimal_config();
        let mut twin = config.services[0].destinations[0].clone();
        twin.name = "web-2".to_string();
        config.services[0].destinations.push(twin);
        let result = validate_config(&config);
        assert!(result.unwrap_err().contains("more than one destination"));
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = minimal_config();
        config.global.log_level = "verbose".to_string();
        assert!(validate_config(&config).unwrap_err().contains("invalid log level"));
    }

    #[test]
    fn test_long_interface_name() {
        let mut config = minimal_config();
        config.node.interface = "enp0s31f6abcd".to_string();
        assert!(validate_config(&config).unwrap_err().contains("interface name"));
    }
}
