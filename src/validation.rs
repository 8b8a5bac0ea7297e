//! Input validation for profile values that end up in generated
//! configuration files or on helper command lines

use crate::error::{VpnctlError, VpnctlResult};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::net::IpAddr;

/// Maximum length for interface names (Linux kernel limit is 15)
const MAX_INTERFACE_NAME_LEN: usize = 15;

/// Maximum length for configuration values
const MAX_CONFIG_VALUE_LEN: usize = 255;

/// Maximum length for helper stderr carried in errors
const MAX_ERROR_MESSAGE_LEN: usize = 500;

/// Raw length of a Curve25519 key
pub const WIREGUARD_KEY_LEN: usize = 32;

/// Validate interface name to prevent command injection
///
/// Interface names must be alphanumeric with optional dashes and underscores,
/// and no longer than 15 characters (Linux kernel limit)
pub fn validate_interface_name(name: &str) -> VpnctlResult<()> {
    if name.is_empty() {
        return Err(VpnctlError::InvalidParameter(
            "Interface name cannot be empty".to_string()
        ));
    }

    if name.len() > MAX_INTERFACE_NAME_LEN {
        return Err(VpnctlError::InvalidParameter(
            format!("Interface name too long (max {} characters)", MAX_INTERFACE_NAME_LEN)
        ));
    }

    for c in name.chars() {
        if !c.is_ascii_alphanumeric() && c != '-' && c != '_' {
            return Err(VpnctlError::InvalidParameter(
                format!("Invalid interface name '{}': contains invalid character '{}'", name, c)
            ));
        }
    }

    // Would be taken as an option by ip(8)
    if name.starts_with('-') {
        return Err(VpnctlError::InvalidParameter(
            "Interface name cannot start with dash".to_string()
        ));
    }

    Ok(())
}

/// Validate MTU value
pub fn validate_mtu(mtu: u32) -> VpnctlResult<()> {
    // IPv4 minimum; 1280 is enforced separately where IPv6 is configured
    if mtu < 576 {
        return Err(VpnctlError::InvalidParameter(
            format!("MTU {} is below the minimum of 576 bytes", mtu)
        ));
    }
    if mtu > 9000 {
        return Err(VpnctlError::InvalidParameter(
            "MTU cannot exceed 9000 bytes".to_string()
        ));
    }
    Ok(())
}

/// Sanitize values written into strongSwan, xl2tpd or pppd configuration
///
/// Rejects control characters and overlong values. Quoting is left to the
/// individual renderers.
pub fn sanitize_config_value(value: &str) -> VpnctlResult<String> {
    if value.chars().any(|c| c.is_control()) {
        return Err(VpnctlError::InvalidParameter(
            "Configuration value contains invalid control characters".to_string()
        ));
    }

    if value.len() > MAX_CONFIG_VALUE_LEN {
        return Err(VpnctlError::InvalidParameter(
            format!("Configuration value too long (max {} characters)", MAX_CONFIG_VALUE_LEN)
        ));
    }

    Ok(value.to_string())
}

/// Validate a remote gateway: an IP address or a DNS hostname
pub fn validate_hostname(host: &str) -> VpnctlResult<()> {
    if host.is_empty() {
        return Err(VpnctlError::InvalidParameter(
            "Hostname cannot be empty".to_string()
        ));
    }

    if host.len() > 253 {
        return Err(VpnctlError::InvalidParameter(
            "Hostname too long".to_string()
        ));
    }

    if host.parse::<IpAddr>().is_ok() {
        return Ok(());
    }

    for c in host.chars() {
        if !c.is_ascii_alphanumeric() && c != '-' && c != '.' {
            return Err(VpnctlError::InvalidParameter(
                format!("Invalid hostname character: {}", c)
            ));
        }
    }

    if host.starts_with('-') || host.starts_with('.') ||
       host.ends_with('-') || host.ends_with('.') {
        return Err(VpnctlError::InvalidParameter(
            "Invalid hostname format".to_string()
        ));
    }

    Ok(())
}

/// Validate a WireGuard endpoint: `host:port` or `[v6]:port`
pub fn validate_endpoint(endpoint: &str) -> VpnctlResult<()> {
    let (host, port) = endpoint.rsplit_once(':').ok_or_else(|| {
        VpnctlError::InvalidParameter(format!("Endpoint '{}' is missing a port", endpoint))
    })?;

    port.parse::<u16>().map_err(|_| {
        VpnctlError::InvalidParameter(format!("Invalid endpoint port in '{}'", endpoint))
    })?;

    match host.strip_prefix('[').and_then(|h| h.strip_suffix(']')) {
        Some(v6) => v6
            .parse::<std::net::Ipv6Addr>()
            .map(|_| ())
            .map_err(|_| VpnctlError::InvalidParameter(format!("Invalid endpoint address '{}'", v6))),
        None => validate_hostname(host),
    }
}

/// Validate a base64 encoded WireGuard key
pub fn validate_wireguard_key(key: &str) -> VpnctlResult<()> {
    let raw = STANDARD.decode(key.trim()).map_err(|_| {
        VpnctlError::InvalidParameter("WireGuard key is not valid base64".to_string())
    })?;

    if raw.len() != WIREGUARD_KEY_LEN {
        return Err(VpnctlError::InvalidParameter(
            format!("WireGuard key must be {} bytes, got {}", WIREGUARD_KEY_LEN, raw.len())
        ));
    }

    Ok(())
}

/// Trim helper stderr before it is carried in an error
pub fn sanitize_error_message(stderr: &str) -> String {
    let mut sanitized = stderr.trim().to_string();

    if sanitized.len() > MAX_ERROR_MESSAGE_LEN {
        let mut cut = MAX_ERROR_MESSAGE_LEN;
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized.truncate(cut);
        sanitized.push_str("... (truncated)");
    }

    sanitized
}
