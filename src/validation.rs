//! Input validation and sanitization
//!
//! Everything that ends up in a daemon configuration file or on a command
//! line passes through here first.

use crate::error::{ApctlError, ApctlResult};
use crate::network::Band;

/// Maximum length for interface names (Linux kernel limit is 15)
const MAX_INTERFACE_NAME_LEN: usize = 15;

/// Maximum length for configuration values
const MAX_CONFIG_VALUE_LEN: usize = 255;

/// Maximum length for error details shown to callers
const MAX_ERROR_MESSAGE_LEN: usize = 500;

const MAX_NET_ID_LEN: usize = 16;

/// Validate a net_id: `^[a-z0-9-]{1,16}$`
pub fn validate_net_id(net_id: &str) -> ApctlResult<()> {
    if net_id.is_empty() || net_id.len() > MAX_NET_ID_LEN {
        return Err(ApctlError::ValidationFailed(format!(
            "net_id '{}' must be 1-{} characters",
            net_id, MAX_NET_ID_LEN
        )));
    }

    if let Some(c) = net_id
        .chars()
        .find(|c| !(c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '-'))
    {
        return Err(ApctlError::ValidationFailed(format!(
            "net_id '{}' contains invalid character '{}' (allowed: a-z, 0-9, '-')",
            net_id, c
        )));
    }

    Ok(())
}

/// Validate interface name to prevent command injection
///
/// Interface names must be alphanumeric with optional dashes and underscores,
/// and no longer than 15 characters (Linux kernel limit)
pub fn validate_interface_name(name: &str) -> ApctlResult<()> {
    if name.is_empty() {
        return Err(ApctlError::ValidationFailed(
            "Interface name cannot be empty".to_string()
        ));
    }

    if name.len() > MAX_INTERFACE_NAME_LEN {
        return Err(ApctlError::ValidationFailed(
            format!("Interface name too long (max {} characters)", MAX_INTERFACE_NAME_LEN)
        ));
    }

    // Only allow alphanumeric, dash, underscore
    for c in name.chars() {
        if !c.is_ascii_alphanumeric() && c != '-' && c != '_' {
            return Err(ApctlError::ValidationFailed(
                format!("Invalid interface name '{}': contains invalid character '{}'", name, c)
            ));
        }
    }

    // Could be parsed as an option
    if name.starts_with('-') {
        return Err(ApctlError::ValidationFailed(
            "Interface name cannot start with dash".to_string()
        ));
    }

    Ok(())
}

/// Reject values that would break a line-oriented config file
pub fn sanitize_config_value(value: &str) -> ApctlResult<String> {
    if value.chars().any(|c| c.is_control() && c != '\t') {
        return Err(ApctlError::ValidationFailed(
            "Configuration value contains invalid control characters".to_string()
        ));
    }

    if value.len() > MAX_CONFIG_VALUE_LEN {
        return Err(ApctlError::ValidationFailed(
            format!("Configuration value too long (max {} characters)", MAX_CONFIG_VALUE_LEN)
        ));
    }

    Ok(value.to_string())
}

/// Validate WiFi SSID (1-32 bytes, no control characters)
pub fn validate_ssid(ssid: &str) -> ApctlResult<()> {
    if ssid.is_empty() {
        return Err(ApctlError::ValidationFailed(
            "SSID cannot be empty".to_string()
        ));
    }

    if ssid.len() > 32 {
        return Err(ApctlError::ValidationFailed(
            format!("SSID cannot exceed 32 bytes (got {})", ssid.len())
        ));
    }

    if ssid.chars().any(|c| c.is_control()) {
        return Err(ApctlError::ValidationFailed(
            "SSID contains invalid control characters".to_string()
        ));
    }

    Ok(())
}

/// Validate WiFi passphrase (WPA family: 8-63 ASCII characters)
pub fn validate_wifi_password(password: &str) -> ApctlResult<()> {
    if password.len() < 8 {
        return Err(ApctlError::ValidationFailed(
            format!("WiFi password must be at least 8 characters (got {})", password.len())
        ));
    }

    if password.len() > 63 {
        return Err(ApctlError::ValidationFailed(
            format!("WiFi password cannot exceed 63 characters (got {})", password.len())
        ));
    }

    if !password.is_ascii() {
        return Err(ApctlError::ValidationFailed(
            "WiFi password must contain only ASCII characters".to_string()
        ));
    }

    if password.chars().any(|c| c.is_control()) {
        return Err(ApctlError::ValidationFailed(
            "WiFi password contains invalid control characters".to_string()
        ));
    }

    Ok(())
}

/// Validate country code (ISO 3166-1 alpha-2)
pub fn validate_country_code(code: &str) -> ApctlResult<()> {
    const VALID_CODES: &[&str] = &[
        "US", "GB", "DE", "FR", "CA", "AU", "JP", "CN", "IN", "BR",
        "RU", "IT", "ES", "KR", "MX", "NL", "SE", "CH", "NO", "DK",
        "FI", "BE", "AT", "PL", "CZ", "PT", "GR", "IE", "NZ", "SG",
    ];

    let code_upper = code.to_uppercase();

    if code_upper.len() != 2 || !code_upper.chars().all(|c| c.is_ascii_alphabetic()) {
        return Err(ApctlError::ValidationFailed(
            format!("Country code must be 2 letters, got '{}'", code)
        ));
    }

    if !VALID_CODES.contains(&code_upper.as_str()) {
        return Err(ApctlError::ValidationFailed(
            format!("Unsupported country code: {}", code)
        ));
    }

    Ok(())
}

/// Validate WiFi channel for a band
pub fn validate_wifi_channel(channel: u8, band: Band) -> ApctlResult<()> {
    if !band.allowed_channels().contains(&channel) {
        return Err(ApctlError::ValidationFailed(format!(
            "Channel {} invalid for {} band ({})",
            channel,
            band,
            band.channel_hint()
        )));
    }
    Ok(())
}

/// Validate TX power level (1 = lowest, 4 = max)
pub fn validate_tx_power_level(level: u8) -> ApctlResult<()> {
    if !(1..=4).contains(&level) {
        return Err(ApctlError::ValidationFailed(
            format!("TX power level must be 1-4, got {}", level)
        ));
    }
    Ok(())
}

/// Trim daemon output before it is handed back to callers
pub fn sanitize_error_message(stderr: &str) -> String {
    let trimmed = stderr.trim();
    if trimmed.len() <= MAX_ERROR_MESSAGE_LEN {
        return trimmed.to_string();
    }

    // keep the end, where daemons print the fatal line
    let mut start = trimmed.len() - MAX_ERROR_MESSAGE_LEN;
    while !trimmed.is_char_boundary(start) {
        start += 1;
    }
    format!("(truncated) ...{}", &trimmed[start..])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_net_id_validation() {
        assert!(validate_net_id("ap-01").is_ok());
        assert!(validate_net_id("a").is_ok());
        assert!(validate_net_id("0123456789abcdef").is_ok());

        assert!(validate_net_id("").is_err());
        assert!(validate_net_id("0123456789abcdefg").is_err());
        assert!(validate_net_id("AP-01").is_err());
        assert!(validate_net_id("ap_01").is_err());
        assert!(validate_net_id("ap:01").is_err());
    }

    #[test]
    fn test_interface_name_validation() {
        assert!(validate_interface_name("wlan0").is_ok());
        assert!(validate_interface_name("wlx00c0ca123456").is_ok());

        assert!(validate_interface_name("wlan0; rm -rf /").is_err());
        assert!(validate_interface_name("wlan0\nmalicious").is_err());
        assert!(validate_interface_name("verylonginterfacename").is_err());
        assert!(validate_interface_name("-wlan0").is_err());
        assert!(validate_interface_name("").is_err());
    }

    #[test]
    fn test_ssid_validation() {
        assert!(validate_ssid("Lab Network").is_ok());
        assert!(validate_ssid(&"x".repeat(32)).is_ok());

        assert!(validate_ssid("").is_err());
        assert!(validate_ssid(&"x".repeat(33)).is_err());
        assert!(validate_ssid("SSID\ninterface=eth0").is_err());
    }

    #[test]
    fn test_wifi_password_validation() {
        assert!(validate_wifi_password("password123").is_ok());
        assert!(validate_wifi_password(&"a".repeat(63)).is_ok());

        assert!(validate_wifi_password("short").is_err());
        assert!(validate_wifi_password(&"a".repeat(64)).is_err());
        assert!(validate_wifi_password("pässwörd12").is_err());
        assert!(validate_wifi_password("pass\nword123").is_err());
    }

    #[test]
    fn test_country_code_validation() {
        assert!(validate_country_code("US").is_ok());
        assert!(validate_country_code("it").is_ok());

        assert!(validate_country_code("USA").is_err());
        assert!(validate_country_code("99").is_err());
        assert!(validate_country_code("XX").is_err());
    }

    #[test]
    fn test_wifi_channel_validation() {
        assert!(validate_wifi_channel(1, Band::Ghz2_4).is_ok());
        assert!(validate_wifi_channel(14, Band::Ghz2_4).is_ok());
        assert!(validate_wifi_channel(36, Band::Ghz2_4).is_err());

        assert!(validate_wifi_channel(36, Band::Ghz5).is_ok());
        assert!(validate_wifi_channel(144, Band::Ghz5).is_ok());
        assert!(validate_wifi_channel(165, Band::Ghz5).is_ok());
        assert!(validate_wifi_channel(1, Band::Ghz5).is_err());
        assert!(validate_wifi_channel(38, Band::Ghz5).is_err());
    }

    #[test]
    fn test_tx_power_level_validation() {
        assert!(validate_tx_power_level(1).is_ok());
        assert!(validate_tx_power_level(4).is_ok());
        assert!(validate_tx_power_level(0).is_err());
        assert!(validate_tx_power_level(5).is_err());
    }

    #[test]
    fn test_sanitize_error_message_keeps_tail() {
        let long = format!("{}FATAL: nl80211 driver init failed", "noise ".repeat(200));
        let out = sanitize_error_message(&long);
        assert!(out.starts_with("(truncated)"));
        assert!(out.ends_with("driver init failed"));
    }
}
