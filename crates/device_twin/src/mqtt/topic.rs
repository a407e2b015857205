use common::domain::{DomainError, DomainResult};

/// Number of `/`-separated segments in a device topic (`devices/<kind>/<device_id>`)
pub const DEVICE_TOPIC_SEGMENTS: usize = 3;

const DEVICE_ID_SEGMENT: usize = 2;

/// Device id carried by an inbound device topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceTopic {
    pub kind: String,
    pub device_id: String,
}

/// Parse `devices/<kind>/<device_id>`.
///
/// ```
/// use device_twin::mqtt::parse_device_topic;
///
/// let parsed = parse_device_topic("devices/health/a111").unwrap();
/// assert_eq!(parsed.device_id, "a111");
/// ```
pub fn parse_device_topic(topic: &str) -> DomainResult<DeviceTopic> {
    let parts: Vec<&str> = topic.split('/').collect();

    if parts.len() != DEVICE_TOPIC_SEGMENTS {
        return Err(DomainError::InvalidArgument(format!(
            "invalid device topic '{}': expected {} segments",
            topic, DEVICE_TOPIC_SEGMENTS
        )));
    }

    let device_id = parts[DEVICE_ID_SEGMENT].trim();
    if device_id.is_empty() {
        return Err(DomainError::InvalidArgument(format!(
            "invalid device topic '{}': empty device id",
            topic
        )));
    }

    Ok(DeviceTopic {
        kind: parts[1].to_string(),
        device_id: device_id.to_string(),
    })
}

/// Topic on which a device receives commands
pub fn subscribe_topic(device_id: &str) -> String {
    format!("devices/sub/{}", device_id)
}

/// Topic on which a device receives required-install requests
pub fn required_install_topic(serial: &str) -> String {
    format!("devices/actions/{}/required-install", sanitize_serial(serial))
}

/// Keep only `[A-Za-z0-9_-]` so a serial is a single topic level without
/// wildcards
pub fn sanitize_serial(serial: &str) -> String {
    serial
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .collect()
}

/// MQTT filter matching with `+` (one level) and `#` (remaining levels)
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(f), Some(t)) if f == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_health_topic() {
        let parsed = parse_device_topic("devices/health/a111").unwrap();
        assert_eq!(parsed.kind, "health");
        assert_eq!(parsed.device_id, "a111");
    }

    #[test]
    fn test_parse_topic_wrong_segment_count() {
        assert!(parse_device_topic("devices/health").is_err());
        assert!(parse_device_topic("devices/health/a111/extra").is_err());
        assert!(parse_device_topic("").is_err());
    }

    #[test]
    fn test_parse_topic_empty_device() {
        assert!(parse_device_topic("devices/pub/").is_err());
    }

    #[test]
    fn test_sanitize_serial() {
        assert_eq!(sanitize_serial("dev/ice#01"), "device01");
        assert_eq!(sanitize_serial("DR1000B222"), "DR1000B222");
        assert_eq!(sanitize_serial("a+b_c-d e"), "ab_c-de");
    }

    #[test]
    fn test_sanitize_serial_is_idempotent() {
        for serial in ["dev/ice#01", "DR1000B222", "+/#", "ünï-cødé_9"] {
            let once = sanitize_serial(serial);
            assert_eq!(sanitize_serial(&once), once);
        }
    }

    #[test]
    fn test_required_install_topic() {
        assert_eq!(
            required_install_topic("DR1000A111"),
            "devices/actions/DR1000A111/required-install"
        );
    }

    #[test]
    fn test_topic_matches_wildcards() {
        assert!(topic_matches("devices/health/+", "devices/health/a111"));
        assert!(!topic_matches("devices/health/+", "devices/pub/a111"));
        assert!(!topic_matches("devices/health/+", "devices/health/a111/x"));
        assert!(topic_matches("devices/#", "devices/pub/a111"));
        assert!(topic_matches("devices/pub/a111", "devices/pub/a111"));
    }
}
