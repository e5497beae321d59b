//! Out-of-band record attached to an established connection
//!
//! Connectors fill in whatever their native transport exposes; the rest
//! stays empty (or zero for the signal strength).

use serde::Serialize;
use url::Url;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Metadata {
    pub url: String,
    pub name: String,
    pub manufacturer: String,
    pub model: String,
    pub serial_number: String,
    pub firmware_version: String,
    /// Signal strength in dBm, 0 when unknown
    pub rssi: i32,
    /// Soft errors hit while establishing the connection
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    /// RFC 3339 timestamp of when the connection was established
    pub connected_at: String,
}

impl Metadata {
    /// Fresh record for `url`, stamped with the current time
    pub fn for_url(url: &Url) -> Self {
        Self {
            url: url.to_string(),
            connected_at: chrono::Local::now().to_rfc3339(),
            ..Self::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn warn(&mut self, warning: impl Into<String>) {
        self.warnings.push(warning.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_for_url_defaults() {
        let url = Url::parse("tcp://localhost:9000").unwrap();
        let meta = Metadata::for_url(&url).with_name("localhost");

        assert_eq!(meta.url, "tcp://localhost:9000");
        assert_eq!(meta.name, "localhost");
        assert_eq!(meta.rssi, 0);
        assert!(meta.manufacturer.is_empty());
        assert!(chrono::DateTime::parse_from_rfc3339(&meta.connected_at).is_ok());
    }

    #[test]
    fn test_json_skips_empty_warnings() {
        let url = Url::parse("tty:///dev/ttyUSB0").unwrap();
        let mut meta = Metadata::for_url(&url);
        let json = serde_json::to_value(&meta).unwrap();
        assert!(json.get("warnings").is_none());

        meta.warn("baud rate 250000 not applied");
        let json = serde_json::to_value(&meta).unwrap();
        assert_eq!(json["warnings"][0], "baud rate 250000 not applied");
    }
}
