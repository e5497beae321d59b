//! Target addressing
//!
//! | scheme   | host                        | path            | port            |
//! |----------|-----------------------------|-----------------|-----------------|
//! | `tcp`    | hostname                    |                 | TCP port        |
//! | `tty`    |                             | device path     | baud (optional) |
//! | `ble`    | GATT service id             | peer id (opt.)  | L2CAP PSM (opt.)|
//! | `rfcomm` | hardware address            |                 | channel (opt.)  |
//! | `ea`     | accessory protocol          |                 |                 |
//!
//! Two schemes need massaging before a generic URL parser accepts them:
//! RFCOMM addresses may be written with `:` separators, and TTY baud
//! rates do not fit in a 16-bit port. `parse_url` rewrites both into a
//! canonical form, which is also the key the broker uses for the target.

use crate::constants::{BLE_PEER_ID_LEN, HARDWARE_ADDRESS_LEN};
use crate::error::{Result, StreamError};
use std::borrow::Cow;
use std::fmt;
use std::path::PathBuf;
use url::Url;

pub const SCHEME_TCP: &str = "tcp";
pub const SCHEME_TTY: &str = "tty";
pub const SCHEME_BLE: &str = "ble";
pub const SCHEME_RFCOMM: &str = "rfcomm";
pub const SCHEME_ACCESSORY: &str = "ea";

/// Query key carrying a TTY baud rate in canonical URLs
const BAUD_QUERY_KEY: &str = "baud";

/// A parsed, validated connection target
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Tcp {
        host: String,
        port: u16,
    },
    Tty {
        path: PathBuf,
        baud: Option<u32>,
    },
    Ble {
        service: String,
        peer: Option<String>,
        psm: Option<u16>,
    },
    Rfcomm {
        address: String,
        channel: Option<u8>,
    },
    Accessory {
        protocol: String,
    },
}

impl Target {
    /// Validate `url` against the addressing rules of its scheme
    pub fn parse(url: &Url) -> Result<Self> {
        match url.scheme() {
            SCHEME_TCP => parse_tcp(url),
            SCHEME_TTY => parse_tty(url),
            SCHEME_BLE => parse_ble(url),
            SCHEME_RFCOMM => parse_rfcomm(url),
            SCHEME_ACCESSORY => parse_accessory(url),
            other => Err(StreamError::UnsupportedScheme {
                scheme: other.to_string(),
            }),
        }
    }

    pub fn scheme(&self) -> &'static str {
        match self {
            Self::Tcp { .. } => SCHEME_TCP,
            Self::Tty { .. } => SCHEME_TTY,
            Self::Ble { .. } => SCHEME_BLE,
            Self::Rfcomm { .. } => SCHEME_RFCOMM,
            Self::Accessory { .. } => SCHEME_ACCESSORY,
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp { host, port } => write!(f, "{}:{}", host, port),
            Self::Tty { path, baud } => match baud {
                Some(baud) => write!(f, "{} @ {} baud", path.display(), baud),
                None => write!(f, "{}", path.display()),
            },
            Self::Ble { service, peer, psm } => {
                write!(f, "service {}", service)?;
                if let Some(peer) = peer {
                    write!(f, " on {}", peer)?;
                }
                if let Some(psm) = psm {
                    write!(f, " (PSM {})", psm)?;
                }
                Ok(())
            }
            Self::Rfcomm { address, channel } => match channel {
                Some(ch) => write!(f, "{} channel {}", address, ch),
                None => write!(f, "{}", address),
            },
            Self::Accessory { protocol } => write!(f, "{}", protocol),
        }
    }
}

/// Parse a raw target string into its canonical URL
pub fn parse_url(raw: &str) -> Result<Url> {
    let raw = raw.trim();
    let canonical = canonicalize(raw);
    Url::parse(&canonical).map_err(|e| StreamError::invalid_url(raw, e.to_string()))
}

fn canonicalize(raw: &str) -> Cow<'_, str> {
    let Some((scheme, rest)) = raw.split_once("://") else {
        return Cow::Borrowed(raw);
    };
    let (authority, tail) = match rest.find(|c: char| matches!(c, '/' | '?' | '#')) {
        Some(i) => rest.split_at(i),
        None => (rest, ""),
    };

    if scheme.eq_ignore_ascii_case(SCHEME_RFCOMM) {
        if authority.len() >= HARDWARE_ADDRESS_LEN
            && authority.is_char_boundary(HARDWARE_ADDRESS_LEN)
            && authority[..HARDWARE_ADDRESS_LEN].contains(':')
        {
            let (address, port) = authority.split_at(HARDWARE_ADDRESS_LEN);
            return Cow::Owned(format!(
                "{}://{}{}{}",
                scheme,
                address.replace(':', "-"),
                port,
                tail
            ));
        }
    } else if scheme.eq_ignore_ascii_case(SCHEME_TTY) {
        if let Some((host, baud)) = authority.rsplit_once(':') {
            if !baud.is_empty() && baud.bytes().all(|b| b.is_ascii_digit()) {
                let (before_fragment, fragment) = match tail.find('#') {
                    Some(i) => tail.split_at(i),
                    None => (tail, ""),
                };
                let separator = if before_fragment.contains('?') { '&' } else { '?' };
                return Cow::Owned(format!(
                    "{}://{}{}{}{}={}{}",
                    scheme, host, before_fragment, separator, BAUD_QUERY_KEY, baud, fragment
                ));
            }
        }
    }
    Cow::Borrowed(raw)
}

fn host_of(url: &Url) -> &str {
    url.host_str().unwrap_or("")
}

fn parse_tcp(url: &Url) -> Result<Target> {
    let host = host_of(url);
    if host.is_empty() {
        return Err(StreamError::invalid_url(url.as_str(), "missing host"));
    }
    let port = url
        .port()
        .ok_or_else(|| StreamError::invalid_url(url.as_str(), "missing port"))?;
    Ok(Target::Tcp {
        host: host.trim_start_matches('[').trim_end_matches(']').to_string(),
        port,
    })
}

fn parse_tty(url: &Url) -> Result<Target> {
    let path = url.path();
    if path.is_empty() || path == "/" {
        return Err(StreamError::invalid_url(url.as_str(), "missing device path"));
    }

    let from_query = url
        .query_pairs()
        .find(|(key, _)| key == BAUD_QUERY_KEY)
        .map(|(_, value)| value.into_owned());
    let baud = match from_query {
        Some(value) => Some(value.parse::<u32>().map_err(|_| {
            StreamError::invalid_url(url.as_str(), format!("invalid baud rate '{}'", value))
        })?),
        None => url.port().map(u32::from),
    };
    if baud == Some(0) {
        return Err(StreamError::invalid_url(url.as_str(), "baud rate must be non-zero"));
    }

    Ok(Target::Tty {
        path: PathBuf::from(path),
        baud,
    })
}

/// GATT service ids: 16-bit short form, 6-char form, or a full UUID
pub fn is_valid_service_id(id: &str) -> bool {
    matches!(id.len(), 4 | 6 | 36) && id.chars().all(|c| c.is_ascii_hexdigit() || c == '-')
}

fn parse_ble(url: &Url) -> Result<Target> {
    let service = host_of(url);
    if !is_valid_service_id(service) {
        return Err(StreamError::invalid_url(
            url.as_str(),
            format!("invalid service id '{}'", service),
        ));
    }

    let peer = match url.path().trim_start_matches('/') {
        "" => None,
        id if id.len() == BLE_PEER_ID_LEN => Some(id.to_string()),
        id => {
            return Err(StreamError::invalid_url(
                url.as_str(),
                format!("invalid peer id '{}'", id),
            ))
        }
    };

    Ok(Target::Ble {
        service: service.to_string(),
        peer,
        psm: url.port(),
    })
}

/// Hardware addresses in canonical form: 17 chars of hex and `-`
pub fn is_valid_hardware_address(address: &str) -> bool {
    address.len() == HARDWARE_ADDRESS_LEN
        && address.chars().all(|c| c.is_ascii_hexdigit() || c == '-' || c == ':')
}

fn parse_rfcomm(url: &Url) -> Result<Target> {
    let address = host_of(url);
    if !is_valid_hardware_address(address) {
        return Err(StreamError::invalid_url(
            url.as_str(),
            format!("invalid hardware address '{}'", address),
        ));
    }
    let channel = match url.port() {
        None => None,
        Some(port) => match u8::try_from(port) {
            Ok(ch) if ch > 0 => Some(ch),
            _ => {
                return Err(StreamError::invalid_url(
                    url.as_str(),
                    format!("invalid RFCOMM channel {}", port),
                ))
            }
        },
    };
    Ok(Target::Rfcomm {
        address: address.replace(':', "-"),
        channel,
    })
}

fn parse_accessory(url: &Url) -> Result<Target> {
    let protocol = host_of(url);
    if protocol.is_empty() {
        return Err(StreamError::invalid_url(url.as_str(), "missing accessory protocol"));
    }
    Ok(Target::Accessory {
        protocol: protocol.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn target(raw: &str) -> Result<Target> {
        Target::parse(&parse_url(raw)?)
    }

    #[test]
    fn test_tcp_target() {
        assert_eq!(
            target("tcp://localhost:9000").unwrap(),
            Target::Tcp {
                host: "localhost".into(),
                port: 9000
            }
        );
        assert!(matches!(
            target("tcp://localhost"),
            Err(StreamError::InvalidUrl { .. })
        ));
    }

    #[test]
    fn test_tty_target_without_baud() {
        assert_eq!(
            target("tty:///dev/ttyUSB0").unwrap(),
            Target::Tty {
                path: PathBuf::from("/dev/ttyUSB0"),
                baud: None
            }
        );
    }

    #[test]
    fn test_tty_baud_above_port_range() {
        let url = parse_url("tty://localhost:115200/dev/ttyUSB0").unwrap();
        assert_eq!(url.as_str(), "tty://localhost/dev/ttyUSB0?baud=115200");
        assert_eq!(
            Target::parse(&url).unwrap(),
            Target::Tty {
                path: PathBuf::from("/dev/ttyUSB0"),
                baud: Some(115_200)
            }
        );
    }

    #[test]
    fn test_tty_missing_path() {
        assert!(matches!(
            target("tty://localhost:9600"),
            Err(StreamError::InvalidUrl { .. })
        ));
    }

    #[test]
    fn test_ble_target_variants() {
        assert_eq!(
            target("ble://FFE0").unwrap(),
            Target::Ble {
                service: "FFE0".into(),
                peer: None,
                psm: None
            }
        );

        let peer = "6E400001-B5A3-F393-E0A9-E50E24DCCA9E";
        assert_eq!(
            target(&format!("ble://1234:192/{}", peer)).unwrap(),
            Target::Ble {
                service: "1234".into(),
                peer: Some(peer.into()),
                psm: Some(192)
            }
        );
    }

    #[test]
    fn test_ble_rejects_malformed_ids() {
        for raw in ["ble://123", "ble://12345", "ble://12G4", "ble://1234/short-peer"] {
            assert!(
                matches!(target(raw), Err(StreamError::InvalidUrl { .. })),
                "{} should be rejected",
                raw
            );
        }
    }

    #[test]
    fn test_rfcomm_colon_address_is_canonicalized() {
        let url = parse_url("rfcomm://00:1A:7D:DA:71:13:3").unwrap();
        assert_eq!(url.as_str(), "rfcomm://00-1A-7D-DA-71-13:3");
        assert_eq!(
            Target::parse(&url).unwrap(),
            Target::Rfcomm {
                address: "00-1A-7D-DA-71-13".into(),
                channel: Some(3)
            }
        );
    }

    #[test]
    fn test_rfcomm_rejects_bad_address_and_channel() {
        assert!(target("rfcomm://00-1A-7D-DA-71").is_err());
        assert!(target("rfcomm://00-1A-7D-DA-71-ZZ").is_err());
        assert!(target("rfcomm://00-1A-7D-DA-71-13:0").is_err());
        assert!(target("rfcomm://00-1A-7D-DA-71-13:300").is_err());
    }

    #[test]
    fn test_accessory_target() {
        assert_eq!(
            target("ea://com.example.obd").unwrap(),
            Target::Accessory {
                protocol: "com.example.obd".into()
            }
        );
    }

    #[test]
    fn test_unknown_scheme() {
        assert!(matches!(
            target("gopher://example.com:70"),
            Err(StreamError::UnsupportedScheme { scheme }) if scheme == "gopher"
        ));
    }

    #[test]
    fn test_garbage_is_invalid_url() {
        assert!(matches!(
            parse_url("not a url"),
            Err(StreamError::InvalidUrl { .. })
        ));
    }

    proptest! {
        #[test]
        fn prop_short_hex_service_ids_are_valid(id in "[0-9a-fA-F]{4}") {
            let raw = format!("ble://{}", id);
            prop_assert!(target(&raw).is_ok());
        }

        #[test]
        fn prop_service_ids_with_wrong_length_are_rejected(id in "[0-9a-f]{1,40}") {
            prop_assume!(![4, 6, 36].contains(&id.len()));
            prop_assert!(!is_valid_service_id(&id));
        }

        #[test]
        fn prop_non_hex_service_ids_are_rejected(id in "[0-9a-f]{3}[g-z]") {
            prop_assert!(!is_valid_service_id(&id));
        }

        #[test]
        fn prop_colon_addresses_parse(bytes in proptest::array::uniform6(any::<u8>())) {
            let address = bytes
                .iter()
                .map(|b| format!("{:02X}", b))
                .collect::<Vec<_>>()
                .join(":");
            let parsed = target(&format!("rfcomm://{}", address)).unwrap();
            prop_assert_eq!(
                parsed,
                Target::Rfcomm { address: address.replace(':', "-"), channel: None }
            );
        }
    }
}
