use std::fmt;
use std::str::FromStr;

use crate::error::{DeviceError, Result};

/// Where to find an AMBE device.
///
/// `usb:/dev/ttyUSB0` names a locally attached dongle; `tcp:host:port`
/// names a sharing server. The scheme is matched case-insensitively and the
/// authority is everything after the first colon, verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceUri {
    Usb { path: String },
    Tcp { authority: String },
}

impl DeviceUri {
    pub fn parse(uri: &str) -> Result<Self> {
        if uri.is_empty() {
            return Err(DeviceError::InvalidUri {
                uri: uri.to_string(),
                reason: "URI must not be empty",
            });
        }

        let Some((scheme, authority)) = uri.split_once(':') else {
            return Err(DeviceError::InvalidUri {
                uri: uri.to_string(),
                reason: "expected <scheme>:<authority>",
            });
        };

        match scheme.to_ascii_lowercase().as_str() {
            "usb" => Ok(DeviceUri::Usb {
                path: authority.to_string(),
            }),
            "tcp" => Ok(DeviceUri::Tcp {
                authority: authority.to_string(),
            }),
            _ => Err(DeviceError::InvalidUri {
                uri: uri.to_string(),
                reason: "unknown scheme (expected 'usb' or 'tcp')",
            }),
        }
    }
}

impl FromStr for DeviceUri {
    type Err = DeviceError;

    fn from_str(uri: &str) -> Result<Self> {
        DeviceUri::parse(uri)
    }
}

impl fmt::Display for DeviceUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceUri::Usb { path } => write!(f, "usb:{path}"),
            DeviceUri::Tcp { authority } => write!(f, "tcp:{authority}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_usb_and_tcp() {
        assert_eq!(
            DeviceUri::parse("usb:/dev/ttyUSB0").unwrap(),
            DeviceUri::Usb {
                path: "/dev/ttyUSB0".to_string()
            }
        );
        assert_eq!(
            DeviceUri::parse("tcp:127.0.0.1:50051").unwrap(),
            DeviceUri::Tcp {
                authority: "127.0.0.1:50051".to_string()
            }
        );
    }

    #[test]
    fn scheme_is_case_insensitive() {
        assert_eq!(
            DeviceUri::parse("USB:/dev/ttyUSB1").unwrap(),
            DeviceUri::Usb {
                path: "/dev/ttyUSB1".to_string()
            }
        );
    }

    #[test]
    fn authority_keeps_embedded_colons() {
        let uri = DeviceUri::parse("tcp:[::1]:50051").unwrap();
        assert_eq!(
            uri,
            DeviceUri::Tcp {
                authority: "[::1]:50051".to_string()
            }
        );
    }

    #[test]
    fn rejects_malformed_uris() {
        for bad in ["", "no-colon", "serial:/dev/ttyUSB0"] {
            assert!(matches!(
                DeviceUri::parse(bad),
                Err(DeviceError::InvalidUri { .. })
            ));
        }
    }

    #[test]
    fn display_round_trips() {
        for uri in ["usb:/dev/ttyUSB0", "tcp:localhost:50051"] {
            assert_eq!(DeviceUri::parse(uri).unwrap().to_string(), uri);
        }
    }
}
