//! Connection parameters exchanged in INIT frames.
//!
//! Once a side has verified its peer it sends an INIT carrying its protocol
//! version and whether it is willing to compress. The client additionally
//! names the definitions module the server should dispatch against and,
//! optionally, how often the server should send keep-alives.

use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, Result};

/// Current protocol version, `major.minor`.
pub const PROTOCOL_VERSION: &str = "1.0";

/// Payload of an INIT frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct InitInfo {
    /// Sender's protocol version.
    pub version: String,
    /// Definitions module to dispatch against (client to server only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub definitions_module: Option<String>,
    /// Seconds between server keep-alives (client to server only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keep_alive_interval: Option<u64>,
    /// Sender is willing to receive compressed record frames.
    #[serde(default)]
    pub enable_compression: bool,
}

impl InitInfo {
    /// INIT for the server side.
    pub fn server(enable_compression: bool) -> Self {
        Self {
            version: PROTOCOL_VERSION.to_string(),
            definitions_module: None,
            keep_alive_interval: None,
            enable_compression,
        }
    }

    /// INIT for the client side.
    pub fn client(
        definitions_module: impl Into<String>,
        keep_alive_interval: Option<u64>,
        enable_compression: bool,
    ) -> Self {
        Self {
            version: PROTOCOL_VERSION.to_string(),
            definitions_module: Some(definitions_module.into()),
            keep_alive_interval,
            enable_compression,
        }
    }

    /// Fails unless the sender's version shares our major component.
    pub fn check_version(&self) -> Result<()> {
        if is_compatible(&self.version) {
            Ok(())
        } else {
            Err(ProtocolError::HandshakeFailed(format!(
                "Incompatible protocol version: peer has version {}, we have version {}",
                self.version, PROTOCOL_VERSION
            )))
        }
    }
}

/// Returns true when `version` has the same major component as
/// [`PROTOCOL_VERSION`].
pub fn is_compatible(version: &str) -> bool {
    fn major(v: &str) -> Option<u32> {
        v.split('.').next()?.trim().parse().ok()
    }
    match (major(version), major(PROTOCOL_VERSION)) {
        (Some(theirs), Some(ours)) => theirs == ours,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_init_fields() {
        let init = InitInfo::client("remote_code", Some(30), true);
        assert_eq!(init.version, PROTOCOL_VERSION);
        assert_eq!(init.definitions_module.as_deref(), Some("remote_code"));
        assert_eq!(init.keep_alive_interval, Some(30));
        assert!(init.enable_compression);
    }

    #[test]
    fn test_server_init_omits_client_fields() {
        let json = serde_json::to_value(InitInfo::server(false)).unwrap();
        assert!(json.get("definitions-module").is_none());
        assert!(json.get("keep-alive-interval").is_none());
        assert_eq!(json["enable-compression"], false);
    }

    #[test]
    fn test_missing_optional_fields_default() {
        let init: InitInfo = serde_json::from_str(r#"{"version":"1.3"}"#).unwrap();
        assert_eq!(init.definitions_module, None);
        assert!(!init.enable_compression);
        assert!(init.check_version().is_ok());
    }

    #[test]
    fn test_msgpack_roundtrip() {
        let init = InitInfo::client("mod", None, false);
        let bytes = rmp_serde::to_vec_named(&init).unwrap();
        let decoded: InitInfo = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(decoded, init);
    }

    #[test]
    fn test_version_compatibility() {
        assert!(is_compatible("1.0"));
        assert!(is_compatible("1.7"));
        assert!(!is_compatible("2.0"));
        assert!(!is_compatible("0.22.2"));
        assert!(!is_compatible("garbage"));
    }

    #[test]
    fn test_incompatible_version_message() {
        let init = InitInfo {
            version: "2.1".to_string(),
            ..InitInfo::server(false)
        };
        let err = init.check_version().unwrap_err();
        assert!(err.to_string().contains("Incompatible protocol version"));
    }
}
