use std::path::PathBuf;

use native_tls::{Identity, Protocol, TlsConnector};

use crate::error::Error;

/// TLS trust strategy for a client obtained from the agent.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TrustMode {
    /// Standard certificate validation and hostname verification.
    None,
    /// Accepts any certificate chain without validation and skips
    /// hostname verification. The handshake still encrypts, but no
    /// identity guarantee is made. Exists for trusted internal
    /// endpoints; must never be the default.
    TrustAll,
    /// Mutual TLS. Loads a PKCS#12 keystore from `keystore_path` with
    /// `password`. The negotiated protocol is pinned to TLS 1.0 for
    /// compatibility with the legacy target server.
    Mutual {
        keystore_path: PathBuf,
        password: String,
    },
}

impl TrustMode {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::TrustAll => "trust_all",
            Self::Mutual { .. } => "mutual",
        }
    }
}

impl std::fmt::Display for TrustMode {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(self.as_str())
    }
}

fn tls_config_error(message: impl Into<String>) -> Error {
    Error::TlsConfig {
        message: message.into(),
    }
}

/// Builds the connector for a trust mode. Keystore problems (missing
/// file, bad password, corrupt archive) surface here, at client
/// construction, and are never retried.
pub(crate) fn build_connector(mode: &TrustMode) -> Result<TlsConnector, Error> {
    let mut builder = TlsConnector::builder();

    match mode {
        TrustMode::None => {}
        TrustMode::TrustAll => {
            builder.danger_accept_invalid_certs(true);
            builder.danger_accept_invalid_hostnames(true);
        }
        TrustMode::Mutual {
            keystore_path,
            password,
        } => {
            let keystore = std::fs::read(keystore_path).map_err(|source| {
                tls_config_error(format!(
                    "failed to read PKCS#12 keystore {}: {source}",
                    keystore_path.display()
                ))
            })?;
            let identity = Identity::from_pkcs12(&keystore, password).map_err(|source| {
                tls_config_error(format!(
                    "failed to load PKCS#12 keystore {}: {source}",
                    keystore_path.display()
                ))
            })?;
            builder.identity(identity);
            builder.min_protocol_version(Some(Protocol::Tlsv10));
            builder.max_protocol_version(Some(Protocol::Tlsv10));
        }
    }

    builder
        .build()
        .map_err(|source| tls_config_error(format!("failed to build tls connector: {source}")))
}

#[cfg(test)]
mod tests {
    use super::{TrustMode, build_connector};
    use crate::error::Error;

    #[test]
    fn standard_and_trust_all_connectors_build() {
        build_connector(&TrustMode::None).expect("standard connector builds");
        build_connector(&TrustMode::TrustAll).expect("trust-all connector builds");
    }

    #[test]
    fn missing_keystore_is_fatal_tls_config_error() {
        let mode = TrustMode::Mutual {
            keystore_path: "/nonexistent/client.p12".into(),
            password: "secret".to_owned(),
        };
        let error = build_connector(&mode).expect_err("missing keystore must fail");
        assert!(matches!(error, Error::TlsConfig { .. }));
    }

    #[test]
    fn corrupt_keystore_is_fatal_tls_config_error() {
        let dir = std::env::temp_dir().join("outcall-tls-test");
        std::fs::create_dir_all(&dir).expect("create temp dir");
        let keystore_path = dir.join("corrupt.p12");
        std::fs::write(&keystore_path, [0x30, 0x82, 0x01, 0x02]).expect("write junk keystore");

        let mode = TrustMode::Mutual {
            keystore_path,
            password: "secret".to_owned(),
        };
        let error = build_connector(&mode).expect_err("corrupt keystore must fail");
        assert!(matches!(error, Error::TlsConfig { .. }));
    }
}
