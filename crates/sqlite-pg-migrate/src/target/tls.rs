//! TLS for target connections.
//!
//! tokio-postgres only understands `disable`, `prefer` and `require`, so the
//! `sslmode` parameter is lifted out of the DSN here and the rustls connector
//! is chosen from it.

use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{ring, verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio_postgres_rustls::MakeRustlsConnect;
use tracing::{debug, warn};

use crate::error::{MigrateError, Result};

/// PostgreSQL `sslmode` values, collapsed to what the connector can honour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SslMode {
    /// Plain TCP (`disable`, `allow`).
    #[default]
    Disable,
    /// Encrypted when the server offers TLS, plain TCP otherwise. The
    /// certificate is not checked.
    Prefer,
    /// Encrypted, certificate not checked.
    Require,
    /// Certificate checked against the web PKI roots.
    VerifyCa,
    /// Certificate and host name checked.
    VerifyFull,
}

impl SslMode {
    pub fn parse(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "" | "disable" | "allow" => Ok(SslMode::Disable),
            "prefer" => Ok(SslMode::Prefer),
            "require" => Ok(SslMode::Require),
            "verify-ca" => Ok(SslMode::VerifyCa),
            "verify-full" => Ok(SslMode::VerifyFull),
            other => Err(MigrateError::Config(format!(
                "unknown sslmode '{}', expected disable, prefer, require, verify-ca or verify-full",
                other
            ))),
        }
    }

    /// The mode tokio-postgres negotiates with. Only `prefer` may fall back
    /// to plain TCP.
    pub(crate) fn wire_mode(self) -> tokio_postgres::config::SslMode {
        match self {
            SslMode::Disable => tokio_postgres::config::SslMode::Disable,
            SslMode::Prefer => tokio_postgres::config::SslMode::Prefer,
            SslMode::Require | SslMode::VerifyCa | SslMode::VerifyFull => {
                tokio_postgres::config::SslMode::Require
            }
        }
    }
}

/// Remove `sslmode` from a DSN, returning the remaining DSN and the mode.
///
/// Handles the key/value and URL forms. No `sslmode` means [`SslMode::Disable`].
pub fn split_ssl_mode(dsn: &str) -> Result<(String, SslMode)> {
    let dsn = dsn.trim();
    let mut found = None;
    let mut take = |key: &str, value: &str| {
        if key.eq_ignore_ascii_case("sslmode") {
            found = Some(value.trim_matches('\'').to_string());
            false
        } else {
            true
        }
    };

    let rest = if dsn.starts_with("postgres://") || dsn.starts_with("postgresql://") {
        match dsn.split_once('?') {
            None => dsn.to_string(),
            Some((base, query)) => {
                let params: Vec<&str> = query
                    .split('&')
                    .filter(|p| p.split_once('=').map_or(true, |(k, v)| take(k, v)))
                    .collect();
                if params.is_empty() {
                    base.to_string()
                } else {
                    format!("{}?{}", base, params.join("&"))
                }
            }
        }
    } else {
        kv_tokens(dsn)
            .into_iter()
            .filter(|t| t.split_once('=').map_or(true, |(k, v)| take(k, v)))
            .collect::<Vec<_>>()
            .join(" ")
    };

    let mode = found.as_deref().map(SslMode::parse).transpose()?;
    Ok((rest, mode.unwrap_or_default()))
}

/// Split a key/value DSN on whitespace, keeping single-quoted values whole.
pub(crate) fn kv_tokens(dsn: &str) -> Vec<&str> {
    let mut tokens = Vec::new();
    let mut start = None;
    let mut quoted = false;
    let mut escaped = false;

    for (i, c) in dsn.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            c if c.is_whitespace() && !quoted => {
                if let Some(s) = start.take() {
                    tokens.push(&dsn[s..i]);
                }
            }
            '\\' => {
                escaped = true;
                start.get_or_insert(i);
            }
            '\'' => {
                quoted = !quoted;
                start.get_or_insert(i);
            }
            _ => {
                start.get_or_insert(i);
            }
        }
    }
    if let Some(s) = start {
        tokens.push(&dsn[s..]);
    }
    tokens
}

/// Connector for `mode`, or `None` for plain TCP.
pub fn connector(mode: SslMode) -> Result<Option<MakeRustlsConnect>> {
    if mode == SslMode::Disable {
        return Ok(None);
    }

    let provider = Arc::new(ring::default_provider());
    let builder = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(|e| MigrateError::Config(format!("TLS setup failed: {}", e)))?;

    let config = match mode {
        SslMode::Prefer | SslMode::Require => {
            warn!(
                "sslmode={:?}: the server certificate is not checked",
                mode
            );
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(EncryptOnly { provider }))
                .with_no_client_auth()
        }
        SslMode::Disable | SslMode::VerifyCa | SslMode::VerifyFull => {
            debug!("sslmode={:?}: verifying server certificate", mode);
            let mut roots = RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            builder.with_root_certificates(roots).with_no_client_auth()
        }
    };

    Ok(Some(MakeRustlsConnect::new(config)))
}

/// Accepts any server certificate but still checks handshake signatures.
#[derive(Debug)]
struct EncryptOnly {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for EncryptOnly {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_modes() {
        assert_eq!(SslMode::parse("allow").unwrap(), SslMode::Disable);
        assert_eq!(SslMode::parse("PREFER").unwrap(), SslMode::Prefer);
        assert_eq!(SslMode::parse("require").unwrap(), SslMode::Require);
        assert_eq!(SslMode::parse("verify-ca").unwrap(), SslMode::VerifyCa);
        assert_eq!(SslMode::parse("verify-full").unwrap(), SslMode::VerifyFull);
        assert!(SslMode::parse("strict").is_err());
    }

    #[test]
    fn test_split_key_value_dsn() {
        let (dsn, mode) = split_ssl_mode("host=db sslmode=verify-full dbname=shop").unwrap();
        assert_eq!(dsn, "host=db dbname=shop");
        assert_eq!(mode, SslMode::VerifyFull);

        let (dsn, mode) = split_ssl_mode("host=db dbname=shop").unwrap();
        assert_eq!(dsn, "host=db dbname=shop");
        assert_eq!(mode, SslMode::Disable);
    }

    #[test]
    fn test_split_url_dsn() {
        let (dsn, mode) =
            split_ssl_mode("postgres://app:pw@db/shop?sslmode=require&connect_timeout=5").unwrap();
        assert_eq!(dsn, "postgres://app:pw@db/shop?connect_timeout=5");
        assert_eq!(mode, SslMode::Require);

        let (dsn, _) = split_ssl_mode("postgresql://db/shop?sslmode=disable").unwrap();
        assert_eq!(dsn, "postgresql://db/shop");
    }

    #[test]
    fn test_split_keeps_quoted_values() {
        let (dsn, mode) =
            split_ssl_mode("host=db password='a  b\\' c' sslmode=require dbname=shop").unwrap();
        assert_eq!(dsn, "host=db password='a  b\\' c' dbname=shop");
        assert_eq!(mode, SslMode::Require);
    }

    #[test]
    fn test_only_prefer_may_fall_back() {
        use tokio_postgres::config::SslMode as Wire;
        assert_eq!(SslMode::Prefer.wire_mode(), Wire::Prefer);
        assert_eq!(SslMode::Require.wire_mode(), Wire::Require);
        assert_eq!(SslMode::VerifyFull.wire_mode(), Wire::Require);
        assert_eq!(SslMode::Disable.wire_mode(), Wire::Disable);
    }

    #[test]
    fn test_split_rejects_unknown_mode() {
        assert!(split_ssl_mode("host=db sslmode=maybe").is_err());
    }

    #[test]
    fn test_connector_per_mode() {
        assert!(connector(SslMode::Disable).unwrap().is_none());
        assert!(connector(SslMode::Prefer).unwrap().is_some());
        assert!(connector(SslMode::Require).unwrap().is_some());
        assert!(connector(SslMode::VerifyFull).unwrap().is_some());
    }
}
