use std::fs::File;
use std::io::{self, BufReader, ErrorKind};
use std::sync::Arc;

use pgwire::tokio::TlsAcceptor;
use pgwire::tokio::tokio_rustls::rustls::ServerConfig as RustlsConfig;

use crate::config::ServerConfig;

/// TLS acceptor from the configured PEM files, or `None` when TLS is off.
pub fn acceptor_from_config(config: &ServerConfig) -> io::Result<Option<TlsAcceptor>> {
    let (cert_path, key_path) = match (config.tls_cert.as_deref(), config.tls_key.as_deref()) {
        (None, None) => return Ok(None),
        (Some(c), Some(k)) => (c, k),
        _ => {
            return Err(io::Error::new(
                ErrorKind::InvalidInput,
                "both STUDIOSLOT_TLS_CERT and STUDIOSLOT_TLS_KEY must be set, or neither",
            ));
        }
    };

    let certs: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(File::open(cert_path)?))
        .collect::<Result<_, _>>()?;
    if certs.is_empty() {
        return Err(io::Error::new(
            ErrorKind::InvalidInput,
            format!("no certificates in {cert_path}"),
        ));
    }
    let key = rustls_pemfile::private_key(&mut BufReader::new(File::open(key_path)?))?
        .ok_or_else(|| {
            io::Error::new(ErrorKind::InvalidInput, format!("no private key in {key_path}"))
        })?;

    let mut tls = RustlsConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| io::Error::new(ErrorKind::InvalidInput, e))?;
    tls.alpn_protocols = vec![b"postgresql".to_vec()];

    Ok(Some(TlsAcceptor::from(Arc::new(tls))))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_without_paths() {
        let config = ServerConfig::default();
        assert!(acceptor_from_config(&config).unwrap().is_none());
    }

    #[test]
    fn half_configured_is_an_error() {
        let config = ServerConfig { tls_cert: Some("cert.pem".into()), ..ServerConfig::default() };
        let err = acceptor_from_config(&config).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }

    #[test]
    fn missing_files_are_reported() {
        let dir = std::env::temp_dir().join("studioslot_test_tls_missing");
        let config = ServerConfig {
            tls_cert: Some(dir.join("cert.pem").display().to_string()),
            tls_key: Some(dir.join("key.pem").display().to_string()),
            ..ServerConfig::default()
        };
        let err = acceptor_from_config(&config).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}
