use std::fs::File;
use std::io::{self, BufReader, ErrorKind};
use std::sync::Arc;

use pgwire::tokio::TlsAcceptor;
use pgwire::tokio::tokio_rustls::rustls::ServerConfig;
use pgwire::tokio::tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tracing::info;

use crate::config::Config;

/// TLS acceptor for the configured certificate and key, or `None` when
/// neither `KITBOOK_TLS_CERT` nor `KITBOOK_TLS_KEY` is set.
pub fn load_tls_acceptor(config: &Config) -> io::Result<Option<TlsAcceptor>> {
    let Some((cert_path, key_path)) = tls_paths(config)? else {
        info!("TLS disabled, accepting plaintext connections");
        return Ok(None);
    };

    let certs = read_certs(cert_path)?;
    let key = read_key(key_path)?;
    let chain_len = certs.len();

    let mut server = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| io::Error::new(ErrorKind::InvalidInput, format!("{cert_path}: {e}")))?;
    server.alpn_protocols = vec![b"postgresql".to_vec()];

    info!(cert = cert_path, chain_len, "TLS enabled");
    Ok(Some(TlsAcceptor::from(Arc::new(server))))
}

fn tls_paths(config: &Config) -> io::Result<Option<(&str, &str)>> {
    match (config.tls_cert.as_deref(), config.tls_key.as_deref()) {
        (None, None) => Ok(None),
        (Some(cert), Some(key)) => Ok(Some((cert, key))),
        _ => Err(io::Error::new(
            ErrorKind::InvalidInput,
            "both KITBOOK_TLS_CERT and KITBOOK_TLS_KEY must be set, or neither",
        )),
    }
}

fn open(path: &str) -> io::Result<BufReader<File>> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|e| io::Error::new(e.kind(), format!("{path}: {e}")))
}

fn read_certs(path: &str) -> io::Result<Vec<CertificateDer<'static>>> {
    let certs: Vec<_> = rustls_pemfile::certs(&mut open(path)?).collect::<Result<_, _>>()?;
    if certs.is_empty() {
        return Err(io::Error::new(
            ErrorKind::InvalidData,
            format!("{path}: no certificates found"),
        ));
    }
    Ok(certs)
}

fn read_key(path: &str) -> io::Result<PrivateKeyDer<'static>> {
    rustls_pemfile::private_key(&mut open(path)?)?.ok_or_else(|| {
        io::Error::new(ErrorKind::InvalidData, format!("{path}: no private key found"))
    })
}
