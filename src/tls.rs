//! TLS for LDAPS and StartTLS: PEM certificate and key files into a TlsAcceptor.

use anyhow::{bail, Context, Result};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls_pemfile::{certs, pkcs8_private_keys, rsa_private_keys};
use std::fs;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;

use crate::config::TlsConfig;

/// Build a rustls ServerConfig from PEM certificate and key file paths.
pub fn load_server_config_from_files(cert_file: &str, key_file: &str) -> Result<Arc<rustls::ServerConfig>> {
    let certs = load_certs_from_file(cert_file)?;
    let key = load_private_key_from_file(key_file)?;
    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("Build ServerConfig from cert and key")?;
    Ok(Arc::new(config))
}

fn load_certs_from_file(path: &str) -> Result<Vec<CertificateDer<'static>>> {
    let file = fs::File::open(path).with_context(|| format!("Open cert file: {}", path))?;
    let mut reader = BufReader::new(file);
    let certs: Vec<CertificateDer<'static>> = certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .context("Parse PEM certificates")?;
    if certs.is_empty() {
        bail!("No certificates found in {}", path);
    }
    Ok(certs)
}

fn load_private_key_from_file(path: &str) -> Result<PrivateKeyDer<'static>> {
    let pem = fs::read(path).with_context(|| format!("Open key file: {}", path))?;
    let pkcs8: Vec<_> = pkcs8_private_keys(&mut pem.as_slice())
        .collect::<Result<Vec<_>, _>>()
        .context("Parse PEM PKCS8 keys")?;
    if let Some(key) = pkcs8.into_iter().next() {
        return Ok(key.into());
    }
    let rsa: Vec<_> = rsa_private_keys(&mut pem.as_slice())
        .collect::<Result<Vec<_>, _>>()
        .context("Parse PEM RSA keys")?;
    rsa.into_iter()
        .next()
        .map(Into::into)
        .ok_or_else(|| anyhow::anyhow!("No private key found in {}", path))
}

/// Acceptor for the `tls` config section. The CA file, when set, must exist;
/// client certificates are not requested.
pub fn acceptor(config: &TlsConfig) -> Result<TlsAcceptor> {
    let (Some(cert_file), Some(key_file)) = (config.cert_file.as_deref(), config.key_file.as_deref()) else {
        bail!("TLS requires tls.cert_file and tls.key_file");
    };
    if let Some(ca) = config.ca_file.as_deref() {
        if !Path::new(ca).exists() {
            bail!("TLS CA file not found: {}", ca);
        }
    }
    let server_config = load_server_config_from_files(cert_file, key_file)?;
    Ok(TlsAcceptor::from(server_config))
}
