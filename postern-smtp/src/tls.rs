//! TLS material loading.
//!
//! The session asks a [`TlsMaterialProvider`] for certificate and key
//! material on every STARTTLS, so providers may reload from disk (picking
//! up rotated certificates) or cache internally.

use std::{fmt, fs::File, io::BufReader, path::PathBuf, sync::Arc};

use tokio_rustls::rustls::{
    pki_types::{CertificateDer, PrivateKeyDer},
    ServerConfig,
};

use crate::error::{TlsError, TlsResult};

pub trait TlsMaterialProvider: Send + Sync + fmt::Debug {
    fn load(&self) -> TlsResult<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)>;
}

/// Build the rustls server configuration for one STARTTLS upgrade.
pub(crate) fn server_config(
    provider: &dyn TlsMaterialProvider,
) -> TlsResult<Arc<ServerConfig>> {
    let (certs, key) = provider.load()?;
    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    Ok(Arc::new(config))
}

/// Loads PEM-encoded certificate chain and private key from disk on each
/// upgrade.
#[derive(Debug, Clone)]
pub struct FilePemProvider {
    pub certificate: PathBuf,
    pub key: PathBuf,
}

impl FilePemProvider {
    pub fn new(certificate: impl Into<PathBuf>, key: impl Into<PathBuf>) -> Self {
        Self {
            certificate: certificate.into(),
            key: key.into(),
        }
    }

    fn load_certs(&self) -> TlsResult<Vec<CertificateDer<'static>>> {
        let file = File::open(&self.certificate).map_err(|e| TlsError::CertificateLoad {
            path: self.certificate.display().to_string(),
            source: e,
        })?;
        rustls_pemfile::certs(&mut BufReader::new(file))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| TlsError::CertificateLoad {
                path: self.certificate.display().to_string(),
                source: e,
            })
    }

    fn load_key(&self) -> TlsResult<PrivateKeyDer<'static>> {
        let path_str = self.key.display().to_string();
        let mut reader =
            BufReader::new(File::open(&self.key).map_err(|e| TlsError::KeyLoad {
                path: path_str.clone(),
                reason: e.to_string(),
            })?);

        match rustls_pemfile::read_one(&mut reader).map_err(|e| TlsError::KeyLoad {
            path: path_str.clone(),
            reason: e.to_string(),
        })? {
            Some(rustls_pemfile::Item::Pkcs1Key(key)) => Ok(PrivateKeyDer::Pkcs1(key)),
            Some(rustls_pemfile::Item::Pkcs8Key(key)) => Ok(PrivateKeyDer::Pkcs8(key)),
            Some(rustls_pemfile::Item::Sec1Key(key)) => Ok(PrivateKeyDer::Sec1(key)),
            _ => Err(TlsError::KeyLoad {
                path: path_str,
                reason: "Unable to determine key file format (expected PKCS1, PKCS8, or SEC1)"
                    .to_string(),
            }),
        }
    }
}

impl TlsMaterialProvider for FilePemProvider {
    fn load(&self) -> TlsResult<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
        Ok((self.load_certs()?, self.load_key()?))
    }
}
