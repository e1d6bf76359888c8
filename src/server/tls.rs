use std::{
    fs::File,
    io::BufReader,
    path::{Path, PathBuf},
    sync::Arc,
};

use rustls::{
    ServerConfig,
    pki_types::{CertificateDer, PrivateKeyDer},
};
use tokio_rustls::TlsAcceptor;

use crate::{config::ConfigError, server::BindError};

/// Certificate chain and private key for terminating TLS on the listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsMaterial {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

impl TlsMaterial {
    /// Both paths or neither; exactly one is a configuration error.
    pub fn from_paths(
        cert_path: Option<PathBuf>,
        key_path: Option<PathBuf>,
    ) -> Result<Option<Self>, ConfigError> {
        match (cert_path, key_path) {
            (Some(cert_path), Some(key_path)) => Ok(Some(Self {
                cert_path,
                key_path,
            })),
            (None, None) => Ok(None),
            (Some(_), None) => Err(ConfigError::IncompleteTls {
                present: "certificate",
            }),
            (None, Some(_)) => Err(ConfigError::IncompleteTls { present: "key" }),
        }
    }

    /// Read the PEM files and build an acceptor advertising `h2` and
    /// `http/1.1` through ALPN.
    pub fn load_acceptor(&self) -> Result<TlsAcceptor, BindError> {
        // Install default crypto provider for rustls if not already set
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

        let certs = load_certs(&self.cert_path)?;
        let key = load_private_key(&self.key_path)?;

        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| BindError::Tls(format!("invalid certificate/key pair: {e}")))?;
        config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

        Ok(TlsAcceptor::from(Arc::new(config)))
    }
}

fn open(path: &Path, what: &str) -> Result<BufReader<File>, BindError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|e| BindError::Tls(format!("failed to open {what} file {}: {e}", path.display())))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, BindError> {
    let mut reader = open(path, "certificate")?;
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| BindError::Tls(format!("failed to parse {}: {e}", path.display())))?;

    if certs.is_empty() {
        return Err(BindError::Tls(format!(
            "no certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

/// First PKCS#1, PKCS#8 or SEC1 key in the file.
fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, BindError> {
    let mut reader = open(path, "key")?;
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| BindError::Tls(format!("failed to parse {}: {e}", path.display())))?
        .ok_or_else(|| BindError::Tls(format!("no private key found in {}", path.display())))
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::NamedTempFile;

    use super::*;

    fn pem_files() -> (NamedTempFile, NamedTempFile) {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();

        let mut cert_file = NamedTempFile::with_suffix(".pem").unwrap();
        cert_file.write_all(cert.cert.pem().as_bytes()).unwrap();
        let mut key_file = NamedTempFile::with_suffix(".pem").unwrap();
        key_file
            .write_all(cert.signing_key.serialize_pem().as_bytes())
            .unwrap();

        (cert_file, key_file)
    }

    #[test]
    fn test_both_or_neither() {
        assert_eq!(TlsMaterial::from_paths(None, None).unwrap(), None);
        assert!(
            TlsMaterial::from_paths(Some("c.pem".into()), Some("k.pem".into()))
                .unwrap()
                .is_some()
        );

        let err = TlsMaterial::from_paths(Some("c.pem".into()), None).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::IncompleteTls {
                present: "certificate"
            }
        ));
        let err = TlsMaterial::from_paths(None, Some("k.pem".into())).unwrap_err();
        assert!(matches!(err, ConfigError::IncompleteTls { present: "key" }));
    }

    #[test]
    fn test_load_acceptor_from_pem() {
        let (cert_file, key_file) = pem_files();
        let material = TlsMaterial {
            cert_path: cert_file.path().to_path_buf(),
            key_path: key_file.path().to_path_buf(),
        };
        assert!(material.load_acceptor().is_ok());
    }

    #[test]
    fn test_missing_files_are_tls_errors() {
        let material = TlsMaterial {
            cert_path: "/nonexistent/cert.pem".into(),
            key_path: "/nonexistent/key.pem".into(),
        };
        let Err(err) = material.load_acceptor() else {
            panic!("expected a TLS error");
        };
        assert!(matches!(err, BindError::Tls(_)));
        assert!(err.to_string().contains("/nonexistent/cert.pem"));
    }

    #[test]
    fn test_key_file_without_key() {
        let (cert_file, _key_file) = pem_files();
        let material = TlsMaterial {
            cert_path: cert_file.path().to_path_buf(),
            key_path: cert_file.path().to_path_buf(),
        };
        let Err(err) = material.load_acceptor() else {
            panic!("expected a TLS error");
        };
        assert!(err.to_string().contains("no private key"));
    }
}
