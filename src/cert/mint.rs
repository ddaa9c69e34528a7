use super::ca::CertificateAuthority;
use super::{CertError, CertResult};
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

/// A leaf certificate minted for one intercepted host, along with the key
/// pair it was signed with.
#[derive(Clone)]
pub struct MintedCertificate {
    pub cert_der: CertificateDer<'static>,
    pub key_der: Arc<PrivateKeyDer<'static>>,
    pub pem_cert: String,
    pub pem_key: String,
}

/// Mints per-host leaf certificates signed by a [`CertificateAuthority`],
/// backed by a `<host>.pub` / `<host>.csr` / `<host>.pem` file cache.
///
/// The three files are produced idempotently and in order; a process-wide
/// lock serializes the pipeline the way the upstream `threading.Lock()`
/// serializes concurrent calls to `gen_ca_signed_certificate` so that two
/// connections racing to intercept the same host don't mint conflicting
/// certificates.
pub struct CertMint {
    ca: CertificateAuthority,
    cache_dir: PathBuf,
    lock: Mutex<()>,
}

impl CertMint {
    pub fn new(ca: CertificateAuthority, cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            ca,
            cache_dir: cache_dir.into(),
            lock: Mutex::new(()),
        }
    }

    fn pub_path(&self, host: &str) -> PathBuf {
        self.cache_dir.join(format!("{host}.pub"))
    }

    fn csr_path(&self, host: &str) -> PathBuf {
        self.cache_dir.join(format!("{host}.csr"))
    }

    fn pem_path(&self, host: &str) -> PathBuf {
        self.cache_dir.join(format!("{host}.pem"))
    }

    pub fn root_certificate_pem(&self) -> String {
        self.ca.get_root_certificate_pem()
    }

    /// Mint (or reuse a cached) leaf certificate for `host`. `peer_cert`, when
    /// present, is the certificate the real upstream server presented; its
    /// subject fields seed the minted leaf's distinguished name the way the
    /// upstream implementation copies the intercepted server's subject.
    pub async fn mint(
        &self,
        host: &str,
        peer_cert: Option<&CertificateDer<'static>>,
        connection_id: Uuid,
    ) -> CertResult<MintedCertificate> {
        let _guard = self.lock.lock().await;
        fs::create_dir_all(&self.cache_dir).await?;

        let key_pem = self.ensure_keypair(host).await?;
        let key_pair = KeyPair::from_pem(&key_pem)?;

        let mut params = CertificateParams::new(vec![host.to_string()])?;
        params.distinguished_name = build_distinguished_name(host, peer_cert);

        self.ensure_csr(host, &params, &key_pair).await?;
        let pem_cert = self.ensure_signed(host, params, &key_pair, connection_id).await?;

        let cert_der = pem_to_der(&pem_cert)?;
        let key_der = PrivateKeyDer::try_from(key_pair.serialize_der()).map_err(|_| CertError::InvalidFormat)?;

        Ok(MintedCertificate {
            cert_der,
            key_der: Arc::new(key_der),
            pem_cert,
            pem_key: key_pem,
        })
    }

    async fn ensure_keypair(&self, host: &str) -> CertResult<String> {
        let path = self.pub_path(host);
        if path.exists() {
            debug!(host, "reusing cached key pair");
            return Ok(fs::read_to_string(&path).await?);
        }
        let key_pair = KeyPair::generate()?;
        let pem = key_pair.serialize_pem();
        write_atomic(&path, pem.as_bytes()).await?;
        Ok(pem)
    }

    async fn ensure_csr(&self, host: &str, params: &CertificateParams, key_pair: &KeyPair) -> CertResult<()> {
        let path = self.csr_path(host);
        if path.exists() {
            return Ok(());
        }
        let csr = params.serialize_request(key_pair)?;
        write_atomic(&path, csr.pem()?.as_bytes()).await?;
        Ok(())
    }

    async fn ensure_signed(
        &self,
        host: &str,
        mut params: CertificateParams,
        key_pair: &KeyPair,
        connection_id: Uuid,
    ) -> CertResult<String> {
        let path = self.pem_path(host);
        if path.exists() {
            debug!(host, "reusing cached leaf certificate");
            return Ok(fs::read_to_string(&path).await?);
        }

        let (serial_hi, _) = connection_id.as_u64_pair();
        params.serial_number = Some(rcgen::SerialNumber::from(serial_hi.to_be_bytes().to_vec()));
        params.is_ca = rcgen::IsCa::NoCa;
        params.key_usages = vec![
            rcgen::KeyUsagePurpose::DigitalSignature,
            rcgen::KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![rcgen::ExtendedKeyUsagePurpose::ServerAuth];
        let not_before = time::OffsetDateTime::now_utc() - time::Duration::days(1);
        params.not_before = not_before;
        params.not_after = not_before + time::Duration::days(730);

        let cert = params.signed_by(key_pair, self.ca.root_cert(), self.ca.root_key())?;
        let pem = cert.pem();
        write_atomic(&path, pem.as_bytes()).await?;
        Ok(pem)
    }
}

fn build_distinguished_name(host: &str, peer_cert: Option<&CertificateDer<'static>>) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    let mut cn_set = false;

    if let Some(peer) = peer_cert {
        if let Ok((_, cert)) = x509_parser::parse_x509_certificate(peer.as_ref()) {
            let subject = cert.subject();
            if let Some(v) = subject.iter_common_name().next().and_then(|a| a.as_str().ok()) {
                dn.push(DnType::CommonName, v);
                cn_set = true;
            }
            if let Some(v) = subject.iter_country().next().and_then(|a| a.as_str().ok()) {
                dn.push(DnType::CountryName, v);
            }
            if let Some(v) = subject.iter_state_or_province().next().and_then(|a| a.as_str().ok()) {
                dn.push(DnType::StateOrProvinceName, v);
            }
            if let Some(v) = subject.iter_locality().next().and_then(|a| a.as_str().ok()) {
                dn.push(DnType::LocalityName, v);
            }
            if let Some(v) = subject.iter_organization().next().and_then(|a| a.as_str().ok()) {
                dn.push(DnType::OrganizationName, v);
            }
            if let Some(v) = subject.iter_organizational_unit().next().and_then(|a| a.as_str().ok()) {
                dn.push(DnType::OrganizationalUnitName, v);
            }
        }
    }

    if !cn_set {
        dn.push(DnType::CommonName, host);
    }
    dn
}

fn pem_to_der(pem: &str) -> CertResult<CertificateDer<'static>> {
    let mut reader = std::io::Cursor::new(pem.as_bytes());
    let der = rustls_pemfile::certs(&mut reader)
        .next()
        .ok_or(CertError::InvalidFormat)??;
    Ok(der)
}

async fn write_atomic(path: &std::path::Path, data: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension(format!(
        "{}.tmp-{}",
        path.extension().and_then(|e| e.to_str()).unwrap_or(""),
        Uuid::new_v4().simple()
    ));
    fs::write(&tmp, data).await?;
    fs::rename(&tmp, path).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn mint_for(dir: &std::path::Path, host: &str) -> MintedCertificate {
        let ca = CertificateAuthority::new(dir.join("ca")).await.unwrap();
        let mint = CertMint::new(ca, dir.join("leaves"));
        mint.mint(host, None, Uuid::new_v4()).await.unwrap()
    }

    #[tokio::test]
    async fn mints_leaf_and_writes_cache_files() {
        let tmp = tempfile::tempdir().unwrap();
        let cert = mint_for(tmp.path(), "example.com").await;
        assert!(!cert.pem_cert.is_empty());
        assert!(tmp.path().join("leaves").join("example.com.pub").exists());
        assert!(tmp.path().join("leaves").join("example.com.csr").exists());
        assert!(tmp.path().join("leaves").join("example.com.pem").exists());
    }

    #[tokio::test]
    async fn reuses_cached_certificate_on_second_mint() {
        let tmp = tempfile::tempdir().unwrap();
        let ca = CertificateAuthority::new(tmp.path().join("ca")).await.unwrap();
        let mint = CertMint::new(ca, tmp.path().join("leaves"));
        let first = mint.mint("example.org", None, Uuid::new_v4()).await.unwrap();
        let second = mint.mint("example.org", None, Uuid::new_v4()).await.unwrap();
        assert_eq!(first.pem_cert, second.pem_cert);
    }
}
