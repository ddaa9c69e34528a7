use super::CertResult;
use anyhow::{anyhow, Result};
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use tokio::fs;
use tracing::{debug, error, info, warn};

const ROOT_CN: &str = "wiretap Root CA";
const ROOT_O: &str = "wiretap";

/// Holds the long-lived root key pair used to sign every minted leaf
/// certificate. Loaded once at startup and handed to [`super::mint::CertMint`]
/// as a long-lived resource, never reconstructed per connection.
#[derive(Clone)]
pub struct CertificateAuthority {
    root_cert: Arc<rcgen::Certificate>,
    root_key: Arc<KeyPair>,
    cert_dir: PathBuf,
}

impl std::fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateAuthority")
            .field("cert_dir", &self.cert_dir)
            .finish()
    }
}

pub fn get_root_cert_path(cert_dir: &Path) -> PathBuf {
    cert_dir.join("ca.crt")
}

pub fn get_root_key_path(cert_dir: &Path) -> PathBuf {
    cert_dir.join("ca.key")
}

impl CertificateAuthority {
    pub async fn new<P: AsRef<Path>>(cert_dir: P) -> Result<Self> {
        let cert_dir = cert_dir.as_ref().to_path_buf();
        fs::create_dir_all(&cert_dir).await?;

        let root_cert_path = get_root_cert_path(&cert_dir);
        let root_key_path = get_root_key_path(&cert_dir);
        let (root_cert, root_key) = if root_cert_path.exists() && root_key_path.exists() {
            info!("loading existing root certificate");
            Self::load_root_certificate(&root_key_path).await?
        } else {
            info!("generating new root certificate");
            let (cert, key) = Self::generate_root_certificate().await?;
            Self::save_root_certificate(&cert, &key, &root_cert_path, &root_key_path).await?;
            (cert, key)
        };

        Ok(Self {
            root_cert: Arc::new(root_cert),
            root_key: Arc::new(root_key),
            cert_dir,
        })
    }

    fn root_distinguished_name() -> DistinguishedName {
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, ROOT_CN);
        dn.push(DnType::OrganizationName, ROOT_O);
        dn.push(DnType::CountryName, "US");
        dn
    }

    async fn generate_root_certificate() -> CertResult<(rcgen::Certificate, KeyPair)> {
        let mut params = CertificateParams::default();
        params.distinguished_name = Self::root_distinguished_name();
        params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        params.key_usages = vec![
            rcgen::KeyUsagePurpose::KeyCertSign,
            rcgen::KeyUsagePurpose::CrlSign,
        ];

        let not_before = time::OffsetDateTime::now_utc() - time::Duration::days(1);
        params.not_before = not_before;
        params.not_after = not_before + time::Duration::days(365 * 10);

        let key_pair = KeyPair::generate()?;
        let cert = params.self_signed(&key_pair)?;
        Ok((cert, key_pair))
    }

    async fn load_root_certificate(key_path: &Path) -> CertResult<(rcgen::Certificate, KeyPair)> {
        let key_pem = fs::read_to_string(key_path).await?;
        let key_pair = KeyPair::from_pem(&key_pem)?;

        let mut params = CertificateParams::default();
        params.distinguished_name = Self::root_distinguished_name();
        params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        params.key_usages = vec![
            rcgen::KeyUsagePurpose::KeyCertSign,
            rcgen::KeyUsagePurpose::CrlSign,
        ];

        let cert = params.self_signed(&key_pair)?;
        Ok((cert, key_pair))
    }

    async fn save_root_certificate(
        cert: &rcgen::Certificate,
        key: &KeyPair,
        cert_path: &Path,
        key_path: &Path,
    ) -> CertResult<()> {
        fs::write(cert_path, cert.pem()).await?;
        fs::write(key_path, key.serialize_pem()).await?;
        info!("root certificate saved to {:?}", cert_path);
        Ok(())
    }

    pub fn root_cert(&self) -> &rcgen::Certificate {
        &self.root_cert
    }

    pub fn root_key(&self) -> &KeyPair {
        &self.root_key
    }

    pub fn cert_dir(&self) -> &Path {
        &self.cert_dir
    }

    pub fn get_root_certificate_pem(&self) -> String {
        self.root_cert.pem()
    }

    pub fn get_root_certificate_der(&self) -> Vec<u8> {
        self.root_cert.der().to_vec()
    }

    /// Install the root CA certificate to the system trust store.
    pub async fn install_root_certificate(&self, yes: bool, dry_run: bool) -> Result<()> {
        let root_cert_path = get_root_cert_path(&self.cert_dir);
        let platform = detect_platform();
        debug!("detected platform: {:?}", platform);

        if dry_run {
            info!("dry run: would install root certificate for platform {:?}", platform);
            info!("dry run: certificate path {:?}", root_cert_path);
            return Ok(());
        }

        if !yes {
            info!("This will install the wiretap root CA certificate into your system's trust store.");
            info!("Certificate location: {:?}", root_cert_path);
            info!("Continue? [y/N]");
            let mut input = String::new();
            io::stdin().read_line(&mut input)?;
            if !input.trim().to_lowercase().starts_with('y') {
                info!("installation cancelled");
                return Ok(());
            }
        }

        match platform {
            Platform::MacOS => self.install_macos(&root_cert_path).await,
            Platform::Linux => self.install_linux(&root_cert_path).await,
            Platform::Windows => self.install_windows(&root_cert_path).await,
            Platform::Unknown(os) => {
                warn!("unsupported platform: {os}, manual installation required");
                self.print_manual_instructions(&root_cert_path)
            }
        }
    }

    pub async fn remove_root_certificate(&self, yes: bool, dry_run: bool) -> Result<()> {
        let platform = detect_platform();
        info!("detected platform: {:?}", platform);

        if dry_run {
            info!("dry run: would remove root certificate for platform {:?}", platform);
            return Ok(());
        }

        if !yes {
            info!("This will remove the wiretap root CA certificate from your system's trust store.");
            info!("Continue? [y/N]");
            let mut input = String::new();
            io::stdin().read_line(&mut input)?;
            if !input.trim().to_lowercase().starts_with('y') {
                info!("removal cancelled");
                return Ok(());
            }
        }

        match platform {
            Platform::MacOS => self.remove_macos(),
            Platform::Linux => self.remove_linux(),
            Platform::Windows => self.remove_windows(),
            Platform::Unknown(os) => {
                warn!("unsupported platform: {os}, manual removal required");
                self.print_manual_removal_instructions()
            }
        }
    }

    pub async fn check_root_certificate_status(&self) -> Result<()> {
        let root_cert_path = get_root_cert_path(&self.cert_dir);
        let platform = detect_platform();

        info!("certificate authority status");
        info!("platform: {:?}", platform);
        info!("certificate path: {:?}", root_cert_path);
        info!("certificate exists: {}", root_cert_path.exists());

        if !root_cert_path.exists() {
            info!("trust status: certificate not found");
            return Ok(());
        }

        match platform {
            Platform::MacOS => self.check_macos_status(),
            Platform::Linux => self.check_linux_status(),
            Platform::Windows => self.check_windows_status(),
            Platform::Unknown(os) => {
                info!("trust status: unknown (unsupported platform: {os})");
                Ok(())
            }
        }
    }

    fn install_macos(&self, cert_path: &Path) -> Result<()> {
        info!("installing root certificate on macOS via Keychain (you may be prompted for your password)");
        let output = Command::new("sudo")
            .args(["security", "add-trusted-cert", "-d", "-r", "trustRoot", "-k", "/Library/Keychains/System.keychain"])
            .arg(cert_path)
            .output()?;
        if output.status.success() {
            info!("certificate installed to System keychain");
        } else {
            error!("failed to install certificate: {}", String::from_utf8_lossy(&output.stderr));
            return Err(anyhow!("failed to install certificate to macOS keychain"));
        }
        Ok(())
    }

    fn install_linux(&self, cert_path: &Path) -> Result<()> {
        info!("installing root certificate on Linux (sudo access may be required)");
        if Path::new("/usr/local/share/ca-certificates").exists() {
            let dest_path = "/usr/local/share/ca-certificates/wiretap-root-ca.crt";
            let output = Command::new("sudo").arg("cp").arg(cert_path).arg(dest_path).output()?;
            if !output.status.success() {
                return Err(anyhow!("failed to copy certificate: {}", String::from_utf8_lossy(&output.stderr)));
            }
            let output = Command::new("sudo").arg("update-ca-certificates").output()?;
            if output.status.success() {
                info!("certificate installed via update-ca-certificates");
            } else {
                return Err(anyhow!("failed to update ca-certificates: {}", String::from_utf8_lossy(&output.stderr)));
            }
        } else if Path::new("/etc/pki/ca-trust/source/anchors").exists() {
            let dest_path = "/etc/pki/ca-trust/source/anchors/wiretap-root-ca.crt";
            let output = Command::new("sudo").arg("cp").arg(cert_path).arg(dest_path).output()?;
            if !output.status.success() {
                return Err(anyhow!("failed to copy certificate: {}", String::from_utf8_lossy(&output.stderr)));
            }
            let output = Command::new("sudo").arg("update-ca-trust").output()?;
            if output.status.success() {
                info!("certificate installed via update-ca-trust");
            } else {
                return Err(anyhow!("failed to update ca-trust: {}", String::from_utf8_lossy(&output.stderr)));
            }
        } else {
            warn!("no supported certificate installation method found");
            self.print_manual_instructions(cert_path)?;
        }
        Ok(())
    }

    fn install_windows(&self, cert_path: &Path) -> Result<()> {
        info!("installing root certificate on Windows via certutil");
        let output = Command::new("certutil").args(["-addstore", "-f", "Root"]).arg(cert_path).output()?;
        if output.status.success() {
            info!("certificate installed using certutil");
        } else {
            return Err(anyhow!("failed to install certificate: {}", String::from_utf8_lossy(&output.stderr)));
        }
        Ok(())
    }

    fn remove_macos(&self) -> Result<()> {
        let output = Command::new("sudo")
            .args(["security", "delete-certificate", "-c", ROOT_CN, "/Library/Keychains/System.keychain"])
            .output()?;
        if output.status.success() {
            info!("certificate removed from macOS System keychain");
        } else {
            warn!("certificate may not have been installed: {}", String::from_utf8_lossy(&output.stderr));
        }
        Ok(())
    }

    fn remove_linux(&self) -> Result<()> {
        let mut removed = false;
        let ubuntu_path = "/usr/local/share/ca-certificates/wiretap-root-ca.crt";
        if Path::new(ubuntu_path).exists() {
            let output = Command::new("sudo").args(["rm", ubuntu_path]).output()?;
            if output.status.success() {
                let _ = Command::new("sudo").arg("update-ca-certificates").output()?;
                removed = true;
            }
        }
        let rhel_path = "/etc/pki/ca-trust/source/anchors/wiretap-root-ca.crt";
        if Path::new(rhel_path).exists() {
            let output = Command::new("sudo").args(["rm", rhel_path]).output()?;
            if output.status.success() {
                let _ = Command::new("sudo").arg("update-ca-trust").output()?;
                removed = true;
            }
        }
        if !removed {
            info!("certificate not found in standard locations (may already be removed)");
        }
        Ok(())
    }

    fn remove_windows(&self) -> Result<()> {
        let output = Command::new("certutil").args(["-delstore", "Root", ROOT_CN]).output()?;
        if output.status.success() || output.stderr.is_empty() {
            info!("certificate removal attempted (may already be removed)");
        } else {
            warn!("certificate removal failed: {}", String::from_utf8_lossy(&output.stderr));
        }
        Ok(())
    }

    fn check_macos_status(&self) -> Result<()> {
        let output = Command::new("security")
            .args(["find-certificate", "-c", ROOT_CN, "/Library/Keychains/System.keychain"])
            .output()?;
        if output.status.success() {
            info!("trust status: installed in System keychain");
        } else {
            info!("trust status: not found in System keychain");
        }
        Ok(())
    }

    fn check_linux_status(&self) -> Result<()> {
        let ubuntu_path = Path::new("/usr/local/share/ca-certificates/wiretap-root-ca.crt");
        let rhel_path = Path::new("/etc/pki/ca-trust/source/anchors/wiretap-root-ca.crt");
        if ubuntu_path.exists() {
            info!("trust status: installed via ca-certificates");
        } else if rhel_path.exists() {
            info!("trust status: installed via ca-trust");
        } else {
            info!("trust status: not found in standard trust stores");
        }
        Ok(())
    }

    fn check_windows_status(&self) -> Result<()> {
        let output = Command::new("certutil").args(["-store", "Root", ROOT_CN]).output()?;
        if output.status.success() && !String::from_utf8_lossy(&output.stdout).contains("ERROR") {
            info!("trust status: installed in Root certificate store");
        } else {
            info!("trust status: not found in Root certificate store");
        }
        Ok(())
    }

    fn print_manual_instructions(&self, cert_path: &Path) -> Result<()> {
        info!("manual installation: import {:?} into your system's trusted root store", cert_path);
        Ok(())
    }

    fn print_manual_removal_instructions(&self) -> Result<()> {
        info!("manual removal: remove '{ROOT_CN}' from your system's trusted root store");
        Ok(())
    }
}

#[derive(Debug)]
enum Platform {
    MacOS,
    Linux,
    Windows,
    Unknown(String),
}

fn detect_platform() -> Platform {
    if cfg!(target_os = "macos") {
        Platform::MacOS
    } else if cfg!(target_os = "linux") {
        Platform::Linux
    } else if cfg!(target_os = "windows") {
        Platform::Windows
    } else {
        Platform::Unknown(std::env::consts::OS.to_string())
    }
}
