pub mod ca;
pub mod mint;

pub use ca::CertificateAuthority;
pub use mint::{CertMint, MintedCertificate};

#[derive(Debug, thiserror::Error)]
pub enum CertError {
    #[error("certificate generation failed: {0}")]
    Generation(#[from] rcgen::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid certificate format")]
    InvalidFormat,

    #[error("certificate not found for host: {0}")]
    NotFound(String),

    #[error("TLS config rejected minted certificate: {0}")]
    Tls(#[from] rustls::Error),
}

pub type CertResult<T> = Result<T, CertError>;
