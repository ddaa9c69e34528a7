use anyhow::Result;
use clap::Args;
use confique::Config;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Utility function to expand $HOME in a PathBuf
pub fn expand_home_in_path(path: &PathBuf) -> Result<PathBuf> {
    let home_dir = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
    let path_str = path
        .to_str()
        .ok_or_else(|| anyhow::anyhow!("Invalid UTF-8 in path"))?;

    if path_str.contains("$HOME") {
        let expanded = path_str.replace("$HOME", home_dir.to_str().unwrap_or("."));
        Ok(PathBuf::from(expanded))
    } else {
        Ok(path.clone())
    }
}

#[derive(Config, Clone, Default, Serialize, Deserialize)]
#[config(partial_attr(derive(Args, Serialize, Clone)))]
pub struct AppConfig {
    #[config(nested, partial_attr(command(flatten)))]
    pub proxy: ProxyConfig,

    #[config(nested, partial_attr(command(flatten)))]
    pub tls: TlsConfig,

    #[config(nested, partial_attr(command(flatten)))]
    pub handler: HandlerConfig,

    #[config(nested, partial_attr(command(flatten)))]
    pub events: EventsConfig,
}

#[derive(Clone, Config, Deserialize, Serialize, Default)]
#[config(partial_attr(derive(Args, Clone, Serialize,)))]
pub struct ProxyConfig {
    /// The address the proxy server will bind to (optional, defaults to 127.0.0.1:0)
    #[config(env = "PROXY_BIND_ADDR", partial_attr(arg(long)))]
    pub proxy_bind_addr: Option<String>,
}

#[derive(Clone, Config, Deserialize, Serialize, Default)]
#[config(partial_attr(derive(Args, Clone, Serialize,)))]
pub struct TlsConfig {
    /// Whether CONNECT tunnels are intercepted (MITM'd) or passed through
    /// opaque. Interception requires a local CA; see `wiretap trust`.
    #[config(default = false, partial_attr(arg(long, default_value = "false")))]
    pub intercept: bool,

    /// The directory where the root CA and minted leaf certificates live
    #[config(
        default = "$HOME/.wiretap/certs",
        partial_attr(arg(long, default_value = "$HOME/.wiretap/certs"))
    )]
    pub cert_dir: PathBuf,
}

#[derive(Clone, Config, Deserialize, Serialize, Default)]
#[config(partial_attr(derive(Args, Clone, Serialize,)))]
pub struct HandlerConfig {
    /// Seconds of inactivity on an otherwise idle connection before it is
    /// closed.
    #[config(default = 30, partial_attr(arg(long, default_value = "30")))]
    pub idle_timeout_secs: u64,

    /// Read buffer size, in bytes, used for both the client and upstream
    /// legs of a connection.
    #[config(default = 8192, partial_attr(arg(long, default_value = "8192")))]
    pub recvbuf_size: usize,

    /// Header names stripped from every request and response before it is
    /// forwarded, beyond the hop-by-hop headers the proxy always strips.
    #[config(default = [], partial_attr(arg(long)))]
    pub disable_headers: Vec<String>,
}

#[derive(Clone, Config, Deserialize, Serialize, Default)]
#[config(partial_attr(derive(Args, Clone, Serialize,)))]
pub struct EventsConfig {
    /// Whether request-complete events are published at all.
    #[config(default = false, partial_attr(arg(long, default_value = "false")))]
    pub enabled: bool,
}

impl AppConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Resolve all potential $HOME placeholders in configuration paths.
    /// This should be called once during initialization to avoid repeated
    /// path resolution.
    pub fn with_resolved_paths(mut self) -> Result<Self> {
        self.tls.cert_dir = expand_home_in_path(&self.tls.cert_dir)?;
        Ok(self)
    }
}
