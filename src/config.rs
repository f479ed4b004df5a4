//! Validated proxy configuration.

use crate::args::Args;
use anyhow::bail;
use std::fmt::{self, Display};
use std::net::SocketAddr;
use std::path::PathBuf;

/// Where trace entries are written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputDestination {
    Stdout,
    /// Opened in append mode, created if missing.
    File(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsFiles {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

/// Everything the server needs, built once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    pub port: u16,
    pub verbose: bool,
    pub output: OutputDestination,
    /// HTTPS listener when set, plain HTTP otherwise.
    pub tls: Option<TlsFiles>,
}

impl ProxyConfig {
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::from(([0, 0, 0, 0], self.port))
    }
}

impl TryFrom<Args> for ProxyConfig {
    type Error = anyhow::Error;

    fn try_from(args: Args) -> anyhow::Result<Self> {
        let port = match u16::try_from(args.port) {
            Ok(port) if port != 0 => port,
            _ => bail!("invalid port {}", args.port),
        };

        let output = match non_empty(args.output_file) {
            Some(path) => OutputDestination::File(path),
            None => OutputDestination::Stdout,
        };

        let tls = match (non_empty(args.tls_crt), non_empty(args.tls_key)) {
            (Some(cert_path), Some(key_path)) => Some(TlsFiles {
                cert_path,
                key_path,
            }),
            (None, None) => None,
            (Some(_), None) => bail!("tls-crt is set but tls-key is not; both are required for TLS"),
            (None, Some(_)) => bail!("tls-key is set but tls-crt is not; both are required for TLS"),
        };

        Ok(Self {
            port,
            verbose: args.verbose,
            output,
            tls,
        })
    }
}

fn non_empty(path: Option<PathBuf>) -> Option<PathBuf> {
    path.filter(|p| !p.as_os_str().is_empty())
}

impl Display for ProxyConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "port: {} verbose: {} output: ", self.port, self.verbose)?;
        match &self.output {
            OutputDestination::Stdout => write!(f, "stdout")?,
            OutputDestination::File(path) => write!(f, "{:?}", path)?,
        }
        match &self.tls {
            Some(tls) => write!(f, " tls-crt: {:?} tls-key: {:?}", tls.cert_path, tls.key_path),
            None => write!(f, " tls: off"),
        }
    }
}
