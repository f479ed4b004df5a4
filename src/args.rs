use clap::{Parser, ValueHint};
use std::path::PathBuf;

pub const DEFAULT_PORT: u32 = 8080;

/// Diagnostic forward HTTP proxy.
///
/// Every request is relayed to its origin unmodified and the full exchange
/// is traced to standard output or to a file.
#[derive(Parser, Debug, Clone)]
#[command(name = "forward-proxy", author, version, about)]
pub struct Args {
    /// Port on which to run the proxy server
    #[arg(long, env = "FP_PORT", default_value_t = DEFAULT_PORT)]
    pub port: u32,

    /// Log what the proxy is doing
    #[arg(long, env = "FP_VERBOSE")]
    pub verbose: bool,

    /// File where requests and responses are appended; standard output if unset
    #[arg(long, env = "FP_OUTPUT_FILE", value_hint = ValueHint::FilePath)]
    pub output_file: Option<PathBuf>,

    /// Path to the TLS certificate served by the proxy (PEM format)
    #[arg(long, env = "FP_TLS_CRT", value_hint = ValueHint::FilePath)]
    pub tls_crt: Option<PathBuf>,

    /// Path to the TLS private key served by the proxy (PEM format)
    #[arg(long, env = "FP_TLS_KEY", value_hint = ValueHint::FilePath)]
    pub tls_key: Option<PathBuf>,
}
