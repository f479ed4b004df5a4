//! Diagnostic forward HTTP proxy.
//!
//! Every request is relayed to its origin unmodified, the origin's answer is
//! relayed back, and the whole exchange is written out as a readable trace:
//!
//! ```text
//! [2024-05-01T12:30:00.000Z http://example.com/foo]
//! > GET http://example.com/foo HTTP/1.1
//! > Host: example.com
//! > accept: text/plain
//! >
//! * text/plain; charset=utf-8
//!
//! < 200 OK HTTP/1.1
//! < content-type: application/json
//! <
//! * application/json
//! {"a":1}
//! ```
//!
//! The content type on the `*` lines is sniffed from the body bytes, not
//! taken from the headers. Bodies that do not look textual are replaced by a
//! placeholder.

pub mod args;
pub mod config;
pub mod error;
pub mod logging;
pub mod output;
pub mod policy;
pub mod proxy;
pub mod record;
pub mod server;
pub mod sniff;
pub mod tls;

pub use args::Args;
pub use config::{OutputDestination, ProxyConfig, TlsFiles};
pub use error::ForwardError;
pub use policy::{BodyPolicy, TextualBodies};
pub use proxy::{ForwardProxy, ResponseBuffer, ResponseSink};
pub use record::{HeaderSet, RequestRecord, ResponseRecord};
pub use server::{run_server, serve, TraceHandler};
pub use sniff::detect_content_type;
