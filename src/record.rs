//! Audit records for one forwarded exchange.
//!
//! Records are fully buffered snapshots built by the forwarding engine.
//! They only exist to be rendered into the trace output.

use crate::policy::BodyPolicy;
use hyper::body::Bytes;
use hyper::header::{HeaderMap, CONTENT_TYPE};
use std::collections::HashMap;

/// Header name to a single value, multiple values joined with `,`.
///
/// Audit-only: the joined form never goes back on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderSet(HashMap<String, String>);

impl HeaderSet {
    /// Collapses `headers` into one entry per name.
    pub fn from_header_map(headers: &HeaderMap) -> Self {
        let mut set = HashMap::with_capacity(headers.keys_len());
        for name in headers.keys() {
            let joined = headers
                .get_all(name)
                .iter()
                .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
                .collect::<Vec<_>>()
                .join(",");
            set.insert(name.as_str().to_string(), joined);
        }
        Self(set)
    }

    /// Case-insensitive lookup.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.insert(name.into(), value.into());
    }

    pub fn remove(&mut self, name: &str) -> Option<String> {
        let key = self.0.keys().find(|k| k.eq_ignore_ascii_case(name))?.clone();
        self.0.remove(&key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// One `"{prefix}{name}: {value}"` line per entry, in no particular order.
    pub fn pretty_string(&self, prefix: &str) -> String {
        self.0
            .iter()
            .map(|(name, value)| format!("{prefix}{name}: {value}"))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// The client side of an exchange.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestRecord {
    pub method: String,
    pub url: String,
    pub proto: String,
    pub host: String,
    pub headers: HeaderSet,
    pub content_type: String,
    pub body: Bytes,
}

impl RequestRecord {
    pub fn pretty_string(&self, policy: &dyn BodyPolicy) -> String {
        let body = render_body(&self.headers, &self.content_type, &self.body, policy);
        format!(
            "> {} {} {}\n> Host: {}\n{}\n>\n* {}\n{}\n",
            self.method,
            self.url,
            self.proto,
            self.host,
            self.headers.pretty_string("> "),
            self.content_type,
            body
        )
    }
}

/// The origin side of an exchange.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseRecord {
    pub proto: String,
    /// Code and reason phrase, e.g. `200 OK`.
    pub status: String,
    pub headers: HeaderSet,
    pub content_type: String,
    pub body: Bytes,
}

impl ResponseRecord {
    pub fn pretty_string(&self, policy: &dyn BodyPolicy) -> String {
        let body = render_body(&self.headers, &self.content_type, &self.body, policy);
        format!(
            "< {} {}\n{}\n<\n* {}\n{}\n",
            self.status,
            self.proto,
            self.headers.pretty_string("< "),
            self.content_type,
            body
        )
    }
}

fn render_body(
    headers: &HeaderSet,
    content_type: &str,
    body: &Bytes,
    policy: &dyn BodyPolicy,
) -> String {
    if policy.should_print_body(headers.get(CONTENT_TYPE.as_str()), content_type) {
        String::from_utf8_lossy(body).into_owned()
    } else {
        format!("not printing {content_type} content")
    }
}
