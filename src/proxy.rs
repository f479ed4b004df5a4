//! Forwarding engine.
//!
//! Relays one exchange to its origin, writes the origin's answer to the
//! caller's response sink and hands back audit records for both sides.

use crate::error::ForwardError;
use crate::record::{HeaderSet, RequestRecord, ResponseRecord};
use crate::sniff::detect_content_type;
use anyhow::Context;
use http_body_util::{BodyExt, Full};
use hyper::body::{Body, Bytes};
use hyper::header::{HeaderMap, HeaderName, HeaderValue, HOST, TRANSFER_ENCODING};
use hyper::http::request::Parts;
use hyper::{Request, Response, StatusCode, Uri};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use rustls::crypto::aws_lc_rs::default_provider;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, warn};

/// Upper bound for the origin call plus the response body read.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Shared origin client; HTTP and HTTPS origins over one connection pool.
pub type OriginClient = Client<HttpsConnector<HttpConnector>, Full<Bytes>>;

/// Where the relayed response goes.
///
/// Writes arrive headers first, then the status, then the body.
pub trait ResponseSink {
    fn append_header(&mut self, name: HeaderName, value: HeaderValue);
    fn write_status(&mut self, status: StatusCode);
    fn write_body(&mut self, body: Bytes);
}

/// A sink that assembles a hyper response.
///
/// Headers appended after the status are dropped, as is a second status.
/// Writing a body without a status implies `200 OK`.
#[derive(Debug, Default)]
pub struct ResponseBuffer {
    headers: HeaderMap,
    status: Option<StatusCode>,
    body: Vec<u8>,
}

impl ResponseBuffer {
    pub fn status(&self) -> Option<StatusCode> {
        self.status
    }

    pub fn into_response(self) -> Response<Full<Bytes>> {
        let mut response = Response::new(Full::new(Bytes::from(self.body)));
        *response.status_mut() = self.status.unwrap_or(StatusCode::OK);
        *response.headers_mut() = self.headers;
        response
    }
}

impl ResponseSink for ResponseBuffer {
    fn append_header(&mut self, name: HeaderName, value: HeaderValue) {
        if self.status.is_some() {
            warn!(header = %name, "header written after status, ignoring");
            return;
        }
        self.headers.append(name, value);
    }

    fn write_status(&mut self, status: StatusCode) {
        if let Some(current) = self.status {
            warn!(%current, %status, "superfluous status write, ignoring");
            return;
        }
        self.status = Some(status);
    }

    fn write_body(&mut self, body: Bytes) {
        if self.status.is_none() {
            self.status = Some(StatusCode::OK);
        }
        self.body.extend_from_slice(&body);
    }
}

/// Builds the shared origin client with the bundled web PKI roots.
pub fn build_client() -> anyhow::Result<OriginClient> {
    let mut root_store = rustls::RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let tls_config = rustls::ClientConfig::builder_with_provider(Arc::new(default_provider()))
        .with_safe_default_protocol_versions()
        .context("Failed to select TLS protocol versions")?
        .with_root_certificates(root_store)
        .with_no_client_auth();

    let https = HttpsConnectorBuilder::new()
        .with_tls_config(tls_config)
        .https_or_http()
        .enable_http1()
        .build();

    Ok(Client::builder(TokioExecutor::new()).build(https))
}

/// The forwarding engine. Cheap to clone; clones share the client pool.
#[derive(Clone)]
pub struct ForwardProxy {
    client: OriginClient,
    timeout: Duration,
    listen_addr: Option<SocketAddr>,
}

impl ForwardProxy {
    pub fn new() -> anyhow::Result<Self> {
        Ok(Self::with_client(build_client()?, DEFAULT_TIMEOUT))
    }

    pub fn with_client(client: OriginClient, timeout: Duration) -> Self {
        Self {
            client,
            timeout,
            listen_addr: None,
        }
    }

    /// Refuse targets that resolve back to the proxy's own listener.
    pub fn with_listen_addr(mut self, addr: SocketAddr) -> Self {
        self.listen_addr = Some(addr);
        self
    }

    /// Forwards `request` to its origin and relays the answer into `sink`.
    ///
    /// On error a 500 has already been written to `sink` and no records are
    /// produced.
    pub async fn forward<B, S>(
        &self,
        request: Request<B>,
        sink: &mut S,
    ) -> Result<(RequestRecord, ResponseRecord), ForwardError>
    where
        B: Body,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
        S: ResponseSink,
    {
        let (parts, body) = request.into_parts();

        // the inbound body is consumed here on every path
        let request_body = match timeout(self.timeout, body.collect()).await {
            Ok(Ok(collected)) => collected.to_bytes(),
            Ok(Err(e)) => return Err(fail(sink, ForwardError::ReadRequestBody(e.into()))),
            Err(_) => {
                return Err(fail(
                    sink,
                    ForwardError::Timeout {
                        stage: "copy request body",
                        after: self.timeout,
                    },
                ))
            }
        };

        let outbound = outbound_request(&parts, request_body.clone())
            .map_err(|e| fail(sink, e.into()))?;
        if let Some(listen_addr) = self.listen_addr {
            if targets_listener(outbound.uri(), listen_addr) {
                let target = outbound.uri().to_string();
                return Err(fail(sink, ForwardError::SelfTarget { target }));
            }
        }
        debug!(method = %parts.method, uri = %outbound.uri(), "forwarding");

        let deadline = Instant::now() + self.timeout;
        let response = match timeout_at(deadline, self.client.request(outbound)).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => return Err(fail(sink, ForwardError::Transport(e))),
            Err(_) => {
                return Err(fail(
                    sink,
                    ForwardError::Timeout {
                        stage: "proxy request",
                        after: self.timeout,
                    },
                ))
            }
        };

        let (response_parts, response_body) = response.into_parts();
        let response_body = match timeout_at(deadline, response_body.collect()).await {
            Ok(Ok(collected)) => collected.to_bytes(),
            Ok(Err(e)) => return Err(fail(sink, ForwardError::ReadResponseBody(e))),
            Err(_) => {
                return Err(fail(
                    sink,
                    ForwardError::Timeout {
                        stage: "read response body",
                        after: self.timeout,
                    },
                ))
            }
        };

        // headers, status, body
        for (name, value) in &response_parts.headers {
            if name != TRANSFER_ENCODING {
                sink.append_header(name.clone(), value.clone());
            }
        }
        sink.write_status(response_parts.status);
        sink.write_body(response_body.clone());

        let mut request_headers = HeaderSet::from_header_map(&parts.headers);
        request_headers.remove(HOST.as_str());

        let request_record = RequestRecord {
            method: parts.method.to_string(),
            url: parts.uri.to_string(),
            proto: format!("{:?}", parts.version),
            host: request_host(&parts),
            headers: request_headers,
            content_type: detect_content_type(&request_body).to_string(),
            body: request_body,
        };
        let response_record = ResponseRecord {
            proto: format!("{:?}", response_parts.version),
            status: response_parts.status.to_string(),
            headers: HeaderSet::from_header_map(&response_parts.headers),
            content_type: detect_content_type(&response_body).to_string(),
            body: response_body,
        };

        Ok((request_record, response_record))
    }
}

fn fail<S: ResponseSink>(sink: &mut S, err: ForwardError) -> ForwardError {
    sink.write_status(StatusCode::INTERNAL_SERVER_ERROR);
    sink.write_body(Bytes::from_static(b"Internal Server Error"));
    err
}

/// Same method, target and headers; the body is re-sent from the buffered
/// bytes so `Transfer-Encoding` is left to the client.
fn outbound_request(parts: &Parts, body: Bytes) -> Result<Request<Full<Bytes>>, hyper::http::Error> {
    let mut builder = Request::builder()
        .method(parts.method.clone())
        .uri(target_uri(parts)?);
    for (name, value) in &parts.headers {
        if name != TRANSFER_ENCODING {
            builder = builder.header(name, value);
        }
    }
    builder.body(Full::new(body))
}

/// Absolute-form targets go out as they are. Origin-form targets are
/// resolved against the `Host` header.
fn target_uri(parts: &Parts) -> Result<Uri, hyper::http::Error> {
    if parts.uri.authority().is_some() {
        return Ok(parts.uri.clone());
    }
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let mut builder = Uri::builder().scheme("http").path_and_query(path_and_query);
    if let Some(host) = parts.headers.get(HOST) {
        builder = builder.authority(host.as_bytes());
    }
    builder.build()
}

/// Whether `uri` points at `listen_addr`: same port, and a host that is the
/// listen address itself, loopback, unspecified or `localhost`.
fn targets_listener(uri: &Uri, listen_addr: SocketAddr) -> bool {
    let Some(host) = uri.host() else {
        return false;
    };
    let default_port = if uri.scheme_str() == Some("https") { 443 } else { 80 };
    if uri.port_u16().unwrap_or(default_port) != listen_addr.port() {
        return false;
    }
    if host.eq_ignore_ascii_case("localhost") {
        return true;
    }
    match host.trim_start_matches('[').trim_end_matches(']').parse::<IpAddr>() {
        Ok(ip) => ip == listen_addr.ip() || ip.is_loopback() || ip.is_unspecified(),
        Err(_) => false,
    }
}

fn request_host(parts: &Parts) -> String {
    parts
        .headers
        .get(HOST)
        .map(|h| String::from_utf8_lossy(h.as_bytes()).into_owned())
        .or_else(|| parts.uri.authority().map(|a| a.to_string()))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[derive(Debug, PartialEq)]
    enum SinkEvent {
        Header(String, String),
        Status(u16),
        Body(Vec<u8>),
    }

    #[derive(Default)]
    struct RecordingSink(Vec<SinkEvent>);

    impl ResponseSink for RecordingSink {
        fn append_header(&mut self, name: HeaderName, value: HeaderValue) {
            self.0.push(SinkEvent::Header(
                name.to_string(),
                value.to_str().unwrap().to_string(),
            ));
        }

        fn write_status(&mut self, status: StatusCode) {
            self.0.push(SinkEvent::Status(status.as_u16()));
        }

        fn write_body(&mut self, body: Bytes) {
            self.0.push(SinkEvent::Body(body.to_vec()));
        }
    }

    struct FailingBody;

    impl Body for FailingBody {
        type Data = Bytes;
        type Error = std::io::Error;

        fn poll_frame(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
        ) -> Poll<Option<Result<hyper::body::Frame<Self::Data>, Self::Error>>> {
            Poll::Ready(Some(Err(std::io::Error::other("connection reset"))))
        }
    }

    /// Never yields a frame.
    struct StalledBody;

    impl Body for StalledBody {
        type Data = Bytes;
        type Error = std::io::Error;

        fn poll_frame(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
        ) -> Poll<Option<Result<hyper::body::Frame<Self::Data>, Self::Error>>> {
            Poll::Pending
        }
    }

    /// Origin that promises 100 bytes, sends 5 and hangs up.
    async fn spawn_truncating_origin() -> anyhow::Result<SocketAddr> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        tokio::spawn(async move {
            if let Ok((mut stream, _)) = listener.accept().await {
                let mut buf = [0u8; 1024];
                let _ = stream.read(&mut buf).await;
                let _ = stream
                    .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 100\r\n\r\nhello")
                    .await;
            }
        });
        Ok(addr)
    }

    fn proxy() -> ForwardProxy {
        ForwardProxy::new().unwrap()
    }

    #[tokio::test]
    async fn test_sink_written_headers_then_status_then_body() -> anyhow::Result<()> {
        let origin = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/ordered"))
            .respond_with(
                ResponseTemplate::new(201)
                    .insert_header("x-origin", "mock")
                    .set_body_string("done"),
            )
            .mount(&origin)
            .await;

        let request = Request::get(format!("{}/ordered", origin.uri())).body(Full::new(Bytes::new()))?;
        let mut sink = RecordingSink::default();
        proxy().forward(request, &mut sink).await?;

        let status_at = sink
            .0
            .iter()
            .position(|e| *e == SinkEvent::Status(201))
            .unwrap();
        assert_eq!(status_at, sink.0.len() - 2);
        assert!(sink.0[..status_at]
            .iter()
            .all(|e| matches!(e, SinkEvent::Header(..))));
        assert!(sink
            .0
            .contains(&SinkEvent::Header("x-origin".into(), "mock".into())));
        assert_eq!(sink.0.last(), Some(&SinkEvent::Body(b"done".to_vec())));
        Ok(())
    }

    #[tokio::test]
    async fn test_request_body_read_failure_writes_500() {
        let request = Request::post("http://127.0.0.1:9/never")
            .body(FailingBody)
            .unwrap();
        let mut sink = ResponseBuffer::default();

        let err = proxy().forward(request, &mut sink).await.unwrap_err();

        assert!(matches!(err, ForwardError::ReadRequestBody(_)));
        assert!(err.to_string().starts_with("copy request body"));
        let response = sink.into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body, Bytes::from_static(b"Internal Server Error"));
    }

    #[tokio::test]
    async fn test_unreachable_origin_is_transport_error() {
        let request = Request::get("http://127.0.0.1:9/")
            .body(Full::new(Bytes::new()))
            .unwrap();
        let mut sink = RecordingSink::default();

        let err = proxy().forward(request, &mut sink).await.unwrap_err();

        assert!(matches!(err, ForwardError::Transport(_)));
        assert_eq!(
            sink.0,
            vec![
                SinkEvent::Status(500),
                SinkEvent::Body(b"Internal Server Error".to_vec())
            ]
        );
    }

    #[tokio::test]
    async fn test_slow_origin_times_out() -> anyhow::Result<()> {
        let origin = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
            .mount(&origin)
            .await;

        let proxy = ForwardProxy::with_client(build_client()?, Duration::from_millis(50));
        let request = Request::get(origin.uri()).body(Full::new(Bytes::new()))?;
        let mut sink = ResponseBuffer::default();

        let err = proxy.forward(request, &mut sink).await.unwrap_err();

        assert!(matches!(err, ForwardError::Timeout { stage: "proxy request", .. }));
        assert_eq!(sink.status(), Some(StatusCode::INTERNAL_SERVER_ERROR));
        Ok(())
    }

    #[test]
    fn test_origin_form_resolved_against_host() {
        let (parts, _) = Request::get("/foo?x=1")
            .header(HOST, "example.com:8081")
            .body(())
            .unwrap()
            .into_parts();
        assert_eq!(
            target_uri(&parts).unwrap(),
            "http://example.com:8081/foo?x=1"
        );
        assert_eq!(request_host(&parts), "example.com:8081");
    }

    #[test]
    fn test_origin_form_without_host_is_rejected() {
        let (parts, _) = Request::get("/foo").body(()).unwrap().into_parts();
        assert!(target_uri(&parts).is_err());
    }

    #[test]
    fn test_outbound_request_drops_transfer_encoding() {
        let (parts, _) = Request::post("http://example.com/upload")
            .header(TRANSFER_ENCODING, "chunked")
            .header("connection", "close")
            .header("x-keep", "1")
            .body(())
            .unwrap()
            .into_parts();

        let outbound = outbound_request(&parts, Bytes::from_static(b"abc")).unwrap();

        assert_eq!(outbound.method(), "POST");
        assert_eq!(outbound.uri(), "http://example.com/upload");
        assert!(outbound.headers().get(TRANSFER_ENCODING).is_none());
        assert_eq!(outbound.headers()["connection"], "close");
        assert_eq!(outbound.headers()["x-keep"], "1");
    }

    #[test]
    fn test_response_buffer_ignores_late_writes() {
        let mut sink = ResponseBuffer::default();
        sink.append_header(HeaderName::from_static("x-a"), HeaderValue::from_static("1"));
        sink.write_status(StatusCode::ACCEPTED);
        sink.append_header(HeaderName::from_static("x-late"), HeaderValue::from_static("1"));
        sink.write_status(StatusCode::INTERNAL_SERVER_ERROR);
        sink.write_body(Bytes::from_static(b"ok"));

        let response = sink.into_response();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert!(response.headers().contains_key("x-a"));
        assert!(!response.headers().contains_key("x-late"));
    }

    #[test]
    fn test_response_buffer_body_implies_ok() {
        let mut sink = ResponseBuffer::default();
        sink.write_body(Bytes::from_static(b"hi"));
        assert_eq!(sink.status(), Some(StatusCode::OK));
    }

    #[tokio::test]
    async fn test_truncated_origin_body_writes_500() -> anyhow::Result<()> {
        let origin = spawn_truncating_origin().await?;
        let request = Request::get(format!("http://{origin}/short")).body(Full::new(Bytes::new()))?;
        let mut sink = RecordingSink::default();

        let err = proxy().forward(request, &mut sink).await.unwrap_err();

        assert!(matches!(err, ForwardError::ReadResponseBody(_)));
        assert!(err.to_string().starts_with("read response body"));
        // nothing from the origin reached the sink
        assert_eq!(
            sink.0,
            vec![
                SinkEvent::Status(500),
                SinkEvent::Body(b"Internal Server Error".to_vec())
            ]
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_stalled_request_body_times_out() -> anyhow::Result<()> {
        let proxy = ForwardProxy::with_client(build_client()?, Duration::from_millis(50));
        let request = Request::post("http://127.0.0.1:9/upload").body(StalledBody)?;
        let mut sink = ResponseBuffer::default();

        let err = proxy.forward(request, &mut sink).await.unwrap_err();

        assert!(matches!(
            err,
            ForwardError::Timeout {
                stage: "copy request body",
                ..
            }
        ));
        assert_eq!(sink.status(), Some(StatusCode::INTERNAL_SERVER_ERROR));
        Ok(())
    }

    #[tokio::test]
    async fn test_request_to_own_listener_is_refused() -> anyhow::Result<()> {
        // nothing listens here; a dial would surface as a transport error
        let listen_addr: SocketAddr = "127.0.0.1:9".parse()?;
        let proxy = proxy().with_listen_addr(listen_addr);
        let request = Request::get("/loop")
            .header(HOST, listen_addr.to_string())
            .body(Full::new(Bytes::new()))?;
        let mut sink = ResponseBuffer::default();

        let err = proxy.forward(request, &mut sink).await.unwrap_err();

        assert!(matches!(
            err,
            ForwardError::SelfTarget { ref target } if target == "http://127.0.0.1:9/loop"
        ));
        assert_eq!(sink.status(), Some(StatusCode::INTERNAL_SERVER_ERROR));
        Ok(())
    }

    #[test]
    fn test_targets_listener() {
        let any: SocketAddr = "0.0.0.0:8080".parse().unwrap();
        let local: SocketAddr = "10.0.0.5:8080".parse().unwrap();
        let hits = |uri: &str, addr| targets_listener(&uri.parse::<Uri>().unwrap(), addr);

        assert!(hits("http://127.0.0.1:8080/", any));
        assert!(hits("http://localhost:8080/x", any));
        assert!(hits("http://[::1]:8080/", any));
        assert!(hits("http://0.0.0.0:8080/", any));
        assert!(hits("http://10.0.0.5:8080/", local));
        assert!(!hits("http://127.0.0.1:8081/", any));
        assert!(!hits("http://10.0.0.6:8080/", local));
        assert!(!hits("http://example.com:8080/", any));
        assert!(!hits("http://127.0.0.1/", any));
        assert!(hits("http://127.0.0.1/", "0.0.0.0:80".parse().unwrap()));
    }

    #[tokio::test]
    async fn test_host_header_kept_out_of_request_headers() -> anyhow::Result<()> {
        let origin = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&origin)
            .await;

        let request = Request::get("/bare")
            .header(HOST, origin.address().to_string())
            .body(Full::new(Bytes::new()))?;
        let mut sink = ResponseBuffer::default();
        let (request, _) = proxy().forward(request, &mut sink).await?;

        assert!(request.headers.is_empty());
        assert_eq!(request.host, origin.address().to_string());
        Ok(())
    }
}
