//! Listener, connection handling and the catch-all trace handler.

use crate::config::ProxyConfig;
use crate::output::{format_exchange, format_failure, TraceWriter};
use crate::policy::{BodyPolicy, TextualBodies};
use crate::proxy::{ForwardProxy, ResponseBuffer};
use crate::tls::load_acceptor;
use anyhow::{Context, Result};
use http_body_util::Full;
use hyper::body::{Body, Bytes};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info};

/// Forwards every request and writes its trace.
pub struct TraceHandler {
    proxy: ForwardProxy,
    output: TraceWriter,
    policy: Box<dyn BodyPolicy + Send + Sync>,
}

impl TraceHandler {
    pub fn new(proxy: ForwardProxy, output: TraceWriter) -> Self {
        Self::with_policy(proxy, output, TextualBodies)
    }

    pub fn with_policy<P>(proxy: ForwardProxy, output: TraceWriter, policy: P) -> Self
    where
        P: BodyPolicy + Send + Sync + 'static,
    {
        Self {
            proxy,
            output,
            policy: Box::new(policy),
        }
    }

    pub async fn handle<B>(&self, request: Request<B>) -> Response<Full<Bytes>>
    where
        B: Body,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let url = request.uri().to_string();
        let mut sink = ResponseBuffer::default();

        let entry = match self.proxy.forward(request, &mut sink).await {
            Ok((request, response)) => format_exchange(
                chrono::Utc::now(),
                &url,
                &request,
                &response,
                self.policy.as_ref(),
            ),
            Err(e) => {
                error!(%url, "{e}");
                format_failure(chrono::Utc::now(), &url, &e)
            }
        };

        if let Err(e) = self.output.write_entry(&entry).await {
            error!(%url, "write trace entry: {e}");
        }

        sink.into_response()
    }
}

/// Run the proxy until the process is terminated.
///
/// Only startup (output file, TLS material, bind) can fail.
pub async fn run_server(config: ProxyConfig) -> Result<()> {
    let output = TraceWriter::open(&config.output).await?;
    let tls = match &config.tls {
        Some(files) => Some(load_acceptor(&files.cert_path, &files.key_path)?),
        None => None,
    };

    let listen_addr = config.listen_addr();
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("Failed to listen on {listen_addr}"))?;

    let proxy = ForwardProxy::new()?.with_listen_addr(listener.local_addr()?);
    let handler = Arc::new(TraceHandler::new(proxy, output));

    let scheme = if tls.is_some() { "https" } else { "http" };
    info!("Proxy listening on {scheme}://{listen_addr}");

    serve(listener, tls, handler).await;
    Ok(())
}

/// Accept loop over an already bound listener.
pub async fn serve(listener: TcpListener, tls: Option<TlsAcceptor>, handler: Arc<TraceHandler>) {
    loop {
        let (stream, peer_addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                error!("accept: {e}");
                continue;
            }
        };
        let tls = tls.clone();
        let handler = handler.clone();

        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, peer_addr, tls, handler).await {
                error!("Connection error from {peer_addr}: {e:#}");
            }
        });
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    tls: Option<TlsAcceptor>,
    handler: Arc<TraceHandler>,
) -> Result<()> {
    debug!("New connection from {peer_addr}");

    match tls {
        Some(acceptor) => {
            let stream = acceptor
                .accept(stream)
                .await
                .context("TLS handshake failed")?;
            serve_connection(stream, handler).await?;
        }
        None => serve_connection(stream, handler).await?,
    }

    debug!("Connection closed from {peer_addr}");
    Ok(())
}

async fn serve_connection<I>(io: I, handler: Arc<TraceHandler>) -> Result<()>
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    http1::Builder::new()
        .serve_connection(
            TokioIo::new(io),
            service_fn(move |req| {
                let handler = handler.clone();
                async move { Ok::<_, Infallible>(handler.handle(req).await) }
            }),
        )
        .await
        .context("HTTP connection error")
}
