//! HTTP endpoint serving the metrics registry in Prometheus text format.

use std::{convert::Infallible, io, net::SocketAddr};

use http_body_util::Full;
use hyper::{
    body::{Bytes, Incoming},
    header::CONTENT_TYPE,
    server::conn::http1,
    service::service_fn,
    Request, Response, StatusCode,
};
use hyper_util::rt::TokioIo;
use prometheus::{Encoder, Registry, TextEncoder};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

pub const METRICS_PATH: &str = "/metrics";

/// Bind `addr` and serve `GET /metrics` until the task is dropped.
///
/// Only a bind failure is returned; per-connection errors are logged.
pub async fn serve(addr: SocketAddr, registry: Registry) -> io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "metrics endpoint listening");
    serve_listener(listener, registry).await
}

/// Serve connections accepted from an already bound listener.
pub async fn serve_listener(listener: TcpListener, registry: Registry) -> io::Result<()> {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(conn) => conn,
            Err(err) => {
                warn!(error = %err, "failed to accept metrics connection");
                continue;
            }
        };

        let registry = registry.clone();
        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let service = service_fn(move |req: Request<Incoming>| {
                let registry = registry.clone();
                async move { Ok::<_, Infallible>(respond(req.uri().path(), &registry)) }
            });

            if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                debug!(%peer, error = %err, "error serving metrics connection");
            }
        });
    }
}

fn respond(path: &str, registry: &Registry) -> Response<Full<Bytes>> {
    if path != METRICS_PATH {
        return plain(StatusCode::NOT_FOUND, "Not Found");
    }

    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(err) = encoder.encode(&registry.gather(), &mut buffer) {
        warn!(error = %err, "failed to encode metrics");
        return plain(StatusCode::INTERNAL_SERVER_ERROR, "failed to encode metrics");
    }

    let mut response = Response::new(Full::new(Bytes::from(buffer)));
    if let Ok(content_type) = encoder.format_type().parse() {
        response.headers_mut().insert(CONTENT_TYPE, content_type);
    }
    response
}

fn plain(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from_static(body.as_bytes())));
    *response.status_mut() = status;
    response
}
