use std::net::SocketAddr;

use http_body_util::Full;
use hyper::{
    Request, Response, StatusCode,
    body::{Bytes, Incoming},
    header::CONTENT_TYPE,
    server::conn::http1,
    service::service_fn,
};
use hyper_util::rt::TokioIo;
use prometheus::{Encoder, Registry, TextEncoder};
use tokio::{net::TcpListener, sync::watch};

use crate::{cache::LocalCache, controller::ControllerState};

fn text(status: StatusCode, body: &'static str) -> Result<Response<Full<Bytes>>, hyper::http::Error> {
    Response::builder()
        .status(status)
        .body(Full::new(Bytes::from_static(body.as_bytes())))
}

fn respond(
    path: &str,
    registry: &Registry,
    ready: bool,
) -> Result<Response<Full<Bytes>>, hyper::http::Error> {
    match path {
        "/metrics" => {
            let encoder = TextEncoder::new();
            let metric_families = registry.gather();
            let mut result = Vec::new();
            match encoder.encode(&metric_families, &mut result) {
                Ok(_) => Response::builder()
                    .status(StatusCode::OK)
                    .header(CONTENT_TYPE, encoder.format_type())
                    .body(Full::new(Bytes::from(result))),
                Err(e) => {
                    error!("{}", e);
                    text(StatusCode::INTERNAL_SERVER_ERROR, "")
                }
            }
        }
        "/healthz" => text(StatusCode::OK, "ok"),
        "/readyz" if ready => text(StatusCode::OK, "ok"),
        "/readyz" => text(StatusCode::SERVICE_UNAVAILABLE, "not ready"),
        _ => text(StatusCode::NOT_FOUND, "not found"),
    }
}

async fn serve_req<C: LocalCache>(
    req: Request<Incoming>,
    registry: Registry,
    cache: C,
    state: watch::Receiver<ControllerState>,
) -> Result<Response<Full<Bytes>>, hyper::http::Error> {
    let ready = cache.has_synced() && *state.borrow() == ControllerState::Running;
    respond(req.uri().path(), &registry, ready)
}

/// Serve `/metrics`, `/healthz` and `/readyz` (ready while the controller is
/// running on a synced cache).
pub(crate) async fn start_prometheus_metrics_server<C: LocalCache>(
    addr: SocketAddr,
    registry: Registry,
    cache: C,
    state: watch::Receiver<ControllerState>,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("Listening on http://{}", addr);
    loop {
        let (stream, _) = listener.accept().await?;
        let registry = registry.clone();
        let cache = cache.clone();
        let state = state.clone();
        tokio::spawn(async move {
            let service = service_fn(move |req| {
                serve_req(req, registry.clone(), cache.clone(), state.clone())
            });
            if let Err(e) = http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service)
                .await
            {
                debug!("metrics connection failed: {}", e);
            }
        });
    }
}
