use crate::metrics::Metrics;
use anyhow::{Context, Result};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use log::{error, info};
use std::convert::Infallible;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

/// Start the HTTP metrics server on the specified address and port.
pub async fn serve_metrics(metrics: Arc<Metrics>, ip: IpAddr, port: u16) -> Result<()> {
    let addr = SocketAddr::new(ip, port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind metrics server on {}", addr))?;

    info!("Metrics server listening on http://{}/metrics", addr);

    loop {
        let (stream, _) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                error!("Accept error: {}", e);
                continue;
            }
        };

        let io = TokioIo::new(stream);
        let metrics = Arc::clone(&metrics);

        tokio::spawn(async move {
            let service = service_fn(move |req| {
                let metrics = Arc::clone(&metrics);
                handle_request(req, metrics)
            });

            let conn = hyper::server::conn::http1::Builder::new().serve_connection(io, service);

            if let Err(e) = conn.await {
                error!("Connection error: {}", e);
            }
        });
    }
}

fn text_response(status: StatusCode, content_type: &'static str, body: String) -> Response<String> {
    let mut response = Response::new(body);
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    metrics: Arc<Metrics>,
) -> Result<Response<String>, Infallible> {
    Ok(route(req.uri().path(), &metrics))
}

fn route(path: &str, metrics: &Metrics) -> Response<String> {
    match path {
        "/metrics" => text_response(
            StatusCode::OK,
            "text/plain; version=0.0.4",
            metrics.to_prometheus(),
        ),
        "/health" => text_response(StatusCode::OK, "text/plain", "OK".to_string()),
        _ => text_response(StatusCode::NOT_FOUND, "text/plain", "Not Found".to_string()),
    }
}
