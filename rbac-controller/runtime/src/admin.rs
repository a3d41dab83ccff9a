use bytes::Bytes;
use http::{header, HeaderValue, Method, Request, Response, StatusCode};
use http_body_util::Full;
use hyper_util::rt::TokioIo;
use prometheus_client::{encoding::text::encode, registry::Registry};
use std::{convert::Infallible, net::SocketAddr, sync::Arc};
use tokio::net::TcpListener;
use tracing::{debug, info, instrument, Instrument};

const METRICS_CONTENT_TYPE: &str = "application/openmetrics-text; version=1.0.0; charset=utf-8";

/// Serves `/healthz` and `/metrics` until shutdown is signaled.
#[instrument(skip(registry, shutdown))]
pub async fn serve(
    addr: SocketAddr,
    registry: Arc<Registry>,
    shutdown: kubert::shutdown::Watch,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    let addr = listener.local_addr()?;
    info!(%addr, "HTTP admin server listening");

    let signaled = shutdown.signaled();
    tokio::pin!(signaled);
    loop {
        let (io, client) = tokio::select! {
            accepted = listener.accept() => accepted?,
            _release = &mut signaled => {
                debug!("Admin server shutting down");
                return Ok(());
            }
        };

        let registry = registry.clone();
        let svc = hyper::service::service_fn(move |req: Request<hyper::body::Incoming>| {
            let rsp = handle(&req, &registry);
            async move { Ok::<_, Infallible>(rsp) }
        });
        tokio::spawn(
            async move {
                if let Err(error) = hyper::server::conn::http1::Builder::new()
                    .serve_connection(TokioIo::new(io), svc)
                    .await
                {
                    debug!(%error, "Admin connection failed");
                }
            }
            .instrument(tracing::debug_span!("conn", %client)),
        );
    }
}

fn handle<B>(req: &Request<B>, registry: &Registry) -> Response<Full<Bytes>> {
    let readable = matches!(*req.method(), Method::GET | Method::HEAD);
    match req.uri().path() {
        "/healthz" if readable => text(StatusCode::OK, "text/plain", "OK".into()),
        "/metrics" if readable => {
            let mut body = String::new();
            match encode(&mut body, registry) {
                Ok(()) => text(StatusCode::OK, METRICS_CONTENT_TYPE, body),
                Err(error) => text(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "text/plain",
                    error.to_string(),
                ),
            }
        }
        "/healthz" | "/metrics" => text(StatusCode::METHOD_NOT_ALLOWED, "text/plain", String::new()),
        _ => text(StatusCode::NOT_FOUND, "text/plain", String::new()),
    }
}

fn text(status: StatusCode, content_type: &'static str, body: String) -> Response<Full<Bytes>> {
    let mut rsp = Response::new(Full::new(Bytes::from(body)));
    *rsp.status_mut() = status;
    rsp.headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
    rsp
}
