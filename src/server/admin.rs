use super::GatewayState;
use crate::context::{empty_body, full_body, BoxBody};
use hyper::body::Incoming;
use hyper::{Request, Response};

/// Admin surface: exactly `/healthz`, `/readyz`, `/metrics` (§6). Nothing
/// else runs on this listener — no domain/route introspection, since this
/// gateway has no dynamic service-discovery state to expose.
pub fn handle_admin(
    req: Request<Incoming>,
    state: GatewayState,
) -> Result<Response<BoxBody>, hyper::Error> {
    match req.uri().path() {
        "/healthz" => Ok(Response::builder()
            .status(200)
            .body(full_body(r#"{"status":"healthy"}"#))
            .unwrap()),

        "/readyz" => {
            let _ = state.snapshot();
            Ok(Response::builder()
                .status(200)
                .body(full_body(r#"{"status":"ready"}"#))
                .unwrap())
        }

        "/metrics" => {
            let body = state.metrics.render();
            Ok(Response::builder()
                .status(200)
                .header("content-type", "text/plain; version=0.0.4; charset=utf-8")
                .body(full_body(body))
                .unwrap())
        }

        _ => Ok(Response::builder().status(404).body(empty_body()).unwrap()),
    }
}
