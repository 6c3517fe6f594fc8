use super::DirectorState;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::{Request, Response};

type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

fn full_body(data: impl Into<Bytes>) -> BoxBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed()
}

pub fn handle_admin(
    req: Request<Incoming>,
    state: DirectorState,
) -> Result<Response<BoxBody>, hyper::Error> {
    match req.uri().path() {
        "/health" | "/healthz" => Ok(Response::builder()
            .status(200)
            .body(full_body(r#"{"status":"ok"}"#))
            .unwrap()),

        "/ready" | "/readyz" => {
            // Ready once the first discovery stream was established, so
            // orchestrators can hold traffic until then.
            let synced = state.client.has_synced();
            let clusters = state.client.assignments().len();
            Ok(Response::builder()
                .status(if synced { 200 } else { 503 })
                .body(full_body(format!(
                    r#"{{"status":{:?},"clusters":{}}}"#,
                    if synced { "ready" } else { "syncing" },
                    clusters,
                )))
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

        "/clusters" => {
            let assignments = state.client.assignments();
            let mut names = assignments.clusters();
            names.sort();

            let clusters: Vec<serde_json::Value> = names
                .iter()
                .map(|name| {
                    let (backends, _) = assignments.all(name, false);
                    serde_json::json!({
                        "name": name,
                        "endpoints": backends.iter().map(|b| {
                            serde_json::json!({
                                "address": b.addr.to_string(),
                                "port": b.port,
                                "health": b.health_name(),
                                "weight": b.weight,
                                "locality": b.locality.as_ref().map(|l| {
                                    serde_json::json!({
                                        "region": l.region,
                                        "zone": l.zone,
                                        "sub_zone": l.sub_zone,
                                    })
                                }),
                            })
                        }).collect::<Vec<_>>(),
                    })
                })
                .collect();

            let body = serde_json::to_string_pretty(&clusters).unwrap_or_default();
            Ok(Response::builder()
                .status(200)
                .header("content-type", "application/json")
                .body(full_body(body))
                .unwrap())
        }

        _ => Ok(Response::builder()
            .status(404)
            .body(full_body(r#"{"error":"not found"}"#))
            .unwrap()),
    }
}
