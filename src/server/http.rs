//! The HTTP transport, a thin adapter over `server::Core`.
//!
//! Routing is deliberately small: two save shapes (path segments, JSON), two
//! load shapes, a batch endpoint and a liveness probe. Everything else is a
//! 404. Status codes follow the conventions the agent and its kin expect:
//! 501 for unsupported kinds, 400 for undecodable input or bad signatures,
//! 500 for signature decode failures and backend trouble.

use std::io::Read;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use tiny_http::Method;

use crate::metric::{Metric, MetricKind};
use crate::server::{Core, ServeError};
use crate::thread;
use crate::thread::Stoppable;

/// The HTTP listener. One thread pulls requests off the socket and handles
/// them inline; admission and crypto failures answer before any body
/// decoding happens.
pub struct Server {
    thread: thread::ThreadHandle,
}

impl Server {
    /// Bind `host_port` and start serving. Binding happens on the caller's
    /// thread so a bad address is an error here, not a dead worker later.
    pub fn new(host_port: &str, core: Arc<Core>) -> Result<Server, String> {
        let srv = tiny_http::Server::http(host_port)
            .map_err(|e| format!("failed to bind http listener {}: {}", host_port, e))?;
        info!("http listener bound to {}", host_port);

        Ok(Server {
            thread: thread::spawn(move |stop| {
                loop {
                    if stop.is_set() {
                        break;
                    }
                    match srv.recv_timeout(Duration::from_millis(250)) {
                        Ok(Some(request)) => handle(&core, request),
                        Ok(None) => {}
                        Err(e) => warn!("failed to receive http request: {}", e),
                    }
                }
            }),
        })
    }
}

impl Stoppable for Server {
    fn join(self) {
        self.thread.join();
    }

    fn shutdown(self) {
        self.thread.shutdown();
    }
}

fn respond_text(request: tiny_http::Request, status: u16, body: &str) {
    let response = tiny_http::Response::from_string(body).with_status_code(status);
    if let Err(e) = request.respond(response) {
        warn!("failed to send response: {}", e);
    }
}

fn respond_json(request: tiny_http::Request, status: u16, body: String) {
    let content_type =
        tiny_http::Header::from_bytes(&b"Content-Type"[..], "application/json")
            .expect("static header is well formed");
    let response = tiny_http::Response::from_string(body)
        .with_status_code(status)
        .with_header(content_type);
    if let Err(e) = request.respond(response) {
        warn!("failed to send response: {}", e);
    }
}

// The caller-address tag rides in X-Real-IP, set by the agent or by
// whatever proxy fronts the server.
fn caller_address(request: &tiny_http::Request) -> Option<IpAddr> {
    for header in request.headers() {
        if header.field.equiv("X-Real-IP") {
            return IpAddr::from_str(header.value.as_str()).ok();
        }
    }
    None
}

fn handle(core: &Core, mut request: tiny_http::Request) {
    let caller = caller_address(&request);
    if let Err(err) = core.admit(caller) {
        warn!("{}", err);
        respond_text(request, 403, "Forbidden");
        return;
    }

    let mut raw_body = Vec::new();
    if request.as_reader().read_to_end(&mut raw_body).is_err() {
        respond_text(request, 400, "Bad Request");
        return;
    }
    let body = match core.decrypt_body(&raw_body) {
        Ok(body) => body,
        Err(err) => {
            warn!("{}", err);
            respond_text(request, 400, "Bad Request");
            return;
        }
    };

    let url = request.url().to_string();
    let segments: Vec<&str> = url.trim_matches('/').split('/').collect();
    let method = request.method().clone();

    match (method, segments.as_slice()) {
        (Method::Post, ["update", kind, name, value]) => {
            save_text(core, request, kind, name, value)
        }
        (Method::Post, ["update"]) => save_json(core, request, &body),
        (Method::Post, ["updates"]) => save_json_batch(core, request, &body),
        (Method::Get, ["value", kind, name]) => load_text(core, request, kind, name),
        (Method::Post, ["value"]) => load_json(core, request, &body),
        (Method::Get, ["ping"]) => ping(core, request),
        _ => respond_text(request, 404, "Not Found"),
    }
}

fn save_text(
    core: &Core,
    request: tiny_http::Request,
    kind: &str,
    name: &str,
    value: &str,
) {
    // the kind gate runs before the value is even looked at
    let kind = match MetricKind::from_name(kind) {
        Some(kind) => kind,
        None => {
            respond_text(request, 501, "Not Implemented");
            return;
        }
    };

    let metric = match kind {
        MetricKind::Counter => match value.parse::<i64>() {
            Ok(delta) => Metric::counter(name, delta),
            Err(_) => {
                respond_text(request, 400, "Bad Request");
                return;
            }
        },
        MetricKind::Gauge => match value.parse::<f64>() {
            Ok(value) => Metric::gauge(name, value),
            Err(_) => {
                respond_text(request, 400, "Bad Request");
                return;
            }
        },
    };

    match core.save_unsigned(&metric) {
        Ok(()) => respond_text(request, 200, "Success: metric stored\n"),
        Err(err) => {
            warn!("failed to store metric {}: {}", metric.id, err);
            respond_text(request, 500, "Internal Server Error");
        }
    }
}

fn load_text(core: &Core, request: tiny_http::Request, kind: &str, name: &str) {
    match core.load_one(name, kind) {
        Ok(metric) => {
            let value = match metric.metric_kind() {
                Some(MetricKind::Counter) => {
                    metric.delta.map(|d| d.to_string())
                }
                Some(MetricKind::Gauge) => metric.value.map(|v| v.to_string()),
                None => None,
            };
            match value {
                Some(value) => respond_text(request, 200, &value),
                None => respond_text(request, 404, "Not Found"),
            }
        }
        // the plain-text surface collapses unsupported kinds into not-found
        Err(ServeError::Unsupported) | Err(ServeError::NotFound) => {
            respond_text(request, 404, "Not Found")
        }
        Err(err) => {
            warn!("failed to load metric {}: {}", name, err);
            respond_text(request, 500, "Internal Server Error");
        }
    }
}

fn save_json(core: &Core, request: tiny_http::Request, body: &[u8]) {
    let metric: Metric = match serde_json::from_slice(body) {
        Ok(metric) => metric,
        Err(_) => {
            respond_json(request, 400, r#"{"error": "bad or no payload"}"#.to_string());
            return;
        }
    };

    match core.save_one(&metric) {
        Ok(()) => {
            respond_json(request, 200, r#"{"result": "metric saved"}"#.to_string())
        }
        Err(err) => respond_save_error(request, &metric.id, err),
    }
}

fn save_json_batch(core: &Core, request: tiny_http::Request, body: &[u8]) {
    let metrics: Vec<Metric> = match serde_json::from_slice(body) {
        Ok(metrics) => metrics,
        Err(_) => {
            respond_json(request, 400, r#"{"error": "bad or no payload"}"#.to_string());
            return;
        }
    };

    match core.save_many(&metrics) {
        Ok(()) => {
            respond_json(request, 200, r#"{"result": "metrics saved"}"#.to_string())
        }
        Err(err) => respond_save_error(request, "batch", err),
    }
}

fn respond_save_error(request: tiny_http::Request, what: &str, err: ServeError) {
    match err {
        ServeError::Unsupported => respond_json(
            request,
            501,
            r#"{"error": "unsupported metric type"}"#.to_string(),
        ),
        ServeError::HashUndecodable => respond_json(
            request,
            500,
            r#"{"error": "failed to decode hash"}"#.to_string(),
        ),
        ServeError::HashMismatch => {
            respond_json(request, 400, r#"{"error": "invalid hash"}"#.to_string())
        }
        err => {
            warn!("failed to store {}: {}", what, err);
            respond_json(
                request,
                400,
                r#"{"error": "failed to store metric"}"#.to_string(),
            )
        }
    }
}

fn load_json(core: &Core, request: tiny_http::Request, body: &[u8]) {
    let asked: Metric = match serde_json::from_slice(body) {
        Ok(asked) => asked,
        Err(_) => {
            respond_json(request, 400, r#"{"error": "bad or no payload"}"#.to_string());
            return;
        }
    };

    match core.load_one(&asked.id, &asked.kind) {
        Ok(metric) => match serde_json::to_string(&metric) {
            Ok(body) => respond_json(request, 200, body),
            Err(e) => {
                warn!("failed to marshal metric {}: {}", metric.id, e);
                respond_json(
                    request,
                    500,
                    r#"{"error": "failed to marshal metric"}"#.to_string(),
                )
            }
        },
        Err(ServeError::Unsupported) => respond_json(
            request,
            501,
            r#"{"error": "unsupported metric type"}"#.to_string(),
        ),
        Err(ServeError::NotFound) => respond_json(
            request,
            404,
            r#"{"result": "unknown metric id"}"#.to_string(),
        ),
        Err(err) => {
            warn!("failed to load metric {}: {}", asked.id, err);
            respond_json(
                request,
                500,
                r#"{"error": "failed to load metric"}"#.to_string(),
            )
        }
    }
}

fn ping(core: &Core, request: tiny_http::Request) {
    match core.ping() {
        Ok(()) => respond_text(request, 200, "OK"),
        Err(err) => {
            warn!("failed to ping storage: {}", err);
            respond_text(request, 500, "failed to ping storage")
        }
    }
}
