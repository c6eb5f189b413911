//! Kube client backed by an in-process responder, for adapter tests

use std::sync::{Arc, Mutex};

use http::{header, Method, Request, Response, StatusCode};
use kube::client::Body;
use kube::Client;
use serde_json::{json, Value};

/// A request received by the fake API server
#[derive(Clone, Debug)]
pub struct Recorded {
    pub method: Method,
    pub path: String,
    pub content_type: Option<String>,
}

/// Requests seen so far, in order
#[derive(Clone, Default)]
pub struct RequestLog(Arc<Mutex<Vec<Recorded>>>);

impl RequestLog {
    pub fn requests(&self) -> Vec<Recorded> {
        self.0.lock().unwrap().clone()
    }

    pub fn calls(&self) -> Vec<(Method, String)> {
        self.requests()
            .into_iter()
            .map(|r| (r.method, r.path))
            .collect()
    }
}

/// Build a client whose requests are answered by `respond(method, path)`
pub fn fake_api<F>(respond: F) -> (Client, RequestLog)
where
    F: Fn(&Method, &str) -> (StatusCode, Value) + Send + Sync + 'static,
{
    let log = RequestLog::default();
    let seen = log.clone();

    let service = tower::service_fn(move |request: Request<Body>| {
        let path = request.uri().path().to_string();
        let (status, body) = respond(request.method(), &path);
        seen.0.lock().unwrap().push(Recorded {
            method: request.method().clone(),
            path,
            content_type: request
                .headers()
                .get(header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
        });

        async move {
            Response::builder()
                .status(status)
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(serde_json::to_vec(&body).unwrap()))
        }
    });

    (Client::new(service, "default"), log)
}

/// Body of a 404 Status as returned by the API server
pub fn not_found(name: &str) -> (StatusCode, Value) {
    (
        StatusCode::NOT_FOUND,
        json!({
            "kind": "Status",
            "apiVersion": "v1",
            "metadata": {},
            "status": "Failure",
            "message": format!("\"{name}\" not found"),
            "reason": "NotFound",
            "code": 404,
        }),
    )
}
