//! HTTP endpoint
//!
//! Translates a handful of fixed routes into bridge calls. Success is a JSON
//! body with status 200; every failure is a 500 with a one-line plain-text
//! body. The HTTP method is not checked.

use std::convert::Infallible;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderValue, CONTENT_TYPE, X_CONTENT_TYPE_OPTIONS};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info};

use super::{bind, EndpointError};
use crate::bridge::{BridgeHandle, Command};
use crate::config::HttpConfig;
use crate::lifecycle::{Lifecycle, State};
use crate::metrics::Metrics;

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

type HttpResponse = Response<Full<Bytes>>;

/// Shared by every connection
struct Routes {
    bridge: BridgeHandle,
    metrics: Option<Arc<Metrics>>,
    public_url: String,
}

#[derive(Serialize)]
struct HelpEntry {
    description: &'static str,
    url: String,
}

#[derive(Serialize)]
struct CommandAccepted {
    description: &'static str,
    message: &'static str,
}

pub struct HttpEndpoint {
    listener: TcpListener,
    routes: Arc<Routes>,
    lifecycle: Lifecycle,
}

impl HttpEndpoint {
    pub async fn bind(
        config: &HttpConfig,
        bridge: BridgeHandle,
        metrics: Option<Arc<Metrics>>,
    ) -> Result<Self, EndpointError> {
        let listener = bind(config.bind).await?;
        Ok(Self {
            listener,
            routes: Arc::new(Routes {
                bridge,
                metrics,
                public_url: config.public_url.clone(),
            }),
            lifecycle: Lifecycle::new("http"),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    /// Accept connections until `cancel` fires, then let in-flight
    /// connections finish gracefully.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), EndpointError> {
        let Self {
            listener,
            routes,
            lifecycle,
        } = self;

        lifecycle.transition(State::Running);
        if let Ok(addr) = listener.local_addr() {
            info!("HTTP listening on {}", addr);
        }

        let tracker = TaskTracker::new();
        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        debug!("New HTTP connection from {}", addr);
                        tracker.spawn(serve_connection(stream, routes.clone(), cancel.clone()));
                    }
                    Err(e) => {
                        error!("Failed to accept HTTP connection: {}", e);
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
            }
        }

        lifecycle.transition(State::Stopping);
        drop(listener);
        tracker.close();
        tracker.wait().await;
        lifecycle.transition(State::Stopped);
        Ok(())
    }
}

async fn serve_connection(stream: TcpStream, routes: Arc<Routes>, cancel: CancellationToken) {
    let service = service_fn(move |req| {
        let routes = routes.clone();
        async move { Ok::<_, Infallible>(handle_request(req, &routes).await) }
    });

    let conn = http1::Builder::new().serve_connection(TokioIo::new(stream), service);
    tokio::pin!(conn);

    let result = tokio::select! {
        result = conn.as_mut() => result,
        _ = cancel.cancelled() => {
            conn.as_mut().graceful_shutdown();
            conn.await
        }
    };
    if let Err(e) = result {
        debug!("Error serving HTTP connection: {}", e);
    }
}

async fn handle_request(req: Request<Incoming>, routes: &Routes) -> HttpResponse {
    let path = req.uri().path();
    debug!("{} {}", req.method(), path);

    match path {
        "/status" => match routes.bridge.status().await {
            Ok(status) => json_response(&status),
            Err(e) => error_response(&e.to_string()),
        },
        "/power/on" => enqueue(routes, Command::PowerOn, "Power ON"),
        "/power/off" => enqueue(routes, Command::PowerOff, "Power OFF"),
        "/power/toggle" => enqueue(routes, Command::PowerToggle, "Power TOGGLE"),
        "/metrics" => match routes.metrics {
            Some(ref metrics) => metrics_response(metrics),
            None => help(&routes.public_url),
        },
        _ => help(&routes.public_url),
    }
}

fn enqueue(routes: &Routes, command: Command, description: &'static str) -> HttpResponse {
    match routes.bridge.enqueue(command) {
        Ok(()) => json_response(&CommandAccepted {
            description,
            message: "success",
        }),
        Err(e) => error_response(&e.to_string()),
    }
}

fn help(public_url: &str) -> HttpResponse {
    let entries: Vec<HelpEntry> = [
        ("Help", "/"),
        ("Status", "/status"),
        ("Power ON", "/power/on"),
        ("Power OFF", "/power/off"),
        ("Power TOGGLE", "/power/toggle"),
    ]
    .into_iter()
    .map(|(description, path)| HelpEntry {
        description,
        url: format!("{}{}", public_url, path),
    })
    .collect();
    json_response(&entries)
}

fn metrics_response(metrics: &Metrics) -> HttpResponse {
    match metrics.render() {
        Ok((body, content_type)) => {
            let mut response = Response::new(Full::new(Bytes::from(body)));
            if let Ok(value) = HeaderValue::from_str(&content_type) {
                response.headers_mut().insert(CONTENT_TYPE, value);
            }
            response
        }
        Err(e) => {
            error!("Failed to encode metrics: {}", e);
            error_response("failed to encode metrics")
        }
    }
}

fn json_response<T: Serialize + ?Sized>(value: &T) -> HttpResponse {
    match serde_json::to_vec(value) {
        Ok(body) => {
            let mut response = Response::new(Full::new(Bytes::from(body)));
            response
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            response
        }
        Err(e) => {
            error!("Failed to serialize response: {}", e);
            error_response("internal error")
        }
    }
}

fn error_response(message: &str) -> HttpResponse {
    let mut response = Response::new(Full::new(Bytes::from(format!("{}\n", message))));
    *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
    let headers = response.headers_mut();
    headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    headers.insert(X_CONTENT_TYPE_OPTIONS, HeaderValue::from_static("nosniff"));
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;
    use pretty_assertions::assert_eq;

    async fn body_string(response: HttpResponse) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_error_envelope() {
        let response = error_response("bridge unavailable");
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            response.headers()[CONTENT_TYPE],
            "text/plain; charset=utf-8"
        );
        assert_eq!(response.headers()[X_CONTENT_TYPE_OPTIONS], "nosniff");
        assert_eq!(body_string(response).await, "bridge unavailable\n");
    }

    #[tokio::test]
    async fn test_help_listing_uses_public_url() {
        let response = help("http://switch.local:8080");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[CONTENT_TYPE], "application/json");

        let body: serde_json::Value =
            serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(
            body,
            serde_json::json!([
                {"description": "Help", "url": "http://switch.local:8080/"},
                {"description": "Status", "url": "http://switch.local:8080/status"},
                {"description": "Power ON", "url": "http://switch.local:8080/power/on"},
                {"description": "Power OFF", "url": "http://switch.local:8080/power/off"},
                {"description": "Power TOGGLE", "url": "http://switch.local:8080/power/toggle"},
            ])
        );
    }

    #[tokio::test]
    async fn test_command_accepted_body_field_order() {
        let response = json_response(&CommandAccepted {
            description: "Power ON",
            message: "success",
        });
        assert_eq!(
            body_string(response).await,
            r#"{"description":"Power ON","message":"success"}"#
        );
    }

    #[tokio::test]
    async fn test_metrics_response() {
        let metrics = Metrics::new().unwrap();
        metrics.command_enqueued("power_on");
        let response = metrics_response(&metrics);
        assert_eq!(response.status(), StatusCode::OK);
        assert!(body_string(response)
            .await
            .contains("powerbridge_commands_enqueued_total"));
    }
}
