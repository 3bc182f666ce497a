//! Request forwarding to a single upstream

use async_trait::async_trait;
use axum::body::Body;
use axum::http::header::{self, HeaderMap, HeaderName};
use axum::http::{Request, Response, StatusCode, Uri, Version};
use axum::response::IntoResponse;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use reqwest::Url;
use tracing::warn;

/// Relays one request/response pair to an upstream.
///
/// Implementations never fail at the type level: transport problems are
/// turned into an error response for the caller.
#[async_trait]
pub trait Forwarder: Send + Sync {
    /// Forward a request and return the upstream's response
    async fn forward(&self, req: Request<Body>) -> Response<Body>;
}

/// Headers that only make sense for a single connection
const HOP_BY_HOP: [HeaderName; 7] = [
    header::CONNECTION,
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

/// Reverse proxy bound to one backend URL
pub struct HttpForwarder {
    /// Backend this forwarder targets
    target: Url,
    /// Shared HTTP client
    client: Client<HttpConnector, Body>,
}

impl HttpForwarder {
    /// Create a forwarder with its own connection pool
    pub fn new(target: Url) -> Self {
        let client = Client::builder(TokioExecutor::new()).build(HttpConnector::new());
        Self::with_client(target, client)
    }

    /// Create a forwarder that shares an existing client
    pub fn with_client(target: Url, client: Client<HttpConnector, Body>) -> Self {
        Self { target, client }
    }

    /// Get the target URL
    pub fn target(&self) -> &Url {
        &self.target
    }

    /// Rewrite an inbound URI onto the target, keeping path and query.
    /// Any query or fragment on the target itself is dropped.
    fn upstream_uri(&self, inbound: &Uri) -> Result<Uri, axum::http::uri::InvalidUri> {
        let path_and_query = inbound
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let mut base = self.target.clone();
        base.set_query(None);
        base.set_fragment(None);
        format!("{}{}", base.as_str().trim_end_matches('/'), path_and_query).parse()
    }
}

#[async_trait]
impl Forwarder for HttpForwarder {
    async fn forward(&self, mut req: Request<Body>) -> Response<Body> {
        let uri = match self.upstream_uri(req.uri()) {
            Ok(uri) => uri,
            Err(e) => {
                warn!(backend = %self.target, error = %e, "Proxy error");
                return bad_gateway();
            }
        };

        *req.uri_mut() = uri;
        *req.version_mut() = Version::HTTP_11;
        strip_hop_by_hop(req.headers_mut());

        match self.client.request(req).await {
            Ok(response) => {
                let mut response: Response<Body> = response.map(Body::new);
                strip_hop_by_hop(response.headers_mut());
                response
            }
            Err(e) => {
                warn!(backend = %self.target, error = %e, "Proxy error");
                bad_gateway()
            }
        }
    }
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP.iter() {
        headers.remove(name);
    }
    headers.remove("keep-alive");
}

/// The response sent when an upstream could not be reached
pub fn bad_gateway() -> Response<Body> {
    (StatusCode::BAD_GATEWAY, "Proxy error").into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use axum::routing::get;
    use axum::Router;

    fn forwarder(target: &str) -> HttpForwarder {
        HttpForwarder::new(Url::parse(target).unwrap())
    }

    #[test]
    fn test_upstream_uri_keeps_path_and_query() {
        let fwd = forwarder("http://127.0.0.1:9000");
        let uri = fwd
            .upstream_uri(&"/api/items?page=2".parse().unwrap())
            .unwrap();
        assert_eq!(uri.to_string(), "http://127.0.0.1:9000/api/items?page=2");
    }

    #[test]
    fn test_upstream_uri_joins_target_prefix() {
        let fwd = forwarder("http://127.0.0.1:9000/base/");
        assert_eq!(fwd.target().path(), "/base/");
        let uri = fwd.upstream_uri(&"/items".parse().unwrap()).unwrap();
        assert_eq!(uri.to_string(), "http://127.0.0.1:9000/base/items");
    }

    #[test]
    fn test_upstream_uri_ignores_target_query() {
        let fwd = forwarder("http://127.0.0.1:9000/base/?a=1#frag");
        let uri = fwd.upstream_uri(&"/items?b=2".parse().unwrap()).unwrap();
        assert_eq!(uri.to_string(), "http://127.0.0.1:9000/base/items?b=2");
    }

    #[test]
    fn test_strip_hop_by_hop() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONNECTION, "keep-alive".parse().unwrap());
        headers.insert("keep-alive", "timeout=5".parse().unwrap());
        headers.insert(header::CONTENT_TYPE, "text/plain".parse().unwrap());

        strip_hop_by_hop(&mut headers);

        assert!(headers.get(header::CONNECTION).is_none());
        assert!(headers.get("keep-alive").is_none());
        assert!(headers.get(header::CONTENT_TYPE).is_some());
    }

    #[tokio::test]
    async fn test_forward_to_live_backend() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = Router::new().route("/hello", get(|| async { "hello from upstream" }));
        tokio::spawn(async move { axum::serve(listener, app).await });

        let fwd = forwarder(&format!("http://{}", addr));
        let req = Request::builder()
            .uri("/hello")
            .body(Body::empty())
            .unwrap();

        let response = fwd.forward(req).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"hello from upstream");
    }

    #[tokio::test]
    async fn test_forward_to_dead_backend_is_bad_gateway() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let fwd = forwarder(&format!("http://{}", addr));
        let req = Request::builder().uri("/").body(Body::empty()).unwrap();

        let response = fwd.forward(req).await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"Proxy error");
    }
}
