//! HTTP reverse proxy routing by `Host` header.
//!
//! The proxy listens on the load-balancer address. Each request loads the
//! current registry snapshot, so keep-alive connections follow reloads
//! without being closed, and requests already in flight finish against the
//! snapshot they started with.

use std::convert::Infallible;
use std::net::SocketAddr;

use bytes::Bytes;
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::uri::{Authority, Scheme};
use http::{Request, Response, StatusCode, Uri};
use http_body_util::{combinators::UnsyncBoxBody, BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use log::{debug, error, info, warn};
use thiserror::Error;
use tokio::net::TcpListener;

use crate::error::Result;
use crate::registry::{EndpointId, Lookup, ProxyMode, Registry, RegistryHandle};

pub type ProxyBody = UnsyncBoxBody<Bytes, hyper::Error>;

/// Headers that only make sense for a single hop.
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_FORWARDED_HOST: &str = "x-forwarded-host";

/// Why a request could not be routed.
#[derive(Debug, Error)]
pub enum RouteError {
    #[error("request has no Host header")]
    MissingHost,

    #[error("no endpoint named {0}")]
    UnknownHost(String),

    #[error("{host} is not proxied over HTTP ({mode:?})")]
    NotProxied { host: String, mode: ProxyMode },

    #[error("{0} has no backend port")]
    NoPort(String),

    #[error("backend for {host} failed: {reason}")]
    Upstream { host: String, reason: String },
}

impl RouteError {
    pub fn status(&self) -> StatusCode {
        match self {
            RouteError::MissingHost => StatusCode::BAD_REQUEST,
            RouteError::UnknownHost(_) => StatusCode::NOT_FOUND,
            RouteError::NotProxied { .. } | RouteError::NoPort(_) => {
                StatusCode::MISDIRECTED_REQUEST
            }
            RouteError::Upstream { .. } => StatusCode::BAD_GATEWAY,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            RouteError::MissingHost => "missing_host",
            RouteError::UnknownHost(_) => "unknown_host",
            RouteError::NotProxied { .. } => "not_proxied",
            RouteError::NoPort(_) => "no_backend_port",
            RouteError::Upstream { .. } => "upstream_failed",
        }
    }

    fn host(&self) -> Option<&str> {
        match self {
            RouteError::MissingHost => None,
            RouteError::UnknownHost(host)
            | RouteError::NoPort(host)
            | RouteError::NotProxied { host, .. }
            | RouteError::Upstream { host, .. } => Some(host.as_str()),
        }
    }

    fn into_response(self) -> Response<ProxyBody> {
        let body = serde_json::json!({
            "error": self.code(),
            "host": self.host(),
            "message": self.to_string(),
        });
        let mut response = Response::new(full(body.to_string()));
        *response.status_mut() = self.status();
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        response
    }
}

/// Where a request is forwarded to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backend {
    pub endpoint: EndpointId,
    pub addr: SocketAddr,
}

/// Host name from a `Host` header or URI authority, without port or
/// trailing dot.
pub fn request_host(headers: &HeaderMap, uri: &Uri) -> Option<String> {
    let raw = headers
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .or_else(|| uri.authority().map(|authority| authority.to_string()))?;
    let authority: Authority = raw.parse().ok()?;
    let host = authority.host();
    let host = host.strip_suffix('.').unwrap_or(host);
    (!host.is_empty()).then(|| host.to_string())
}

/// Find the backend serving `host` in `registry`.
pub fn route(registry: &Registry, host: &str) -> std::result::Result<Backend, RouteError> {
    let resolution = match registry.lookup(host) {
        Lookup::Found(resolution) => resolution,
        Lookup::Retired(_) | Lookup::Missing => {
            return Err(RouteError::UnknownHost(host.to_string()))
        }
    };

    let effective = resolution.effective;
    if effective.proxy_mode != ProxyMode::Http {
        return Err(RouteError::NotProxied {
            host: host.to_string(),
            mode: effective.proxy_mode,
        });
    }
    let port = effective
        .port()
        .ok_or_else(|| RouteError::NoPort(host.to_string()))?;

    Ok(Backend {
        endpoint: effective.id,
        addr: SocketAddr::new(effective.ip(), port),
    })
}

/// `uri` pointed at `backend` over plain HTTP, path and query kept.
pub fn rewrite_uri(uri: &Uri, backend: SocketAddr) -> http::Result<Uri> {
    let path_and_query = uri.path_and_query().map_or("/", |pq| pq.as_str());
    Uri::builder()
        .scheme(Scheme::HTTP)
        .authority(backend.to_string())
        .path_and_query(path_and_query)
        .build()
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    // Headers listed in Connection are hop-by-hop too.
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

fn full(body: impl Into<Bytes>) -> ProxyBody {
    Full::new(body.into())
        .map_err(|never: Infallible| match never {})
        .boxed_unsync()
}

/// Routes and forwards requests against the published registry.
#[derive(Clone)]
pub struct ReverseProxy {
    registry: RegistryHandle,
    client: Client<HttpConnector, Incoming>,
}

impl ReverseProxy {
    pub fn new(registry: RegistryHandle) -> Self {
        let client = Client::builder(TokioExecutor::new()).build_http();
        Self { registry, client }
    }

    /// Handle one request. Failures become error responses, never errors.
    pub async fn handle(
        &self,
        request: Request<Incoming>,
        peer: SocketAddr,
    ) -> std::result::Result<Response<ProxyBody>, Infallible> {
        let path = request
            .uri()
            .path_and_query()
            .map_or_else(|| "/".to_string(), |pq| pq.to_string());

        let response = match self.forward(request, peer).await {
            Ok(response) => response,
            Err(e) => {
                warn!("Unroutable HTTP request from {} for {}: {}", peer, path, e);
                e.into_response()
            }
        };
        Ok(response)
    }

    async fn forward(
        &self,
        mut request: Request<Incoming>,
        peer: SocketAddr,
    ) -> std::result::Result<Response<ProxyBody>, RouteError> {
        let host = request_host(request.headers(), request.uri()).ok_or(RouteError::MissingHost)?;
        let backend = {
            let snapshot = self.registry.current();
            route(&snapshot, &host)?
        };
        debug!("Proxying request for {} to {}", host, backend.addr);

        let upstream = |reason: String| RouteError::Upstream {
            host: host.clone(),
            reason,
        };

        let uri = rewrite_uri(request.uri(), backend.addr).map_err(|e| upstream(e.to_string()))?;
        *request.uri_mut() = uri;

        let headers = request.headers_mut();
        strip_hop_by_hop(headers);
        let forwarded_for = match headers
            .get(X_FORWARDED_FOR)
            .and_then(|value| value.to_str().ok())
        {
            Some(previous) => format!("{previous}, {}", peer.ip()),
            None => peer.ip().to_string(),
        };
        if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
            headers.insert(X_FORWARDED_FOR, value);
        }
        if let Ok(value) = HeaderValue::from_str(&host) {
            headers.insert(X_FORWARDED_HOST, value);
        }

        let response = self
            .client
            .request(request)
            .await
            .map_err(|e| upstream(e.to_string()))?;

        let (mut parts, body) = response.into_parts();
        strip_hop_by_hop(&mut parts.headers);
        Ok(Response::from_parts(parts, body.boxed_unsync()))
    }
}

/// The proxy's listening socket.
pub struct ProxyServer {
    listener: TcpListener,
    proxy: ReverseProxy,
}

impl ProxyServer {
    pub async fn bind(bind_addr: SocketAddr, proxy: ReverseProxy) -> Result<Self> {
        let listener = TcpListener::bind(bind_addr).await?;
        info!("HTTP proxy listening on {}", listener.local_addr()?);
        Ok(Self { listener, proxy })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections forever, one task per connection.
    pub async fn run(self) -> Result<()> {
        loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("Failed to accept proxy connection: {}", e);
                    continue;
                }
            };
            let proxy = self.proxy.clone();
            tokio::spawn(async move {
                let service = service_fn(move |request| {
                    let proxy = proxy.clone();
                    async move { proxy.handle(request, peer).await }
                });
                if let Err(e) = http1::Builder::new()
                    .keep_alive(true)
                    .serve_connection(TokioIo::new(stream), service)
                    .await
                {
                    debug!("Proxy connection from {} ended: {}", peer, e);
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::overrides::ManualDeclaration;
    use crate::reconcile::reconcile;

    fn registry() -> Registry {
        let manual = [
            ManualDeclaration::new(
                "api.shop.cnt.local",
                "172.18.0.5".parse().unwrap(),
                Some(8080),
                ProxyMode::Http,
            ),
            ManualDeclaration::new(
                "db.cnt.local",
                "10.0.0.9".parse().unwrap(),
                Some(5432),
                ProxyMode::Tcp,
            ),
            ManualDeclaration::new("dns.cnt.local", "10.0.0.10".parse().unwrap(), None, ProxyMode::DnsOnly),
            ManualDeclaration::new(
                "secure.cnt.local",
                "10.0.0.11".parse().unwrap(),
                Some(443),
                ProxyMode::Https,
            ),
        ];
        reconcile(&Registry::empty("cnt.local"), &[], &manual).registry
    }

    #[test]
    fn host_header_is_cleaned() {
        let uri: Uri = "/path".parse().unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, HeaderValue::from_static("api.shop.cnt.local.:80"));
        assert_eq!(
            request_host(&headers, &uri).as_deref(),
            Some("api.shop.cnt.local")
        );

        headers.insert(header::HOST, HeaderValue::from_static("[::1]:8080"));
        assert_eq!(request_host(&headers, &uri).as_deref(), Some("[::1]"));

        let absolute: Uri = "http://web.cnt.local/x".parse().unwrap();
        assert_eq!(
            request_host(&HeaderMap::new(), &absolute).as_deref(),
            Some("web.cnt.local")
        );
        assert_eq!(request_host(&HeaderMap::new(), &uri), None);
    }

    #[test]
    fn routes_http_endpoint_by_any_name() {
        let registry = registry();
        for host in ["api.shop.cnt.local", "api.shop.lb.cnt.local"] {
            let backend = route(&registry, host).unwrap();
            assert_eq!(backend.addr, "172.18.0.5:8080".parse().unwrap());
        }
    }

    #[test]
    fn routes_discovered_compose_container() {
        use crate::discovery::{propose, DiscoverySettings, COMPOSE_PROJECT_LABEL, COMPOSE_SERVICE_LABEL};
        use crate::types::{ContainerInfo, ExposedPort, Inventory, NetworkAttachment, NetworkInfo};
        use std::collections::HashMap;

        let inventory = Inventory {
            containers: vec![ContainerInfo {
                id: "c1".into(),
                names: vec!["/api-1".into()],
                labels: HashMap::from([
                    (COMPOSE_PROJECT_LABEL.to_string(), "shop".to_string()),
                    (COMPOSE_SERVICE_LABEL.to_string(), "api".to_string()),
                ]),
                ports: vec![ExposedPort::tcp(8080)],
                networks: vec![NetworkAttachment {
                    network_id: "br".into(),
                    ip: Some("172.18.0.5".parse().unwrap()),
                }],
            }],
            networks: vec![NetworkInfo {
                id: "br".into(),
                driver: "bridge".into(),
            }],
        };
        let proposals = propose(&inventory, &DiscoverySettings::new("cnt.local"));
        let registry = reconcile(&Registry::empty("cnt.local"), &proposals, &[]).registry;

        for host in ["api.shop.cnt.local", "api.cnt.local", "api-1.cnt.local", "api.shop.lb.cnt.local"] {
            let backend = route(&registry, host).unwrap();
            assert_eq!(backend.addr, "172.18.0.5:8080".parse().unwrap(), "{host}");
        }
        let uri = rewrite_uri(&"/cart".parse::<Uri>().unwrap(), route(&registry, "api.shop.cnt.local").unwrap().addr)
            .unwrap();
        assert_eq!(uri.to_string(), "http://172.18.0.5:8080/cart");
    }

    #[test]
    fn refuses_unknown_and_non_http_hosts() {
        let registry = registry();
        assert!(matches!(
            route(&registry, "nope.cnt.local"),
            Err(RouteError::UnknownHost(_))
        ));
        for host in ["db.cnt.local", "dns.cnt.local", "secure.cnt.local"] {
            let err = route(&registry, host).unwrap_err();
            assert_eq!(err.status(), StatusCode::MISDIRECTED_REQUEST, "{host}");
        }
    }

    #[test]
    fn uri_is_rewritten_to_backend() {
        let uri: Uri = "/orders?id=7".parse().unwrap();
        let rewritten = rewrite_uri(&uri, "172.18.0.5:8080".parse().unwrap()).unwrap();
        assert_eq!(rewritten.to_string(), "http://172.18.0.5:8080/orders?id=7");

        let absolute: Uri = "http://api.shop.cnt.local/".parse().unwrap();
        let rewritten = rewrite_uri(&absolute, "172.18.0.5:8080".parse().unwrap()).unwrap();
        assert_eq!(rewritten.scheme_str(), Some("http"));
        assert_eq!(rewritten.authority().map(|a| a.as_str()), Some("172.18.0.5:8080"));
    }

    #[test]
    fn hop_by_hop_headers_are_removed() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive, x-secret"));
        headers.insert("x-secret", HeaderValue::from_static("1"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert("x-kept", HeaderValue::from_static("yes"));

        strip_hop_by_hop(&mut headers);
        assert_eq!(headers.len(), 1);
        assert!(headers.contains_key("x-kept"));
    }

    #[test]
    fn errors_map_to_distinct_statuses() {
        let statuses = [
            RouteError::MissingHost.status(),
            RouteError::UnknownHost("a".into()).status(),
            RouteError::NoPort("a".into()).status(),
            RouteError::Upstream {
                host: "a".into(),
                reason: "refused".into(),
            }
            .status(),
        ];
        assert_eq!(
            statuses,
            [
                StatusCode::BAD_REQUEST,
                StatusCode::NOT_FOUND,
                StatusCode::MISDIRECTED_REQUEST,
                StatusCode::BAD_GATEWAY,
            ]
        );
    }
}
