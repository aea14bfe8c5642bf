//! ---
//! skyr_section: "05-networking-external-interfaces"
//! skyr_subsection: "module"
//! skyr_type: "source"
//! skyr_scope: "code"
//! skyr_description: "Request middleware: panic recovery, request logging, CORS, Basic auth, transaction ids."
//! skyr_version: "v0.0.0-prealpha"
//! skyr_owner: "tbd"
//! ---
//! Stages run outermost first: recovery, logging, CORS, authentication,
//! transaction assignment, request deadline. CORS answers preflight requests
//! itself, so an `OPTIONS` never reaches authentication.
use std::any::Any;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::header::{self, HeaderMap, HeaderName, HeaderValue};
use axum::http::{Method, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use futures::FutureExt;
use skyr_common::{AuthConfig, CorsConfig};
use tracing::{debug, error, warn};

use crate::envelope::{
    find_param, parse_client_transaction_id, AlpacaReply, AlpacaResponse, ErrorCode, ErrorDetail,
    TransactionCounter, TransactionIds, CLIENT_TRANSACTION_KEY,
};

const FORM_BODY_LIMIT: usize = 1024 * 1024;

/// Turn a handler panic into a 500 envelope instead of a dropped connection.
pub async fn recover_panics(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_owned();
    match AssertUnwindSafe(next.run(request)).catch_unwind().await {
        Ok(response) => response,
        Err(panic) => {
            let detail = panic_message(panic.as_ref());
            error!(%method, path = %path, panic = %detail, "request handler panicked");
            AlpacaReply::with_status(
                StatusCode::INTERNAL_SERVER_ERROR,
                AlpacaResponse::error(
                    ErrorCode::UNSPECIFIED,
                    "Internal server error",
                    TransactionIds::default(),
                ),
            )
            .into_response()
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

/// One line per request; level follows the response class.
pub async fn log_requests(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_owned();
    let query = request.uri().query().unwrap_or_default().to_owned();
    let client = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let started = Instant::now();

    let response = next.run(request).await;

    let status = response.status().as_u16();
    let duration_ms = started.elapsed().as_millis() as u64;
    let failure = response
        .extensions()
        .get::<ErrorDetail>()
        .map(|detail| detail.0.as_str())
        .unwrap_or_default();
    if response.status().is_server_error() {
        error!(%method, path = %path, query = %query, client = ?client, status, duration_ms, error = failure, "request failed");
    } else if response.status().is_client_error() {
        warn!(%method, path = %path, query = %query, client = ?client, status, duration_ms, error = failure, "request rejected");
    } else {
        debug!(%method, path = %path, query = %query, client = ?client, status, duration_ms, error = failure, "request served");
    }
    response
}

/// Resolved CORS headers for the configured policy.
#[derive(Debug, Clone)]
pub struct CorsPolicy {
    allowed_origins: Vec<String>,
    allow_methods: String,
    allow_headers: String,
    allow_credentials: bool,
    max_age: String,
}

impl CorsPolicy {
    pub fn from_config(config: &CorsConfig) -> Self {
        Self {
            allowed_origins: config.allowed_origins.clone(),
            allow_methods: config.allowed_methods.join(", "),
            allow_headers: config.allowed_headers.join(", "),
            allow_credentials: config.allow_credentials,
            max_age: config.max_age.to_string(),
        }
    }

    /// Value for `Access-Control-Allow-Origin`, if the origin may be echoed at all.
    pub fn allowed_origin(&self, origin: Option<&str>) -> Option<String> {
        let wildcard = self.allowed_origins.iter().any(|allowed| allowed == "*");
        match origin {
            Some(origin) if wildcard && self.allow_credentials => Some(origin.to_owned()),
            _ if wildcard => Some("*".to_owned()),
            Some(origin) if self.allowed_origins.iter().any(|allowed| allowed == origin) => {
                Some(origin.to_owned())
            }
            _ => None,
        }
    }

    /// Set the CORS response headers. Nothing is added for a refused origin.
    pub fn apply(&self, origin: Option<&str>, headers: &mut HeaderMap) {
        let Some(allowed) = self.allowed_origin(origin) else {
            return;
        };
        insert_header(headers, header::ACCESS_CONTROL_ALLOW_ORIGIN, &allowed);
        if allowed != "*" {
            headers.append(header::VARY, HeaderValue::from_static("Origin"));
        }
        insert_header(headers, header::ACCESS_CONTROL_ALLOW_METHODS, &self.allow_methods);
        insert_header(headers, header::ACCESS_CONTROL_ALLOW_HEADERS, &self.allow_headers);
        if self.allow_credentials {
            headers.insert(
                header::ACCESS_CONTROL_ALLOW_CREDENTIALS,
                HeaderValue::from_static("true"),
            );
        }
        insert_header(headers, header::ACCESS_CONTROL_MAX_AGE, &self.max_age);
    }
}

fn insert_header(headers: &mut HeaderMap, name: HeaderName, value: &str) {
    match HeaderValue::from_str(value) {
        Ok(value) => {
            headers.insert(name, value);
        }
        Err(_) => warn!(header = %name, value, "skipping unrepresentable header value"),
    }
}

pub async fn apply_cors(
    State(policy): State<Arc<CorsPolicy>>,
    request: Request,
    next: Next,
) -> Response {
    let origin = request
        .headers()
        .get(header::ORIGIN)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned);

    let mut response = if request.method() == Method::OPTIONS {
        StatusCode::NO_CONTENT.into_response()
    } else {
        next.run(request).await
    };
    policy.apply(origin.as_deref(), response.headers_mut());
    response
}

/// Decode `Authorization: Basic ...` into its user and password.
pub fn basic_credentials(headers: &HeaderMap) -> Option<(String, String)> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, encoded) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }
    let decoded = STANDARD.decode(encoded.trim()).ok()?;
    let text = String::from_utf8(decoded).ok()?;
    let (user, password) = text.split_once(':')?;
    Some((user.to_owned(), password.to_owned()))
}

pub async fn require_basic_auth(
    State(auth): State<Arc<AuthConfig>>,
    request: Request,
    next: Next,
) -> Response {
    if !auth.enabled {
        return next.run(request).await;
    }
    match basic_credentials(request.headers()) {
        Some((user, password)) if user == auth.username && password == auth.password => {
            next.run(request).await
        }
        presented => {
            debug!(
                path = %request.uri().path(),
                credentials_present = presented.is_some(),
                "rejecting unauthenticated request"
            );
            let mut response = AlpacaReply::with_status(
                StatusCode::UNAUTHORIZED,
                AlpacaResponse::error(
                    ErrorCode::UNSPECIFIED,
                    "Authentication required",
                    TransactionIds::default(),
                ),
            )
            .into_response();
            let challenge = HeaderValue::from_str(&format!("Basic realm=\"{}\"", auth.realm))
                .unwrap_or_else(|_| HeaderValue::from_static("Basic"));
            response
                .headers_mut()
                .insert(header::WWW_AUTHENTICATE, challenge);
            response
        }
    }
}

fn is_form(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.starts_with("application/x-www-form-urlencoded"))
}

/// Attach [`TransactionIds`] to the request. The client number comes from the
/// query string, then from a urlencoded body.
pub async fn assign_transaction(
    State(counter): State<Arc<TransactionCounter>>,
    request: Request,
    next: Next,
) -> Response {
    let (mut parts, body) = request.into_parts();
    let mut client = find_param(parts.uri.query(), CLIENT_TRANSACTION_KEY);

    let body = if client.is_none() && is_form(&parts.headers) {
        match axum::body::to_bytes(body, FORM_BODY_LIMIT).await {
            Ok(bytes) => {
                client = find_param(std::str::from_utf8(&bytes).ok(), CLIENT_TRANSACTION_KEY);
                Body::from(bytes)
            }
            Err(err) => {
                return AlpacaReply::with_status(
                    StatusCode::BAD_REQUEST,
                    AlpacaResponse::error(
                        ErrorCode::INVALID_VALUE,
                        format!("unreadable request body: {err}"),
                        TransactionIds::default(),
                    ),
                )
                .into_response();
            }
        }
    } else {
        body
    };

    let ids = TransactionIds {
        client: parse_client_transaction_id(client.as_deref()),
        server: counter.next(),
    };
    parts.extensions.insert(ids);
    next.run(Request::from_parts(parts, body)).await
}

/// Answer with an envelope when the inner stack exceeds `deadline`.
pub async fn enforce_deadline(
    State(deadline): State<Duration>,
    request: Request,
    next: Next,
) -> Response {
    let ids = request
        .extensions()
        .get::<TransactionIds>()
        .copied()
        .unwrap_or_default();
    let path = request.uri().path().to_owned();
    match tokio::time::timeout(deadline, next.run(request)).await {
        Ok(response) => response,
        Err(_) => {
            warn!(path = %path, timeout_ms = deadline.as_millis() as u64, "request timed out");
            AlpacaReply::with_status(
                StatusCode::REQUEST_TIMEOUT,
                AlpacaResponse::error(
                    ErrorCode::UNSPECIFIED,
                    format!("request timed out after {deadline:?}"),
                    ids,
                ),
            )
            .into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(origins: &[&str], credentials: bool) -> CorsPolicy {
        CorsPolicy::from_config(&CorsConfig {
            allowed_origins: origins.iter().map(|o| (*o).to_owned()).collect(),
            allow_credentials: credentials,
            ..CorsConfig::default()
        })
    }

    #[test]
    fn wildcard_origin_is_emitted_as_star() {
        let cors = policy(&["*"], false);
        assert_eq!(cors.allowed_origin(Some("http://a")).as_deref(), Some("*"));
        assert_eq!(cors.allowed_origin(None).as_deref(), Some("*"));
    }

    #[test]
    fn listed_origins_are_echoed_and_others_dropped() {
        let cors = policy(&["http://dash.local"], false);
        assert_eq!(
            cors.allowed_origin(Some("http://dash.local")).as_deref(),
            Some("http://dash.local")
        );
        assert_eq!(cors.allowed_origin(Some("http://evil")), None);
        assert_eq!(cors.allowed_origin(None), None);
    }

    #[test]
    fn credentials_with_wildcard_echo_the_origin() {
        let cors = policy(&["*"], true);
        assert_eq!(
            cors.allowed_origin(Some("http://dash.local")).as_deref(),
            Some("http://dash.local")
        );
    }

    #[test]
    fn refused_origin_gets_no_cors_headers() {
        let cors = policy(&["http://dash.local"], true);
        let mut headers = HeaderMap::new();
        cors.apply(Some("http://evil"), &mut headers);
        assert!(headers.is_empty());

        cors.apply(Some("http://dash.local"), &mut headers);
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_ORIGIN], "http://dash.local");
        assert!(headers.contains_key(header::ACCESS_CONTROL_ALLOW_METHODS));
        assert!(headers.contains_key(header::ACCESS_CONTROL_MAX_AGE));
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_CREDENTIALS], "true");
    }

    #[test]
    fn basic_credentials_are_decoded() {
        let mut headers = HeaderMap::new();
        let encoded = STANDARD.encode("observer:s3cret:x");
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_str(&format!("Basic {encoded}")).unwrap(),
        );
        assert_eq!(
            basic_credentials(&headers),
            Some(("observer".to_owned(), "s3cret:x".to_owned()))
        );

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer abc"));
        assert_eq!(basic_credentials(&headers), None);
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic !!!"));
        assert_eq!(basic_credentials(&headers), None);
    }

    #[test]
    fn panic_payloads_are_rendered() {
        let text: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(text.as_ref()), "boom");
        let owned: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(owned.as_ref()), "bang");
        let other: Box<dyn Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(other.as_ref()), "non-string panic payload");
    }
}
