//! Translation between HTTP and the bridge payloads: requests become
//! [`AccessData`], response descriptors become responses.

use std::collections::BTreeMap;
use std::net::SocketAddr;

use axum::body::Body;
use axum::http::header::{CONTENT_TYPE, HOST, LOCATION};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri};
use axum::response::Response;
use serde_json::Value;
use switchboard_types::{AccessData, ResponseDescriptor};
use tracing::warn;

/// Largest request body forwarded to a Worker.
pub const MAX_BODY: usize = 8 * 1024 * 1024;

/// Describe one request to a Worker. Repeated headers are joined with `, `.
pub fn access_data(
    method: &Method,
    uri: &Uri,
    headers: &HeaderMap,
    body: &[u8],
    peer: SocketAddr,
    local: SocketAddr,
) -> AccessData {
    let mut flat: BTreeMap<String, String> = BTreeMap::new();
    for (name, value) in headers {
        let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
        match flat.get_mut(name.as_str()) {
            Some(existing) => {
                existing.push_str(", ");
                existing.push_str(&value);
            }
            None => {
                flat.insert(name.as_str().to_string(), value);
            }
        }
    }

    let host_header = headers
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| uri.authority().map(|a| a.to_string()))
        .unwrap_or_else(|| local.to_string());
    let host = match host_header.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => host.to_string(),
        _ => host_header.clone(),
    };
    let path_and_query = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");

    AccessData {
        method: method.as_str().to_string(),
        content_type: headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
        ip: peer.ip().to_string(),
        host,
        port: local.port(),
        url: format!("http://{host_header}{path_and_query}"),
        uri: path_and_query.to_string(),
        headers: flat,
        body: String::from_utf8_lossy(body).into_owned(),
    }
}

pub fn text(status: StatusCode, body: impl Into<String>) -> Response {
    let mut response = Response::new(Body::from(body.into()));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
    response
}

/// Response while no Worker is connected.
pub fn not_ready() -> Response {
    text(StatusCode::SERVICE_UNAVAILABLE, "503 Service Unavailable: not ready")
}

fn first_text(descriptor: &ResponseDescriptor) -> String {
    match descriptor.args.first() {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => String::new(),
    }
}

fn set_header(headers: &mut HeaderMap, name: &str, value: &str) {
    match (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(value)) {
        (Ok(name), Ok(value)) => {
            headers.insert(name, value);
        }
        _ => warn!(header = name, "dropping invalid response header"),
    }
}

/// 1xx, 204 and 304 responses carry no body.
fn is_bodyless(status: StatusCode) -> bool {
    status.is_informational() || status == StatusCode::NO_CONTENT || status == StatusCode::NOT_MODIFIED
}

/// Invoke the response constructor a descriptor names.
///
/// `kwargs.status`, `kwargs.headers` (an object of strings) and
/// `kwargs.content_type` apply to every kind.
pub fn render(descriptor: &ResponseDescriptor) -> Response {
    let (status, content_type, body) = match descriptor.kind.as_str() {
        "text" => (
            StatusCode::OK,
            Some("text/plain; charset=utf-8"),
            first_text(descriptor).into_bytes(),
        ),
        "html" => (
            StatusCode::OK,
            Some("text/html; charset=utf-8"),
            first_text(descriptor).into_bytes(),
        ),
        "json" => {
            let value = descriptor.args.first().cloned().unwrap_or(Value::Null);
            match serde_json::to_vec(&value) {
                Ok(bytes) => (StatusCode::OK, Some("application/json"), bytes),
                Err(e) => return text(StatusCode::INTERNAL_SERVER_ERROR, format!("cannot encode json body: {e}")),
            }
        }
        "redirect" => (StatusCode::FOUND, None, Vec::new()),
        "empty" => (StatusCode::NO_CONTENT, None, Vec::new()),
        other => {
            return text(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("unknown response type {other:?}"),
            );
        }
    };

    let status = match descriptor.status() {
        None => status,
        Some(code) => match StatusCode::from_u16(code) {
            Ok(status) => status,
            Err(_) => return text(StatusCode::INTERNAL_SERVER_ERROR, format!("invalid status {code}")),
        },
    };
    let body = if is_bodyless(status) { Body::empty() } else { Body::from(body) };

    let mut response = Response::new(body);
    *response.status_mut() = status;
    let headers = response.headers_mut();
    if let Some(content_type) = content_type {
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    }
    if descriptor.kind == "redirect" {
        set_header(headers, LOCATION.as_str(), &first_text(descriptor));
    }
    if let Some(content_type) = descriptor.kwargs.get("content_type").and_then(Value::as_str) {
        set_header(headers, CONTENT_TYPE.as_str(), content_type);
    }
    if let Some(Value::Object(extra)) = descriptor.kwargs.get("headers") {
        for (name, value) in extra {
            let value = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            set_header(headers, name, &value);
        }
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::header::CONTENT_LENGTH;
    use serde_json::json;

    async fn body_of(response: Response) -> Vec<u8> {
        axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap()
            .to_vec()
    }

    #[test]
    fn access_data_describes_the_request() {
        let mut headers = HeaderMap::new();
        headers.insert(HOST, HeaderValue::from_static("example.com:5000"));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.append("x-tag", HeaderValue::from_static("a"));
        headers.append("x-tag", HeaderValue::from_static("b"));
        let uri: Uri = "/api/echo?x=1".parse().unwrap();

        let access = access_data(
            &Method::POST,
            &uri,
            &headers,
            br#"{"a":1}"#,
            SocketAddr::from(([10, 0, 0, 7], 40000)),
            SocketAddr::from(([0, 0, 0, 0], 5000)),
        );
        assert_eq!(access.method, "POST");
        assert_eq!(access.ip, "10.0.0.7");
        assert_eq!(access.host, "example.com");
        assert_eq!(access.port, 5000);
        assert_eq!(access.url, "http://example.com:5000/api/echo?x=1");
        assert_eq!(access.uri, "/api/echo?x=1");
        assert_eq!(access.path(), "/api/echo");
        assert_eq!(access.content_type.as_deref(), Some("application/json"));
        assert_eq!(access.headers["x-tag"], "a, b");
        assert_eq!(access.body, r#"{"a":1}"#);
    }

    #[test]
    fn missing_host_falls_back_to_the_local_address() {
        let uri: Uri = "/".parse().unwrap();
        let access = access_data(
            &Method::GET,
            &uri,
            &HeaderMap::new(),
            b"",
            SocketAddr::from(([127, 0, 0, 1], 1)),
            SocketAddr::from(([127, 0, 0, 1], 5000)),
        );
        assert_eq!(access.host, "127.0.0.1");
        assert_eq!(access.url, "http://127.0.0.1:5000/");
    }

    #[tokio::test]
    async fn renders_each_kind() {
        let text = render(&ResponseDescriptor::text("hello"));
        assert_eq!(text.status(), StatusCode::OK);
        assert_eq!(body_of(text).await, b"hello");

        let html = render(&ResponseDescriptor::html("<p>x</p>"));
        assert_eq!(html.headers()[CONTENT_TYPE], "text/html; charset=utf-8");

        let json = render(&ResponseDescriptor::json(json!({"ok": true})).with_status(201));
        assert_eq!(json.status(), StatusCode::CREATED);
        assert_eq!(serde_json::from_slice::<Value>(&body_of(json).await).unwrap(), json!({"ok": true}));

        let redirect = render(&ResponseDescriptor::redirect("/login"));
        assert_eq!(redirect.status(), StatusCode::FOUND);
        assert_eq!(redirect.headers()[LOCATION], "/login");

        let empty = render(&ResponseDescriptor::empty());
        assert_eq!(empty.status(), StatusCode::NO_CONTENT);
        assert!(body_of(empty).await.is_empty());
    }

    #[tokio::test]
    async fn bodyless_status_drops_body_and_length() {
        let response = render(&ResponseDescriptor::text("ignored").with_status(204));
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert!(response.headers().get(CONTENT_LENGTH).is_none());
        assert!(body_of(response).await.is_empty());

        let response = render(&ResponseDescriptor::html("<p>cached</p>").with_status(304));
        assert!(body_of(response).await.is_empty());
    }

    #[test]
    fn kwargs_override_headers_and_content_type() {
        let mut descriptor = ResponseDescriptor::text("x").with_header("X-Worker", "2");
        descriptor.kwargs.insert("content_type".into(), json!("text/csv"));
        let response = render(&descriptor);
        assert_eq!(response.headers()[CONTENT_TYPE], "text/csv");
        assert_eq!(response.headers()["x-worker"], "2");
    }

    #[test]
    fn unknown_kind_or_status_is_a_server_error() {
        let response = render(&ResponseDescriptor::new("video", vec![], Default::default()));
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let response = render(&ResponseDescriptor::text("x").with_status(42));
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
