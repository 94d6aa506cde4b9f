use std::net::{IpAddr, SocketAddr};

use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode, Uri};

/// One request, captured up front with its body already buffered so that
/// rule conditions and event assembly can read it any number of times.
#[derive(Debug, Clone)]
pub struct RequestInfo {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub remote_addr: Option<SocketAddr>,
    pub body: Bytes,
}

#[derive(Debug, Clone)]
pub struct ResponseInfo {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl ResponseInfo {
    /// Placeholder passed to identify callbacks before the handler has run.
    pub fn pending() -> ResponseInfo {
        ResponseInfo {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }
}

impl RequestInfo {
    /// Extract the string a rule condition's `path` refers to. Unknown
    /// paths and missing values yield the empty string, which most
    /// patterns will not match.
    pub fn path_lookup(&self, path: &str) -> String {
        match path {
            "request.ip_address" => return self.client_ip(),
            "request.route" => return self.uri.path().to_string(),
            "request.verb" => return self.method.to_string(),
            _ => {}
        }
        let Some(key) = path.strip_prefix("request.body.") else {
            return String::new();
        };
        let content_type = self
            .headers
            .get(http::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("");
        if content_type == "application/graphql" && key == "query" {
            return String::from_utf8_lossy(&self.body).into_owned();
        }
        if content_type == "application/json" {
            return json_key_string(&self.body, key);
        }
        String::new()
    }

    pub fn client_ip(&self) -> String {
        client_ip(&self.headers, self.remote_addr)
    }

    /// Reporting URI: scheme://host + path, reconstructed from the Host
    /// header when the inbound request line was origin-form.
    pub fn absolute_uri(&self) -> String {
        if self.uri.scheme().is_some() {
            return self.uri.to_string();
        }
        let host = self
            .uri
            .authority()
            .map(|authority| authority.as_str())
            .or_else(|| {
                self.headers
                    .get(http::header::HOST)
                    .and_then(|value| value.to_str().ok())
            })
            .unwrap_or("localhost");
        format!("http://{}{}", host, self.uri.path())
    }
}

/// Top-level key lookup in a JSON object body; returns the value only if
/// it is a string.
pub fn json_key_string(body: &[u8], key: &str) -> String {
    match serde_json::from_slice::<serde_json::Value>(body) {
        Ok(serde_json::Value::Object(map)) => match map.get(key) {
            Some(serde_json::Value::String(value)) => value.clone(),
            _ => String::new(),
        },
        _ => String::new(),
    }
}

// Headers checked after X-Client-IP and X-Forwarded-For, in order:
// Cloudflare, Akamai, nginx, Rackspace/Riverbed, then the rarer
// forwarding variants.
const FALLBACK_IP_HEADERS: [&str; 7] = [
    "cf-connecting-ip",
    "true-client-ip",
    "x-real-ip",
    "x-cluster-client-ip",
    "x-forwarded",
    "forwarded-for",
    "forwarded",
];

/// Resolve the originating client IP from proxy headers, falling back to
/// the socket peer address.
pub fn client_ip(headers: &HeaderMap, remote_addr: Option<SocketAddr>) -> String {
    if let Some(ip) = header_ip(headers, "x-client-ip") {
        return ip;
    }
    if let Some(forwarded) = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
    {
        if let Some(ip) = leftmost_forwarded_ip(forwarded) {
            return ip;
        }
    }
    for name in FALLBACK_IP_HEADERS {
        if let Some(ip) = header_ip(headers, name) {
            return ip;
        }
    }
    remote_addr
        .map(|addr| addr.ip().to_string())
        .unwrap_or_default()
}

fn header_ip(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .filter(|candidate| valid_ip(candidate))
        .map(str::to_string)
}

fn valid_ip(candidate: &str) -> bool {
    candidate.parse::<IpAddr>().is_ok()
}

/// X-Forwarded-For lists "client, proxy 1, proxy 2"; the left-most entry
/// that parses as an address is the originating client. Entries may be
/// "unknown" or carry a port (Azure), both handled here.
fn leftmost_forwarded_ip(list: &str) -> Option<String> {
    for entry in list.split(',') {
        let candidate = entry.trim();
        // IPv6 literals are full of colons, so try the entry as-is
        // before assuming a trailing :port
        if valid_ip(candidate) {
            return Some(candidate.to_string());
        }
        if let Some((host, _port)) = candidate.split_once(':') {
            if valid_ip(host) {
                return Some(host.to_string());
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use http::{HeaderMap, Method};

    use super::{client_ip, json_key_string, RequestInfo};

    fn request(method: Method, path: &str, headers: HeaderMap, body: &str) -> RequestInfo {
        RequestInfo {
            method,
            uri: path.parse().unwrap(),
            headers,
            remote_addr: Some("10.1.2.3:4567".parse().unwrap()),
            body: Bytes::copy_from_slice(body.as_bytes()),
        }
    }

    #[test]
    fn looks_up_route_verb_and_ip() {
        let info = request(Method::DELETE, "/users/42?full=1", HeaderMap::new(), "");
        assert_eq!(info.path_lookup("request.route"), "/users/42");
        assert_eq!(info.path_lookup("request.verb"), "DELETE");
        assert_eq!(info.path_lookup("request.ip_address"), "10.1.2.3");
        assert_eq!(info.path_lookup("request.nonsense"), "");
    }

    #[test]
    fn looks_up_json_body_keys() {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", "application/json".parse().unwrap());
        let info = request(
            Method::POST,
            "/orders",
            headers,
            r#"{"sku": "a-1", "count": 3}"#,
        );
        assert_eq!(info.path_lookup("request.body.sku"), "a-1");
        // non-string values do not match
        assert_eq!(info.path_lookup("request.body.count"), "");
        assert_eq!(info.path_lookup("request.body.missing"), "");
    }

    #[test]
    fn graphql_query_returns_whole_body() {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", "application/graphql".parse().unwrap());
        let info = request(Method::POST, "/graphql", headers, "{ users { id } }");
        assert_eq!(info.path_lookup("request.body.query"), "{ users { id } }");
        assert_eq!(info.path_lookup("request.body.other"), "");
    }

    #[test]
    fn json_key_lookup_handles_malformed_bodies() {
        assert_eq!(json_key_string(b"not json", "key"), "");
        assert_eq!(json_key_string(b"[1,2,3]", "key"), "");
        assert_eq!(json_key_string(br#"{"key": "value"}"#, "key"), "value");
    }

    #[test]
    fn client_ip_prefers_proxy_headers_in_order() {
        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", "5.6.7.8".parse().unwrap());
        headers.insert("x-forwarded-for", "unknown, 1.2.3.4, 9.9.9.9".parse().unwrap());
        let remote = Some("10.0.0.1:80".parse().unwrap());

        assert_eq!(client_ip(&headers, remote), "1.2.3.4");

        headers.insert("x-client-ip", "2.3.4.5".parse().unwrap());
        assert_eq!(client_ip(&headers, remote), "2.3.4.5");
    }

    #[test]
    fn forwarded_for_ports_are_stripped() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "1.2.3.4:5000".parse().unwrap());
        assert_eq!(client_ip(&headers, None), "1.2.3.4");
    }

    #[test]
    fn forwarded_for_keeps_ipv6_entries() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "::1".parse().unwrap());
        assert_eq!(client_ip(&headers, None), "::1");

        headers.insert(
            "x-forwarded-for",
            "2001:db8::1, 1.2.3.4".parse().unwrap(),
        );
        assert_eq!(client_ip(&headers, None), "2001:db8::1");
    }

    #[test]
    fn falls_back_to_peer_address() {
        let headers = HeaderMap::new();
        assert_eq!(client_ip(&headers, Some("10.0.0.9:443".parse().unwrap())), "10.0.0.9");
        assert_eq!(client_ip(&headers, None), "");
    }

    #[test]
    fn absolute_uri_uses_host_header() {
        let mut headers = HeaderMap::new();
        headers.insert("host", "api.example.com".parse().unwrap());
        let info = request(Method::GET, "/users/42?full=1", headers, "");
        assert_eq!(info.absolute_uri(), "http://api.example.com/users/42");
    }
}
