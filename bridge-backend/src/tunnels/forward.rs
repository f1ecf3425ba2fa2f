//! Relay of webhook requests to a second local port.

use crate::error::BridgeError;
use actix_web::http::header::HeaderMap;
use actix_web::web::Bytes;
use reqwest::Client;
use std::time::Duration;

/// Response headers that must not be re-emitted verbatim. The body was
/// buffered (and possibly decompressed), so framing headers are recomputed.
const STRIPPED_RESPONSE_HEADERS: &[&str] = &[
    "content-encoding",
    "transfer-encoding",
    "connection",
    "content-length",
];

#[derive(Debug, Clone)]
pub struct ForwardedResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

/// One value per header name, repeated headers joined with `", "`.
pub fn joined_headers(headers: &HeaderMap) -> Vec<(String, String)> {
    let mut names: Vec<&actix_web::http::header::HeaderName> = headers.keys().collect();
    names.sort_by(|a, b| a.as_str().cmp(b.as_str()));
    names.dedup();
    names
        .into_iter()
        .map(|name| {
            let value = headers
                .get_all(name)
                .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
                .collect::<Vec<_>>()
                .join(", ");
            (name.as_str().to_string(), value)
        })
        .collect()
}

/// Headers for the relayed request: `host` points at the target,
/// `content-length` is left to the client.
pub fn forward_request_headers(inbound: &HeaderMap, target_port: u16) -> Vec<(String, String)> {
    let mut headers: Vec<(String, String)> = joined_headers(inbound)
        .into_iter()
        .filter(|(name, _)| name != "host" && name != "content-length")
        .collect();
    headers.push(("host".to_string(), format!("localhost:{}", target_port)));
    headers
}

pub fn is_stripped_response_header(name: &str) -> bool {
    STRIPPED_RESPONSE_HEADERS
        .iter()
        .any(|h| h.eq_ignore_ascii_case(name))
}

/// Send the request to `http://localhost:<target_port><path>` and buffer the
/// response.
pub async fn forward(
    client: &Client,
    method: &str,
    path_and_query: &str,
    headers: &[(String, String)],
    body: Bytes,
    target_port: u16,
    timeout: Duration,
) -> Result<ForwardedResponse, BridgeError> {
    let method = reqwest::Method::from_bytes(method.as_bytes())
        .map_err(|e| BridgeError::Forward(format!("invalid method {}: {}", method, e)))?;
    let url = format!("http://localhost:{}{}", target_port, path_and_query);

    let mut request = client.request(method, &url).timeout(timeout).body(body);
    for (name, value) in headers {
        request = request.header(name.as_str(), value.as_str());
    }

    let response = request
        .send()
        .await
        .map_err(|e| BridgeError::Forward(format!("{} unreachable: {}", url, e)))?;

    let status = response.status().as_u16();
    let headers = response
        .headers()
        .iter()
        .filter(|(name, _)| !is_stripped_response_header(name.as_str()))
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect();
    let body = response
        .bytes()
        .await
        .map_err(|e| BridgeError::Forward(format!("reading response from {}: {}", url, e)))?;

    Ok(ForwardedResponse {
        status,
        headers,
        body,
    })
}
