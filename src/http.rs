//! HTTP probes against deployed applications.

use std::collections::BTreeMap;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tracing::debug;

use crate::error::{HarnessError, Result};

/// Synthetic header carrying the response status, as scenarios expect it.
pub const STATUS_CODE_HEADER: &str = "StatusCode";

/// A fully read response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    /// Header name to every value sent, plus [`STATUS_CODE_HEADER`].
    pub headers: BTreeMap<String, Vec<String>>,
    pub body: String,
}

impl HttpResponse {
    pub fn header(&self, name: &str) -> Option<&[String]> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_slice())
    }

    pub fn has_header(&self, name: &str) -> bool {
        self.header(name).is_some()
    }
}

/// Thin wrapper over a shared `reqwest` client.
///
/// Fixture apps routinely sit behind self-signed certificates, so
/// certificate verification is off.
#[derive(Debug, Clone)]
pub struct HttpProbe {
    client: reqwest::Client,
}

impl HttpProbe {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .danger_accept_invalid_certs(true)
            .build()?;
        Ok(Self { client })
    }

    /// GET `url`; any status is returned, not raised.
    pub async fn get(&self, url: &str, headers: &[(&str, &str)]) -> Result<HttpResponse> {
        let mut request_headers = HeaderMap::new();
        for (k, v) in headers {
            let name = HeaderName::from_bytes(k.as_bytes())
                .map_err(|e| HarnessError::config(format!("bad header name {}: {}", k, e)))?;
            let value = HeaderValue::from_str(v)
                .map_err(|e| HarnessError::config(format!("bad header value for {}: {}", k, e)))?;
            request_headers.append(name, value);
        }

        let response = self.client.get(url).headers(request_headers).send().await?;
        let status = response.status().as_u16();
        let mut collected: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (name, value) in response.headers() {
            collected
                .entry(canonical_header(name.as_str()))
                .or_default()
                .push(String::from_utf8_lossy(value.as_bytes()).into_owned());
        }
        collected.insert(STATUS_CODE_HEADER.to_string(), vec![status.to_string()]);
        let body = response.text().await?;
        debug!(url, status, bytes = body.len(), "GET");
        Ok(HttpResponse {
            status,
            headers: collected,
            body,
        })
    }

    /// GET `url` and return the body, failing on 4xx/5xx.
    pub async fn get_body(&self, url: &str) -> Result<String> {
        let response = self.get(url, &[]).await?;
        if response.status >= 400 {
            return Err(HarnessError::PlatformResponse(format!(
                "GET {} returned {}: {}",
                url,
                response.status,
                response.body.trim()
            )));
        }
        Ok(response.body)
    }
}

/// `x-powered-by` to `X-Powered-By`.
fn canonical_header(name: &str) -> String {
    name.split('-')
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + &chars.as_str().to_ascii_lowercase(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join("-")
}
