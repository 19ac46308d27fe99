use std::collections::HashSet;
use std::sync::Arc;

use http::{HeaderMap, StatusCode, Version};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::cache::variation::{CacheType, Variation};
use crate::types::{Body, Request, Response};

/// Header names that travel with the content rather than the response
/// envelope; persisted in their own list so the stored form mirrors the
/// message structure.
static CONTENT_HEADER_NAMES: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "allow",
        "content-disposition",
        "content-encoding",
        "content-language",
        "content-length",
        "content-location",
        "content-md5",
        "content-range",
        "content-type",
        "expires",
        "last-modified",
    ]
    .into_iter()
    .collect()
});

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct HeaderEntry {
    pub key: String,
    pub value: Vec<String>,
}

/// The persisted metadata half of a cached response. The body bytes live
/// in the sibling `.response.bin` file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ResponseEntry {
    pub url: String,
    pub version: String,
    pub status_code: u16,
    pub reason_phrase: String,
    pub response_headers: Vec<HeaderEntry>,
    pub content_headers: Vec<HeaderEntry>,
    pub trailing_headers: Vec<HeaderEntry>,
}

/// The persisted indirection record mapping an entry key to the variation
/// needed to compute the response key for a new request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct VariationEntry {
    pub key: String,
    pub cache_type: CacheType,
    pub normalized_vary_headers: Vec<String>,
}

impl ResponseEntry {
    pub(crate) fn from_response(response: &Response, url: &str) -> Self {
        let (response_headers, content_headers) = partition_headers(&response.headers);
        Self {
            url: url.to_string(),
            version: version_to_string(response.version),
            status_code: response.status.as_u16(),
            reason_phrase: response.reason_phrase().to_string(),
            response_headers,
            content_headers,
            trailing_headers: headers_to_entries(&response.trailers),
        }
    }

    /// Rebuilds an in-memory response around a freshly opened body stream.
    pub(crate) fn to_response(&self, body: Body, request: Arc<Request>) -> Response {
        let mut headers = entries_to_headers(&self.response_headers);
        for (name, value) in entries_to_headers(&self.content_headers).iter() {
            headers.append(name.clone(), value.clone());
        }
        Response {
            version: version_from_str(&self.version),
            status: StatusCode::from_u16(self.status_code).unwrap_or(StatusCode::OK),
            reason: Some(self.reason_phrase.clone()),
            headers,
            trailers: entries_to_headers(&self.trailing_headers),
            body,
            request: Some(request),
        }
    }
}

impl VariationEntry {
    pub(crate) fn new(key: &str, variation: &Variation) -> Self {
        Self {
            key: key.to_string(),
            cache_type: variation.cache_type(),
            normalized_vary_headers: variation.vary_headers().to_vec(),
        }
    }

    pub(crate) fn to_variation(&self) -> Variation {
        Variation::new(self.cache_type, self.normalized_vary_headers.iter().cloned())
    }
}

fn partition_headers(headers: &HeaderMap) -> (Vec<HeaderEntry>, Vec<HeaderEntry>) {
    let mut response_headers = Vec::new();
    let mut content_headers = Vec::new();
    for entry in headers_to_entries(headers) {
        if CONTENT_HEADER_NAMES.contains(entry.key.as_str()) {
            content_headers.push(entry);
        } else {
            response_headers.push(entry);
        }
    }
    (response_headers, content_headers)
}

fn headers_to_entries(headers: &HeaderMap) -> Vec<HeaderEntry> {
    let mut entries = Vec::new();
    for name in headers.keys() {
        let value = headers
            .get_all(name)
            .iter()
            .map(|value| String::from_utf8_lossy(value.as_bytes()).into_owned())
            .collect();
        entries.push(HeaderEntry {
            key: name.as_str().to_string(),
            value,
        });
    }
    entries
}

fn entries_to_headers(entries: &[HeaderEntry]) -> HeaderMap {
    let mut map = HeaderMap::new();
    for entry in entries {
        if let Ok(name) = http::header::HeaderName::try_from(entry.key.as_str()) {
            for value in &entry.value {
                if let Ok(value) = http::HeaderValue::from_str(value) {
                    map.append(name.clone(), value);
                }
            }
        }
    }
    map
}

fn version_to_string(version: Version) -> String {
    let text = match version {
        Version::HTTP_09 => "0.9",
        Version::HTTP_10 => "1.0",
        Version::HTTP_11 => "1.1",
        Version::HTTP_2 => "2",
        Version::HTTP_3 => "3",
        _ => "1.1",
    };
    text.to_string()
}

fn version_from_str(version: &str) -> Version {
    match version {
        "0.9" => Version::HTTP_09,
        "1.0" => Version::HTTP_10,
        "2" => Version::HTTP_2,
        "3" => Version::HTTP_3,
        _ => Version::HTTP_11,
    }
}
