use std::fmt;
use std::str::FromStr;

use http::Method;
use serde::{Deserialize, Serialize};

use crate::cache_control::parse_cache_control;
use crate::types::Response;

/// How a response may be shared between requesters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheType {
    /// Not cacheable at all.
    None,
    /// One copy serves every requester.
    Shared,
    /// Partitioned by the requesting principal.
    Private,
}

impl fmt::Display for CacheType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CacheType::None => "None",
            CacheType::Shared => "Shared",
            CacheType::Private => "Private",
        };
        f.write_str(name)
    }
}

impl FromStr for CacheType {
    type Err = ();

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "None" => Ok(CacheType::None),
            "Shared" => Ok(CacheType::Shared),
            "Private" => Ok(CacheType::Private),
            _ => Err(()),
        }
    }
}

/// The sharing policy of a response together with the normalized list of
/// headers its representation varies on. Two variations are equal exactly
/// when both the type and the header sequence match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Variation {
    cache_type: CacheType,
    normalized_vary_headers: Vec<String>,
}

impl Variation {
    pub fn new(cache_type: CacheType, vary_headers: impl IntoIterator<Item = String>) -> Self {
        Self {
            cache_type,
            normalized_vary_headers: normalize(vary_headers),
        }
    }

    /// The neutral variation used to compute the entry key: shared, no vary.
    pub fn shared_entry() -> Self {
        Self {
            cache_type: CacheType::Shared,
            normalized_vary_headers: Vec::new(),
        }
    }

    pub fn none() -> Self {
        Self {
            cache_type: CacheType::None,
            normalized_vary_headers: Vec::new(),
        }
    }

    /// Classifies a response. Relies on the originating request being
    /// attached; a detached response is never cacheable.
    pub fn from_response(response: &Response) -> Self {
        let request = match response.request.as_ref() {
            Some(request) => request,
            None => return Self::none(),
        };

        if request.method != Method::GET && request.method != Method::HEAD {
            return Self::none();
        }
        if !response.status.is_success() {
            return Self::none();
        }

        let request_cc = parse_cache_control(&request.headers);
        let response_cc = parse_cache_control(&response.headers);
        if request_cc.no_store || response_cc.no_store {
            return Self::none();
        }

        let vary_headers = vary_header_names(response);
        if vary_headers.iter().any(|name| name == "*") {
            // A Vary:* representation can never be matched to a request.
            return Self::none();
        }

        let cache_type = if response_cc.private {
            CacheType::Private
        } else if request.headers.contains_key(http::header::AUTHORIZATION) && !response_cc.public {
            CacheType::Private
        } else {
            CacheType::Shared
        };

        Self::new(cache_type, vary_headers)
    }

    pub fn cache_type(&self) -> CacheType {
        self.cache_type
    }

    pub fn vary_headers(&self) -> &[String] {
        &self.normalized_vary_headers
    }

    pub fn is_storable(&self) -> bool {
        self.cache_type != CacheType::None
    }

    pub fn has_vary(&self) -> bool {
        !self.normalized_vary_headers.is_empty()
    }
}

fn vary_header_names(response: &Response) -> Vec<String> {
    let mut names = Vec::new();
    for value in response.headers.get_all(http::header::VARY) {
        if let Ok(s) = value.to_str() {
            for name in s.split(',') {
                let name = name.trim();
                if !name.is_empty() {
                    names.push(name.to_string());
                }
            }
        }
    }
    names
}

fn normalize(names: impl IntoIterator<Item = String>) -> Vec<String> {
    let mut normalized: Vec<String> = names
        .into_iter()
        .map(|name| name.to_ascii_lowercase())
        .collect();
    normalized.sort_unstable();
    normalized.dedup();
    normalized
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Request;
    use http::{HeaderValue, StatusCode, Uri};
    use std::sync::Arc;

    fn request(method: Method) -> Request {
        Request::new(method, Uri::from_static("https://example.com/resource"))
    }

    fn response_for(request: Request, status: StatusCode) -> Response {
        Response::new(status).with_request(Arc::new(request))
    }

    #[test]
    fn plain_get_is_shared() {
        let response = response_for(request(Method::GET), StatusCode::OK);
        let variation = Variation::from_response(&response);
        assert_eq!(variation.cache_type(), CacheType::Shared);
        assert!(variation.vary_headers().is_empty());
    }

    #[test]
    fn non_get_head_is_not_cacheable() {
        let response = response_for(request(Method::POST), StatusCode::OK);
        assert_eq!(
            Variation::from_response(&response).cache_type(),
            CacheType::None
        );
    }

    #[test]
    fn non_success_is_not_cacheable() {
        let response = response_for(request(Method::GET), StatusCode::NOT_FOUND);
        assert_eq!(
            Variation::from_response(&response).cache_type(),
            CacheType::None
        );
    }

    #[test]
    fn no_store_on_either_side_wins() {
        let mut req = request(Method::GET);
        req.headers.insert(
            http::header::CACHE_CONTROL,
            HeaderValue::from_static("no-store"),
        );
        let response = response_for(req, StatusCode::OK);
        assert_eq!(
            Variation::from_response(&response).cache_type(),
            CacheType::None
        );

        let mut response = response_for(request(Method::GET), StatusCode::OK);
        response.headers.insert(
            http::header::CACHE_CONTROL,
            HeaderValue::from_static("no-store"),
        );
        assert_eq!(
            Variation::from_response(&response).cache_type(),
            CacheType::None
        );
    }

    #[test]
    fn private_response_is_private() {
        let mut response = response_for(request(Method::GET), StatusCode::OK);
        response.headers.insert(
            http::header::CACHE_CONTROL,
            HeaderValue::from_static("private"),
        );
        assert_eq!(
            Variation::from_response(&response).cache_type(),
            CacheType::Private
        );
    }

    #[test]
    fn authorization_without_public_is_private() {
        let mut req = request(Method::GET);
        req.headers.insert(
            http::header::AUTHORIZATION,
            HeaderValue::from_static("Bearer abc"),
        );
        let response = response_for(req, StatusCode::OK);
        assert_eq!(
            Variation::from_response(&response).cache_type(),
            CacheType::Private
        );
    }

    #[test]
    fn authorization_with_public_stays_shared() {
        let mut req = request(Method::GET);
        req.headers.insert(
            http::header::AUTHORIZATION,
            HeaderValue::from_static("Bearer abc"),
        );
        let mut response = response_for(req, StatusCode::OK);
        response.headers.insert(
            http::header::CACHE_CONTROL,
            HeaderValue::from_static("public, max-age=60"),
        );
        assert_eq!(
            Variation::from_response(&response).cache_type(),
            CacheType::Shared
        );
    }

    #[test]
    fn vary_names_are_lowercased_sorted_and_deduped() {
        let mut response = response_for(request(Method::GET), StatusCode::OK);
        response.headers.append(
            http::header::VARY,
            HeaderValue::from_static("Accept-Language, User-Agent"),
        );
        response
            .headers
            .append(http::header::VARY, HeaderValue::from_static("ACCEPT"));
        response
            .headers
            .append(http::header::VARY, HeaderValue::from_static("accept"));
        let variation = Variation::from_response(&response);
        assert_eq!(
            variation.vary_headers(),
            ["accept", "accept-language", "user-agent"]
        );
    }

    #[test]
    fn vary_star_is_not_cacheable() {
        let mut response = response_for(request(Method::GET), StatusCode::OK);
        response
            .headers
            .insert(http::header::VARY, HeaderValue::from_static("*"));
        assert_eq!(
            Variation::from_response(&response).cache_type(),
            CacheType::None
        );
    }

    #[test]
    fn derivation_is_idempotent() {
        let mut response = response_for(request(Method::GET), StatusCode::OK);
        response.headers.insert(
            http::header::VARY,
            HeaderValue::from_static("Accept-Language"),
        );
        let first = Variation::from_response(&response);
        let second = Variation::from_response(&response);
        assert_eq!(first, second);
    }

    #[test]
    fn equality_is_structural() {
        let a = Variation::new(CacheType::Shared, vec!["Accept".to_string()]);
        let b = Variation::new(CacheType::Shared, vec!["accept".to_string()]);
        let c = Variation::new(CacheType::Private, vec!["accept".to_string()]);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn display_round_trips_through_from_str() {
        for cache_type in [CacheType::None, CacheType::Shared, CacheType::Private] {
            let parsed: CacheType = cache_type.to_string().parse().unwrap();
            assert_eq!(parsed, cache_type);
        }
    }
}
