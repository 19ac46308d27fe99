use std::borrow::Cow;
use std::cell::RefCell;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::Deserialize;
use tracing::trace;

use crate::cache::variation::{CacheType, Variation};
use crate::types::Request;

/// Field separator inside a cache key (ASCII Record Separator).
const SEP: char = '\u{1e}';
/// Placeholder for "no value" inside a cache key.
const ABSENT: char = '\u{0}';

const BEARER_PREFIX: &str = "Bearer ";

thread_local! {
    // Scratch buffer reused across key computations on this thread.
    static SCRATCH: RefCell<String> = const { RefCell::new(String::new()) };
}

/// Derives the stable text key a request is stored and looked up under.
#[derive(Debug, Clone)]
pub(crate) struct KeyComputer {
    require_jwt_token: bool,
}

impl KeyComputer {
    pub(crate) fn new(require_jwt_token: bool) -> Self {
        Self { require_jwt_token }
    }

    /// Computes the key for `request` under `variation`, or `None` when a
    /// private key is requested but no principal can be derived. This is
    /// the only failure surface; the caller treats `None` as uncacheable.
    pub(crate) fn compute(&self, request: &Request, variation: &Variation) -> Option<String> {
        let principal = if variation.cache_type() == CacheType::Private {
            Some(self.principal(request)?)
        } else {
            None
        };

        SCRATCH.with(|scratch| {
            let mut key = scratch.borrow_mut();
            key.clear();

            for ch in request.method.as_str().chars() {
                key.push(ch.to_ascii_lowercase());
            }
            key.push(SEP);
            push_lowercase(&mut key, request.uri.scheme_str().unwrap_or("http"));
            key.push(SEP);
            push_lowercase(&mut key, request.uri.host().unwrap_or(""));
            key.push(SEP);
            key.push_str(&port_for(request).to_string());
            key.push(SEP);
            key.push_str(
                request
                    .uri
                    .path_and_query()
                    .map(|pq| pq.as_str())
                    .unwrap_or("/"),
            );
            key.push(SEP);
            match principal {
                Some(principal) => key.push_str(&principal),
                None => key.push(ABSENT),
            }

            for name in variation.vary_headers() {
                key.push(SEP);
                key.push_str(name);
                key.push('=');
                push_header_values(&mut key, request, name);
            }

            Some(key.clone())
        })
    }

    /// A stable identifier for the requesting user, derived from
    /// `Authorization`. Bearer tokens are decoded (not validated) so that
    /// renewed tokens for the same subject share a cache partition.
    fn principal(&self, request: &Request) -> Option<String> {
        let raw = request.headers.get(http::header::AUTHORIZATION)?;
        let raw = String::from_utf8_lossy(raw.as_bytes()).into_owned();

        if let Some(prefix) = raw.get(..BEARER_PREFIX.len())
            && prefix.eq_ignore_ascii_case(BEARER_PREFIX)
        {
            let token = raw[BEARER_PREFIX.len()..].trim();
            if let Some(principal) = bearer_principal(token) {
                return Some(principal);
            }
            if self.require_jwt_token {
                trace!("bearer token did not parse as a JWT; no cache principal");
                return None;
            }
        }

        Some(raw)
    }
}

fn push_lowercase(key: &mut String, value: &str) {
    for ch in value.chars() {
        key.push(ch.to_ascii_lowercase());
    }
}

fn port_for(request: &Request) -> u16 {
    if let Some(port) = request.uri.port_u16() {
        return port;
    }
    match request.uri.scheme_str() {
        Some("https") | Some("wss") => 443,
        Some("http") | Some("ws") | None => 80,
        Some(_) => 0,
    }
}

fn push_header_values(key: &mut String, request: &Request, name: &str) {
    let mut values: Vec<Cow<'_, str>> = request
        .headers
        .get_all(name)
        .iter()
        .map(|value| String::from_utf8_lossy(value.as_bytes()))
        .collect();
    if values.is_empty() {
        key.push(ABSENT);
        return;
    }
    values.sort_unstable();
    for (index, value) in values.iter().enumerate() {
        if index > 0 {
            key.push(',');
        }
        key.push_str(value);
    }
}

#[derive(Debug, Deserialize)]
struct BearerClaims {
    sub: Option<String>,
    client_id: Option<String>,
}

/// Extracts `sub:` or `client_id:` from the payload of an unvalidated JWT.
/// Returns `None` for anything that is not a parseable JWT carrying one of
/// the two claims.
fn bearer_principal(token: &str) -> Option<String> {
    let mut segments = token.split('.');
    let _header = segments.next()?;
    let payload = segments.next()?;
    let _signature = segments.next()?;
    if segments.next().is_some() {
        return None;
    }

    let decoded = URL_SAFE_NO_PAD.decode(payload.as_bytes()).ok()?;
    let claims: BearerClaims = serde_json::from_slice(&decoded).ok()?;
    if let Some(sub) = claims.sub {
        return Some(format!("sub:{sub}"));
    }
    if let Some(client_id) = claims.client_id {
        return Some(format!("client_id:{client_id}"));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::{HeaderValue, Uri};

    fn jwt(payload: serde_json::Value) -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none","typ":"JWT"}"#);
        let payload = URL_SAFE_NO_PAD.encode(payload.to_string().as_bytes());
        format!("{header}.{payload}.sig")
    }

    fn get(uri: &str) -> Request {
        Request::get(uri.parse::<Uri>().unwrap())
    }

    #[test]
    fn key_layout_for_shared_requests() {
        let keys = KeyComputer::new(false);
        let request = get("https://Example.COM/Path?q=1");
        let key = keys
            .compute(&request, &Variation::shared_entry())
            .expect("shared key");
        assert_eq!(
            key,
            "get\u{1e}https\u{1e}example.com\u{1e}443\u{1e}/Path?q=1\u{1e}\u{0}"
        );
    }

    #[test]
    fn explicit_port_is_preserved() {
        let keys = KeyComputer::new(false);
        let request = get("http://example.com:8080/");
        let key = keys.compute(&request, &Variation::shared_entry()).unwrap();
        assert!(key.contains("\u{1e}8080\u{1e}"));
    }

    #[test]
    fn key_is_deterministic() {
        let keys = KeyComputer::new(false);
        let request = get("https://example.com/a");
        let a = keys.compute(&request, &Variation::shared_entry()).unwrap();
        let b = keys.compute(&request, &Variation::shared_entry()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn vary_values_are_sorted_and_joined() {
        let keys = KeyComputer::new(false);
        let mut request = get("https://example.com/");
        request
            .headers
            .append(http::header::ACCEPT_LANGUAGE, "en".parse().unwrap());
        request
            .headers
            .append(http::header::ACCEPT_LANGUAGE, "da".parse().unwrap());
        let variation = Variation::new(
            CacheType::Shared,
            vec!["accept-language".to_string(), "accept".to_string()],
        );
        let key = keys.compute(&request, &variation).unwrap();
        assert!(key.ends_with("\u{1e}accept=\u{0}\u{1e}accept-language=da,en"));
    }

    #[test]
    fn absent_vary_header_is_marked() {
        let keys = KeyComputer::new(false);
        let request = get("https://example.com/");
        let variation = Variation::new(CacheType::Shared, vec!["accept".to_string()]);
        let key = keys.compute(&request, &variation).unwrap();
        assert!(key.ends_with("accept=\u{0}"));
    }

    #[test]
    fn private_key_uses_jwt_sub() {
        let keys = KeyComputer::new(false);
        let mut request = get("https://example.com/");
        let token = jwt(serde_json::json!({"sub": "u1", "exp": 9999999999u64}));
        request.headers.insert(
            http::header::AUTHORIZATION,
            format!("Bearer {token}").parse().unwrap(),
        );
        let key = keys
            .compute(&request, &Variation::new(CacheType::Private, Vec::new()))
            .unwrap();
        assert!(key.ends_with("\u{1e}sub:u1"));
    }

    #[test]
    fn renewed_token_with_same_sub_shares_the_key() {
        let keys = KeyComputer::new(false);
        let variation = Variation::new(CacheType::Private, Vec::new());

        let mut first = get("https://example.com/");
        let token = jwt(serde_json::json!({"sub": "u1", "iat": 1}));
        first.headers.insert(
            http::header::AUTHORIZATION,
            format!("Bearer {token}").parse().unwrap(),
        );

        let mut second = get("https://example.com/");
        let token = jwt(serde_json::json!({"sub": "u1", "iat": 2}));
        second.headers.insert(
            http::header::AUTHORIZATION,
            format!("Bearer {token}").parse().unwrap(),
        );

        assert_eq!(
            keys.compute(&first, &variation),
            keys.compute(&second, &variation)
        );
    }

    #[test]
    fn client_id_claim_is_the_fallback() {
        let keys = KeyComputer::new(false);
        let mut request = get("https://example.com/");
        let token = jwt(serde_json::json!({"client_id": "svc-7"}));
        request.headers.insert(
            http::header::AUTHORIZATION,
            format!("Bearer {token}").parse().unwrap(),
        );
        let key = keys
            .compute(&request, &Variation::new(CacheType::Private, Vec::new()))
            .unwrap();
        assert!(key.ends_with("\u{1e}client_id:svc-7"));
    }

    #[test]
    fn unparseable_bearer_falls_back_to_raw_header() {
        let keys = KeyComputer::new(false);
        let mut request = get("https://example.com/");
        request.headers.insert(
            http::header::AUTHORIZATION,
            HeaderValue::from_static("Bearer not-a-jwt"),
        );
        let key = keys
            .compute(&request, &Variation::new(CacheType::Private, Vec::new()))
            .unwrap();
        assert!(key.ends_with("\u{1e}Bearer not-a-jwt"));
    }

    #[test]
    fn unparseable_bearer_yields_no_key_when_jwt_required() {
        let keys = KeyComputer::new(true);
        let mut request = get("https://example.com/");
        request.headers.insert(
            http::header::AUTHORIZATION,
            HeaderValue::from_static("Bearer not-a-jwt"),
        );
        assert_eq!(
            keys.compute(&request, &Variation::new(CacheType::Private, Vec::new())),
            None
        );
    }

    #[test]
    fn non_bearer_authorization_is_used_verbatim() {
        let keys = KeyComputer::new(true);
        let mut request = get("https://example.com/");
        request.headers.insert(
            http::header::AUTHORIZATION,
            HeaderValue::from_static("Basic dXNlcjpwdw=="),
        );
        let key = keys
            .compute(&request, &Variation::new(CacheType::Private, Vec::new()))
            .unwrap();
        assert!(key.ends_with("\u{1e}Basic dXNlcjpwdw=="));
    }

    #[test]
    fn private_without_authorization_has_no_key() {
        let keys = KeyComputer::new(false);
        let request = get("https://example.com/");
        assert_eq!(
            keys.compute(&request, &Variation::new(CacheType::Private, Vec::new())),
            None
        );
    }
}
