use http::HeaderMap;
use std::time::Duration;

/// The `Cache-Control` directives this cache evaluates.
#[derive(Debug, Clone, Default)]
pub struct CacheControl {
    pub public: bool,
    pub private: bool,
    pub no_cache: bool,
    pub no_store: bool,
    pub must_revalidate: bool,
    pub max_age: Option<Duration>,
}

/// A single recognized directive. Unknown directives and unparseable
/// arguments are dropped at the token level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Directive {
    Public,
    Private,
    NoCache,
    NoStore,
    MustRevalidate,
    MaxAge(Duration),
}

impl Directive {
    fn parse(token: &str) -> Option<Self> {
        let (name, argument) = match token.split_once('=') {
            Some((name, argument)) => (name.trim(), Some(argument.trim())),
            None => (token.trim(), None),
        };

        if name.eq_ignore_ascii_case("max-age") {
            let seconds = argument?.trim_matches('"').parse::<u64>().ok()?;
            return Some(Directive::MaxAge(Duration::from_secs(seconds)));
        }

        let directive = if name.eq_ignore_ascii_case("public") {
            Directive::Public
        } else if name.eq_ignore_ascii_case("private") {
            Directive::Private
        } else if name.eq_ignore_ascii_case("no-cache") {
            Directive::NoCache
        } else if name.eq_ignore_ascii_case("no-store") {
            Directive::NoStore
        } else if name.eq_ignore_ascii_case("must-revalidate") {
            Directive::MustRevalidate
        } else {
            return None;
        };
        Some(directive)
    }
}

impl CacheControl {
    fn apply(&mut self, directive: Directive) {
        match directive {
            Directive::Public => self.public = true,
            Directive::Private => self.private = true,
            Directive::NoCache => self.no_cache = true,
            Directive::NoStore => self.no_store = true,
            Directive::MustRevalidate => self.must_revalidate = true,
            Directive::MaxAge(lifetime) => self.max_age = Some(lifetime),
        }
    }
}

pub fn parse_cache_control(headers: &HeaderMap) -> CacheControl {
    let tokens = headers
        .get_all(http::header::CACHE_CONTROL)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','));

    let mut cc = CacheControl::default();
    for token in tokens {
        if let Some(directive) = Directive::parse(token) {
            cc.apply(directive);
        }
    }
    cc
}

/// True when the request asks to skip the cache lookup (`Cache-Control:
/// no-cache`). An absent header means caching is desirable.
pub fn request_cache_bypass(headers: &HeaderMap) -> bool {
    parse_cache_control(headers).no_cache
}
