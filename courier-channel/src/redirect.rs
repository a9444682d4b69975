use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use reqwest::header::{self, HeaderMap};
use reqwest::{Response, StatusCode, redirect};
use tokio::time::Instant;
use url::Url;

use crate::ChannelConfig;

#[derive(Clone, Debug)]
struct CachedRedirect {
    target: Url,
    expires: Instant,
}

/// Sends payloads and follows temporary and permanent redirects.
///
/// Automatic redirects of the HTTP client are disabled. Instead, `307` and `308` responses are
/// followed here so that the request body is sent again and the target is remembered: subsequent
/// sends to the same endpoint go straight to the target until the cache entry expires. The entry
/// lives for the `max-age` of the redirect response's `Cache-Control` header, or for the
/// configured default.
#[derive(Debug)]
pub struct RedirectHandler {
    client: reqwest::Client,
    max_redirects: usize,
    default_ttl: Duration,
    cache: Mutex<HashMap<Url, CachedRedirect>>,
}

impl RedirectHandler {
    /// Creates a handler with its own HTTP client.
    pub fn new(config: &ChannelConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::ClientBuilder::new()
            .redirect(redirect::Policy::none())
            .gzip(true)
            .build()?;

        Ok(Self {
            client,
            max_redirects: config.max_redirects,
            default_ttl: config.redirect_cache_ttl(),
            cache: Mutex::new(HashMap::new()),
        })
    }

    /// Returns the URL that requests to `endpoint` are currently sent to.
    pub fn resolve(&self, endpoint: &Url) -> Url {
        let mut cache = self.cache.lock();
        match cache.get(endpoint) {
            Some(entry) if entry.expires > Instant::now() => entry.target.clone(),
            Some(_) => {
                cache.remove(endpoint);
                endpoint.clone()
            }
            None => endpoint.clone(),
        }
    }

    /// Posts `body` to `endpoint`, following up to the configured number of redirects.
    ///
    /// Once the limit is reached, the last redirect response is returned as is.
    pub async fn send(
        &self,
        endpoint: &Url,
        headers: HeaderMap,
        body: Bytes,
    ) -> Result<Response, reqwest::Error> {
        let mut target = self.resolve(endpoint);
        let mut redirects = 0;

        loop {
            let response = self
                .client
                .post(target.clone())
                .headers(headers.clone())
                .body(body.clone())
                .send()
                .await?;

            let status = response.status();
            if !is_redirect(status) || redirects >= self.max_redirects {
                return Ok(response);
            }

            let Some(location) = location(&target, response.headers()) else {
                courier_log::warn!(status = status.as_u16(), "redirect without a valid location");
                return Ok(response);
            };

            let ttl = max_age(response.headers()).unwrap_or(self.default_ttl);
            if !ttl.is_zero() {
                courier_log::debug!(from = %endpoint, to = %location, "caching redirect");
                self.cache.lock().insert(
                    endpoint.clone(),
                    CachedRedirect {
                        target: location.clone(),
                        expires: Instant::now() + ttl,
                    },
                );
            }

            target = location;
            redirects += 1;
        }
    }
}

fn is_redirect(status: StatusCode) -> bool {
    status == StatusCode::TEMPORARY_REDIRECT || status == StatusCode::PERMANENT_REDIRECT
}

fn location(base: &Url, headers: &HeaderMap) -> Option<Url> {
    let value = headers.get(header::LOCATION)?.to_str().ok()?;
    base.join(value).ok()
}

/// Parses the `max-age` directive of a `Cache-Control` header.
fn max_age(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get(header::CACHE_CONTROL)?.to_str().ok()?;
    value
        .split(',')
        .filter_map(|directive| directive.trim().strip_prefix("max-age="))
        .find_map(|seconds| seconds.trim_matches('"').parse().ok())
        .map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use axum::Router;
    use axum::http::{StatusCode as AxumStatus, header as axum_header};
    use axum::routing::{MethodRouter, post};
    use reqwest::header::HeaderValue;

    use super::*;
    use crate::testutils::{Hits, spawn_server};

    fn handler(max_redirects: usize) -> RedirectHandler {
        let config = ChannelConfig {
            max_redirects,
            ..Default::default()
        };
        RedirectHandler::new(&config).unwrap()
    }

    fn redirect_route(
        status: AxumStatus,
        to: &'static str,
        cache: &'static str,
        hits: &Hits,
    ) -> MethodRouter {
        let hits = hits.clone();
        post(move || async move {
            hits.hit();
            (
                status,
                [
                    (axum_header::LOCATION, to),
                    (axum_header::CACHE_CONTROL, cache),
                ],
            )
        })
    }

    fn ok_route(hits: &Hits) -> MethodRouter {
        let hits = hits.clone();
        post(move |body: String| async move {
            hits.hit();
            body
        })
    }

    #[test]
    fn test_max_age() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CACHE_CONTROL,
            HeaderValue::from_static("public, max-age=3600"),
        );
        assert_eq!(max_age(&headers), Some(Duration::from_secs(3600)));

        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
        assert_eq!(max_age(&headers), None);
    }

    #[tokio::test]
    async fn test_follows_and_caches_permanent_redirect() {
        let old = Hits::default();
        let new = Hits::default();

        let router = Router::new()
            .route(
                "/old",
                redirect_route(AxumStatus::PERMANENT_REDIRECT, "/new", "max-age=3600", &old),
            )
            .route("/new", ok_route(&new));
        let base = spawn_server(router).await;
        let endpoint = base.join("old").unwrap();

        let handler = handler(10);
        for _ in 0..2 {
            let response = handler
                .send(&endpoint, HeaderMap::new(), Bytes::from_static(b"payload"))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(response.text().await.unwrap(), "payload");
        }

        assert_eq!(old.count(), 1);
        assert_eq!(new.count(), 2);
        assert_eq!(handler.resolve(&endpoint), base.join("new").unwrap());
    }

    #[tokio::test]
    async fn test_zero_max_age_is_not_cached() {
        let old = Hits::default();
        let new = Hits::default();

        let router = Router::new()
            .route(
                "/old",
                redirect_route(AxumStatus::TEMPORARY_REDIRECT, "/new", "max-age=0", &old),
            )
            .route("/new", ok_route(&new));
        let base = spawn_server(router).await;
        let endpoint = base.join("old").unwrap();

        let handler = handler(10);
        for _ in 0..2 {
            let response = handler
                .send(&endpoint, HeaderMap::new(), Bytes::new())
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }

        assert_eq!(old.count(), 2);
        assert_eq!(new.count(), 2);
        assert_eq!(handler.resolve(&endpoint), endpoint);
    }

    #[tokio::test]
    async fn test_redirect_limit() {
        let hits = Hits::default();
        let router = Router::new().route(
            "/loop",
            redirect_route(AxumStatus::TEMPORARY_REDIRECT, "/loop", "max-age=0", &hits),
        );
        let base = spawn_server(router).await;

        let response = handler(3)
            .send(&base.join("loop").unwrap(), HeaderMap::new(), Bytes::new())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
        assert_eq!(hits.count(), 4);
    }

    #[tokio::test]
    async fn test_default_redirect_limit() {
        let hits = Hits::default();
        let router = Router::new().route(
            "/loop",
            redirect_route(AxumStatus::TEMPORARY_REDIRECT, "/loop", "max-age=0", &hits),
        );
        let base = spawn_server(router).await;

        let handler = RedirectHandler::new(&ChannelConfig::default()).unwrap();
        let response = handler
            .send(&base.join("loop").unwrap(), HeaderMap::new(), Bytes::new())
            .await
            .unwrap();

        // Ten redirects are followed, the eleventh is returned as-is.
        assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
        assert_eq!(hits.count(), 11);
    }

    #[tokio::test]
    async fn test_other_redirects_are_returned() {
        let hits = Hits::default();
        let router = Router::new().route(
            "/found",
            redirect_route(AxumStatus::FOUND, "/elsewhere", "max-age=60", &hits),
        );
        let base = spawn_server(router).await;

        let response = handler(10)
            .send(&base.join("found").unwrap(), HeaderMap::new(), Bytes::new())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(hits.count(), 1);
    }
}
