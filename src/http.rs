//! HTTP client with rate limiting and bearer authorization for the Web API.
//!
//! This module wraps `reqwest::Client` and adds:
//! * Request rate limiting to stay well within the Web API quota
//! * `Authorization: Bearer` headers from the configured access token
//! * Consistent timeouts and `User-Agent`

use std::{future::Future, num::NonZeroU32, time::Duration};

use futures_util::{FutureExt, TryFutureExt};
use governor::{DefaultDirectRateLimiter, Quota};
use reqwest::{
    header::{HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE},
    Body, Method, Url,
};

use crate::{
    config::Config,
    error::{Error, Result},
};

/// HTTP client with built-in rate limiting and authorization.
pub struct Client {
    /// Direct access to the underlying client without rate limiting or
    /// authorization.
    pub unlimited: reqwest::Client,

    rate_limiter: DefaultDirectRateLimiter,

    authorization: HeaderValue,
}

impl Client {
    /// The Web API applies a rolling 30 second window.
    const RATE_LIMIT_INTERVAL: Duration = Duration::from_secs(30);

    /// Calls per interval. A remote control needs far fewer than this.
    const RATE_LIMIT_CALLS_PER_INTERVAL: u8 = 90;

    /// Duration to keep idle connections alive.
    const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(60);

    /// Duration to wait for individual network reads.
    const READ_TIMEOUT: Duration = Duration::from_secs(5);

    /// Duration to wait for a whole request.
    const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

    /// Creates a new client.
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// * HTTP client creation fails
    /// * the access token is not a valid header value
    ///
    /// # Panics
    ///
    /// Panics if rate limit parameters are zero.
    pub fn new(config: &Config) -> Result<Self> {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

        let http_client = reqwest::Client::builder()
            .tcp_keepalive(Self::KEEPALIVE_TIMEOUT)
            .read_timeout(Self::READ_TIMEOUT)
            .timeout(Self::REQUEST_TIMEOUT)
            .default_headers(headers)
            .user_agent(&config.user_agent);

        let mut authorization =
            HeaderValue::from_str(&format!("Bearer {}", config.access_token))
                .map_err(|e| Error::invalid_argument(format!("access token: {e}")))?;
        authorization.set_sensitive(true);

        let replenish_interval =
            Self::RATE_LIMIT_INTERVAL / u32::from(Self::RATE_LIMIT_CALLS_PER_INTERVAL);
        let quota = Quota::with_period(replenish_interval)
            .expect("quota time interval is zero")
            .allow_burst(
                NonZeroU32::new(Self::RATE_LIMIT_CALLS_PER_INTERVAL.into())
                    .expect("calls per interval is zero"),
            );

        Ok(Self {
            unlimited: http_client.build()?,
            rate_limiter: governor::RateLimiter::direct(quota),
            authorization,
        })
    }

    /// Builds an authorized request with specified method, URL and body.
    pub fn request<U, T>(&self, method: Method, url: U, body: T) -> reqwest::Request
    where
        U: Into<Url>,
        T: Into<Body>,
    {
        let mut request = reqwest::Request::new(method, url.into());
        request
            .headers_mut()
            .insert(AUTHORIZATION, self.authorization.clone());

        let body = body.into();
        if body.as_bytes().is_some_and(|bytes| !bytes.is_empty()) {
            request
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        }
        *request.body_mut() = Some(body);

        request
    }

    pub fn get<U>(&self, url: U) -> reqwest::Request
    where
        U: Into<Url>,
    {
        self.request(Method::GET, url, Body::from(""))
    }

    pub fn put<U, T>(&self, url: U, body: T) -> reqwest::Request
    where
        U: Into<Url>,
        T: Into<Body>,
    {
        self.request(Method::PUT, url, body)
    }

    pub fn post<U, T>(&self, url: U, body: T) -> reqwest::Request
    where
        U: Into<Url>,
        T: Into<Body>,
    {
        self.request(Method::POST, url, body)
    }

    /// Executes a request with rate limiting.
    ///
    /// # Errors
    ///
    /// Returns error if the request could not be sent or no response was
    /// received. Error statuses are not checked here.
    pub fn execute(
        &self,
        request: reqwest::Request,
    ) -> impl Future<Output = Result<reqwest::Response>> + '_ {
        let throttle = self.rate_limiter.until_ready();
        throttle.then(|()| self.unlimited.execute(request).map_err(Into::into))
    }
}
