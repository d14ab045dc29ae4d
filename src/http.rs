//! Blocking HTTP client with rate limiting and retries.
//!
//! This module wraps `reqwest::blocking::Client` and adds:
//! * Request rate limiting for service APIs
//! * Retries of transient failures with `Retry-After` support
//! * Consistent timeouts and headers
//!
//! # Rate Limiting
//!
//! API calls are limited to 50 calls per 5-second interval, allowing bursts
//! up to the maximum. Requests that would exceed the limit are delayed.
//! Media chunk fetches from CDNs are not rate limited.
//!
//! # Retries
//!
//! Responses with status 429, 500, 502, 503 or 504 are retried up to
//! [`Client::MAX_RETRIES`] times. A `Retry-After` header in seconds is
//! honored; otherwise the next exponential backoff interval is used.
//!
//! # Example
//!
//! ```rust,no_run
//! use sptape::{config::Config, http::Client};
//!
//! let config = Config::new();
//! let client = Client::new(&config)?;
//!
//! let request = client.get("https://apresolve.spotify.com/?type=accesspoint".parse()?);
//! let response = client.execute(request)?;
//! # Ok::<(), sptape::error::Error>(())
//! ```

use std::{num::NonZeroU32, thread, time::Duration};

use exponential_backoff::Backoff;
use governor::{
    clock::{Clock, DefaultClock},
    DefaultDirectRateLimiter, Quota,
};
use reqwest::{
    blocking::{Body, Request, Response},
    header::{HeaderValue, ACCEPT_LANGUAGE, RETRY_AFTER},
    Method, StatusCode, Url,
};

use crate::{
    config::Config,
    error::{Error, Result},
};

/// HTTP client with built-in rate limiting and retries.
pub struct Client {
    /// Client without rate limiting, for CDN downloads.
    pub unlimited: reqwest::blocking::Client,

    /// Rate limiter for API quota compliance.
    rate_limiter: DefaultDirectRateLimiter,

    clock: DefaultClock,
}

impl Client {
    /// Standard rate limit interval.
    const RATE_LIMIT_INTERVAL: Duration = Duration::from_secs(5);

    /// Maximum allowed API calls per interval.
    const RATE_LIMIT_CALLS_PER_INTERVAL: u8 = 50;

    /// Duration to keep idle connections alive.
    const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(60);

    /// Total duration allowed for one request, including the body.
    const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

    /// Retries after the first attempt of a transient failure.
    pub const MAX_RETRIES: u32 = 5;

    /// First backoff interval between retries.
    const BACKOFF_MIN: Duration = Duration::from_secs(1);

    /// Longest backoff interval between retries.
    const BACKOFF_MAX: Duration = Duration::from_secs(32);

    /// Status codes worth retrying.
    const RETRY_STATUS: [StatusCode; 5] = [
        StatusCode::TOO_MANY_REQUESTS,
        StatusCode::INTERNAL_SERVER_ERROR,
        StatusCode::BAD_GATEWAY,
        StatusCode::SERVICE_UNAVAILABLE,
        StatusCode::GATEWAY_TIMEOUT,
    ];

    /// Creates a new client.
    ///
    /// # Errors
    ///
    /// Returns error if the HTTP client cannot be built or the rate limit
    /// parameters are zero.
    pub fn new(config: &Config) -> Result<Self> {
        // Not having `Accept-Language` set is non-fatal.
        let mut headers = reqwest::header::HeaderMap::new();
        if let Ok(lang) = HeaderValue::from_str(&config.app_lang) {
            headers.insert(ACCEPT_LANGUAGE, lang);
        }

        let http_client = reqwest::blocking::Client::builder()
            .tcp_keepalive(Self::KEEPALIVE_TIMEOUT)
            .timeout(Self::REQUEST_TIMEOUT)
            .default_headers(headers)
            .user_agent(&config.user_agent)
            .build()?;

        // Rate limit own requests as to not overload the service.
        let replenish_interval =
            Self::RATE_LIMIT_INTERVAL / u32::from(Self::RATE_LIMIT_CALLS_PER_INTERVAL);
        let burst = NonZeroU32::new(Self::RATE_LIMIT_CALLS_PER_INTERVAL.into())
            .ok_or_else(|| Error::internal("calls per interval is zero"))?;
        let quota = Quota::with_period(replenish_interval)
            .ok_or_else(|| Error::internal("quota time interval is zero"))?
            .allow_burst(burst);

        Ok(Self {
            unlimited: http_client,
            rate_limiter: governor::RateLimiter::direct(quota),
            clock: DefaultClock::default(),
        })
    }

    /// Builds a request with specified method, URL and body.
    pub fn request<T>(&self, method: Method, url: Url, body: T) -> Request
    where
        T: Into<Body>,
    {
        let mut request = Request::new(method, url);
        *request.body_mut() = Some(body.into());
        request
    }

    /// Builds a POST request.
    pub fn post<T>(&self, url: Url, body: T) -> Request
    where
        T: Into<Body>,
    {
        self.request(Method::POST, url, body)
    }

    /// Builds a GET request without body.
    pub fn get(&self, url: Url) -> Request {
        Request::new(Method::GET, url)
    }

    /// Executes a request with rate limiting and retries.
    ///
    /// # Errors
    ///
    /// Returns error if the request fails after all retries, or if the
    /// final response has an error status.
    pub fn execute(&self, request: Request) -> Result<Response> {
        self.execute_with_retry(request, true)
    }

    /// Executes a request with retries but without rate limiting.
    ///
    /// # Errors
    ///
    /// Same as [`Client::execute`].
    pub fn execute_unlimited(&self, request: Request) -> Result<Response> {
        self.execute_with_retry(request, false)
    }

    /// Sends `request`, retrying transient failures.
    ///
    /// Requests with a streaming body cannot be cloned and are sent once.
    ///
    /// # Errors
    ///
    /// Returns error if sending fails or the final status is an error.
    pub fn execute_with_retry(&self, request: Request, limited: bool) -> Result<Response> {
        let backoff = Backoff::new(Self::MAX_RETRIES + 1, Self::BACKOFF_MIN, Self::BACKOFF_MAX);
        let mut pending = Some(request);

        for delay in &backoff {
            let Some(request) = pending.take() else {
                break;
            };
            let retry = request.try_clone();
            let url = request.url().clone();

            if limited {
                self.throttle();
            }

            let response = self.unlimited.execute(request)?;
            let status = response.status();
            if !Self::RETRY_STATUS.contains(&status) {
                return response.error_for_status().map_err(Into::into);
            }

            let (Some(delay), Some(retry)) = (delay, retry) else {
                return response.error_for_status().map_err(Into::into);
            };

            let delay = Self::retry_after(&response).unwrap_or(delay);
            warn!(
                "{url} returned {status}, retrying in {:.1}s",
                delay.as_secs_f32()
            );
            thread::sleep(delay);
            pending = Some(retry);
        }

        Err(Error::unavailable("retries exhausted"))
    }

    /// Blocks until the rate limiter allows another call.
    fn throttle(&self) {
        while let Err(not_until) = self.rate_limiter.check() {
            thread::sleep(not_until.wait_time_from(self.clock.now()));
        }
    }

    /// Parses a `Retry-After` header in seconds.
    fn retry_after(response: &Response) -> Option<Duration> {
        response
            .headers()
            .get(RETRY_AFTER)?
            .to_str()
            .ok()?
            .trim()
            .parse()
            .ok()
            .map(Duration::from_secs)
    }
}
