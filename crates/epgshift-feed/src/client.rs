//! `FeedClient` - HTTP feed fetcher implementation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use reqwest::header::{
    ETAG, HeaderMap, HeaderName, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED, RETRY_AFTER,
};
use reqwest::{Client, StatusCode};
use tokio::sync::{Mutex, OnceCell};
use tokio_util::sync::CancellationToken;
use tracing::instrument;
use url::Url;

use super::api::FeedSource;
use super::error::FetchError;
use super::retry::RetryPolicy;
use super::types::{CachedFeed, FetchRequest, FetchedFeed, Freshness, Validators, content_hash};

/// Default per-request timeout.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Identifies requests that can share one HTTP exchange within a run.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct FetchKey {
    url: Url,
    etag: Option<String>,
    last_modified: Option<String>,
}

/// Result of a successful HTTP exchange.
#[derive(Debug, Clone)]
enum Exchange {
    /// `200 OK` with a body.
    Body {
        body: Arc<[u8]>,
        fetched_at: DateTime<Utc>,
        etag: Option<String>,
        last_modified: Option<String>,
    },
    /// `304 Not Modified`.
    NotModified {
        fetched_at: DateTime<Utc>,
        etag: Option<String>,
        last_modified: Option<String>,
    },
}

/// Channel-independent failure, shared between coalesced requests.
#[derive(Debug, Clone)]
enum Failure {
    Unavailable { attempts: u32, cause: String },
    Cancelled,
}

impl Failure {
    fn into_fetch_error(self, channel: &str) -> FetchError {
        match self {
            Self::Unavailable { attempts, cause } => FetchError::Unavailable {
                channel: String::from(channel),
                attempts,
                cause,
            },
            Self::Cancelled => FetchError::Cancelled {
                channel: String::from(channel),
            },
        }
    }
}

/// Outcome of a single attempt.
#[derive(Debug)]
enum AttemptError {
    /// Worth another attempt, optionally after a server-requested delay.
    Retryable {
        cause: String,
        retry_after: Option<Duration>,
    },
    /// Retrying will not help.
    Fatal(String),
}

type SharedExchange = Arc<OnceCell<Result<Exchange, Failure>>>;

/// HTTP feed client.
#[derive(Debug)]
#[allow(clippy::module_name_repetitions)]
pub struct FeedClient {
    /// HTTP client (reqwest, gzip enabled).
    http_client: Client,
    /// Retry policy.
    retry: RetryPolicy,
    /// Run-wide cancellation.
    cancel: CancellationToken,
    /// Exchanges started in this run, keyed by URL and validators.
    exchanges: Mutex<HashMap<FetchKey, SharedExchange>>,
}

/// Builder for `FeedClient`.
#[derive(Debug)]
#[allow(clippy::module_name_repetitions)]
pub struct FeedClientBuilder {
    user_agent: Option<String>,
    timeout: Option<Duration>,
    retry: Option<RetryPolicy>,
    cancel: Option<CancellationToken>,
}

impl FeedClientBuilder {
    /// Creates a new builder.
    const fn new() -> Self {
        Self {
            user_agent: None,
            timeout: None,
            retry: None,
            cancel: None,
        }
    }

    /// Sets the User-Agent (required).
    #[must_use]
    pub fn user_agent(mut self, ua: impl Into<String>) -> Self {
        self.user_agent = Some(ua.into());
        self
    }

    /// Sets the per-request timeout (default: 30s).
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Sets the retry policy (default: 3 attempts, 1s base delay).
    #[must_use]
    pub const fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    /// Sets the run cancellation token.
    #[must_use]
    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Builds the client.
    ///
    /// # Errors
    ///
    /// - `user_agent` is not set.
    /// - `reqwest::Client` build fails.
    pub fn build(self) -> Result<FeedClient> {
        let user_agent = self.user_agent.context("user_agent is required")?;

        let http_client = Client::builder()
            .user_agent(&user_agent)
            .timeout(self.timeout.unwrap_or(DEFAULT_TIMEOUT))
            .gzip(true)
            .build()
            .context("failed to build HTTP client")?;

        Ok(FeedClient {
            http_client,
            retry: self.retry.unwrap_or_default(),
            cancel: self.cancel.unwrap_or_default(),
            exchanges: Mutex::new(HashMap::new()),
        })
    }
}

impl FeedClient {
    /// Creates a new builder.
    #[must_use]
    pub const fn builder() -> FeedClientBuilder {
        FeedClientBuilder::new()
    }

    /// Reads a header as an owned string, ignoring non-ASCII values.
    fn header_string(headers: &HeaderMap, name: &HeaderName) -> Option<String> {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(String::from)
    }

    /// Parses `Retry-After` given in seconds.
    fn retry_after(headers: &HeaderMap) -> Option<Duration> {
        headers
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.trim().parse::<u64>().ok())
            .map(Duration::from_secs)
    }

    /// Performs one HTTP exchange.
    async fn attempt(
        &self,
        url: &Url,
        validators: Option<&Validators>,
    ) -> std::result::Result<Exchange, AttemptError> {
        let mut request = self.http_client.get(url.clone());
        if let Some(v) = validators {
            if let Some(ref etag) = v.etag {
                request = request.header(IF_NONE_MATCH, etag.as_str());
            }
            if let Some(ref last_modified) = v.last_modified {
                request = request.header(IF_MODIFIED_SINCE, last_modified.as_str());
            }
        }

        let response = request
            .send()
            .await
            .map_err(|e| AttemptError::Retryable {
                cause: format!("request failed: {e}"),
                retry_after: None,
            })?;

        let status = response.status();
        let fetched_at = Utc::now();
        let headers = response.headers();
        let etag = Self::header_string(headers, &ETAG);
        let last_modified = Self::header_string(headers, &LAST_MODIFIED);
        tracing::trace!(%url, %status, ?headers, "Response headers");

        if status == StatusCode::NOT_MODIFIED {
            return Ok(Exchange::NotModified {
                fetched_at,
                etag,
                last_modified,
            });
        }

        if status == StatusCode::TOO_MANY_REQUESTS
            || status == StatusCode::REQUEST_TIMEOUT
            || status.is_server_error()
        {
            return Err(AttemptError::Retryable {
                cause: format!("HTTP {status}"),
                retry_after: Self::retry_after(headers),
            });
        }

        if !status.is_success() {
            return Err(AttemptError::Fatal(format!("HTTP {status}")));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| AttemptError::Retryable {
                cause: format!("failed to read response body: {e}"),
                retry_after: None,
            })?;

        tracing::debug!(%url, body_len = bytes.len(), "Response body received");

        Ok(Exchange::Body {
            body: Arc::from(bytes.as_ref()),
            fetched_at,
            etag,
            last_modified,
        })
    }

    /// Runs attempts until one succeeds, the policy is exhausted, or the run
    /// is cancelled. Backoff sleeps end early on cancellation.
    #[instrument(skip_all, fields(url = %url))]
    async fn exchange_with_retry(
        &self,
        url: &Url,
        validators: Option<&Validators>,
    ) -> std::result::Result<Exchange, Failure> {
        let max_attempts = self.retry.max_attempts();
        let mut last_cause = String::from("no attempt made");

        for attempt in 1..=max_attempts {
            if self.cancel.is_cancelled() {
                return Err(Failure::Cancelled);
            }

            let delay = match self.attempt(url, validators).await {
                Ok(exchange) => return Ok(exchange),
                Err(AttemptError::Fatal(cause)) => {
                    tracing::warn!(attempt, %cause, "Feed request failed, not retrying");
                    return Err(Failure::Unavailable {
                        attempts: attempt,
                        cause,
                    });
                }
                Err(AttemptError::Retryable { cause, retry_after }) => {
                    // Retry-After is honoured with one second of slack, but
                    // never beyond the policy cap.
                    let delay = retry_after.map_or_else(
                        || self.retry.delay_for(attempt),
                        |d| {
                            d.saturating_add(Duration::from_secs(1))
                                .min(self.retry.max_delay())
                        },
                    );
                    tracing::warn!(
                        attempt,
                        max_attempts,
                        %cause,
                        backoff_ms = delay.as_millis(),
                        "Feed request failed, will retry"
                    );
                    last_cause = cause;
                    delay
                }
            };

            if attempt < max_attempts {
                tokio::select! {
                    () = self.cancel.cancelled() => return Err(Failure::Cancelled),
                    () = tokio::time::sleep(delay) => {}
                }
            }
        }

        Err(Failure::Unavailable {
            attempts: max_attempts,
            cause: last_cause,
        })
    }

    /// Returns the shared exchange slot for a key, creating it if needed.
    async fn exchange_slot(&self, key: FetchKey) -> SharedExchange {
        let mut exchanges = self.exchanges.lock().await;
        Arc::clone(exchanges.entry(key).or_default())
    }

    /// Converts an exchange into the caller's view.
    fn into_fetched(
        exchange: Exchange,
        channel: &str,
        conditional: Option<&CachedFeed>,
    ) -> std::result::Result<FetchedFeed, FetchError> {
        match exchange {
            Exchange::Body {
                body,
                fetched_at,
                etag,
                last_modified,
            } => {
                let hash = content_hash(&body);
                Ok(FetchedFeed {
                    body,
                    fetched_at,
                    validators: Validators {
                        etag,
                        last_modified,
                        content_hash: Some(hash),
                    },
                    freshness: Freshness::Live,
                })
            }
            Exchange::NotModified {
                fetched_at,
                etag,
                last_modified,
            } => {
                let cached = conditional.ok_or_else(|| FetchError::Unavailable {
                    channel: String::from(channel),
                    attempts: 1,
                    cause: String::from("server answered 304 without a cached snapshot"),
                })?;
                let hash = cached
                    .validators
                    .content_hash
                    .clone()
                    .unwrap_or_else(|| content_hash(&cached.body));
                Ok(FetchedFeed {
                    body: Arc::clone(&cached.body),
                    fetched_at,
                    validators: Validators {
                        etag: etag.or_else(|| cached.validators.etag.clone()),
                        last_modified: last_modified
                            .or_else(|| cached.validators.last_modified.clone()),
                        content_hash: Some(hash),
                    },
                    freshness: Freshness::NotModified,
                })
            }
        }
    }
}

impl FeedSource for FeedClient {
    #[instrument(skip_all, fields(channel = request.channel_id))]
    async fn fetch(
        &self,
        request: &FetchRequest<'_>,
    ) -> std::result::Result<FetchedFeed, FetchError> {
        if self.cancel.is_cancelled() {
            return Err(FetchError::Cancelled {
                channel: String::from(request.channel_id),
            });
        }

        let conditional = if request.force {
            None
        } else {
            request.cached.filter(|c| c.validators.is_conditional())
        };
        let validators = conditional.map(|c| &c.validators);

        let key = FetchKey {
            url: request.url.clone(),
            etag: validators.and_then(|v| v.etag.clone()),
            last_modified: validators.and_then(|v| v.last_modified.clone()),
        };
        let slot = self.exchange_slot(key).await;

        let shared = slot
            .get_or_init(|| self.exchange_with_retry(request.url, validators))
            .await
            .clone();

        let exchange = shared.map_err(|f| f.into_fetch_error(request.channel_id))?;
        let fetched = Self::into_fetched(exchange, request.channel_id, conditional)?;

        tracing::info!(
            body_len = fetched.body.len(),
            freshness = ?fetched.freshness,
            "Feed fetched"
        );
        Ok(fetched)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    fn test_client(policy: RetryPolicy) -> FeedClient {
        FeedClient::builder()
            .user_agent("test/0.0.0")
            .retry_policy(policy)
            .build()
            .unwrap()
    }

    fn fast_policy(attempts: u32) -> RetryPolicy {
        RetryPolicy::new(attempts, Duration::from_millis(1), Duration::from_millis(5))
    }

    const BODY: &str = r#"<tv><channel id="bbc1"><display-name>BBC One</display-name></channel></tv>"#;

    #[test]
    fn test_builder_requires_user_agent() {
        // Arrange & Act
        let result = FeedClient::builder().build();

        // Assert
        assert!(result.is_err());
        assert!(
            result
                .unwrap_err()
                .to_string()
                .contains("user_agent is required")
        );
    }

    #[tokio::test]
    async fn test_live_fetch_records_validators() {
        // Arrange
        let mock_server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("GET"))
            .and(wiremock::matchers::path("/bbc1.xml"))
            .respond_with(
                wiremock::ResponseTemplate::new(200)
                    .insert_header("ETag", "\"v1\"")
                    .set_body_string(BODY),
            )
            .expect(1)
            .mount(&mock_server)
            .await;

        let client = test_client(fast_policy(3));
        let url: Url = format!("{}/bbc1.xml", mock_server.uri()).parse().unwrap();

        // Act
        let fetched = client
            .fetch(&FetchRequest {
                channel_id: "bbc1",
                url: &url,
                force: false,
                cached: None,
            })
            .await
            .unwrap();

        // Assert
        assert_eq!(&*fetched.body, BODY.as_bytes());
        assert_eq!(fetched.freshness, Freshness::Live);
        assert_eq!(fetched.validators.etag.as_deref(), Some("\"v1\""));
        assert_eq!(
            fetched.validators.content_hash,
            Some(content_hash(BODY.as_bytes()))
        );
    }

    #[tokio::test]
    async fn test_not_modified_returns_cached_bytes() {
        // Arrange
        let mock_server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("GET"))
            .and(wiremock::matchers::header("If-None-Match", "\"v1\""))
            .respond_with(wiremock::ResponseTemplate::new(304))
            .expect(1)
            .mount(&mock_server)
            .await;

        let client = test_client(fast_policy(3));
        let url: Url = format!("{}/bbc1.xml", mock_server.uri()).parse().unwrap();
        let cached = CachedFeed {
            body: Arc::from(BODY.as_bytes()),
            validators: Validators {
                etag: Some(String::from("\"v1\"")),
                last_modified: None,
                content_hash: Some(String::from("cafe")),
            },
        };

        // Act
        let fetched = client
            .fetch(&FetchRequest {
                channel_id: "bbc1",
                url: &url,
                force: false,
                cached: Some(&cached),
            })
            .await
            .unwrap();

        // Assert
        assert_eq!(fetched.freshness, Freshness::NotModified);
        assert_eq!(&*fetched.body, BODY.as_bytes());
        assert_eq!(fetched.validators.content_hash.as_deref(), Some("cafe"));
    }

    #[tokio::test]
    async fn test_force_skips_conditional_headers() {
        // Arrange
        let mock_server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("GET"))
            .and(wiremock::matchers::header("If-None-Match", "\"v1\""))
            .respond_with(wiremock::ResponseTemplate::new(304))
            .expect(0)
            .mount(&mock_server)
            .await;
        wiremock::Mock::given(wiremock::matchers::method("GET"))
            .respond_with(wiremock::ResponseTemplate::new(200).set_body_string("<tv/>"))
            .expect(1)
            .mount(&mock_server)
            .await;

        let client = test_client(fast_policy(3));
        let url: Url = format!("{}/bbc1.xml", mock_server.uri()).parse().unwrap();
        let cached = CachedFeed {
            body: Arc::from(BODY.as_bytes()),
            validators: Validators {
                etag: Some(String::from("\"v1\"")),
                ..Validators::default()
            },
        };

        // Act
        let fetched = client
            .fetch(&FetchRequest {
                channel_id: "bbc1",
                url: &url,
                force: true,
                cached: Some(&cached),
            })
            .await
            .unwrap();

        // Assert
        assert_eq!(fetched.freshness, Freshness::Live);
        assert_eq!(&*fetched.body, b"<tv/>");
    }

    #[tokio::test]
    async fn test_server_errors_are_retried() {
        // Arrange
        let mock_server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("GET"))
            .respond_with(wiremock::ResponseTemplate::new(503))
            .up_to_n_times(2)
            .expect(2)
            .mount(&mock_server)
            .await;
        wiremock::Mock::given(wiremock::matchers::method("GET"))
            .respond_with(wiremock::ResponseTemplate::new(200).set_body_string(BODY))
            .expect(1)
            .mount(&mock_server)
            .await;

        let client = test_client(fast_policy(3));
        let url: Url = format!("{}/bbc1.xml", mock_server.uri()).parse().unwrap();

        // Act
        let fetched = client
            .fetch(&FetchRequest {
                channel_id: "bbc1",
                url: &url,
                force: false,
                cached: None,
            })
            .await
            .unwrap();

        // Assert
        assert_eq!(&*fetched.body, BODY.as_bytes());
    }

    #[tokio::test]
    async fn test_retry_after_is_capped_by_policy() {
        // Arrange
        let mock_server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("GET"))
            .respond_with(
                wiremock::ResponseTemplate::new(429).insert_header("Retry-After", "3600"),
            )
            .up_to_n_times(1)
            .expect(1)
            .mount(&mock_server)
            .await;
        wiremock::Mock::given(wiremock::matchers::method("GET"))
            .respond_with(wiremock::ResponseTemplate::new(200).set_body_string(BODY))
            .expect(1)
            .mount(&mock_server)
            .await;

        let client = test_client(fast_policy(2));
        let url: Url = format!("{}/bbc1.xml", mock_server.uri()).parse().unwrap();
        let request = FetchRequest {
            channel_id: "bbc1",
            url: &url,
            force: false,
            cached: None,
        };

        // Act
        let result = tokio::time::timeout(Duration::from_secs(3), client.fetch(&request)).await;

        // Assert
        assert!(result.is_ok(), "backoff followed the server's Retry-After");
        let fetched = result.unwrap().unwrap();
        assert_eq!(&*fetched.body, BODY.as_bytes());
    }

    #[tokio::test]
    async fn test_retries_exhausted_reports_unavailable() {
        // Arrange
        let mock_server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("GET"))
            .respond_with(wiremock::ResponseTemplate::new(500))
            .expect(3)
            .mount(&mock_server)
            .await;

        let client = test_client(fast_policy(3));
        let url: Url = format!("{}/bbc1.xml", mock_server.uri()).parse().unwrap();

        // Act
        let err = client
            .fetch(&FetchRequest {
                channel_id: "bbc1",
                url: &url,
                force: false,
                cached: None,
            })
            .await
            .unwrap_err();

        // Assert
        match err {
            FetchError::Unavailable {
                channel,
                attempts,
                cause,
            } => {
                assert_eq!(channel, "bbc1");
                assert_eq!(attempts, 3);
                assert!(cause.contains("500"));
            }
            FetchError::Cancelled { .. } => panic!("unexpected cancellation"),
        }
    }

    #[tokio::test]
    async fn test_client_error_is_not_retried() {
        // Arrange
        let mock_server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("GET"))
            .respond_with(wiremock::ResponseTemplate::new(404))
            .expect(1)
            .mount(&mock_server)
            .await;

        let client = test_client(fast_policy(3));
        let url: Url = format!("{}/missing.xml", mock_server.uri()).parse().unwrap();

        // Act
        let err = client
            .fetch(&FetchRequest {
                channel_id: "gone",
                url: &url,
                force: false,
                cached: None,
            })
            .await
            .unwrap_err();

        // Assert
        assert!(matches!(
            err,
            FetchError::Unavailable { attempts: 1, .. }
        ));
    }

    #[tokio::test]
    async fn test_same_url_is_downloaded_once_per_run() {
        // Arrange
        let mock_server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("GET"))
            .and(wiremock::matchers::path("/TV.xml"))
            .respond_with(wiremock::ResponseTemplate::new(200).set_body_string(BODY))
            .expect(1)
            .mount(&mock_server)
            .await;

        let client = test_client(fast_policy(3));
        let url: Url = format!("{}/TV.xml", mock_server.uri()).parse().unwrap();

        // Act
        let first = client
            .fetch(&FetchRequest {
                channel_id: "bbc1",
                url: &url,
                force: false,
                cached: None,
            })
            .await
            .unwrap();
        let second = client
            .fetch(&FetchRequest {
                channel_id: "itv",
                url: &url,
                force: false,
                cached: None,
            })
            .await
            .unwrap();

        // Assert
        assert_eq!(first.body, second.body);
    }

    #[tokio::test]
    async fn test_cancelled_before_fetch() {
        // Arrange
        let token = CancellationToken::new();
        token.cancel();
        let client = FeedClient::builder()
            .user_agent("test/0.0.0")
            .cancellation(token)
            .build()
            .unwrap();
        let url: Url = "http://127.0.0.1:9/TV.xml".parse().unwrap();

        // Act
        let err = client
            .fetch(&FetchRequest {
                channel_id: "bbc1",
                url: &url,
                force: false,
                cached: None,
            })
            .await
            .unwrap_err();

        // Assert
        assert_eq!(
            err,
            FetchError::Cancelled {
                channel: String::from("bbc1")
            }
        );
    }

    #[tokio::test]
    async fn test_cancel_interrupts_backoff() {
        // Arrange
        let mock_server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("GET"))
            .respond_with(wiremock::ResponseTemplate::new(503))
            .expect(1)
            .mount(&mock_server)
            .await;

        let token = CancellationToken::new();
        let client = FeedClient::builder()
            .user_agent("test/0.0.0")
            .retry_policy(RetryPolicy::new(
                3,
                Duration::from_secs(60),
                Duration::from_secs(60),
            ))
            .cancellation(token.clone())
            .build()
            .unwrap();
        let url: Url = format!("{}/TV.xml", mock_server.uri()).parse().unwrap();

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            token.cancel();
        });

        // Act
        let err = client
            .fetch(&FetchRequest {
                channel_id: "bbc1",
                url: &url,
                force: false,
                cached: None,
            })
            .await
            .unwrap_err();
        canceller.await.unwrap();

        // Assert
        assert!(matches!(err, FetchError::Cancelled { .. }));
    }
}
