//! One attempt against the Cloud-Code backend: endpoint fallback, outcome
//! classification, reset-time parsing and empty-response retries.

use std::{collections::VecDeque, pin::Pin, sync::LazyLock, time::Duration};

use eventsource_stream::Eventsource;
use futures::{Stream, StreamExt};
use jiff::Timestamp;
use regex::Regex;
use reqwest::{StatusCode, header::HeaderMap};
use secrecy::{ExposeSecret, SecretString};
use thiserror::Error;

use crate::{
    http_client::default_http_client,
    messages::{
        anthropic::{
            ContentBlock, ContentDelta, MessageDeltaBody, MessageStart, MessagesRequest, MessagesResponse,
            StopReason, StreamEvent, Usage,
        },
        cloud_code::{GenerateChunk, GenerateResponse, StatusError},
    },
    pool::{AccountPool, DEFAULT_COOLDOWN, SelectedAccount},
    token::TokenStore,
    transcode::cloud,
};

/// A stream that closed after `message_start` without content is retried
/// this many times against the same endpoint.
pub const MAX_EMPTY_RESPONSE_RETRIES: usize = 3;

/// Synthetic assistant text emitted after empty-response retries run out.
pub const EMPTY_RESPONSE_TEXT: &str = "[No response after retries - please try again]";

/// Pause before moving past a 5xx endpoint.
const SERVER_ERROR_PAUSE: Duration = Duration::from_secs(1);

/// An ordered lazy sequence of Anthropic events.
pub type EventStream = Pin<Box<dyn Stream<Item = StreamEvent> + Send>>;

/// Result of a successful attempt.
pub enum UpstreamReply {
    /// Complete message (non-streaming request).
    Message(MessagesResponse),
    /// Lazy event sequence (streaming request).
    Stream(EventStream),
}

impl std::fmt::Debug for UpstreamReply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UpstreamReply::Message(msg) => f.debug_tuple("Message").field(msg).finish(),
            UpstreamReply::Stream(_) => f.debug_tuple("Stream").finish(),
        }
    }
}

/// Classified failure of one attempt, driving the dispatcher's retry loop.
#[derive(Debug, Error)]
pub enum AttemptError {
    /// Token rejected on every endpoint; the token cache was invalidated.
    #[error("upstream rejected authentication: {0}")]
    Auth(String),

    /// Every endpoint answered 429; the account was marked rate-limited.
    #[error("rate limited, reset in {reset:?}")]
    RateLimited {
        /// Smallest reset observed across endpoints.
        reset: Duration,
    },

    /// PERMISSION_DENIED; not retried.
    #[error("permission denied: {0}")]
    Permission(String),

    /// Upstream rejected the request shape; not retried.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Every endpoint failed with a server error.
    #[error("upstream server error: {0}")]
    Server(String),

    /// Connection-level failure; soft-fails the account.
    #[error("network error: {0}")]
    Network(String),
}

#[derive(Debug)]
enum EndpointError {
    Unauthenticated(String),
    RateLimited(Duration),
    Permission(String),
    InvalidRequest(String),
    Server(String),
    Network(String),
}

/// Executes attempts against the ordered endpoint-fallback list.
pub struct UpstreamClient {
    client: reqwest::Client,
    endpoints: Vec<String>,
}

impl UpstreamClient {
    /// Client over the given endpoint list, primary first.
    pub fn new(endpoints: Vec<String>) -> Self {
        Self {
            client: default_http_client(),
            endpoints,
        }
    }

    /// Run one attempt for `account` with `token`. Walks the endpoint list,
    /// classifying failures; marks the pool / invalidates the token cache as
    /// mandated by the classification.
    pub async fn attempt(
        &self,
        pool: &AccountPool,
        tokens: &TokenStore,
        account: &SelectedAccount,
        token: &SecretString,
        request: &MessagesRequest,
    ) -> Result<UpstreamReply, AttemptError> {
        let envelope = cloud::generate_request(request, account.project_id.as_deref());
        let body = sonic_rs::to_vec(&envelope)
            .map_err(|e| AttemptError::Server(format!("failed to serialize upstream request: {e}")))?;

        let streaming = request.stream.unwrap_or(false);

        let mut min_reset: Option<Duration> = None;
        let mut auth_failure: Option<String> = None;
        let mut last_server_error: Option<String> = None;

        for endpoint in &self.endpoints {
            let url = if streaming {
                format!("{endpoint}/v1internal:streamGenerateContent?alt=sse")
            } else {
                format!("{endpoint}/v1internal:generateContent")
            };

            let outcome = if streaming {
                self.attempt_stream(&url, token, &body, &request.model).await
            } else {
                self.attempt_non_stream(&url, token, &body, &request.model).await
            };

            match outcome {
                Ok(reply) => return Ok(reply),
                Err(EndpointError::Unauthenticated(message)) => {
                    log::warn!("Endpoint {endpoint} rejected the token for {}", account.email);
                    tokens.invalidate(&account.email);
                    pool.clear_project(&account.email);
                    auth_failure = Some(message);
                }
                Err(EndpointError::RateLimited(reset)) => {
                    log::info!("Endpoint {endpoint} rate-limited {} for {}", account.email, request.model);
                    min_reset = Some(min_reset.map_or(reset, |current| current.min(reset)));
                }
                Err(EndpointError::Server(message)) => {
                    log::warn!("Endpoint {endpoint} failed with a server error: {message}");
                    last_server_error = Some(message);
                    tokio::time::sleep(SERVER_ERROR_PAUSE).await;
                }
                Err(EndpointError::Permission(message)) => {
                    return Err(AttemptError::Permission(message));
                }
                Err(EndpointError::InvalidRequest(message)) => {
                    return Err(AttemptError::InvalidRequest(message));
                }
                Err(EndpointError::Network(message)) => {
                    return Err(AttemptError::Network(message));
                }
            }
        }

        if let Some(reset) = min_reset {
            pool.mark_rate_limited(&account.email, &request.model, Some(reset));
            return Err(AttemptError::RateLimited { reset });
        }

        if let Some(message) = auth_failure {
            return Err(AttemptError::Auth(message));
        }

        Err(AttemptError::Server(
            last_server_error.unwrap_or_else(|| "all endpoints failed".to_string()),
        ))
    }

    async fn send(&self, url: &str, token: &SecretString, body: &[u8]) -> Result<reqwest::Response, EndpointError> {
        self.client
            .post(url)
            .bearer_auth(token.expose_secret())
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body.to_vec())
            .send()
            .await
            .map_err(|e| EndpointError::Network(e.to_string()))
    }

    async fn attempt_non_stream(
        &self,
        url: &str,
        token: &SecretString,
        body: &[u8],
        model: &str,
    ) -> Result<UpstreamReply, EndpointError> {
        let response = self.send(url, token, body).await?;
        let status = response.status();

        if !status.is_success() {
            return Err(classify_failure(status, response.headers().clone(), response).await);
        }

        let text = response
            .text()
            .await
            .map_err(|e| EndpointError::Network(format!("failed to read upstream response: {e}")))?;

        let generate_response = decode_response(&text)
            .ok_or_else(|| EndpointError::Server("unparseable upstream response".to_string()))?;

        Ok(UpstreamReply::Message(cloud::response_to_message(generate_response, model)))
    }

    async fn attempt_stream(
        &self,
        url: &str,
        token: &SecretString,
        body: &[u8],
        model: &str,
    ) -> Result<UpstreamReply, EndpointError> {
        for attempt in 1..=MAX_EMPTY_RESPONSE_RETRIES {
            let response = self.send(url, token, body).await?;
            let status = response.status();

            if !status.is_success() {
                return Err(classify_failure(status, response.headers().clone(), response).await);
            }

            let mut stream = decode_event_stream(response, model);

            // Peek until the first content block or end of stream; an empty
            // stream is retried with the same payload.
            let mut buffered = Vec::new();
            let mut has_content = false;

            while let Some(event) = stream.next().await {
                let is_content = matches!(event, StreamEvent::ContentBlockStart { .. });
                buffered.push(event);

                if is_content {
                    has_content = true;
                    break;
                }
            }

            if has_content {
                let replay = futures::stream::iter(buffered).chain(stream);
                return Ok(UpstreamReply::Stream(Box::pin(replay)));
            }

            log::warn!("Upstream stream ended without content (attempt {attempt}/{MAX_EMPTY_RESPONSE_RETRIES})");
        }

        Ok(UpstreamReply::Stream(synthetic_reply(model)))
    }
}

/// Event sequence carrying the synthetic "no response" message with correct
/// framing.
pub fn synthetic_reply(model: &str) -> EventStream {
    let events = vec![
        StreamEvent::MessageStart {
            message: MessageStart::new(model),
        },
        StreamEvent::ContentBlockStart {
            index: 0,
            content_block: ContentBlock::Text { text: String::new() },
        },
        StreamEvent::ContentBlockDelta {
            index: 0,
            delta: ContentDelta::TextDelta {
                text: EMPTY_RESPONSE_TEXT.to_string(),
            },
        },
        StreamEvent::ContentBlockStop { index: 0 },
        StreamEvent::MessageDelta {
            delta: MessageDeltaBody {
                stop_reason: Some(StopReason::EndTurn),
                stop_sequence: None,
            },
            usage: Some(Usage::default()),
        },
        StreamEvent::MessageStop,
    ];

    Box::pin(futures::stream::iter(events))
}

fn decode_response(text: &str) -> Option<GenerateResponse> {
    if let Ok(chunk) = sonic_rs::from_str::<GenerateChunk>(text)
        && let Some(response) = chunk.response
    {
        return Some(response);
    }

    sonic_rs::from_str::<GenerateResponse>(text).ok()
}

fn decode_event_stream(response: reqwest::Response, model: &str) -> EventStream {
    let sse = response.bytes_stream().eventsource();
    let adapter = cloud::StreamAdapter::new(model);

    let stream = futures::stream::unfold(
        (Box::pin(sse), adapter, VecDeque::new(), false),
        |(mut source, mut adapter, mut queue, mut done)| async move {
            loop {
                if let Some(event) = queue.pop_front() {
                    return Some((event, (source, adapter, queue, done)));
                }

                if done {
                    return None;
                }

                match source.next().await {
                    Some(Ok(sse_event)) => match sonic_rs::from_str::<GenerateChunk>(&sse_event.data) {
                        Ok(chunk) => queue.extend(adapter.process(chunk)),
                        Err(e) => log::warn!("Failed to parse upstream stream chunk: {e}"),
                    },
                    Some(Err(e)) => log::warn!("SSE decoding error in upstream stream: {e}"),
                    None => {
                        done = true;
                        queue.extend(adapter.finish());
                    }
                }
            }
        },
    );

    Box::pin(stream)
}

async fn classify_failure(status: StatusCode, headers: HeaderMap, response: reqwest::Response) -> EndpointError {
    let body = response.text().await.unwrap_or_default();

    let grpc_status = sonic_rs::from_str::<StatusError>(&body)
        .map(|error| error.error.status)
        .unwrap_or_default();

    match (status.as_u16(), grpc_status.as_str()) {
        (401, _) | (_, "UNAUTHENTICATED") => EndpointError::Unauthenticated(body),
        (429, _) | (_, "RESOURCE_EXHAUSTED") => {
            EndpointError::RateLimited(parse_reset(&headers, &body).unwrap_or(DEFAULT_COOLDOWN))
        }
        (403, _) | (_, "PERMISSION_DENIED") => EndpointError::Permission(body),
        (500..=599, _) => EndpointError::Server(format!("status {status}: {body}")),
        _ => EndpointError::InvalidRequest(body),
    }
}

static QUOTA_RESET_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"quota will reset after (?:(\d+)h\s*)?(?:(\d+)m\s*)?(?:(\d+)s)?").expect("valid reset-time pattern")
});

/// Extract the reset time from a 429: `Retry-After` (seconds or HTTP date)
/// first, then the vendor's "quota will reset after Nh Nm Ns" phrase.
pub(crate) fn parse_reset(headers: &HeaderMap, body: &str) -> Option<Duration> {
    if let Some(value) = headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
    {
        if let Ok(seconds) = value.trim().parse::<u64>() {
            return Some(Duration::from_secs(seconds));
        }

        let parser = jiff::fmt::rfc2822::DateTimeParser::new();
        if let Ok(when) = parser.parse_timestamp(value) {
            let delta_ms = when.as_millisecond() - Timestamp::now().as_millisecond();
            if delta_ms > 0 {
                return Some(Duration::from_millis(delta_ms as u64));
            }
        }
    }

    if let Some(captures) = QUOTA_RESET_RE.captures(body) {
        let hours: u64 = captures.get(1).and_then(|m| m.as_str().parse().ok()).unwrap_or(0);
        let minutes: u64 = captures.get(2).and_then(|m| m.as_str().parse().ok()).unwrap_or(0);
        let seconds: u64 = captures.get(3).and_then(|m| m.as_str().parse().ok()).unwrap_or(0);

        let total = hours * 3600 + minutes * 60 + seconds;
        if total > 0 {
            return Some(Duration::from_secs(total));
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::{Account, AccountSource, AccountStore};
    use axum::{
        Router,
        http::{HeaderValue, StatusCode, header},
        response::IntoResponse,
        routing::post,
    };
    use serde_json::json;
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    fn account(email: &str) -> Account {
        Account {
            email: email.to_string(),
            source: AccountSource::Oauth,
            refresh_token: Some(SecretString::from("rt")),
            project_id: Some("projects/test".to_string()),
            enabled: true,
            invalid_reason: None,
            last_used: 0,
            model_rate_limits: Default::default(),
            subscription: Default::default(),
            quota: Default::default(),
        }
    }

    fn test_pool(accounts: Vec<Account>) -> (AccountPool, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = AccountStore::new(dir.path().join("accounts.json"));
        (AccountPool::new(accounts, store), dir)
    }

    fn selected(email: &str) -> SelectedAccount {
        SelectedAccount {
            email: email.to_string(),
            source: AccountSource::Oauth,
            refresh_token: Some(SecretString::from("rt")),
            project_id: Some("projects/test".to_string()),
        }
    }

    fn request(stream: bool) -> MessagesRequest {
        serde_json::from_value(json!({
            "model": "claude-3-5-sonnet",
            "max_tokens": 64,
            "stream": stream,
            "messages": [{ "role": "user", "content": "hi" }]
        }))
        .unwrap()
    }

    async fn spawn_app(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{address}")
    }

    fn sse_response(frames: &[serde_json::Value]) -> axum::response::Response {
        let body: String = frames.iter().map(|frame| format!("data: {frame}\n\n")).collect();

        (
            [(header::CONTENT_TYPE, HeaderValue::from_static("text/event-stream"))],
            body,
        )
            .into_response()
    }

    #[test]
    fn retry_after_seconds_wins() {
        let mut headers = HeaderMap::new();
        headers.insert(reqwest::header::RETRY_AFTER, HeaderValue::from_static("30"));

        assert_eq!(parse_reset(&headers, ""), Some(Duration::from_secs(30)));
    }

    #[test]
    fn vendor_reset_phrase_is_parsed() {
        let body = r#"{"error":{"message":"Your quota will reset after 1h 3m 20s."}}"#;

        assert_eq!(parse_reset(&HeaderMap::new(), body), Some(Duration::from_secs(3800)));
    }

    #[test]
    fn vendor_reset_phrase_partial_units() {
        let body = "quota will reset after 45s";

        assert_eq!(parse_reset(&HeaderMap::new(), body), Some(Duration::from_secs(45)));
    }

    #[test]
    fn no_reset_information_yields_none() {
        assert_eq!(parse_reset(&HeaderMap::new(), "try later"), None);
    }

    #[tokio::test]
    async fn all_endpoints_429_marks_account_with_smallest_reset() {
        let resource_exhausted = || async {
            (
                StatusCode::TOO_MANY_REQUESTS,
                json!({
                    "error": {
                        "code": 429,
                        "message": "Your quota will reset after 10s.",
                        "status": "RESOURCE_EXHAUSTED"
                    }
                })
                .to_string(),
            )
        };

        let first = spawn_app(Router::new().route("/v1internal:generateContent", post(resource_exhausted))).await;
        let second = spawn_app(Router::new().route("/v1internal:generateContent", post(resource_exhausted))).await;

        let client = UpstreamClient::new(vec![first, second]);
        let (pool, _dir) = test_pool(vec![account("a@example.com")]);
        let tokens = TokenStore::with_token_url("http://unused".to_string(), None);

        let error = client
            .attempt(
                &pool,
                &tokens,
                &selected("a@example.com"),
                &SecretString::from("tok"),
                &request(false),
            )
            .await
            .unwrap_err();

        let AttemptError::RateLimited { reset } = error else {
            unreachable!("expected rate-limit classification");
        };
        assert_eq!(reset, Duration::from_secs(10));

        // The pool now excludes the account for this model.
        assert!(matches!(
            pool.pick_next("claude-3-5-sonnet"),
            crate::pool::Selection::Wait(_)
        ));
    }

    #[tokio::test]
    async fn unauthenticated_falls_through_to_next_endpoint() {
        let hits = Arc::new(AtomicUsize::new(0));

        let bad = spawn_app(Router::new().route(
            "/v1internal:generateContent",
            post(|| async {
                (
                    StatusCode::UNAUTHORIZED,
                    json!({ "error": { "status": "UNAUTHENTICATED", "message": "bad token" } }).to_string(),
                )
            }),
        ))
        .await;

        let good_hits = hits.clone();
        let good = spawn_app(Router::new().route(
            "/v1internal:generateContent",
            post(move || {
                let hits = good_hits.clone();
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    json!({
                        "response": {
                            "candidates": [{
                                "content": { "role": "model", "parts": [{ "text": "hello" }] },
                                "finishReason": "STOP"
                            }]
                        }
                    })
                    .to_string()
                }
            }),
        ))
        .await;

        let client = UpstreamClient::new(vec![bad, good]);
        let (pool, _dir) = test_pool(vec![account("a@example.com")]);
        let tokens = TokenStore::with_token_url("http://unused".to_string(), None);

        let reply = client
            .attempt(
                &pool,
                &tokens,
                &selected("a@example.com"),
                &SecretString::from("tok"),
                &request(false),
            )
            .await
            .unwrap();

        let UpstreamReply::Message(message) = reply else {
            unreachable!("expected a full message");
        };
        assert!(matches!(&message.content[0], ContentBlock::Text { text } if text == "hello"));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn permission_denied_stops_immediately() {
        let second_hits = Arc::new(AtomicUsize::new(0));

        let first = spawn_app(Router::new().route(
            "/v1internal:generateContent",
            post(|| async {
                (
                    StatusCode::FORBIDDEN,
                    json!({ "error": { "status": "PERMISSION_DENIED", "message": "no access" } }).to_string(),
                )
            }),
        ))
        .await;

        let counter = second_hits.clone();
        let second = spawn_app(Router::new().route(
            "/v1internal:generateContent",
            post(move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    "unreachable".to_string()
                }
            }),
        ))
        .await;

        let client = UpstreamClient::new(vec![first, second]);
        let (pool, _dir) = test_pool(vec![account("a@example.com")]);
        let tokens = TokenStore::with_token_url("http://unused".to_string(), None);

        let error = client
            .attempt(
                &pool,
                &tokens,
                &selected("a@example.com"),
                &SecretString::from("tok"),
                &request(false),
            )
            .await
            .unwrap_err();

        assert!(matches!(error, AttemptError::Permission(_)));
        assert_eq!(second_hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn streaming_happy_path_produces_framed_events() {
        let upstream = spawn_app(Router::new().route(
            "/v1internal:streamGenerateContent",
            post(|| async {
                sse_response(&[
                    json!({ "response": { "candidates": [{ "content": { "parts": [{ "text": "par" }] } }] } }),
                    json!({
                        "response": {
                            "candidates": [{ "content": { "parts": [{ "text": "tial" }] }, "finishReason": "STOP" }],
                            "usageMetadata": { "promptTokenCount": 5, "candidatesTokenCount": 2 }
                        }
                    }),
                ])
            }),
        ))
        .await;

        let client = UpstreamClient::new(vec![upstream]);
        let (pool, _dir) = test_pool(vec![account("a@example.com")]);
        let tokens = TokenStore::with_token_url("http://unused".to_string(), None);

        let reply = client
            .attempt(
                &pool,
                &tokens,
                &selected("a@example.com"),
                &SecretString::from("tok"),
                &request(true),
            )
            .await
            .unwrap();

        let UpstreamReply::Stream(mut stream) = reply else {
            unreachable!("expected a stream");
        };

        let mut names = Vec::new();
        let mut text = String::new();

        while let Some(event) = stream.next().await {
            names.push(event.name());
            if let StreamEvent::ContentBlockDelta {
                delta: ContentDelta::TextDelta { text: t },
                ..
            } = event
            {
                text.push_str(&t);
            }
        }

        assert_eq!(names.first(), Some(&"message_start"));
        assert_eq!(names.last(), Some(&"message_stop"));
        assert_eq!(text, "partial");
    }

    #[tokio::test]
    async fn empty_streams_retry_then_synthesize_fallback() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();

        let upstream = spawn_app(Router::new().route(
            "/v1internal:streamGenerateContent",
            post(move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    // message metadata only, no content parts
                    sse_response(&[json!({
                        "response": { "candidates": [{ "finishReason": "STOP" }] }
                    })])
                }
            }),
        ))
        .await;

        let client = UpstreamClient::new(vec![upstream]);
        let (pool, _dir) = test_pool(vec![account("a@example.com")]);
        let tokens = TokenStore::with_token_url("http://unused".to_string(), None);

        let reply = client
            .attempt(
                &pool,
                &tokens,
                &selected("a@example.com"),
                &SecretString::from("tok"),
                &request(true),
            )
            .await
            .unwrap();

        assert_eq!(hits.load(Ordering::SeqCst), MAX_EMPTY_RESPONSE_RETRIES);

        let UpstreamReply::Stream(mut stream) = reply else {
            unreachable!("expected a stream");
        };

        let mut text = String::new();
        let mut names = Vec::new();

        while let Some(event) = stream.next().await {
            names.push(event.name());
            if let StreamEvent::ContentBlockDelta {
                delta: ContentDelta::TextDelta { text: t },
                ..
            } = event
            {
                text.push_str(&t);
            }
        }

        assert_eq!(text, EMPTY_RESPONSE_TEXT);
        assert_eq!(names.last(), Some(&"message_stop"));
    }
}
