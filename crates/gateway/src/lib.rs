//! The gateway core: an Anthropic-compatible HTTP surface dispatching to a
//! pool of Cloud-Code accounts or a local OpenAI-compatible endpoint, with
//! streaming transcoding between the three protocols.

use std::{convert::Infallible, sync::Arc};

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Query, State},
    http::{HeaderValue, Uri, header},
    response::{IntoResponse, Response, Sse, sse::Event},
    routing::{get, post},
};
use futures::StreamExt;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

pub mod account;
pub mod dispatch;
pub mod error;
mod http_client;
pub mod local;
pub mod messages;
pub mod pool;
pub mod routing;
pub mod status;
pub mod token;
pub mod transcode;
pub mod upstream;
pub mod validate;

pub use error::{GatewayError, GatewayResult};

use crate::{
    account::AccountStore,
    dispatch::Dispatcher,
    local::LocalGateway,
    messages::anthropic::{MessagesRequest, ModelInfo, ModelsResponse},
    pool::AccountPool,
    routing::Route,
    token::TokenStore,
    upstream::{EventStream, UpstreamClient, UpstreamReply},
};

/// Shared state behind the routes.
pub struct Gateway {
    config: config::Config,
    pool: Arc<AccountPool>,
    tokens: Arc<TokenStore>,
    dispatcher: Dispatcher,
    local: LocalGateway,
}

impl Gateway {
    /// Assemble the gateway from pre-built parts. The production path is
    /// [`build`]; tests inject pools and token stores pointing at mock
    /// endpoints.
    pub fn new(config: config::Config, pool: Arc<AccountPool>, tokens: Arc<TokenStore>) -> Arc<Self> {
        let upstream = UpstreamClient::new(config.cloud.endpoints.clone());
        let dispatcher = Dispatcher::new(pool.clone(), tokens.clone(), upstream, config.fallback.clone());
        let local = LocalGateway::new(&config.local);

        Arc::new(Self {
            config,
            pool,
            tokens,
            dispatcher,
            local,
        })
    }

    /// The axum router over this state.
    pub fn router(self: &Arc<Self>) -> Router {
        Router::new()
            .route("/v1/messages", post(handle_messages))
            .route("/v1/messages/count_tokens", post(handle_count_tokens))
            .route("/v1/models", get(handle_models))
            .route("/health", get(handle_health))
            .route("/account-limits", get(handle_account_limits))
            .route("/refresh-token", post(handle_refresh_token))
            .fallback(handle_not_found)
            .with_state(self.clone())
    }
}

/// Load the account store, start the token-refresh scheduler and return the
/// ready-to-serve router.
pub fn build(config: config::Config, shutdown: CancellationToken) -> anyhow::Result<Router> {
    let store = AccountStore::new(config.cloud.accounts_path());
    let accounts = store.load()?;

    let pool = Arc::new(AccountPool::new(accounts, store));
    let tokens = Arc::new(TokenStore::new(config.cloud.legacy_token_path()));
    tokens.spawn_scheduler(pool.clone(), shutdown);

    Ok(Gateway::new(config, pool, tokens).router())
}

async fn handle_messages(State(gateway): State<Arc<Gateway>>, body: Bytes) -> Result<Response, GatewayError> {
    let value: serde_json::Value = sonic_rs::from_slice(&body)
        .map_err(|e| GatewayError::InvalidRequest(format!("malformed JSON body: {e}")))?;

    validate::scan_object_safety(&value)?;

    let mut request: MessagesRequest =
        serde_json::from_value(value).map_err(|e| GatewayError::InvalidRequest(format!("invalid request: {e}")))?;

    let (model, route) = routing::resolve(&request.model, &gateway.config.model_mapping)?;
    request.model = model;

    validate::validate(&mut request)?;

    log::debug!(
        "Dispatching {} message(s) for model {} (stream: {})",
        request.messages.len(),
        request.model,
        request.stream.unwrap_or(false)
    );

    let reply = match route {
        Route::Local => gateway.local.forward(&request).await?,
        Route::CloudCode => gateway.dispatcher.dispatch(request).await?,
    };

    match reply {
        UpstreamReply::Message(message) => Ok(Json(message).into_response()),
        UpstreamReply::Stream(stream) => Ok(sse_response(stream)),
    }
}

fn sse_response(stream: EventStream) -> Response {
    let frames = stream.map(|event| {
        let data = sonic_rs::to_string(&event).unwrap_or_else(|e| {
            log::error!("Failed to serialize stream event: {e}");
            r#"{"type":"error","error":{"type":"api_error","message":"serialization failed"}}"#.to_string()
        });

        Ok::<_, Infallible>(Event::default().event(event.name()).data(data))
    });

    let mut response = Sse::new(frames).into_response();

    let headers = response.headers_mut();
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    headers.insert("x-accel-buffering", HeaderValue::from_static("no"));

    response
}

async fn handle_count_tokens() -> GatewayError {
    GatewayError::NotImplemented
}

async fn handle_models(State(gateway): State<Arc<Gateway>>) -> Json<ModelsResponse> {
    let mut data: Vec<ModelInfo> = routing::CLOUD_MODEL_CATALOG.iter().copied().map(ModelInfo::new).collect();

    // Configured aliases are reachable names too.
    for alias in gateway.config.model_mapping.keys() {
        if !data.iter().any(|model| model.id == *alias) {
            data.push(ModelInfo::new(alias));
        }
    }

    Json(ModelsResponse { data, has_more: false })
}

async fn handle_health(State(gateway): State<Arc<Gateway>>) -> Json<status::HealthResponse> {
    Json(status::health(&gateway.pool.snapshot()))
}

#[derive(Debug, Deserialize)]
struct LimitsQuery {
    format: Option<String>,
}

async fn handle_account_limits(
    State(gateway): State<Arc<Gateway>>,
    Query(query): Query<LimitsQuery>,
) -> Response {
    let limits = status::limits(&gateway.pool.snapshot());

    if query.format.as_deref() == Some("table") {
        let table = status::render_table(&limits);
        (
            [(header::CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"))],
            table,
        )
            .into_response()
    } else {
        Json(limits).into_response()
    }
}

async fn handle_refresh_token(State(gateway): State<Arc<Gateway>>) -> Json<token::RefreshSummary> {
    log::info!("Forced token refresh requested");
    Json(gateway.tokens.force_refresh_all(&gateway.pool).await)
}

async fn handle_not_found(uri: Uri) -> GatewayError {
    GatewayError::NotFound(uri.path().to_string())
}
