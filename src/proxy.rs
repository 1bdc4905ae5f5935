//! Chat Completions gateway.
//!
//! Every request is admitted (rate limit, approval), has its reasoning effort
//! normalized, and is then either forwarded unchanged to a Chat Completions
//! backend or converted and sent to a Responses backend, whose answer is
//! translated back into Chat Completions shape.

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    body::Body,
    extract::State,
    http::{HeaderMap, StatusCode, header},
    response::{
        IntoResponse, Response,
        sse::{Event, Sse},
    },
    routing::{get, post},
};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{Level, debug, error, info, warn};

use crate::auth::{self, CredentialProvider};
use crate::config::Config;
use crate::effort::{self, BackendSelector, ReasoningPolicy, UpstreamMode};
use crate::error::GatewayError;
use crate::limits::{ApprovalGate, RequestLimiter};
use crate::models::ModelRegistry;
use crate::protocol::{ChatCompletionRequest, ResponsesRequest, ResponsesResponse};
use crate::stream::{SseFrame, aggregate_stream, decode_events};
use crate::tokens::TokenCounter;
use crate::translate::{
    ENCRYPTED_REASONING_INCLUDE, extract_final_response, to_chat_response, to_responses_request,
};

/// Everything a request handler needs. Built once at startup and read-only
/// afterwards.
pub struct GatewayState {
    pub client: reqwest::Client,
    pub chat_completions_url: String,
    pub responses_url: String,
    pub credentials: CredentialProvider,
    pub registry: ModelRegistry,
    pub policy: ReasoningPolicy,
    pub selector: BackendSelector,
    pub limiter: Option<RequestLimiter>,
    pub approval: ApprovalGate,
    pub tokens: TokenCounter,
}

impl GatewayState {
    pub fn new(config: &Config, registry: ModelRegistry) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .read_timeout(Duration::from_secs(config.upstream.timeout_secs))
            .build()
            .context("Failed to build HTTP client")?;

        let limiter = match config.limits.rate_limit_seconds {
            Some(secs) if secs > 0 => Some(RequestLimiter::new(
                Duration::from_secs(secs),
                config.limits.rate_limit_wait,
            )?),
            _ => None,
        };

        let approval = if config.limits.manual_approve {
            ApprovalGate::terminal()
        } else {
            ApprovalGate::disabled()
        };

        Ok(Self {
            client,
            chat_completions_url: config.upstream.chat_completions_url.clone(),
            responses_url: config.upstream.responses_url.clone(),
            credentials: CredentialProvider::from_config(&config.upstream),
            registry,
            policy: ReasoningPolicy::new(&config.reasoning),
            selector: BackendSelector::new(&config.routing),
            limiter,
            approval,
            tokens: TokenCounter::new(),
        })
    }
}

pub fn router(state: Arc<GatewayState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/v1/chat/completions", post(chat_completions_handler))
        .route("/chat/completions", post(chat_completions_handler))
        .route("/v1/models", get(models_handler))
        .route("/models", get(models_handler))
        .fallback(fallback_handler)
        .with_state(state)
}

/// Start the gateway server
pub async fn start_server(state: Arc<GatewayState>, listen: &str) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(listen)
        .await
        .with_context(|| format!("Failed to bind {}", listen))?;

    info!(address = %listener.local_addr()?, "gateway listening");
    axum::serve(listener, router(state)).await?;

    Ok(())
}

/// Health check endpoint
async fn health_handler() -> &'static str {
    "OK"
}

async fn models_handler(State(state): State<Arc<GatewayState>>) -> Response {
    Json(state.registry.to_model_list()).into_response()
}

/// Fallback handler to log unmatched routes
async fn fallback_handler(req: axum::extract::Request) -> Response {
    let uri = req.uri().clone();
    debug!(%uri, method = %req.method(), "no route");
    (StatusCode::NOT_FOUND, format!("Not found: {}", uri)).into_response()
}

async fn chat_completions_handler(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    Json(request): Json<ChatCompletionRequest>,
) -> Response {
    match handle_chat_completion(&state, &headers, request).await {
        Ok(response) => response,
        Err(err) => {
            match &err {
                GatewayError::Upstream { status, .. } => {
                    error!(%status, "upstream returned an error")
                }
                GatewayError::Connect(_)
                | GatewayError::InvalidUpstream(_)
                | GatewayError::Internal(_) => error!(error = %err, "request failed"),
                _ => warn!(error = %err, "request refused"),
            }
            err.into_response()
        }
    }
}

/// Admission, normalization, backend selection and dispatch for one request
async fn handle_chat_completion(
    state: &GatewayState,
    headers: &HeaderMap,
    mut request: ChatCompletionRequest,
) -> Result<Response, GatewayError> {
    if let Some(limiter) = &state.limiter {
        limiter.acquire().await?;
    }
    state
        .approval
        .approve(&format!(
            "model={} messages={}",
            request.model,
            request.messages.len()
        ))
        .await?;

    let requested_model = request.model.clone();
    if effort::apply_effort_suffix(&mut request) {
        debug!(
            requested = %requested_model,
            model = %request.model,
            effort = ?request.reasoning_effort,
            "effort taken from model suffix"
        );
    }
    state.policy.normalize(&mut request, &state.registry);
    let mode = state.selector.select(&request.model);

    let prompt_tokens =
        tracing::enabled!(Level::INFO).then(|| state.tokens.count_request(&request));
    info!(
        model = %request.model,
        ?mode,
        stream = request.is_streaming(),
        prompt_tokens,
        "routing request"
    );

    let auth = state.credentials.resolve(headers)?;

    match mode {
        UpstreamMode::ChatCompletions => forward_chat(state, &request, &auth).await,
        UpstreamMode::Responses => forward_responses(state, &request, &auth).await,
    }
}

/// Direct path: the normalized request goes out as-is and the answer comes
/// back untouched
async fn forward_chat(
    state: &GatewayState,
    request: &ChatCompletionRequest,
    auth: &str,
) -> Result<Response, GatewayError> {
    let response =
        send_json_request(&state.client, &state.chat_completions_url, request, auth).await?;
    let response = ensure_success(response).await?;

    if request.is_streaming() {
        return Ok(sse_response(response.bytes_stream()));
    }

    let content_type = response
        .headers()
        .get(header::CONTENT_TYPE)
        .cloned()
        .unwrap_or_else(|| header::HeaderValue::from_static("application/json"));
    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, content_type)],
        Body::from_stream(response.bytes_stream()),
    )
        .into_response())
}

async fn forward_responses(
    state: &GatewayState,
    request: &ChatCompletionRequest,
    auth: &str,
) -> Result<Response, GatewayError> {
    let mut payload = to_responses_request(request);
    if is_chatgpt_codex_backend(&state.responses_url) {
        apply_codex_quirks(&mut payload);
    }

    let response = send_json_request(&state.client, &state.responses_url, &payload, auth).await?;
    let response = ensure_success(response).await?;

    if request.is_streaming() {
        let events = decode_events(response.bytes_stream());
        let frames = aggregate_stream(events, request.model.clone());
        return Ok(Sse::new(frames.map(frame_to_event)).into_response());
    }

    // Some backends answer with SSE even when stream=false
    let is_sse = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.to_ascii_lowercase().contains("text/event-stream"));

    let completed = if is_sse {
        extract_final_response(decode_events(response.bytes_stream())).await?
    } else {
        response
            .json::<ResponsesResponse>()
            .await
            .map_err(|e| GatewayError::InvalidUpstream(e.to_string()))?
    };

    Ok(Json(to_chat_response(&completed, &request.model)).into_response())
}

fn is_chatgpt_codex_backend(url: &str) -> bool {
    // Minimal heuristic: the Codex backend lives under chatgpt.com/backend-api/codex.
    url.contains("://chatgpt.com/backend-api/codex/")
}

/// The Codex backend only accepts streamed, stateless requests and rejects
/// sampling and output-limit fields
fn apply_codex_quirks(payload: &mut ResponsesRequest) {
    payload.store = false;
    payload.stream = Some(true);
    payload.include = Some(vec![ENCRYPTED_REASONING_INCLUDE.to_string()]);
    payload.max_output_tokens = None;
    payload.temperature = None;
    payload.top_p = None;
    payload.tool_choice = None;
}

async fn send_json_request<T: Serialize>(
    client: &reqwest::Client,
    url: &str,
    body: &T,
    auth: &str,
) -> Result<reqwest::Response, GatewayError> {
    let mut builder = client
        .post(url)
        .header(header::CONTENT_TYPE, "application/json")
        .header(header::AUTHORIZATION, auth);

    // ChatGPT Codex backend requires extra headers (Codex CLI parity).
    if is_chatgpt_codex_backend(url) {
        builder = builder
            .header(header::ACCEPT, "text/event-stream")
            .header("OpenAI-Beta", "responses=experimental")
            .header("originator", "codex_cli_rs");

        if let Some(token) = auth::strip_bearer_prefix(auth)
            && let Some(account_id) = auth::decode_chatgpt_account_id(token)
        {
            builder = builder.header("chatgpt-account-id", account_id);
        }
    }

    builder
        .json(body)
        .send()
        .await
        .map_err(|e| GatewayError::Connect(e.to_string()))
}

async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, GatewayError> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    Err(GatewayError::Upstream { status, body })
}

/// Decode an SSE byte stream into raw upstream events
fn frame_to_event(frame: SseFrame) -> Result<Event, axum::Error> {
    match frame {
        SseFrame::Chunk(chunk) => Event::default().json_data(chunk),
        SseFrame::Done => Ok(Event::default().data("[DONE]")),
    }
}

/// Relay an upstream SSE body byte-for-byte
fn sse_response(
    stream: impl Stream<Item = Result<Bytes, reqwest::Error>> + Send + 'static,
) -> Response {
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .body(Body::from_stream(stream))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}
