//! HTTP surface: axum router, identity extraction, and SSE streaming.

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    Router,
    body::Bytes,
    extract::{FromRequestParts, State},
    http::{HeaderName, StatusCode, header, request::Parts},
    response::{
        Html, IntoResponse, Response,
        sse::{Event, Sse},
    },
    routing::{get, post},
};
use color_eyre::eyre::{Result, WrapErr, eyre};
use futures::Stream;
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use parley_core::{ChatService, Exchange, Frame, StreamHandle, Subscription, build_generator};
use parley_markdown::MarkdownRenderer;
use parley_shared::{AppConfig, ParleyError, UserId};
use parley_storage::open_store;

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Shared per-process state handed to every handler.
#[derive(Clone)]
pub(crate) struct AppState {
    pub chat: ChatService,
    pub user_header: HeaderName,
}

impl AppState {
    pub fn new(chat: ChatService, user_header: &str) -> Result<Self> {
        let user_header = HeaderName::from_bytes(user_header.as_bytes())
            .map_err(|e| eyre!("invalid user header name '{user_header}': {e}"))?;
        Ok(Self { chat, user_header })
    }

    /// Open the store, build the generator, and wire the chat service.
    pub async fn from_config(config: &AppConfig) -> Result<Self> {
        let kv = open_store(&config.store).await?;
        // The xAI generator holds a blocking HTTP client, which cannot be
        // built on a runtime thread.
        let generator_config = config.generator.clone();
        let generator = tokio::task::spawn_blocking(move || build_generator(&generator_config))
            .await
            .wrap_err("generator setup task failed")??;
        let chat = ChatService::new(kv, generator, Arc::new(MarkdownRenderer::new()));
        Self::new(chat, &config.server.user_header)
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub(crate) fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/chat", get(view_history))
        .route("/chat/partial", get(subscribe).post(submit))
        .route("/chat/message", post(exchange))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind and serve until the process is stopped.
pub(crate) async fn serve(config: &AppConfig) -> Result<()> {
    let state = AppState::from_config(config).await?;
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&config.server.bind)
        .await
        .wrap_err_with(|| format!("failed to bind {}", config.server.bind))?;
    info!(addr = %config.server.bind, "listening");

    axum::serve(listener, app).await.wrap_err("server error")?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Identity & errors
// ---------------------------------------------------------------------------

/// The user named by the configured identity header.
pub(crate) struct RemoteUser(pub UserId);

impl FromRequestParts<AppState> for RemoteUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> std::result::Result<Self, Self::Rejection> {
        let raw = parts
            .headers
            .get(&state.user_header)
            .and_then(|value| value.to_str().ok())
            .ok_or(ApiError::Unauthorized)?;
        UserId::parse(raw)
            .map(RemoteUser)
            .map_err(|_| ApiError::Unauthorized)
    }
}

#[derive(Debug)]
pub(crate) enum ApiError {
    Unauthorized,
    BadRequest(&'static str),
    Internal(ParleyError),
}

impl From<ParleyError> for ApiError {
    fn from(e: ParleyError) -> Self {
        Self::Internal(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            Self::Unauthorized => (StatusCode::UNAUTHORIZED, "missing user").into_response(),
            Self::BadRequest(reason) => (StatusCode::BAD_REQUEST, reason).into_response(),
            Self::Internal(e) => {
                error!(error = %e, "request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error").into_response()
            }
        }
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

fn question(body: Bytes) -> ApiResult<String> {
    String::from_utf8(body.to_vec()).map_err(|_| ApiError::BadRequest("body is not valid UTF-8"))
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn health() -> &'static str {
    "ok"
}

async fn view_history(
    State(state): State<AppState>,
    RemoteUser(user): RemoteUser,
) -> ApiResult<Html<String>> {
    Ok(Html(state.chat.history_markup(&user).await?))
}

async fn submit(
    State(state): State<AppState>,
    RemoteUser(user): RemoteUser,
    body: Bytes,
) -> ApiResult<StatusCode> {
    let question = question(body)?;
    state.chat.submit(&user, &question).await?;
    Ok(StatusCode::OK)
}

async fn subscribe(
    State(state): State<AppState>,
    RemoteUser(user): RemoteUser,
) -> ApiResult<impl IntoResponse> {
    let frames = match state.chat.subscribe(&user).await? {
        Subscription::Streaming(StreamHandle { frames, task }) => {
            tokio::spawn(async move {
                match task.await {
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => error!(error = %e, "stream finished with an error"),
                    Err(e) => error!(error = %e, "stream task aborted"),
                }
            });
            frames
        }
        Subscription::Nothing | Subscription::Cleared => done_only(),
    };

    Ok((
        [(header::CACHE_CONTROL, "no-cache")],
        Sse::new(events(frames)),
    ))
}

async fn exchange(
    State(state): State<AppState>,
    RemoteUser(user): RemoteUser,
    body: Bytes,
) -> ApiResult<Html<String>> {
    let question = question(body)?;
    match state.chat.exchange(&user, &question).await? {
        Exchange::Answered { markup } => Ok(Html(markup)),
        Exchange::Ignored | Exchange::Cleared => Ok(Html(String::new())),
    }
}

// ---------------------------------------------------------------------------
// SSE plumbing
// ---------------------------------------------------------------------------

fn events(frames: mpsc::Receiver<Frame>) -> impl Stream<Item = std::result::Result<Event, Infallible>> {
    ReceiverStream::new(frames).map(|frame| Ok(Event::default().data(frame.data())))
}

/// A frame receiver that yields only the completion frame.
fn done_only() -> mpsc::Receiver<Frame> {
    let (tx, rx) = mpsc::channel(1);
    if tx.try_send(Frame::Complete).is_err() {
        warn!("could not queue completion frame");
    }
    rx
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use parley_core::{GenerationRequest, Generator};
    use parley_storage::MemoryStore;
    use tower::ServiceExt;

    struct Stub {
        fragments: Vec<&'static str>,
        calls: AtomicUsize,
    }

    impl Generator for Stub {
        fn stream(
            &self,
            _: &GenerationRequest,
            emit: &mut dyn FnMut(String),
        ) -> parley_shared::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            for fragment in &self.fragments {
                emit((*fragment).to_string());
            }
            Ok(())
        }
    }

    fn app_with(fragments: Vec<&'static str>) -> (Router, Arc<Stub>) {
        let stub = Arc::new(Stub {
            fragments,
            calls: AtomicUsize::new(0),
        });
        let chat = ChatService::new(
            Arc::new(MemoryStore::new()),
            stub.clone(),
            Arc::new(MarkdownRenderer::new()),
        );
        let state = AppState::new(chat, "x-remote-user").unwrap();
        (router(state), stub)
    }

    fn request(method: &str, uri: &str, user: Option<&str>, body: impl Into<Body>) -> Request<Body> {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(user) = user {
            builder = builder.header("x-remote-user", user);
        }
        builder.body(body.into()).unwrap()
    }

    async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Response) {
        let response = app.clone().oneshot(req).await.unwrap();
        (response.status(), response)
    }

    async fn body_text(response: Response) -> String {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn health_is_ok() {
        let (app, _) = app_with(vec![]);
        let (status, response) = send(&app, request("GET", "/health", None, Body::empty())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body_text(response).await, "ok");
    }

    #[tokio::test]
    async fn missing_identity_is_unauthorized() {
        let (app, _) = app_with(vec![]);
        for (method, uri) in [
            ("POST", "/chat/partial"),
            ("GET", "/chat/partial"),
            ("POST", "/chat/message"),
            ("GET", "/chat"),
        ] {
            let (status, _) = send(&app, request(method, uri, None, "q")).await;
            assert_eq!(status, StatusCode::UNAUTHORIZED, "{method} {uri}");
        }

        let (status, _) = send(&app, request("GET", "/chat", Some("   "), Body::empty())).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn non_utf8_body_is_bad_request() {
        let (app, _) = app_with(vec![]);
        let (status, _) = send(
            &app,
            request("POST", "/chat/partial", Some("alice"), vec![0xff_u8, 0xfe]),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn submit_then_subscribe_streams_snapshots() {
        let (app, stub) = app_with(vec!["4", "!"]);

        let (status, response) = send(
            &app,
            request("POST", "/chat/partial", Some("alice"), "What is 2+2?"),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body_text(response).await, "");

        let (status, response) =
            send(&app, request("GET", "/chat/partial", Some("alice"), Body::empty())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "text/event-stream"
        );
        assert_eq!(response.headers()[header::CACHE_CONTROL], "no-cache");

        let first = r#"<div class="qa"><div class="q">What is 2+2?</div><div class="a"><p>4</p></div></div>"#;
        let second = r#"<div class="qa"><div class="q">What is 2+2?</div><div class="a"><p>4!</p></div></div>"#;
        assert_eq!(
            body_text(response).await,
            format!("data: {first}\n\ndata: {second}\n\ndata: [DONE]\n\n")
        );
        assert_eq!(stub.calls.load(Ordering::SeqCst), 1);

        let (_, response) = send(&app, request("GET", "/chat", Some("alice"), Body::empty())).await;
        assert_eq!(body_text(response).await, second);
    }

    #[tokio::test]
    async fn subscribe_with_nothing_pending_only_finishes() {
        let (app, stub) = app_with(vec!["unused"]);
        let (status, response) =
            send(&app, request("GET", "/chat/partial", Some("alice"), Body::empty())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body_text(response).await, "data: [DONE]\n\n");
        assert_eq!(stub.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn immediate_exchange_renders_history() {
        let (app, _) = app_with(vec!["**hi**"]);
        let (status, response) = send(
            &app,
            request("POST", "/chat/message", Some("alice"), "hello"),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(
            response.headers()[header::CONTENT_TYPE]
                .to_str()
                .unwrap()
                .starts_with("text/html")
        );
        let markup = body_text(response).await;
        assert!(markup.contains("<strong>hi</strong>"));
        assert!(markup.contains(r#"<div class="q">hello</div>"#));
    }

    #[tokio::test]
    async fn clear_token_empties_history() {
        let (app, _) = app_with(vec!["x"]);
        send(&app, request("POST", "/chat/message", Some("alice"), "one")).await;

        let (status, response) =
            send(&app, request("POST", "/chat/message", Some("alice"), "/c")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body_text(response).await, "");

        let (_, response) = send(&app, request("GET", "/chat", Some("alice"), Body::empty())).await;
        assert_eq!(body_text(response).await, "");
    }

    #[test]
    fn rejects_invalid_header_name() {
        let chat = ChatService::new(
            Arc::new(MemoryStore::new()),
            Arc::new(parley_core::EchoGenerator),
            Arc::new(MarkdownRenderer::new()),
        );
        assert!(AppState::new(chat, "bad header").is_err());
    }

    #[tokio::test]
    async fn state_builds_xai_generator_on_runtime() {
        let mut config = AppConfig::default();
        config.store.backend = parley_shared::StoreBackend::Memory;
        // Any non-empty variable serves as the key; no request is made.
        config.generator.api_key_env = "PATH".into();

        let state = AppState::from_config(&config).await.unwrap();
        tokio::task::spawn_blocking(move || drop(state)).await.unwrap();
    }
}
