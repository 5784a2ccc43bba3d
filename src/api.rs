//! Local HTTP listener: the base URL exported to tasks as
//! `GOPHER_HTTP_POST`, and the AI-dev endpoints for injecting and reading
//! connector messages when `GOPHER_AIDEV_TOKEN` is set.

use crate::bot::Bot;
use crate::connector::{ConnectorDyn, InjectRequest, MessageQuery};

use axum::Router;
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::post;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use subtle::ConstantTimeEq as _;

use std::net::SocketAddr;
use std::sync::Arc;

/// Largest request body accepted.
const BODY_LIMIT: usize = 1 << 20;

/// Long-poll wait when the caller doesn't give one.
const DEFAULT_POLL_MS: u64 = 1400;

/// Name of the file in the robot home recording the AI-dev port.
pub const PORT_FILE: &str = ".aiport";

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SendMessageRequest {
    #[serde(default)]
    protocol: String,
    #[serde(default)]
    as_user: String,
    text: String,
    #[serde(default)]
    channel: String,
    #[serde(default)]
    thread_id: String,
    #[serde(default)]
    hidden: bool,
    #[serde(default)]
    direct: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
struct GetMessagesRequest {
    protocol: String,
    viewer: String,
    after_cursor: u64,
    all: bool,
    limit: usize,
    timeout_ms: u64,
}

/// A failed request: status plus the `{"error": ...}` body.
#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn unauthorized(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(serde_json::json!({ "error": self.message }))).into_response()
    }
}

/// Build the router. Routes answer 405 for anything but POST.
pub fn router(bot: Arc<Bot>) -> Router {
    Router::new()
        .route("/aidev/send-message", post(send_message))
        .route("/aidev/get-messages", post(get_messages))
        .layer(DefaultBodyLimit::max(BODY_LIMIT))
        .with_state(bot)
}

/// Bind the listener on loopback and serve until shutdown. In AI-dev mode
/// the bound port is also written to `<home>/.aiport`.
pub async fn start(bot: &Arc<Bot>) -> anyhow::Result<()> {
    let bind = SocketAddr::from(([127, 0, 0, 1], 0));
    let listener = tokio::net::TcpListener::bind(bind).await?;
    let addr = listener.local_addr()?;
    bot.set_http_addr(&addr.to_string());

    if bot.aidev_token().is_some() {
        let path = bot.paths.home_dir.join(PORT_FILE);
        tokio::fs::write(&path, format!("{}\n", addr.port())).await?;
        tracing::info!(port = addr.port(), path = %path.display(), "AI-dev mode enabled");
    }

    let app = router(bot.clone());
    let shutdown = bot.shutdown_token();
    tokio::spawn(async move {
        if let Err(error) = axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
        {
            tracing::error!(%error, "HTTP server exited with error");
        }
    });

    tracing::info!(%addr, "HTTP listener started");
    Ok(())
}

fn authorize(bot: &Bot, headers: &HeaderMap) -> Result<(), ApiError> {
    let expected = bot
        .aidev_token()
        .filter(|token| !token.is_empty())
        .ok_or_else(|| ApiError::unauthorized("aidev mode is not enabled"))?;
    let auth = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .unwrap_or_default();
    let provided = match auth.get(..7) {
        Some(scheme) if scheme.eq_ignore_ascii_case("Bearer ") => auth[7..].trim(),
        _ => return Err(ApiError::unauthorized("missing bearer authorization token")),
    };
    if provided.is_empty() {
        return Err(ApiError::unauthorized("empty bearer authorization token"));
    }
    if bool::from(provided.as_bytes().ct_eq(expected.as_bytes())) {
        Ok(())
    } else {
        Err(ApiError::unauthorized("invalid aidev token"))
    }
}

/// Exactly one JSON object with no unknown fields.
fn decode<T: DeserializeOwned>(body: &[u8]) -> Result<T, ApiError> {
    serde_json::from_slice(body).map_err(|error| ApiError::bad_request(format!("invalid request JSON: {error}")))
}

fn resolve_connector(bot: &Bot, protocol: &str) -> Result<(String, Arc<dyn ConnectorDyn>), ApiError> {
    let protocol = match protocol.trim().to_lowercase() {
        explicit if !explicit.is_empty() => explicit,
        _ => bot.connectors.primary(),
    };
    if protocol.is_empty() {
        return Err(ApiError::bad_request("no active protocol available"));
    }
    let connector = bot
        .connectors
        .connector(&protocol)
        .ok_or_else(|| ApiError::bad_request(format!("protocol '{protocol}' is not active")))?;
    Ok((protocol, connector))
}

async fn send_message(
    State(bot): State<Arc<Bot>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<crate::connector::InjectResult>, ApiError> {
    authorize(&bot, &headers)?;
    let request: SendMessageRequest = decode(&body)?;
    let (protocol, connector) = resolve_connector(&bot, &request.protocol)?;
    let injector = connector.injector().ok_or_else(|| {
        ApiError::bad_request(format!("protocol '{protocol}' does not support message injection"))
    })?;
    let mut result = injector
        .inject_message(InjectRequest {
            as_user: request.as_user,
            text: request.text,
            channel: request.channel,
            thread: request.thread_id,
            hidden: request.hidden,
            direct: request.direct,
        })
        .await
        .map_err(|error| ApiError::bad_request(format!("{error:#}")))?;
    if result.protocol.is_empty() {
        result.protocol = protocol;
    }
    tracing::debug!(user = %result.user_name, channel = %result.channel, "AI-dev message injected");
    Ok(Json(result))
}

async fn get_messages(
    State(bot): State<Arc<Bot>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<crate::connector::MessageBatch>, ApiError> {
    authorize(&bot, &headers)?;
    let request: GetMessagesRequest = decode(&body)?;
    let (protocol, connector) = resolve_connector(&bot, &request.protocol)?;
    let source = connector.message_source().ok_or_else(|| {
        ApiError::bad_request(format!("protocol '{protocol}' does not support message retrieval"))
    })?;
    let timeout_ms = if request.timeout_ms == 0 {
        DEFAULT_POLL_MS
    } else {
        request.timeout_ms
    };
    let mut batch = source
        .get_messages(MessageQuery {
            viewer: request.viewer,
            after_cursor: request.after_cursor,
            limit: request.limit,
            timeout_ms,
            all: request.all,
        })
        .await
        .map_err(|error| ApiError::bad_request(format!("{error:#}")))?;
    if batch.protocol.is_empty() {
        batch.protocol = protocol;
    }
    Ok(Json(batch))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestBot;

    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt as _;

    const TOKEN: &str = "sekrit-token";

    async fn call(app: Router, method: &str, path: &str, auth: Option<&str>, body: &str) -> (StatusCode, serde_json::Value) {
        let mut request = Request::builder().method(method).uri(path);
        if let Some(auth) = auth {
            request = request.header(header::AUTHORIZATION, auth);
        }
        let response = app
            .oneshot(request.body(Body::from(body.to_string())).expect("request"))
            .await
            .expect("response");
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), BODY_LIMIT)
            .await
            .expect("body");
        let value = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn requests_need_the_bearer_token() {
        let harness = TestBot::builder().aidev_token(TOKEN).start().await;
        let app = router(harness.bot.clone());

        let (status, body) = call(app.clone(), "POST", "/aidev/send-message", None, r#"{"text":"hi"}"#).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "missing bearer authorization token");

        let (status, body) = call(app, "POST", "/aidev/send-message", Some("Bearer wrong"), r#"{"text":"hi"}"#).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "invalid aidev token");
        harness.stop().await;
    }

    #[tokio::test]
    async fn bodies_are_strict() {
        let harness = TestBot::builder().aidev_token(TOKEN).start().await;
        let app = router(harness.bot.clone());
        let auth = format!("Bearer {TOKEN}");

        let (status, _) = call(app.clone(), "POST", "/aidev/send-message", Some(&auth), r#"{"text":"hi","bogus":1}"#).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, _) = call(app.clone(), "POST", "/aidev/send-message", Some(&auth), r#"{"text":"a"} {"text":"b"}"#).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, body) = call(app.clone(), "POST", "/aidev/get-messages", Some(&auth), r#"{"protocol":"slack"}"#).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "protocol 'slack' is not active");
        let (status, _) = call(app, "GET", "/aidev/get-messages", Some(&auth), "").await;
        assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
        harness.stop().await;
    }

    #[tokio::test]
    async fn injected_messages_reach_the_robot() {
        let harness = TestBot::builder().aidev_token(TOKEN).start().await;
        let app = router(harness.bot.clone());
        let auth = format!("Bearer {TOKEN}");

        let (status, sent) = call(
            app.clone(),
            "POST",
            "/aidev/send-message",
            Some(&auth),
            r#"{"as_user":"alice","channel":"general","text":";ping"}"#,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(sent["protocol"], "test");
        assert_eq!(sent["user_name"], "alice");

        let reply = harness.reply().await;
        assert_eq!(reply.text, "PONG");

        let (status, batch) = call(
            app,
            "POST",
            "/aidev/get-messages",
            Some(&auth),
            r#"{"viewer":"alice","timeout_ms":50}"#,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let texts: Vec<&str> = batch["messages"]
            .as_array()
            .expect("messages")
            .iter()
            .filter_map(|event| event["text"].as_str())
            .collect();
        assert!(texts.contains(&";ping"));
        assert!(texts.iter().any(|text| text.contains("PONG")));
        harness.stop().await;
    }
}
