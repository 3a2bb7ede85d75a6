use axum::{
    body::{to_bytes, Body},
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        FromRequestParts, OriginalUri, Path, Request, State,
    },
    http::{header, HeaderMap, HeaderName, Uri},
    response::Response,
};
use common::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        types::job::{Job, ProxyDetails},
    },
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{client::IntoClientRequest, Message as UpstreamMessage},
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, error, warn};

use crate::{api_state::ApiState, error::ApiError};

type UpstreamSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Deserialize)]
pub struct PassthroughParams {
    pub hostname: String,
    pub job_id: String,
}

/// Headers that belong to a single hop and are never copied across the proxy.
fn is_hop_by_hop(name: &HeaderName) -> bool {
    *name == header::CONNECTION
        || *name == header::TRANSFER_ENCODING
        || *name == header::CONTENT_LENGTH
        || *name == header::UPGRADE
        || *name == header::TE
}

/// Forwards a request to the host and port a running job registered for itself.
///
/// The upstream URL keeps the full original path, so job services must be
/// configured to serve under their passthrough prefix.
pub async fn passthrough(
    State(state): State<ApiState>,
    Path(params): Path<PassthroughParams>,
    OriginalUri(original_uri): OriginalUri,
    request: Request,
) -> Result<Response, ApiError> {
    let proxy = resolve_proxy(&state.db, &params).await.map_err(|err| {
        warn!(job_id = %params.job_id, hostname = %params.hostname, error = %err, "Passthrough target unavailable");
        ApiError::UpstreamFailure
    })?;

    if is_websocket_upgrade(request.headers()) {
        return tunnel_websocket(&state, &params, &proxy, &original_uri, request).await;
    }

    forward_http(&state, &proxy, &original_uri, request)
        .await
        .map_err(|err| {
            error!(job_id = %params.job_id, hostname = %params.hostname, error = %err, "Passthrough request failed");
            ApiError::UpstreamFailure
        })
}

async fn resolve_proxy(
    db: &SurrealDbClient,
    params: &PassthroughParams,
) -> Result<ProxyDetails, AppError> {
    let job = Job::get(db, &params.job_id).await?;
    let proxy = job
        .job_details
        .current_job_details
        .proxy_details
        .ok_or_else(|| AppError::Processing("Job has no proxy details yet".into()))?;

    if proxy.hostname != params.hostname {
        return Err(AppError::Processing(format!(
            "Job is served from {}, not {}",
            proxy.hostname, params.hostname
        )));
    }
    Ok(proxy)
}

fn upstream_url(scheme: &str, proxy: &ProxyDetails, uri: &Uri) -> String {
    let query = uri.query().map(|q| format!("?{q}")).unwrap_or_default();
    format!(
        "{scheme}://{}:{}{}{query}",
        proxy.hostname,
        proxy.port,
        uri.path()
    )
}

fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"))
}

async fn forward_http(
    state: &ApiState,
    proxy: &ProxyDetails,
    original_uri: &Uri,
    request: Request,
) -> Result<Response, AppError> {
    let url = upstream_url(&state.config.passthrough.scheme, proxy, original_uri);
    let (parts, body) = request.into_parts();
    let body = to_bytes(body, state.config.passthrough.max_body_bytes)
        .await
        .map_err(|err| AppError::Processing(format!("Failed to read request body: {err}")))?;

    debug!(method = %parts.method, %url, "Forwarding passthrough request");
    let mut upstream = state.http.request(parts.method, &url).body(body);
    for name in [header::COOKIE, header::CONTENT_TYPE, header::ACCEPT] {
        if let Some(value) = parts.headers.get(&name) {
            upstream = upstream.header(name, value.clone());
        }
    }

    let response = upstream.send().await?;
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = response.bytes().await?;

    let mut builder = axum::http::Response::builder().status(status);
    for (name, value) in headers.iter().filter(|(name, _)| !is_hop_by_hop(name)) {
        builder = builder.header(name, value);
    }
    builder
        .body(Body::from(bytes))
        .map_err(|err| AppError::InternalError(err.to_string()))
}

async fn tunnel_websocket(
    state: &ApiState,
    params: &PassthroughParams,
    proxy: &ProxyDetails,
    original_uri: &Uri,
    request: Request,
) -> Result<Response, ApiError> {
    let (mut parts, _body) = request.into_parts();
    let upgrade = WebSocketUpgrade::from_request_parts(&mut parts, state)
        .await
        .map_err(|err| {
            warn!(job_id = %params.job_id, error = %err, "Passthrough websocket upgrade rejected");
            ApiError::UpstreamFailure
        })?;

    let scheme = if state.config.passthrough.scheme == "https" {
        "wss"
    } else {
        "ws"
    };
    let url = upstream_url(scheme, proxy, original_uri);

    let upstream = connect_upstream(&url, parts.headers.get(header::COOKIE).cloned())
        .await
        .map_err(|err| {
            error!(job_id = %params.job_id, %url, error = %err, "Passthrough websocket connect failed");
            ApiError::UpstreamFailure
        })?;

    let job_id = params.job_id.clone();
    Ok(upgrade.on_upgrade(move |socket| bridge(socket, upstream, job_id)))
}

async fn connect_upstream(
    url: &str,
    cookie: Option<header::HeaderValue>,
) -> Result<UpstreamSocket, tokio_tungstenite::tungstenite::Error> {
    let mut request = url.into_client_request()?;
    if let Some(cookie) = cookie {
        request.headers_mut().insert(header::COOKIE, cookie);
    }
    let (socket, _response) = connect_async(request).await?;
    Ok(socket)
}

/// Relays frames both ways until either side goes away, then closes the other.
async fn bridge(client: WebSocket, upstream: UpstreamSocket, job_id: String) {
    let (mut client_tx, mut client_rx) = client.split();
    let (mut upstream_tx, mut upstream_rx) = upstream.split();

    let client_to_upstream = async move {
        while let Some(Ok(message)) = client_rx.next().await {
            let Some(message) = to_upstream(message) else {
                break;
            };
            if upstream_tx.send(message).await.is_err() {
                break;
            }
        }
        upstream_tx.close().await.ok();
    };

    let upstream_to_client = async move {
        while let Some(Ok(message)) = upstream_rx.next().await {
            let Some(message) = to_client(message) else {
                continue;
            };
            let closing = matches!(message, Message::Close(_));
            if client_tx.send(message).await.is_err() || closing {
                break;
            }
        }
        client_tx.close().await.ok();
    };

    tokio::select! {
        () = client_to_upstream => debug!(%job_id, "Passthrough client disconnected"),
        () = upstream_to_client => debug!(%job_id, "Passthrough upstream disconnected"),
    }
}

/// `None` means the client asked to close.
fn to_upstream(message: Message) -> Option<UpstreamMessage> {
    match message {
        Message::Text(text) => Some(UpstreamMessage::text(text.as_str())),
        Message::Binary(data) => Some(UpstreamMessage::Binary(data)),
        Message::Ping(data) => Some(UpstreamMessage::Ping(data)),
        Message::Pong(data) => Some(UpstreamMessage::Pong(data)),
        Message::Close(_) => None,
    }
}

fn to_client(message: UpstreamMessage) -> Option<Message> {
    match message {
        UpstreamMessage::Text(text) => Some(Message::Text(text.as_str().into())),
        UpstreamMessage::Binary(data) => Some(Message::Binary(data)),
        UpstreamMessage::Ping(data) => Some(Message::Ping(data)),
        UpstreamMessage::Pong(data) => Some(Message::Pong(data)),
        UpstreamMessage::Close(_) => Some(Message::Close(None)),
        UpstreamMessage::Frame(_) => None,
    }
}
