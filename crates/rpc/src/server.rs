use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use pinnet_client::{fslist, ContentClient};
use pinnet_types::{ContentAddress, Error, NodeAddress};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::info;

/// Shared state behind every handler.
pub struct AppState {
    pub client: ContentClient,
    pub node_id: String,
    pub start_time: Instant,
    pub req_count: Arc<AtomicUsize>,
}

impl AppState {
    pub fn new(client: ContentClient, node_id: String) -> Self {
        Self {
            client,
            node_id,
            start_time: Instant::now(),
            req_count: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn record_request(&self) -> u64 {
        self.req_count.fetch_add(1, Ordering::Relaxed) as u64 + 1
    }

    fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

type SharedState = Arc<AppState>;

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new<S: Into<String>>(status: StatusCode, message: S) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let payload = Json(ErrorResponse {
            error: self.message,
        });
        (self.status, payload).into_response()
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        let status = match &err {
            Error::InvalidAddress(_)
            | Error::InvalidNodeAddress(_)
            | Error::Serialization(_) => StatusCode::BAD_REQUEST,
            Error::DirNotFound(_) | Error::FileRead { .. } => StatusCode::NOT_FOUND,
            Error::PermissionDenied(_) => StatusCode::FORBIDDEN,
            Error::Connect(_) => StatusCode::BAD_GATEWAY,
            Error::Timeout => StatusCode::GATEWAY_TIMEOUT,
            Error::Store(_) | Error::Session(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        ApiError::new(status, err.to_string())
    }
}

/// Apply the caller's per-request `ttl_ms` bound, if any. This is an
/// upstream request lifetime, independent of the client's internal
/// operation deadline.
async fn with_ttl<F, T>(ttl_ms: Option<u64>, operation: F) -> Result<T, ApiError>
where
    F: Future<Output = pinnet_types::Result<T>>,
{
    match ttl_ms {
        Some(ms) => match tokio::time::timeout(Duration::from_millis(ms), operation).await {
            Ok(result) => result.map_err(ApiError::from),
            Err(_) => Err(ApiError::new(
                StatusCode::GATEWAY_TIMEOUT,
                "request ttl expired",
            )),
        },
        None => operation.await.map_err(ApiError::from),
    }
}

fn parse_node(text: &str) -> Result<NodeAddress, ApiError> {
    NodeAddress::parse(text).map_err(ApiError::from)
}

fn parse_address(text: &str) -> Result<ContentAddress, ApiError> {
    ContentAddress::parse(text).map_err(ApiError::from)
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    node_id: String,
    uptime_secs: u64,
    req_total: u64,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ListRequest {
    /// Directory to list, one level only.
    pub dir: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ListExtRequest {
    /// Directory to list, one level only.
    pub dir: String,

    /// Filename suffix to keep, e.g. `.txt`.
    pub ext: String,
}

#[derive(Debug, Serialize)]
pub struct ListResponse {
    pub files: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExistsRequest {
    /// Storage node multiaddress.
    pub node: String,

    /// Content address to probe.
    pub cid: String,

    /// Optional upstream request lifetime in milliseconds.
    #[serde(default)]
    pub ttl_ms: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct ExistsResponse {
    pub exists: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IdRequest {
    /// Storage node multiaddress.
    pub node: String,

    /// Optional upstream request lifetime in milliseconds.
    #[serde(default)]
    pub ttl_ms: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct IdResponse {
    pub peer_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UploadRequest {
    /// Storage node multiaddress.
    pub node: String,

    /// Local file path to upload.
    pub path: String,

    /// Optional upstream request lifetime in milliseconds.
    #[serde(default)]
    pub ttl_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UploadStringRequest {
    /// Storage node multiaddress.
    pub node: String,

    /// Inline content to upload.
    pub contents: String,

    /// Optional upstream request lifetime in milliseconds.
    #[serde(default)]
    pub ttl_ms: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub cid: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RemoveRequest {
    /// Storage node multiaddress.
    pub node: String,

    /// Content address to unpin and collect.
    pub cid: String,

    /// Optional upstream request lifetime in milliseconds.
    #[serde(default)]
    pub ttl_ms: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct RemoveResponse {
    pub cid: String,
}

async fn handle_health(State(state): State<SharedState>) -> Json<HealthResponse> {
    let req_total = state.record_request();
    Json(HealthResponse {
        status: "ok",
        node_id: state.node_id.clone(),
        uptime_secs: state.uptime_seconds(),
        req_total,
    })
}

/// POST /fs/list - Immediate entries of a local directory
async fn handle_list(
    State(state): State<SharedState>,
    Json(request): Json<ListRequest>,
) -> Result<Json<ListResponse>, ApiError> {
    state.record_request();
    let files = fslist::list(&request.dir).await?;
    Ok(Json(ListResponse { files }))
}

/// POST /fs/list_ext - Directory entries filtered by filename suffix
async fn handle_list_ext(
    State(state): State<SharedState>,
    Json(request): Json<ListExtRequest>,
) -> Result<Json<ListResponse>, ApiError> {
    state.record_request();
    let files = fslist::list_ext(&request.dir, &request.ext).await?;
    Ok(Json(ListResponse { files }))
}

/// POST /ipfs/exists - Whether content is retrievable within the deadline
async fn handle_exists(
    State(state): State<SharedState>,
    Json(request): Json<ExistsRequest>,
) -> Result<Json<ExistsResponse>, ApiError> {
    state.record_request();
    let node = parse_node(&request.node)?;
    let address = parse_address(&request.cid)?;
    let exists = with_ttl(request.ttl_ms, state.client.exists(&node, &address)).await?;
    Ok(Json(ExistsResponse { exists }))
}

/// POST /ipfs/id - Identity of the first discovered peer
async fn handle_id(
    State(state): State<SharedState>,
    Json(request): Json<IdRequest>,
) -> Result<Json<IdResponse>, ApiError> {
    state.record_request();
    let node = parse_node(&request.node)?;
    let peer_id = with_ttl(request.ttl_ms, state.client.id(&node)).await?;
    Ok(Json(IdResponse { peer_id }))
}

/// POST /ipfs/upload - Upload a local file as a raw block
async fn handle_upload(
    State(state): State<SharedState>,
    Json(request): Json<UploadRequest>,
) -> Result<Json<UploadResponse>, ApiError> {
    state.record_request();
    let node = parse_node(&request.node)?;
    let address = with_ttl(request.ttl_ms, state.client.upload(&node, &request.path)).await?;
    Ok(Json(UploadResponse {
        cid: address.to_string(),
    }))
}

/// POST /ipfs/upload_string - Upload inline text as a raw block
async fn handle_upload_string(
    State(state): State<SharedState>,
    Json(request): Json<UploadStringRequest>,
) -> Result<Json<UploadResponse>, ApiError> {
    state.record_request();
    let node = parse_node(&request.node)?;
    let address = with_ttl(
        request.ttl_ms,
        state.client.upload_string(&node, &request.contents),
    )
    .await?;
    Ok(Json(UploadResponse {
        cid: address.to_string(),
    }))
}

/// POST /ipfs/dag_upload - Upload a local file as a dag-json node
async fn handle_dag_upload(
    State(state): State<SharedState>,
    Json(request): Json<UploadRequest>,
) -> Result<Json<UploadResponse>, ApiError> {
    state.record_request();
    let node = parse_node(&request.node)?;
    let address = with_ttl(request.ttl_ms, state.client.dag_upload(&node, &request.path)).await?;
    Ok(Json(UploadResponse {
        cid: address.to_string(),
    }))
}

/// POST /ipfs/dag_upload_string - Upload inline text as a dag-json node
async fn handle_dag_upload_string(
    State(state): State<SharedState>,
    Json(request): Json<UploadStringRequest>,
) -> Result<Json<UploadResponse>, ApiError> {
    state.record_request();
    let node = parse_node(&request.node)?;
    let address = with_ttl(
        request.ttl_ms,
        state.client.dag_upload_string(&node, &request.contents),
    )
    .await?;
    Ok(Json(UploadResponse {
        cid: address.to_string(),
    }))
}

/// POST /ipfs/remove - Unpin content and collect, echoing the address
async fn handle_remove(
    State(state): State<SharedState>,
    Json(request): Json<RemoveRequest>,
) -> Result<Json<RemoveResponse>, ApiError> {
    state.record_request();
    let node = parse_node(&request.node)?;
    let address = parse_address(&request.cid)?;
    let echoed = with_ttl(request.ttl_ms, state.client.remove(&node, &address)).await?;
    Ok(Json(RemoveResponse {
        cid: echoed.to_string(),
    }))
}

/// Build the RPC router with all routes registered.
pub fn build_router(state: SharedState) -> Router {
    Router::new()
        .route("/health", get(handle_health))
        .route("/fs/list", post(handle_list))
        .route("/fs/list_ext", post(handle_list_ext))
        .route("/ipfs/exists", post(handle_exists))
        .route("/ipfs/id", post(handle_id))
        .route("/ipfs/upload", post(handle_upload))
        .route("/ipfs/upload_string", post(handle_upload_string))
        .route("/ipfs/dag_upload", post(handle_dag_upload))
        .route("/ipfs/dag_upload_string", post(handle_dag_upload_string))
        .route("/ipfs/remove", post(handle_remove))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind and serve the RPC surface until the task is cancelled.
pub async fn start_server(addr: SocketAddr, state: SharedState) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("rpc server listening on {}", listener.local_addr()?);
    axum::serve(listener, build_router(state)).await?;
    Ok(())
}
