/// REST API server for queues, messages and dead letters
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    extract::{MatchedPath, Path, Query, Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::core::registry::{QueueSpec, QueueUpdate};
use crate::metrics::get_metrics;
use crate::server::shutdown::shutdown_receiver;
use crate::service::{QueueService, RedriveReport};
use crate::storage::{HealthStatus, QueueFilter};
use crate::types::{ConsumerToken, DeadLetter, Message, MessageId, QueueConfig, QueueStats};
use crate::Error;

/// Health check response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    /// "healthy" or "unhealthy"
    pub status: String,
    /// Backend detail
    pub backend_status: String,
}

/// Service-wide statistics
#[derive(Debug, Serialize, Deserialize)]
pub struct StatsResponse {
    /// Number of queues
    pub total_queues: usize,
    /// Available messages across queues
    pub available_messages: u64,
    /// In-flight messages across queues
    pub in_flight_messages: u64,
    /// Messages awaiting dead-letter routing
    pub dead_lettered_messages: u64,
    /// Armed expiry timers
    pub pending_expiries: usize,
}

/// Queue configuration plus live counts
#[derive(Debug, Serialize, Deserialize)]
pub struct QueueDetails {
    /// Queue id
    pub id: String,
    /// Queue name
    pub name: String,
    /// "standard" or "fifo"
    pub queue_type: String,
    /// Visibility timeout in seconds
    pub visibility_timeout: u32,
    /// Receives before dead-lettering
    pub max_receives: u32,
    /// Retention in seconds
    pub message_retention_period: u32,
    /// Body size limit
    pub max_message_size: usize,
    /// Capacity
    pub max_messages: Option<usize>,
    /// Dead-letter queue
    pub dlq_name: Option<String>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Available messages
    pub available_messages: u64,
    /// In-flight messages
    pub in_flight_messages: u64,
    /// Messages awaiting dead-letter routing
    pub dead_lettered_messages: u64,
    /// Oldest stored message
    pub oldest_message_timestamp: Option<DateTime<Utc>>,
}

impl QueueDetails {
    fn new(config: QueueConfig, stats: QueueStats) -> Self {
        Self {
            id: config.id.0,
            name: config.name,
            queue_type: config.queue_type.as_str().to_string(),
            visibility_timeout: config.visibility_timeout,
            max_receives: config.max_receives,
            message_retention_period: config.message_retention_period,
            max_message_size: config.max_message_size,
            max_messages: config.max_messages,
            dlq_name: config.dlq_name,
            created_at: config.created_at,
            available_messages: stats.available_messages,
            in_flight_messages: stats.in_flight_messages,
            dead_lettered_messages: stats.dead_lettered_messages,
            oldest_message_timestamp: stats.oldest_message_timestamp,
        }
    }
}

/// Queue list response
#[derive(Debug, Serialize, Deserialize)]
pub struct QueueListResponse {
    /// Queues ordered by name
    pub queues: Vec<QueueDetails>,
}

/// Queue deletion response
#[derive(Debug, Serialize, Deserialize)]
pub struct DeleteQueueResponse {
    /// Messages discarded with the queue
    pub messages_discarded: u64,
}

/// Enqueue request
#[derive(Debug, Serialize, Deserialize)]
pub struct EnqueueRequest {
    /// Base64 message body
    pub body: String,
}

/// Enqueue response
#[derive(Debug, Serialize, Deserialize)]
pub struct EnqueueResponse {
    /// New message id
    pub message_id: String,
}

/// Receive request
#[derive(Debug, Serialize, Deserialize)]
pub struct ReceiveRequest {
    /// Lease holder
    pub consumer_token: String,
    /// Batch size, clamped to 1..=10
    #[serde(default = "default_batch")]
    pub max_messages: usize,
}

fn default_batch() -> usize {
    1
}

/// A leased message
#[derive(Debug, Serialize, Deserialize)]
pub struct ReceivedMessage {
    /// Message id
    pub message_id: String,
    /// Base64 body
    pub body: String,
    /// Expiries so far
    pub receive_count: u32,
    /// Enqueue time
    pub enqueued_at: DateTime<Utc>,
    /// Lease deadline
    pub expires_at: Option<DateTime<Utc>>,
}

impl From<Message> for ReceivedMessage {
    fn from(message: Message) -> Self {
        Self {
            message_id: message.id.0,
            body: BASE64.encode(&message.body),
            receive_count: message.receive_count,
            enqueued_at: message.enqueued_at,
            expires_at: message.visibility_deadline,
        }
    }
}

/// Receive response
#[derive(Debug, Serialize, Deserialize)]
pub struct ReceiveResponse {
    /// Leased messages
    pub messages: Vec<ReceivedMessage>,
}

/// Ack or release request
#[derive(Debug, Serialize, Deserialize)]
pub struct LeaseRequest {
    /// Lease holder
    pub consumer_token: String,
}

/// Lease extension request
#[derive(Debug, Serialize, Deserialize)]
pub struct ExtendRequest {
    /// Lease holder
    pub consumer_token: String,
    /// Seconds added to `max(current deadline, now)`
    pub extra_seconds: u32,
}

/// Lease state after an extension
#[derive(Debug, Serialize, Deserialize)]
pub struct LeaseResponse {
    /// Message id
    pub message_id: String,
    /// New deadline
    pub expires_at: Option<DateTime<Utc>>,
}

/// A dead letter
#[derive(Debug, Serialize, Deserialize)]
pub struct DeadLetterView {
    /// Id in the dead-letter queue
    pub message_id: String,
    /// Base64 body
    pub body: String,
    /// Queue it failed in
    pub original_queue: String,
    /// Receive count when it was moved
    pub final_receive_count: u32,
    /// First enqueue into the original queue
    pub first_enqueued_at: DateTime<Utc>,
    /// Last lease expiry
    pub last_failure_at: DateTime<Utc>,
}

impl From<DeadLetter> for DeadLetterView {
    fn from(dead_letter: DeadLetter) -> Self {
        Self {
            message_id: dead_letter.message.id.0,
            body: BASE64.encode(&dead_letter.message.body),
            original_queue: dead_letter.failure.original_queue,
            final_receive_count: dead_letter.failure.final_receive_count,
            first_enqueued_at: dead_letter.failure.first_enqueued_at,
            last_failure_at: dead_letter.failure.last_failure_at,
        }
    }
}

/// Dead-letter peek response
#[derive(Debug, Serialize, Deserialize)]
pub struct DeadLettersResponse {
    /// Dead letters, oldest first
    pub dead_letters: Vec<DeadLetterView>,
}

/// Redrive request
#[derive(Debug, Serialize, Deserialize)]
pub struct RedriveRequest {
    /// Messages to move
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    10
}

#[derive(Debug, Deserialize)]
struct ListParams {
    prefix: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DeleteParams {
    #[serde(default)]
    force: bool,
}

#[derive(Debug, Deserialize)]
struct PeekParams {
    #[serde(default = "default_limit")]
    limit: usize,
}

/// Error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Human readable message
    pub error: String,
    /// Stable error code
    pub code: String,
}

/// API error type
#[derive(Debug)]
enum ApiError {
    InvalidInput(String),
    Service(Error),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            ApiError::Service(err) => match err {
                Error::QueueNotFound(_) | Error::MessageNotFound(_) => StatusCode::NOT_FOUND,
                Error::QueueAlreadyExists(_)
                | Error::QueueNotEmpty { .. }
                | Error::DeadLetterQueueInUse { .. }
                | Error::Conflict(_)
                | Error::TokenMismatch(_) => StatusCode::CONFLICT,
                Error::CapacityExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
                Error::Validation(_) => StatusCode::BAD_REQUEST,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match self {
            ApiError::InvalidInput(msg) => ErrorResponse {
                error: msg,
                code: "validation".to_string(),
            },
            ApiError::Service(err) => {
                if status == StatusCode::INTERNAL_SERVER_ERROR {
                    error!(error = %err, "Request failed");
                }
                ErrorResponse {
                    error: err.to_string(),
                    code: err.code().to_string(),
                }
            }
        };

        (status, Json(body)).into_response()
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        ApiError::Service(err)
    }
}

type ApiResult<T> = Result<T, ApiError>;

fn token(raw: String) -> ConsumerToken {
    ConsumerToken::new(raw)
}

async fn queue_details(service: &QueueService, config: QueueConfig) -> ApiResult<QueueDetails> {
    let stats = service.stats(&config.name).await?;
    Ok(QueueDetails::new(config, stats))
}

/// Health check endpoint
async fn health_check(State(service): State<Arc<QueueService>>) -> Response {
    let (code, backend_status) = match service.health_check().await {
        Ok(HealthStatus::Healthy) => (StatusCode::OK, "healthy".to_string()),
        Ok(HealthStatus::Unhealthy(reason)) => (StatusCode::SERVICE_UNAVAILABLE, reason),
        Err(e) => (StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
    };

    let status = if code == StatusCode::OK {
        "healthy"
    } else {
        "unhealthy"
    };

    (
        code,
        Json(HealthResponse {
            status: status.to_string(),
            backend_status,
        }),
    )
        .into_response()
}

/// Service-wide statistics endpoint
async fn get_stats(State(service): State<Arc<QueueService>>) -> ApiResult<Json<StatsResponse>> {
    let queues = service.list_queues(None).await?;

    let mut response = StatsResponse {
        total_queues: queues.len(),
        available_messages: 0,
        in_flight_messages: 0,
        dead_lettered_messages: 0,
        pending_expiries: service.pending_expiries(),
    };

    for queue in &queues {
        // A queue deleted mid-listing simply drops out of the totals
        if let Ok(stats) = service.stats(&queue.name).await {
            response.available_messages += stats.available_messages;
            response.in_flight_messages += stats.in_flight_messages;
            response.dead_lettered_messages += stats.dead_lettered_messages;
        }
    }

    Ok(Json(response))
}

/// List queues endpoint
async fn list_queues(
    State(service): State<Arc<QueueService>>,
    Query(params): Query<ListParams>,
) -> ApiResult<Json<QueueListResponse>> {
    let filter = params.prefix.map(|prefix| QueueFilter {
        name_prefix: Some(prefix),
    });

    let mut queues = Vec::new();
    for config in service.list_queues(filter).await? {
        let stats = service.stats(&config.name).await.unwrap_or_default();
        queues.push(QueueDetails::new(config, stats));
    }

    Ok(Json(QueueListResponse { queues }))
}

/// Create queue endpoint
async fn create_queue(
    State(service): State<Arc<QueueService>>,
    Json(spec): Json<QueueSpec>,
) -> ApiResult<(StatusCode, Json<QueueDetails>)> {
    let config = service.create_queue_with(spec).await?;
    Ok((
        StatusCode::CREATED,
        Json(QueueDetails::new(config, QueueStats::default())),
    ))
}

/// Get queue endpoint
async fn get_queue(
    State(service): State<Arc<QueueService>>,
    Path(name): Path<String>,
) -> ApiResult<Json<QueueDetails>> {
    let config = service.get_queue(&name).await?;
    Ok(Json(queue_details(&service, config).await?))
}

/// Update queue endpoint
async fn update_queue(
    State(service): State<Arc<QueueService>>,
    Path(name): Path<String>,
    Json(update): Json<QueueUpdate>,
) -> ApiResult<Json<QueueDetails>> {
    let config = service.update_config(&name, update).await?;
    Ok(Json(queue_details(&service, config).await?))
}

/// Delete queue endpoint
async fn delete_queue(
    State(service): State<Arc<QueueService>>,
    Path(name): Path<String>,
    Query(params): Query<DeleteParams>,
) -> ApiResult<Json<DeleteQueueResponse>> {
    let messages_discarded = service.delete_queue(&name, params.force).await?;
    Ok(Json(DeleteQueueResponse { messages_discarded }))
}

/// Enqueue endpoint
async fn enqueue(
    State(service): State<Arc<QueueService>>,
    Path(name): Path<String>,
    Json(req): Json<EnqueueRequest>,
) -> ApiResult<(StatusCode, Json<EnqueueResponse>)> {
    let body = BASE64
        .decode(req.body.as_bytes())
        .map_err(|e| ApiError::InvalidInput(format!("body is not valid base64: {}", e)))?;

    let message_id = service.enqueue(&name, body).await?;
    Ok((
        StatusCode::CREATED,
        Json(EnqueueResponse {
            message_id: message_id.0,
        }),
    ))
}

/// Receive endpoint
async fn receive(
    State(service): State<Arc<QueueService>>,
    Path(name): Path<String>,
    Json(req): Json<ReceiveRequest>,
) -> ApiResult<Json<ReceiveResponse>> {
    let messages = service
        .receive(&name, &token(req.consumer_token), req.max_messages)
        .await?;

    Ok(Json(ReceiveResponse {
        messages: messages.into_iter().map(ReceivedMessage::from).collect(),
    }))
}

/// Ack endpoint
async fn ack(
    State(service): State<Arc<QueueService>>,
    Path(id): Path<String>,
    Json(req): Json<LeaseRequest>,
) -> ApiResult<StatusCode> {
    service
        .ack(&MessageId::from_string(id), &token(req.consumer_token))
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Lease extension endpoint
async fn extend_lease(
    State(service): State<Arc<QueueService>>,
    Path(id): Path<String>,
    Json(req): Json<ExtendRequest>,
) -> ApiResult<Json<LeaseResponse>> {
    let message = service
        .extend_lease(
            &MessageId::from_string(id),
            &token(req.consumer_token),
            Duration::from_secs(req.extra_seconds as u64),
        )
        .await?;

    Ok(Json(LeaseResponse {
        message_id: message.id.0,
        expires_at: message.visibility_deadline,
    }))
}

/// Release endpoint
async fn release(
    State(service): State<Arc<QueueService>>,
    Path(id): Path<String>,
    Json(req): Json<LeaseRequest>,
) -> ApiResult<StatusCode> {
    service
        .release(&MessageId::from_string(id), &token(req.consumer_token))
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Dead-letter peek endpoint
async fn dead_letters(
    State(service): State<Arc<QueueService>>,
    Path(name): Path<String>,
    Query(params): Query<PeekParams>,
) -> ApiResult<Json<DeadLettersResponse>> {
    let dead_letters = service.peek_dlq(&name, params.limit).await?;
    Ok(Json(DeadLettersResponse {
        dead_letters: dead_letters.into_iter().map(DeadLetterView::from).collect(),
    }))
}

/// Redrive endpoint
async fn redrive(
    State(service): State<Arc<QueueService>>,
    Path(name): Path<String>,
    Json(req): Json<RedriveRequest>,
) -> ApiResult<Json<RedriveReport>> {
    Ok(Json(service.redrive(&name, req.limit).await?))
}

/// Count requests and latency per matched route
async fn track_requests(req: Request, next: Next) -> Response {
    let started = Instant::now();
    let method = req.method().to_string();
    let endpoint = req
        .extensions()
        .get::<MatchedPath>()
        .map(|path| path.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string());

    let response = next.run(req).await;

    let metrics = get_metrics();
    metrics
        .api_requests_total
        .with_label_values(&[method.as_str(), endpoint.as_str(), response.status().as_str()])
        .inc();
    metrics
        .api_latency_seconds
        .with_label_values(&[endpoint.as_str()])
        .observe(started.elapsed().as_secs_f64());

    response
}

/// Build the REST router
pub fn router(service: Arc<QueueService>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/stats", get(get_stats))
        .route("/queues", get(list_queues).post(create_queue))
        .route(
            "/queues/{name}",
            get(get_queue).patch(update_queue).delete(delete_queue),
        )
        .route("/queues/{name}/messages", post(enqueue))
        .route("/queues/{name}/receive", post(receive))
        .route("/queues/{name}/dead-letters", get(dead_letters))
        .route("/queues/{name}/redrive", post(redrive))
        .route("/messages/{id}/ack", post(ack))
        .route("/messages/{id}/extend", post(extend_lease))
        .route("/messages/{id}/release", post(release))
        .route_layer(middleware::from_fn(track_requests))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(service)
}

/// Start the REST API server
pub async fn start_api_server(
    service: Arc<QueueService>,
    bind_address: String,
    port: u16,
    shutdown_rx: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    let app = router(service);

    let addr = format!("{}:{}", bind_address, port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!("API server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_receiver(shutdown_rx))
        .await
        .map_err(|e| {
            error!("API server error: {}", e);
            anyhow::anyhow!("API server failed: {}", e)
        })?;

    info!("API server shut down gracefully");
    Ok(())
}
