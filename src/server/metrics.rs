/// Prometheus scrape endpoint
use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use tokio::sync::broadcast;
use tracing::{error, info};

use crate::metrics;
use crate::server::shutdown::shutdown_receiver;

async fn metrics_handler() -> Response {
    match metrics::get_metrics().gather() {
        Ok(output) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            output,
        )
            .into_response(),
        Err(e) => {
            error!("Failed to gather metrics: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "Failed to gather metrics").into_response()
        }
    }
}

/// Router serving `/metrics`
pub fn metrics_router() -> Router {
    Router::new().route("/metrics", get(metrics_handler))
}

/// Start the metrics HTTP server
pub async fn start_metrics_server(
    bind_address: String,
    port: u16,
    shutdown_rx: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    let addr = format!("{}:{}", bind_address, port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!("Metrics server listening on {}", addr);

    axum::serve(listener, metrics_router())
        .with_graceful_shutdown(shutdown_receiver(shutdown_rx))
        .await
        .map_err(|e| {
            error!("Metrics server error: {}", e);
            anyhow::anyhow!("Metrics server failed: {}", e)
        })?;

    info!("Metrics server shut down gracefully");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_metrics_endpoint_exposes_queue_counters() {
        metrics::get_metrics()
            .messages_enqueued_total
            .with_label_values(&["scrape-test"])
            .inc();

        let request = Request::builder()
            .uri("/metrics")
            .body(Body::empty())
            .unwrap();
        let response = metrics_router().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("cloudq_messages_enqueued_total"));
        assert!(text.contains("scrape-test"));
    }

    #[tokio::test]
    async fn test_metrics_server_serves_and_stops() {
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let port = 19391;
        let server = tokio::spawn(async move {
            start_metrics_server("127.0.0.1".to_string(), port, shutdown_rx).await
        });

        tokio::time::sleep(tokio::time::Duration::from_millis(200)).await;

        let response = reqwest::get(format!("http://127.0.0.1:{}/metrics", port)).await;
        assert!(response.is_ok());
        if let Ok(resp) = response {
            assert_eq!(resp.status(), 200);
        }

        let _ = shutdown_tx.send(());
        let result = tokio::time::timeout(tokio::time::Duration::from_secs(2), server).await;
        assert!(matches!(result, Ok(Ok(Ok(())))));
    }
}
