// Command handlers
/// Start command implementation
pub mod start;

use anyhow::Context;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use reqwest::{RequestBuilder, Response};
use serde::{de::DeserializeOwned, Serialize};
use tabled::Tabled;

use crate::cli::{output::*, ApiArgs, Commands, QueueCommands};
use crate::config::CloudqConfig;
use crate::core::registry::{QueueSpec, QueueUpdate};
use crate::server::api::{
    DeadLettersResponse, DeleteQueueResponse, EnqueueRequest, EnqueueResponse, ErrorResponse,
    ExtendRequest, HealthResponse, LeaseRequest, LeaseResponse, QueueDetails, QueueListResponse, ReceiveRequest,
    ReceiveResponse, RedriveRequest, StatsResponse,
};
use crate::service::RedriveReport;
use crate::types::QueueType;

/// Thin client for the REST API
struct ApiClient {
    http: reqwest::Client,
    base_url: String,
}

impl ApiClient {
    fn new(api: &ApiArgs) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: api.api_url.trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send(&self, request: RequestBuilder) -> anyhow::Result<Response> {
        let response = request
            .send()
            .await
            .with_context(|| format!("Failed to connect to cloudq API at {}", self.base_url))?;

        if response.status().is_success() {
            return Ok(response);
        }

        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        match serde_json::from_str::<ErrorResponse>(&text) {
            Ok(body) => anyhow::bail!("API error ({}, {}): {}", status, body.code, body.error),
            Err(_) => anyhow::bail!("API error ({}): {}", status, text),
        }
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> anyhow::Result<T> {
        let response = self.send(self.http.get(self.url(path))).await?;
        response.json().await.context("Failed to parse response")
    }

    async fn post<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> anyhow::Result<T> {
        let response = self.send(self.http.post(self.url(path)).json(body)).await?;
        response.json().await.context("Failed to parse response")
    }
}

/// Queue row for tables
#[derive(Tabled)]
struct QueueRow {
    name: String,
    #[tabled(rename = "type")]
    queue_type: String,
    available: u64,
    in_flight: u64,
    dead_lettered: u64,
    visibility_timeout: u32,
    max_receives: u32,
    dlq: String,
}

impl From<&QueueDetails> for QueueRow {
    fn from(queue: &QueueDetails) -> Self {
        Self {
            name: queue.name.clone(),
            queue_type: queue.queue_type.clone(),
            available: queue.available_messages,
            in_flight: queue.in_flight_messages,
            dead_lettered: queue.dead_lettered_messages,
            visibility_timeout: queue.visibility_timeout,
            max_receives: queue.max_receives,
            dlq: or_dash(&queue.dlq_name),
        }
    }
}

/// Leased message row for tables
#[derive(Tabled)]
struct MessageRow {
    message_id: String,
    receive_count: u32,
    expires_at: String,
    body: String,
}

/// Dead letter row for tables
#[derive(Tabled)]
struct DeadLetterRow {
    message_id: String,
    original_queue: String,
    receives: u32,
    last_failure_at: String,
    body: String,
}

/// Stats row for tables
#[derive(Tabled)]
struct StatsRow {
    queues: usize,
    available: u64,
    in_flight: u64,
    dead_lettered: u64,
    pending_expiries: usize,
}

/// Decode a base64 body for display, falling back to the encoded form for binary payloads
fn display_body(encoded: &str) -> String {
    BASE64
        .decode(encoded)
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .unwrap_or_else(|| format!("base64:{}", encoded))
}

/// Execute a CLI command
pub async fn execute_command(command: Commands, config: CloudqConfig) -> anyhow::Result<()> {
    match command {
        Commands::Start(_) => start::execute(config).await,
        Commands::Queue(queue_cmd) => execute_queue_command(queue_cmd).await,
        Commands::Send { queue, body, api } => {
            let client = ApiClient::new(&api);
            let request = EnqueueRequest {
                body: BASE64.encode(body.as_bytes()),
            };
            let response: EnqueueResponse = client
                .post(&format!("/queues/{}/messages", queue), &request)
                .await?;
            print_success(&format!("Sent message {} to '{}'", response.message_id, queue));
            Ok(())
        }
        Commands::Receive {
            queue,
            consumer,
            max_messages,
            api,
            format,
        } => {
            let client = ApiClient::new(&api);
            let request = ReceiveRequest {
                consumer_token: consumer,
                max_messages,
            };
            let response: ReceiveResponse = client
                .post(&format!("/queues/{}/receive", queue), &request)
                .await?;

            let rows: Vec<MessageRow> = response
                .messages
                .iter()
                .map(|m| MessageRow {
                    message_id: m.message_id.clone(),
                    receive_count: m.receive_count,
                    expires_at: or_dash(&m.expires_at),
                    body: display_body(&m.body),
                })
                .collect();
            render(&rows, &response, OutputFormat::parse(&format))
        }
        Commands::Ack {
            message_id,
            consumer,
            api,
        } => {
            let client = ApiClient::new(&api);
            let request = LeaseRequest {
                consumer_token: consumer,
            };
            client
                .send(
                    client
                        .http
                        .post(client.url(&format!("/messages/{}/ack", message_id)))
                        .json(&request),
                )
                .await?;
            print_success(&format!("Acknowledged {}", message_id));
            Ok(())
        }
        Commands::Extend {
            message_id,
            consumer,
            seconds,
            api,
        } => {
            let client = ApiClient::new(&api);
            let request = ExtendRequest {
                consumer_token: consumer,
                extra_seconds: seconds,
            };
            let lease: LeaseResponse = client
                .post(&format!("/messages/{}/extend", message_id), &request)
                .await?;
            print_success(&format!(
                "Lease on {} now expires at {}",
                lease.message_id,
                or_dash(&lease.expires_at)
            ));
            Ok(())
        }
        Commands::Release {
            message_id,
            consumer,
            api,
        } => {
            let client = ApiClient::new(&api);
            let request = LeaseRequest {
                consumer_token: consumer,
            };
            client
                .send(
                    client
                        .http
                        .post(client.url(&format!("/messages/{}/release", message_id)))
                        .json(&request),
                )
                .await?;
            print_success(&format!("Released {}", message_id));
            Ok(())
        }
        Commands::DeadLetters {
            queue,
            limit,
            api,
            format,
        } => {
            let client = ApiClient::new(&api);
            let response: DeadLettersResponse = client
                .get(&format!("/queues/{}/dead-letters?limit={}", queue, limit))
                .await?;

            let rows: Vec<DeadLetterRow> = response
                .dead_letters
                .iter()
                .map(|d| DeadLetterRow {
                    message_id: d.message_id.clone(),
                    original_queue: d.original_queue.clone(),
                    receives: d.final_receive_count,
                    last_failure_at: d.last_failure_at.to_rfc3339(),
                    body: display_body(&d.body),
                })
                .collect();
            render(&rows, &response, OutputFormat::parse(&format))
        }
        Commands::Redrive { queue, limit, api } => {
            let client = ApiClient::new(&api);
            let report: RedriveReport = client
                .post(&format!("/queues/{}/redrive", queue), &RedriveRequest { limit })
                .await?;
            print_success(&format!("Moved {} message(s) out of '{}'", report.moved, queue));
            if report.skipped > 0 {
                print_warning(&format!("Skipped {} message(s)", report.skipped));
            }
            Ok(())
        }
        Commands::Health { api } => execute_health(api).await,
        Commands::Stats { api, format } => {
            let client = ApiClient::new(&api);
            let stats: StatsResponse = client.get("/stats").await?;
            let row = StatsRow {
                queues: stats.total_queues,
                available: stats.available_messages,
                in_flight: stats.in_flight_messages,
                dead_lettered: stats.dead_lettered_messages,
                pending_expiries: stats.pending_expiries,
            };
            println!("Overall Statistics:");
            render(&[row], &stats, OutputFormat::parse(&format))
        }
        Commands::Config => {
            print!("{}", config.to_toml()?);
            Ok(())
        }
    }
}

async fn execute_queue_command(command: QueueCommands) -> anyhow::Result<()> {
    match command {
        QueueCommands::List {
            prefix,
            api,
            format,
        } => {
            let client = ApiClient::new(&api);
            let path = match prefix {
                Some(prefix) => format!("/queues?prefix={}", prefix),
                None => "/queues".to_string(),
            };
            let list: QueueListResponse = client.get(&path).await?;
            let rows: Vec<QueueRow> = list.queues.iter().map(QueueRow::from).collect();
            render(&rows, &list, OutputFormat::parse(&format))
        }
        QueueCommands::Create {
            name,
            fifo,
            visibility_timeout,
            max_receives,
            retention,
            max_message_size,
            max_messages,
            dlq,
            api,
        } => {
            let client = ApiClient::new(&api);
            let spec = QueueSpec {
                name: name.clone(),
                queue_type: fifo.then_some(QueueType::Fifo),
                visibility_timeout,
                max_receives,
                message_retention_period: retention,
                max_message_size,
                max_messages,
                dlq_name: dlq,
            };
            let queue: QueueDetails = client.post("/queues", &spec).await?;

            print_success(&format!("Queue '{}' created", name));
            println!("{}", table(&[QueueRow::from(&queue)]));
            Ok(())
        }
        QueueCommands::Delete { name, force, api } => {
            let client = ApiClient::new(&api);
            let url = client.url(&format!("/queues/{}?force={}", name, force));
            let response: DeleteQueueResponse = client
                .send(client.http.delete(url))
                .await?
                .json()
                .await
                .context("Failed to parse response")?;

            print_success(&format!("Queue '{}' deleted", name));
            if response.messages_discarded > 0 {
                print_warning(&format!(
                    "Discarded {} message(s)",
                    response.messages_discarded
                ));
            }
            Ok(())
        }
        QueueCommands::Stats { name, api, format } => {
            let client = ApiClient::new(&api);
            let queue: QueueDetails = client.get(&format!("/queues/{}", name)).await?;
            println!("Queue Statistics for '{}':", name);
            render(&[QueueRow::from(&queue)], &queue, OutputFormat::parse(&format))
        }
        QueueCommands::Update {
            name,
            visibility_timeout,
            max_receives,
            retention,
            max_message_size,
            max_messages,
            dlq,
            no_dlq,
            api,
        } => {
            let client = ApiClient::new(&api);
            let update = QueueUpdate {
                visibility_timeout,
                max_receives,
                message_retention_period: retention,
                max_message_size,
                max_messages,
                dlq_name: dlq,
                remove_dead_letter_queue: no_dlq,
            };
            let url = client.url(&format!("/queues/{}", name));
            let queue: QueueDetails = client
                .send(client.http.patch(url).json(&update))
                .await?
                .json()
                .await
                .context("Failed to parse response")?;

            print_success(&format!("Queue '{}' updated", name));
            println!("{}", table(&[QueueRow::from(&queue)]));
            Ok(())
        }
    }
}

async fn execute_health(api: ApiArgs) -> anyhow::Result<()> {
    let client = ApiClient::new(&api);
    // An unhealthy server answers 503 with the same body, so read it directly
    let response = client
        .http
        .get(client.url("/health"))
        .send()
        .await
        .context("Failed to connect to cloudq API")?;

    let health: HealthResponse = response
        .json()
        .await
        .context("Failed to parse response")?;

    if health.status == "healthy" {
        print_success(&format!("Server is {}", health.status));
        print_info(&format!("Backend: {}", health.backend_status));
        Ok(())
    } else {
        print_error(&format!("Server is {}", health.status));
        print_warning(&format!("Backend: {}", health.backend_status));
        anyhow::bail!("Server is unhealthy")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_body() {
        assert_eq!(display_body(&BASE64.encode("hello")), "hello");
        let binary = BASE64.encode([0xff, 0xfe]);
        assert_eq!(display_body(&binary), format!("base64:{}", binary));
    }

    #[test]
    fn test_client_trims_trailing_slash() {
        let client = ApiClient::new(&ApiArgs {
            api_url: "http://localhost:9400/".to_string(),
        });
        assert_eq!(client.url("/queues"), "http://localhost:9400/queues");
    }
}
