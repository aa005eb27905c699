//! Ping handler for health checks

use anyhow::Result;
use async_nats::{Client, Subscriber};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tracing::{debug, error};

use crate::types::{codes, ErrorResponse};

#[derive(Debug, Default, Serialize, Deserialize)]
struct PingRequest {
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PongResponse {
    message: String,
    database: bool,
    timestamp: String,
}

/// Handle ping messages. An empty payload is a valid ping.
pub async fn handle_ping(client: Client, mut subscriber: Subscriber, pool: PgPool) -> Result<()> {
    while let Some(msg) = subscriber.next().await {
        debug!("Received ping message");

        let reply = match msg.reply {
            Some(ref reply) => reply.clone(),
            None => {
                error!("Ping message without reply subject");
                continue;
            }
        };

        let request = if msg.payload.is_empty() {
            PingRequest::default()
        } else {
            match serde_json::from_slice::<PingRequest>(&msg.payload) {
                Ok(req) => req,
                Err(e) => {
                    error!("Failed to parse ping request: {}", e);
                    let error = ErrorResponse::new(
                        uuid::Uuid::nil(),
                        codes::INVALID_REQUEST,
                        format!("Failed to parse request: {}", e),
                    );
                    let _ = client.publish(reply, serde_json::to_vec(&error)?.into()).await;
                    continue;
                }
            }
        };

        let database = sqlx::query("SELECT 1").execute(&pool).await.is_ok();
        let response = PongResponse {
            message: request
                .message
                .map(|m| format!("Pong: {}", m))
                .unwrap_or_else(|| "Pong".to_string()),
            database,
            timestamp: chrono::Utc::now().to_rfc3339(),
        };

        client.publish(reply, serde_json::to_vec(&response)?.into()).await?;
        debug!("Sent pong response (database: {})", database);
    }

    Ok(())
}
