use async_trait::async_trait;
use iv_core::types::VisibilityEvent;
use redis::AsyncCommands;
use std::sync::Arc;
use visibility::{NotificationGateway, VisibilityError, VisibilityResult};

fn publish_err(e: redis::RedisError) -> VisibilityError {
    VisibilityError::Publish(e.to_string())
}

/// Redis Streams notification gateway. Each topic is a stream key; events
/// are appended with `XADD` as a single JSON field. Delivery is best-effort:
/// the reconciler logs and continues on failure.
pub struct RedisGateway {
    client: Arc<redis::Client>,
}

impl RedisGateway {
    pub fn new(connection_url: &str) -> VisibilityResult<Self> {
        let client = redis::Client::open(connection_url).map_err(publish_err)?;
        Ok(Self {
            client: Arc::new(client),
        })
    }
}

#[async_trait]
impl NotificationGateway for RedisGateway {
    async fn publish(&self, topic: &str, event: &VisibilityEvent) -> VisibilityResult<()> {
        let mut conn = self
            .client
            .get_connection_manager()
            .await
            .map_err(publish_err)?;
        let event_json = serde_json::to_string(event)?;

        let _: String = conn
            .xadd(topic, "*", &[("event", event_json)])
            .await
            .map_err(publish_err)?;

        Ok(())
    }
}
