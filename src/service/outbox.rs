//! Outbox 中继: 按写入顺序把未发布事件投递到消息总线
//!
//! 至少一次投递；某条事件失败时本轮停止，保证同一聚合的事件不乱序。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::OutboxConfig;
use crate::db::OutboxRepository;
use crate::error::{AppError, AppResult};
use crate::models::OutboxEvent;

#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn publish(&self, event: &OutboxEvent) -> AppResult<()>;
}

/// 按配置选择总线: 配置了 bus_url 用 HTTP，否则只写日志
pub fn from_config(config: &OutboxConfig) -> AppResult<Arc<dyn MessageBus>> {
    match &config.bus_url {
        Some(url) => Ok(Arc::new(HttpBus::new(
            url.clone(),
            Duration::from_secs(config.publish_timeout_secs),
        )?)),
        None => Ok(Arc::new(LogBus)),
    }
}

/// POST 事件 JSON 到总线网关，2xx 视为已接收
pub struct HttpBus {
    client: reqwest::Client,
    url: String,
}

impl HttpBus {
    pub fn new(url: String, timeout: Duration) -> AppResult<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, url })
    }
}

#[async_trait]
impl MessageBus for HttpBus {
    async fn publish(&self, event: &OutboxEvent) -> AppResult<()> {
        let response = self
            .client
            .post(&self.url)
            .header("X-Event-Type", event.event_type.as_str())
            .header("X-Event-Id", event.id.to_string())
            .json(event)
            .send()
            .await?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(AppError::ExternalService(format!(
                "message bus returned {} for event {}",
                status, event.id
            )))
        }
    }
}

/// 未配置总线时使用
pub struct LogBus;

#[async_trait]
impl MessageBus for LogBus {
    async fn publish(&self, event: &OutboxEvent) -> AppResult<()> {
        tracing::info!(
            seq = event.seq,
            event_type = %event.event_type,
            aggregate_id = %event.aggregate_id,
            "事件已发布 (log bus)"
        );
        Ok(())
    }
}

pub struct OutboxRelay {
    outbox: Arc<dyn OutboxRepository>,
    bus: Arc<dyn MessageBus>,
    interval: Duration,
    batch_size: i64,
}

impl OutboxRelay {
    pub fn new(outbox: Arc<dyn OutboxRepository>, bus: Arc<dyn MessageBus>, config: &OutboxConfig) -> Self {
        Self {
            outbox,
            bus,
            interval: Duration::from_millis(config.poll_interval_ms),
            batch_size: config.batch_size,
        }
    }

    /// 常驻循环，由 `tokio::spawn` 启动
    pub async fn run(&self) {
        tracing::info!(
            "OutboxRelay started (poll interval={:?}, batch_size={})",
            self.interval,
            self.batch_size
        );
        loop {
            match self.relay_once().await {
                Ok(n) if n > 0 => {}
                Ok(_) => tokio::time::sleep(self.interval).await,
                Err(e) => {
                    tracing::error!("outbox 投递失败: {}", e);
                    tokio::time::sleep(self.interval).await;
                }
            }
        }
    }

    /// 投递一批，返回成功发布的条数；首条即失败时返回该错误
    pub async fn relay_once(&self) -> AppResult<usize> {
        let events = self.outbox.fetch_unpublished(self.batch_size).await?;
        let mut published = 0;
        for event in &events {
            if let Err(e) = self.bus.publish(event).await {
                self.outbox.record_failure(event.id, &e.to_string()).await?;
                tracing::warn!(
                    seq = event.seq,
                    event_type = %event.event_type,
                    attempts = event.attempts + 1,
                    "事件发布失败，下轮重试: {}",
                    e
                );
                return if published > 0 { Ok(published) } else { Err(e) };
            }
            self.outbox.mark_published(event.id).await?;
            published += 1;
        }
        if published > 0 {
            tracing::debug!(published, "outbox 批次已发布");
        }
        Ok(published)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{InventoryRepository, MemoryStore};
    use crate::models::BatchReceipt;
    use bigdecimal::BigDecimal;
    use tokio::sync::Mutex;
    use uuid::Uuid;

    /// 记录发布顺序；第 fail_at 次调用失败
    struct RecordingBus {
        seen: Mutex<Vec<i64>>,
        fail_at: Option<usize>,
    }

    #[async_trait]
    impl MessageBus for RecordingBus {
        async fn publish(&self, event: &OutboxEvent) -> AppResult<()> {
            let mut seen = self.seen.lock().await;
            if self.fail_at == Some(seen.len()) {
                return Err(AppError::ExternalService("bus down".into()));
            }
            seen.push(event.seq);
            Ok(())
        }
    }

    async fn store_with_events(n: usize) -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        for i in 0..n {
            let receipt = BatchReceipt {
                shop_id: Uuid::new_v4(),
                product_id: Uuid::new_v4(),
                batch_no: format!("B{}", i),
                expiry_date: None,
                qty: BigDecimal::from(1),
                landed_cost: BigDecimal::from(1),
            };
            store.apply_bulk(&format!("key-{}", i), &[receipt]).await.unwrap();
        }
        store
    }

    #[tokio::test]
    async fn publishes_in_order_and_marks_published() {
        let store = store_with_events(3).await;
        let bus = Arc::new(RecordingBus {
            seen: Mutex::new(Vec::new()),
            fail_at: None,
        });
        let relay = OutboxRelay::new(store.clone(), bus.clone(), &OutboxConfig {
            poll_interval_ms: 10,
            batch_size: 10,
            bus_url: None,
            publish_timeout_secs: 1,
        });
        assert_eq!(relay.relay_once().await.unwrap(), 3);
        let seen = bus.seen.lock().await.clone();
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(relay.relay_once().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn failure_stops_the_batch_and_is_recorded() {
        let store = store_with_events(3).await;
        let bus = Arc::new(RecordingBus {
            seen: Mutex::new(Vec::new()),
            fail_at: Some(1),
        });
        let config = OutboxConfig {
            poll_interval_ms: 10,
            batch_size: 10,
            bus_url: None,
            publish_timeout_secs: 1,
        };
        let relay = OutboxRelay::new(store.clone(), bus.clone(), &config);
        assert_eq!(relay.relay_once().await.unwrap(), 1);

        let events = store.outbox_events().await;
        assert!(events[0].published);
        assert!(!events[1].published);
        assert_eq!(events[1].attempts, 1);
        assert!(!events[2].published);
    }
}
