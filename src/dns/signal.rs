//! 查询完成信号总线
//!
//! 按 topic（域名 + 地址族标签）广播"已完成"，不携带数据，订阅者醒来后需重新查缓存。
//! 订阅必须在发出查询之前建立，这样先于等待到达的信号不会丢失。

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::broadcast;

type Topics = HashMap<String, broadcast::Sender<()>>;

#[derive(Debug, Default, Clone)]
pub struct SignalBus {
    topics: Arc<Mutex<Topics>>,
}

impl SignalBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn topics(&self) -> MutexGuard<'_, Topics> {
        // 锁内没有会 panic 的操作，中毒后继续使用
        self.topics.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn subscribe(&self, topic: impl Into<String>) -> Subscription {
        let topic = topic.into();
        let rx = {
            let mut topics = self.topics();
            topics
                .entry(topic.clone())
                .or_insert_with(|| broadcast::channel(1).0)
                .subscribe()
        };
        Subscription {
            bus: self.clone(),
            topic,
            rx,
        }
    }

    /// 非阻塞发布；没有订阅者时直接丢弃
    pub fn publish(&self, topic: &str) {
        if let Some(tx) = self.topics().get(topic) {
            let _ = tx.send(());
        }
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics()
            .get(topic)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }

    pub fn topic_count(&self) -> usize {
        self.topics().len()
    }
}

/// 订阅句柄，drop 时自动退订
#[derive(Debug)]
pub struct Subscription {
    bus: SignalBus,
    topic: String,
    rx: broadcast::Receiver<()>,
}

impl Subscription {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// 等待下一次完成信号
    pub async fn wait(&mut self) {
        match self.rx.recv().await {
            // Lagged 说明期间有过多次发布，同样视为已完成
            Ok(()) | Err(broadcast::error::RecvError::Lagged(_)) => {}
            // sender 由总线持有，订阅期间不会关闭
            Err(broadcast::error::RecvError::Closed) => std::future::pending().await,
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let mut topics = self.bus.topics();
        if let Some(tx) = topics.get(&self.topic) {
            // 自身的 receiver 尚未释放，计数包含自己
            if tx.receiver_count() <= 1 {
                topics.remove(&self.topic);
            }
        }
    }
}

/// 等待可选订阅；为 `None` 时永不返回
pub async fn wait_optional(sub: &mut Option<Subscription>) {
    match sub {
        Some(sub) => sub.wait().await,
        None => std::future::pending().await,
    }
}
