//! 主机消息队列
//!
//! 每台主机一条出站 FIFO，同一时刻只允许一个 GET 排空（接收端加互斥锁）。
//! 入站消息按插件名分发给已订阅的处理器。

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::message::{Message, MessageType};

/// 入站消息处理器（每个插件一个）
#[async_trait]
pub trait RxHandler: Send + Sync {
    fn plugin(&self) -> &str;

    async fn on_rx(&self, message: Message);
}

/// 一次排空的结果
#[derive(Debug, PartialEq)]
pub enum Drain {
    Messages(Vec<Message>),
    /// 遇到其他 Agent 实例的屏障，本次 GET 脱离队列
    Detached,
}

/// 单台主机的出站队列
pub struct HostQueues {
    pub fqdn: String,
    tx: mpsc::UnboundedSender<Message>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Message>>,
}

impl HostQueues {
    fn new(fqdn: &str) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            fqdn: fqdn.to_string(),
            tx,
            rx: tokio::sync::Mutex::new(rx),
        }
    }

    /// 等待至多 `long_poll` 取得第一条消息，随后取走队列中已有的全部消息
    ///
    /// 屏障的 client_start_time 与本次请求一致时被跳过；不一致时放弃已取消息并返回
    /// `Detached`，让新 Agent 的 GET 接管队列。
    pub async fn drain(&self, long_poll: Duration, client_start_time: DateTime<Utc>) -> Drain {
        let mut rx = self.rx.lock().await;
        let mut messages = Vec::new();

        let first = match tokio::time::timeout(long_poll, rx.recv()).await {
            Ok(Some(message)) => message,
            Ok(None) | Err(_) => return Drain::Messages(messages),
        };

        let mut next = Some(first);
        while let Some(message) = next {
            if message.kind == MessageType::TxBarrier {
                if message.client_start_time != Some(client_start_time) {
                    tracing::warn!(
                        fqdn = %self.fqdn,
                        barrier = ?message.client_start_time,
                        %client_start_time,
                        "Cancelling GET due to barrier"
                    );
                    return Drain::Detached;
                }
            } else {
                messages.push(message);
            }
            next = rx.try_recv().ok();
        }
        Drain::Messages(messages)
    }
}

/// 所有主机队列与插件订阅
#[derive(Default)]
pub struct HostQueueCollection {
    hosts: Mutex<HashMap<String, Arc<HostQueues>>>,
    plugins: Mutex<HashMap<String, mpsc::UnboundedSender<Message>>>,
}

impl HostQueueCollection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, fqdn: &str) -> Arc<HostQueues> {
        let mut hosts = self.hosts.lock().unwrap_or_else(PoisonError::into_inner);
        hosts
            .entry(fqdn.to_string())
            .or_insert_with(|| Arc::new(HostQueues::new(fqdn)))
            .clone()
    }

    pub fn remove_host(&self, fqdn: &str) {
        self.hosts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(fqdn);
    }

    /// 出站：放入主机的 TX 队列
    pub fn send(&self, message: Message) {
        let queues = self.get(&message.fqdn);
        // 接收端与发送端同属 HostQueues，发送不会失败
        let _ = queues.tx.send(message);
    }

    /// 入站：交给插件处理器；不带插件名的消息广播给所有插件
    pub fn receive(&self, message: Message) {
        let mut plugins = self.plugins.lock().unwrap_or_else(PoisonError::into_inner);
        match message.plugin.clone() {
            Some(plugin) => match plugins.get(&plugin) {
                Some(tx) => {
                    if tx.send(message).is_err() {
                        tracing::debug!(plugin, "Plugin handler gone, dropping message");
                        plugins.remove(&plugin);
                    }
                }
                None => tracing::debug!(plugin, fqdn = %message.fqdn, "No handler for plugin"),
            },
            None => {
                plugins.retain(|_, tx| tx.send(message.clone()).is_ok());
            }
        }
    }

    /// 订阅某插件的入站消息（重复订阅替换旧订阅）
    pub fn subscribe(&self, plugin: &str) -> mpsc::UnboundedReceiver<Message> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.plugins
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(plugin.to_string(), tx);
        rx
    }

    /// 为处理器启动分发任务；消息按到达顺序逐条处理
    pub fn serve(&self, handler: Arc<dyn RxHandler>, cancel: CancellationToken) -> JoinHandle<()> {
        let mut rx = self.subscribe(handler.plugin());
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    message = rx.recv() => match message {
                        Some(message) => handler.on_rx(message).await,
                        None => break,
                    },
                }
            }
            tracing::info!(plugin = handler.plugin(), "Rx handler stopped");
        })
    }
}
