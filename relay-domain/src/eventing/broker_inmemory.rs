//! 内存版 Broker（InMemoryBroker）
//!
//! 基于 `tokio::sync::mpsc` 的轻量实现，满足 `Broker` 协议：
//! - 主题支持 `*`（单段）与 `>`（余下全部）通配；
//! - 持久订阅：退订或断开后，同名 durable 的消息进入积压，重新订阅时先补投；
//! - 流按主题第一段归类，保留全部已发布消息，便于测试断言；
//! - 可注入发布失败，用于验证重试与死信路径。
//!
//! 典型用途：测试环境、示例与本地开发。
use super::broker::{
    Broker, BrokerMessage, BrokerSubscription, ConsumerInfo, StreamInfo, SubscriptionId,
};
use crate::dead_letter::dead_letter_subject;
use crate::error::{RelayError, RelayResult};
use crate::event::Headers;
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::debug;

#[derive(Default)]
pub struct InMemoryBroker {
    connected: AtomicBool,
    sequence: AtomicU64,
    fail_publishes: AtomicUsize,
    state: Mutex<BrokerState>,
}

#[derive(Default)]
struct BrokerState {
    next_subscription: u64,
    subscribers: HashMap<SubscriptionId, Subscriber>,
    durables: BTreeMap<(String, String), Durable>,
    streams: BTreeMap<String, Stream>,
}

struct Subscriber {
    subject: String,
    durable: Option<String>,
    tx: mpsc::UnboundedSender<BrokerMessage>,
}

#[derive(Default)]
struct Durable {
    attached: Option<SubscriptionId>,
    backlog: VecDeque<BrokerMessage>,
    delivered: u64,
}

#[derive(Default)]
struct Stream {
    subjects: BTreeSet<String>,
    messages: Vec<BrokerMessage>,
    last_sequence: u64,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// 让接下来的 `n` 次发布失败
    pub fn fail_next_publishes(&self, n: usize) {
        self.fail_publishes.store(n, Ordering::SeqCst);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// 某主题上已发布的全部消息（按顺序号）
    pub fn published(&self, subject: &str) -> Vec<BrokerMessage> {
        let state = self.state();
        state
            .streams
            .get(stream_name(subject))
            .map(|s| {
                s.messages
                    .iter()
                    .filter(|m| m.subject == subject)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn active_subscriptions(&self) -> usize {
        self.state().subscribers.len()
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_connected(&self) -> RelayResult<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(RelayError::NotConnected)
        }
    }

    fn take_injected_failure(&self) -> bool {
        self.fail_publishes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

/// 流名：主题第一段
fn stream_name(subject: &str) -> &str {
    subject.split('.').next().unwrap_or(subject)
}

/// NATS 风格的主题匹配
fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut p = pattern.split('.');
    let mut s = subject.split('.');
    loop {
        match (p.next(), s.next()) {
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => continue,
            (Some(a), Some(b)) if a == b => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn connect(&self) -> RelayResult<()> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> RelayResult<()> {
        self.connected.store(false, Ordering::SeqCst);

        // 断开即结束所有消息流；持久订阅的位置保留到下一次订阅
        let mut state = self.state();
        state.subscribers.clear();
        for durable in state.durables.values_mut() {
            durable.attached = None;
        }
        Ok(())
    }

    async fn publish(&self, subject: &str, payload: Vec<u8>, headers: &Headers) -> RelayResult<u64> {
        self.ensure_connected()?;
        if self.take_injected_failure() {
            debug!(subject, "injected publish failure");
            return Err(RelayError::broker(format!("injected publish failure on {subject}")));
        }

        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let message = BrokerMessage {
            subject: subject.to_string(),
            payload,
            headers: headers.clone(),
            sequence,
            delivery_count: 1,
        };

        let mut state = self.state();
        let BrokerState {
            subscribers,
            durables,
            streams,
            ..
        } = &mut *state;

        let stream = streams.entry(stream_name(subject).to_string()).or_default();
        stream.subjects.insert(subject.to_string());
        stream.messages.push(message.clone());
        stream.last_sequence = sequence;

        for sub in subscribers.values() {
            if !subject_matches(&sub.subject, subject) {
                continue;
            }
            if sub.tx.send(message.clone()).is_ok() {
                if let Some(name) = &sub.durable {
                    if let Some(d) = durables.get_mut(&(sub.subject.clone(), name.clone())) {
                        d.delivered += 1;
                    }
                }
            }
        }

        for ((pattern, _), durable) in durables.iter_mut() {
            if durable.attached.is_none() && subject_matches(pattern, subject) {
                durable.backlog.push_back(message.clone());
            }
        }

        Ok(sequence)
    }

    async fn subscribe(
        &self,
        subject: &str,
        durable_name: Option<&str>,
    ) -> RelayResult<BrokerSubscription> {
        self.ensure_connected()?;

        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state();
        state.next_subscription += 1;
        let id = SubscriptionId::new(format!("sub-{}", state.next_subscription));

        if let Some(name) = durable_name {
            let durable = state
                .durables
                .entry((subject.to_string(), name.to_string()))
                .or_default();
            if durable.attached.is_some() {
                return Err(RelayError::broker(format!(
                    "durable consumer {name} already bound on {subject}"
                )));
            }
            if !durable.backlog.is_empty() {
                debug!(subject, durable = name, backlog = durable.backlog.len(), "replaying durable backlog");
            }
            while let Some(mut message) = durable.backlog.pop_front() {
                message.delivery_count += 1;
                if tx.send(message).is_ok() {
                    durable.delivered += 1;
                }
            }
            durable.attached = Some(id.clone());
        }

        state.subscribers.insert(
            id.clone(),
            Subscriber {
                subject: subject.to_string(),
                durable: durable_name.map(str::to_string),
                tx,
            },
        );

        Ok(BrokerSubscription {
            id,
            messages: Box::pin(UnboundedReceiverStream::new(rx)),
        })
    }

    async fn unsubscribe(&self, id: &SubscriptionId) -> RelayResult<()> {
        let mut state = self.state();
        let Some(sub) = state.subscribers.remove(id) else {
            return Err(RelayError::NotFound {
                reason: format!("subscription {id}"),
            });
        };
        if let Some(name) = sub.durable {
            if let Some(d) = state.durables.get_mut(&(sub.subject, name)) {
                d.attached = None;
            }
        }
        Ok(())
    }

    async fn subscribe_dead_letters(&self, subject: &str) -> RelayResult<BrokerSubscription> {
        self.subscribe(&dead_letter_subject(subject), None).await
    }

    async fn stream_info(&self, stream: &str) -> RelayResult<StreamInfo> {
        let state = self.state();
        let s = state.streams.get(stream).ok_or_else(|| RelayError::NotFound {
            reason: format!("stream {stream}"),
        })?;
        Ok(StreamInfo {
            name: stream.to_string(),
            subjects: s.subjects.iter().cloned().collect(),
            messages: s.messages.len() as u64,
            last_sequence: s.last_sequence,
        })
    }

    async fn consumer_info(&self, stream: &str, consumer: &str) -> RelayResult<ConsumerInfo> {
        self.consumers(stream)
            .await?
            .into_iter()
            .find(|c| c.name == consumer)
            .ok_or_else(|| RelayError::NotFound {
                reason: format!("consumer {consumer} on stream {stream}"),
            })
    }

    async fn streams(&self) -> RelayResult<Vec<StreamInfo>> {
        let names: Vec<String> = self.state().streams.keys().cloned().collect();
        let mut infos = Vec::with_capacity(names.len());
        for name in names {
            infos.push(self.stream_info(&name).await?);
        }
        Ok(infos)
    }

    async fn consumers(&self, stream: &str) -> RelayResult<Vec<ConsumerInfo>> {
        let state = self.state();
        Ok(state
            .durables
            .iter()
            .filter(|((subject, _), _)| stream_name(subject) == stream)
            .map(|((_, name), d)| ConsumerInfo {
                stream: stream.to_string(),
                name: name.clone(),
                delivered: d.delivered,
                pending: d.backlog.len() as u64,
            })
            .collect())
    }
}
