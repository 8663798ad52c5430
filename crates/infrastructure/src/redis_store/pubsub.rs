use std::collections::VecDeque;

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::{PubSub, PubSubSink, PubSubStream};

use taskproc_core::{TaskProcError, TaskProcResult};
use taskproc_domain::{PubSubConnection, PubSubEvent};

use super::FIELD_SEPARATOR;

/// Pub/sub connection over a dedicated Redis connection.
///
/// The Redis client resolves `subscribe`/`unsubscribe` futures once the
/// server has confirmed the command, so confirmations are queued locally
/// and surfaced through `next_event` in order.
pub(crate) struct RedisPubSubConnection {
    sink: PubSubSink,
    stream: PubSubStream,
    confirmations: VecDeque<PubSubEvent>,
}

impl RedisPubSubConnection {
    pub(crate) fn new(connection: PubSub) -> Self {
        let (sink, stream) = connection.split();
        Self {
            sink,
            stream,
            confirmations: VecDeque::new(),
        }
    }
}

#[async_trait]
impl PubSubConnection for RedisPubSubConnection {
    async fn subscribe(&mut self, channel: &str) -> TaskProcResult<()> {
        self.sink
            .subscribe(channel)
            .await
            .map_err(|e| TaskProcError::store("SUBSCRIBE", e))?;
        self.confirmations
            .push_back(PubSubEvent::Subscribed(channel.to_string()));
        Ok(())
    }

    async fn unsubscribe(&mut self, channel: &str) -> TaskProcResult<()> {
        self.sink
            .unsubscribe(channel)
            .await
            .map_err(|e| TaskProcError::store("UNSUBSCRIBE", e))?;
        self.confirmations
            .push_back(PubSubEvent::Unsubscribed(channel.to_string()));
        Ok(())
    }

    async fn next_event(&mut self) -> TaskProcResult<Option<PubSubEvent>> {
        if let Some(event) = self.confirmations.pop_front() {
            return Ok(Some(event));
        }
        match self.stream.next().await {
            Some(message) => {
                let channel = message.get_channel_name().to_string();
                let payload: String = message
                    .get_payload()
                    .map_err(|e| TaskProcError::store("decode pubsub payload", e))?;
                let fields = if payload.is_empty() {
                    Vec::new()
                } else {
                    payload
                        .split(FIELD_SEPARATOR)
                        .map(str::to_string)
                        .collect()
                };
                Ok(Some(PubSubEvent::Message { channel, fields }))
            }
            None => Ok(None),
        }
    }
}
