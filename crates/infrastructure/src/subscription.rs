//! Message bus subscription.
//!
//! One dedicated driver task owns the pub/sub connection; callers talk to
//! it through an in-process command queue and block on per-call gates.
//! This keeps every subscribe/unsubscribe on the connection's own execution
//! context while callers stay free to issue requests from any task.
//!
//! Each subscription also holds a private, randomly named control channel.
//! It is subscribed together with the first real channel and unsubscribed
//! with the last, never shows up in `active_channels`, and never raises a
//! message event. A message published *on* the control channel is honoured
//! as an unsubscribe request (empty payload: everything; otherwise the
//! listed channels), so peers speaking the original wire protocol keep
//! working even though local callers use the command queue instead.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};
use uuid::Uuid;

use taskproc_core::{TaskProcError, TaskProcResult};
use taskproc_domain::{
    MessageBusChannel, PubSubConnection, PubSubEvent, Store, CHANNEL_NAME_PREFIX,
};

/// A message received on a subscribed channel.
#[derive(Debug, Clone, PartialEq)]
pub struct BusMessage {
    pub channel: MessageBusChannel,
    pub fields: Vec<String>,
}

type Gate = oneshot::Sender<TaskProcResult<()>>;

enum Command {
    Subscribe {
        channels: Vec<MessageBusChannel>,
        gate: Gate,
    },
    Unsubscribe {
        channels: Vec<MessageBusChannel>,
        gate: Gate,
    },
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Subscribe,
    Unsubscribe,
}

/// One in-flight subscribe or unsubscribe call: the channels still awaiting
/// confirmation and the gate releasing the blocked caller.
struct PendingOperation {
    direction: Direction,
    remaining: HashSet<String>,
    gate: Option<Gate>,
}

impl PendingOperation {
    fn release(&mut self, result: TaskProcResult<()>) {
        if let Some(gate) = self.gate.take() {
            // The caller may have timed out and dropped its receiver.
            let _ = gate.send(result);
        }
    }
}

pub struct MessageBusSubscription {
    active: Arc<StdMutex<HashSet<MessageBusChannel>>>,
    commands: mpsc::UnboundedSender<Command>,
    messages: broadcast::Sender<BusMessage>,
    closed: Arc<AtomicBool>,
    driver: StdMutex<Option<JoinHandle<()>>>,
    #[allow(dead_code)]
    control_channel: String,
}

impl MessageBusSubscription {
    /// Open a dedicated pub/sub connection on `store` and start the driver.
    pub async fn connect(store: &Arc<dyn Store>) -> TaskProcResult<Self> {
        Ok(Self::from_connection(store.pubsub().await?))
    }

    fn from_connection(connection: Box<dyn PubSubConnection>) -> Self {
        let control_channel = format!("{CHANNEL_NAME_PREFIX}$Control${}", Uuid::new_v4());
        let active = Arc::new(StdMutex::new(HashSet::new()));
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (messages, _) = broadcast::channel(256);

        let driver = Driver {
            connection,
            commands: command_rx,
            active: active.clone(),
            messages: messages.clone(),
            control_channel: control_channel.clone(),
            control_subscribed: false,
            pending: Vec::new(),
        };
        let handle = tokio::spawn(driver.run());

        Self {
            active,
            commands,
            messages,
            closed: Arc::new(AtomicBool::new(false)),
            driver: StdMutex::new(Some(handle)),
            control_channel,
        }
    }

    /// Subscribe to `channels`, blocking until every one is confirmed or
    /// `timeout` elapses.
    ///
    /// On timeout the channels confirmed so far stay subscribed; the call
    /// reports [`TaskProcError::SubscribeTimeout`] without rolling back.
    pub async fn subscribe_to_channels(
        &self,
        timeout: Duration,
        channels: &[MessageBusChannel],
    ) -> TaskProcResult<()> {
        self.ensure_open(timeout)?;

        let request = self.not_yet_active(channels);
        if request.is_empty() {
            return Ok(());
        }

        let (gate, confirmed) = oneshot::channel();
        self.commands
            .send(Command::Subscribe {
                channels: request,
                gate,
            })
            .map_err(|_| TaskProcError::SubscriptionClosed)?;

        match tokio::time::timeout(timeout, confirmed).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TaskProcError::SubscriptionClosed),
            Err(_) => Err(TaskProcError::SubscribeTimeout { timeout }),
        }
    }

    /// Unsubscribe from `channels`, blocking until confirmed or `timeout`
    /// elapses. A timeout returns `Ok(false)`; the unsubscribe itself is
    /// best-effort and keeps running on the driver.
    pub async fn unsubscribe_from_channels(
        &self,
        timeout: Duration,
        channels: &[MessageBusChannel],
    ) -> TaskProcResult<bool> {
        self.ensure_open(timeout)?;

        let request = self.currently_active(channels);
        if request.is_empty() {
            return Ok(true);
        }

        let (gate, confirmed) = oneshot::channel();
        self.commands
            .send(Command::Unsubscribe {
                channels: request,
                gate,
            })
            .map_err(|_| TaskProcError::SubscriptionClosed)?;

        match tokio::time::timeout(timeout, confirmed).await {
            Ok(Ok(Ok(()))) => Ok(true),
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(_)) => Err(TaskProcError::SubscriptionClosed),
            Err(_) => Ok(false),
        }
    }

    /// Currently confirmed channels, excluding the control channel.
    pub fn active_channels(&self) -> Vec<MessageBusChannel> {
        let mut channels: Vec<MessageBusChannel> = self
            .active
            .lock()
            .expect("active channel set poisoned")
            .iter()
            .copied()
            .collect();
        channels.sort_by_key(|c| c.channel_name());
        channels
    }

    /// Stream of messages from all subscribed channels.
    pub fn messages(&self) -> broadcast::Receiver<BusMessage> {
        self.messages.subscribe()
    }

    /// Stop the driver and drop the connection. Calls made after close
    /// starts fail fast with [`TaskProcError::SubscriptionClosed`].
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.commands.send(Command::Shutdown);
        let handle = self
            .driver
            .lock()
            .expect("driver handle poisoned")
            .take();
        if let Some(handle) = handle {
            match handle.await {
                Ok(()) => {}
                // A panic on the driver is process-fatal; resurface it.
                Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
                Err(_) => {}
            }
        }
    }

    fn ensure_open(&self, timeout: Duration) -> TaskProcResult<()> {
        if timeout.is_zero() {
            return Err(TaskProcError::InvalidArgument(
                "timeout must be positive".to_string(),
            ));
        }
        if self.closed.load(Ordering::SeqCst) {
            return Err(TaskProcError::SubscriptionClosed);
        }
        Ok(())
    }

    fn not_yet_active(&self, channels: &[MessageBusChannel]) -> Vec<MessageBusChannel> {
        let active = self.active.lock().expect("active channel set poisoned");
        let mut seen = HashSet::new();
        channels
            .iter()
            .filter(|c| !active.contains(c) && seen.insert(**c))
            .copied()
            .collect()
    }

    fn currently_active(&self, channels: &[MessageBusChannel]) -> Vec<MessageBusChannel> {
        let active = self.active.lock().expect("active channel set poisoned");
        let mut seen = HashSet::new();
        channels
            .iter()
            .filter(|c| active.contains(c) && seen.insert(**c))
            .copied()
            .collect()
    }

    #[cfg(test)]
    fn control_channel(&self) -> &str {
        &self.control_channel
    }
}

struct Driver {
    connection: Box<dyn PubSubConnection>,
    commands: mpsc::UnboundedReceiver<Command>,
    active: Arc<StdMutex<HashSet<MessageBusChannel>>>,
    messages: broadcast::Sender<BusMessage>,
    control_channel: String,
    control_subscribed: bool,
    pending: Vec<PendingOperation>,
}

impl Driver {
    async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Subscribe { channels, gate }) => {
                        self.handle_subscribe(channels, gate).await;
                    }
                    Some(Command::Unsubscribe { channels, gate }) => {
                        self.handle_unsubscribe(channels, gate).await;
                    }
                    Some(Command::Shutdown) | None => break,
                },
                event = self.connection.next_event() => match event {
                    Ok(Some(event)) => self.handle_event(event).await,
                    Ok(None) => {
                        debug!("pubsub connection closed");
                        break;
                    }
                    Err(e) => {
                        error!(error = %e, "pubsub connection failed");
                        break;
                    }
                },
            }
        }
        // Release anyone still waiting before the connection drops.
        for mut op in self.pending.drain(..) {
            op.release(Err(TaskProcError::SubscriptionClosed));
        }
    }

    async fn handle_subscribe(&mut self, channels: Vec<MessageBusChannel>, gate: Gate) {
        let names: Vec<String> = channels.iter().map(|c| c.channel_name()).collect();
        let mut op = PendingOperation {
            direction: Direction::Subscribe,
            remaining: names.iter().cloned().collect(),
            gate: Some(gate),
        };

        // The control channel rides along with the very first subscribe.
        if !self.control_subscribed {
            if let Err(e) = self.connection.subscribe(&self.control_channel).await {
                error!(error = %e, "control channel subscribe failed");
                op.release(Err(e));
                return;
            }
            self.control_subscribed = true;
        }

        for name in &names {
            if let Err(e) = self.connection.subscribe(name).await {
                warn!(channel = %name, error = %e, "subscribe failed");
                op.release(Err(e));
                return;
            }
        }
        self.pending.push(op);
    }

    async fn handle_unsubscribe(&mut self, channels: Vec<MessageBusChannel>, gate: Gate) {
        let covers_all = {
            let active = self.active.lock().expect("active channel set poisoned");
            active.iter().all(|c| channels.contains(c))
        };
        let names: Vec<String> = channels.iter().map(|c| c.channel_name()).collect();
        let mut op = PendingOperation {
            direction: Direction::Unsubscribe,
            remaining: names.iter().cloned().collect(),
            gate: Some(gate),
        };

        for name in &names {
            if let Err(e) = self.connection.unsubscribe(name).await {
                warn!(channel = %name, error = %e, "unsubscribe failed");
                op.release(Err(e));
                return;
            }
        }
        // Nothing left subscribed: the control channel goes too.
        if covers_all && self.control_subscribed {
            if let Err(e) = self.connection.unsubscribe(&self.control_channel).await {
                warn!(error = %e, "control channel unsubscribe failed");
            }
        }
        self.pending.push(op);
    }

    async fn handle_event(&mut self, event: PubSubEvent) {
        match event {
            PubSubEvent::Subscribed(name) => {
                if name != self.control_channel {
                    match MessageBusChannel::from_channel_name(&name) {
                        Ok(channel) => {
                            self.active
                                .lock()
                                .expect("active channel set poisoned")
                                .insert(channel);
                        }
                        Err(_) => warn!(channel = %name, "subscribe confirmed for unknown channel"),
                    }
                }
                self.confirm(Direction::Subscribe, &name);
            }
            PubSubEvent::Unsubscribed(name) => {
                if name == self.control_channel {
                    self.control_subscribed = false;
                } else if let Ok(channel) = MessageBusChannel::from_channel_name(&name) {
                    self.active
                        .lock()
                        .expect("active channel set poisoned")
                        .remove(&channel);
                }
                self.confirm(Direction::Unsubscribe, &name);
            }
            PubSubEvent::Message { channel, fields } => {
                if channel == self.control_channel {
                    self.handle_control_message(fields).await;
                } else {
                    match MessageBusChannel::from_channel_name(&channel) {
                        Ok(channel) => {
                            let _ = self.messages.send(BusMessage { channel, fields });
                        }
                        Err(_) => {
                            warn!(channel = %channel, "message on unknown channel dropped")
                        }
                    }
                }
            }
        }
    }

    /// A control message is an unsubscribe request relayed from off the
    /// driver's context: no payload means everything, otherwise the listed
    /// physical channel names.
    async fn handle_control_message(&mut self, fields: Vec<String>) {
        let names: Vec<String> = if fields.is_empty() {
            self.active
                .lock()
                .expect("active channel set poisoned")
                .iter()
                .map(|c| c.channel_name())
                .collect()
        } else {
            fields
        };
        for name in &names {
            if let Err(e) = self.connection.unsubscribe(name).await {
                warn!(channel = %name, error = %e, "relayed unsubscribe failed");
            }
        }
        if self.control_subscribed {
            let none_left = self
                .active
                .lock()
                .expect("active channel set poisoned")
                .iter()
                .all(|c| names.contains(&c.channel_name()));
            if none_left {
                if let Err(e) = self.connection.unsubscribe(&self.control_channel).await {
                    warn!(error = %e, "control channel unsubscribe failed");
                }
            }
        }
    }

    /// Every pending operation in `direction` drops `name` from its
    /// remaining set; drained operations release their gate. Two in-flight
    /// operations awaiting the same channel are both confirmed.
    fn confirm(&mut self, direction: Direction, name: &str) {
        self.pending.retain_mut(|op| {
            if op.direction != direction {
                return true;
            }
            op.remaining.remove(name);
            if op.remaining.is_empty() {
                op.release(Ok(()));
                false
            } else {
                true
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_store::MemoryStore;
    use tokio::time::timeout as tokio_timeout;

    const WAIT: Duration = Duration::from_secs(2);

    fn store() -> Arc<dyn Store> {
        Arc::new(MemoryStore::new())
    }

    #[tokio::test]
    async fn subscribe_then_publish_raises_message_received() {
        let store = store();
        let bus = MessageBusSubscription::connect(&store).await.unwrap();
        let mut messages = bus.messages();

        bus.subscribe_to_channels(WAIT, &[MessageBusChannel::TaskSubmitted])
            .await
            .unwrap();
        store
            .publish(
                &MessageBusChannel::TaskSubmitted.channel_name(),
                &["task-1".to_string()],
            )
            .await
            .unwrap();

        let received = tokio_timeout(WAIT, messages.recv()).await.unwrap().unwrap();
        assert_eq!(received.channel, MessageBusChannel::TaskSubmitted);
        assert_eq!(received.fields, vec!["task-1".to_string()]);
        bus.close().await;
    }

    #[tokio::test]
    async fn unsubscribed_channel_raises_no_event() {
        let store = store();
        let bus = MessageBusSubscription::connect(&store).await.unwrap();
        let mut messages = bus.messages();

        bus.subscribe_to_channels(
            WAIT,
            &[MessageBusChannel::TaskSubmitted, MessageBusChannel::TaskCanceled],
        )
        .await
        .unwrap();
        assert!(bus
            .unsubscribe_from_channels(WAIT, &[MessageBusChannel::TaskCanceled])
            .await
            .unwrap());

        store
            .publish(&MessageBusChannel::TaskCanceled.channel_name(), &["x".to_string()])
            .await
            .unwrap();
        store
            .publish(
                &MessageBusChannel::TaskSubmitted.channel_name(),
                &["y".to_string()],
            )
            .await
            .unwrap();

        // The still-subscribed channel delivers; the unsubscribed one never
        // did, otherwise it would arrive first in order.
        let received = tokio_timeout(WAIT, messages.recv()).await.unwrap().unwrap();
        assert_eq!(received.channel, MessageBusChannel::TaskSubmitted);
        bus.close().await;
    }

    #[tokio::test]
    async fn active_channels_excludes_the_control_channel() {
        let store = store();
        let bus = MessageBusSubscription::connect(&store).await.unwrap();

        bus.subscribe_to_channels(WAIT, &[MessageBusChannel::MasterChanged])
            .await
            .unwrap();
        assert_eq!(bus.active_channels(), vec![MessageBusChannel::MasterChanged]);
        bus.close().await;
    }

    #[tokio::test]
    async fn subscribing_already_active_channels_is_a_noop() {
        let store = store();
        let bus = MessageBusSubscription::connect(&store).await.unwrap();

        bus.subscribe_to_channels(WAIT, &[MessageBusChannel::TaskSubmitted])
            .await
            .unwrap();
        bus.subscribe_to_channels(WAIT, &[MessageBusChannel::TaskSubmitted])
            .await
            .unwrap();
        assert_eq!(bus.active_channels().len(), 1);
        bus.close().await;
    }

    #[tokio::test]
    async fn unsubscribing_inactive_channels_trivially_succeeds() {
        let store = store();
        let bus = MessageBusSubscription::connect(&store).await.unwrap();
        assert!(bus
            .unsubscribe_from_channels(WAIT, &[MessageBusChannel::TaskCanceled])
            .await
            .unwrap());
        bus.close().await;
    }

    #[tokio::test]
    async fn zero_timeout_is_rejected() {
        let store = store();
        let bus = MessageBusSubscription::connect(&store).await.unwrap();
        let err = bus
            .subscribe_to_channels(Duration::ZERO, &[MessageBusChannel::TaskSubmitted])
            .await
            .unwrap_err();
        assert!(matches!(err, TaskProcError::InvalidArgument(_)));
        bus.close().await;
    }

    #[tokio::test]
    async fn calls_after_close_fail_fast() {
        let store = store();
        let bus = MessageBusSubscription::connect(&store).await.unwrap();
        bus.close().await;
        let err = bus
            .subscribe_to_channels(WAIT, &[MessageBusChannel::TaskSubmitted])
            .await
            .unwrap_err();
        assert!(matches!(err, TaskProcError::SubscriptionClosed));
    }

    #[tokio::test]
    async fn concurrent_subscribes_to_the_same_channel_both_confirm() {
        let store = store();
        let bus = Arc::new(MessageBusSubscription::connect(&store).await.unwrap());

        let first = {
            let bus = bus.clone();
            tokio::spawn(async move {
                bus.subscribe_to_channels(WAIT, &[MessageBusChannel::TaskSubmitted])
                    .await
            })
        };
        let second = {
            let bus = bus.clone();
            tokio::spawn(async move {
                bus.subscribe_to_channels(WAIT, &[MessageBusChannel::TaskSubmitted])
                    .await
            })
        };
        first.await.unwrap().unwrap();
        second.await.unwrap().unwrap();
        assert_eq!(bus.active_channels(), vec![MessageBusChannel::TaskSubmitted]);
        bus.close().await;
    }

    /// Pub/sub double that acknowledges commands but only confirms as many
    /// subscribes as scripted, and optionally no unsubscribes at all.
    struct ScriptedPubSub {
        subscribe_confirmations_left: usize,
        confirm_unsubscribes: bool,
        sender: mpsc::UnboundedSender<PubSubEvent>,
        receiver: mpsc::UnboundedReceiver<PubSubEvent>,
    }

    impl ScriptedPubSub {
        fn new(subscribe_confirmations_left: usize, confirm_unsubscribes: bool) -> Box<Self> {
            let (sender, receiver) = mpsc::unbounded_channel();
            Box::new(Self {
                subscribe_confirmations_left,
                confirm_unsubscribes,
                sender,
                receiver,
            })
        }
    }

    #[async_trait::async_trait]
    impl taskproc_domain::PubSubConnection for ScriptedPubSub {
        async fn subscribe(&mut self, channel: &str) -> TaskProcResult<()> {
            if self.subscribe_confirmations_left > 0 {
                self.subscribe_confirmations_left -= 1;
                let _ = self
                    .sender
                    .send(PubSubEvent::Subscribed(channel.to_string()));
            }
            Ok(())
        }

        async fn unsubscribe(&mut self, channel: &str) -> TaskProcResult<()> {
            if self.confirm_unsubscribes {
                let _ = self
                    .sender
                    .send(PubSubEvent::Unsubscribed(channel.to_string()));
            }
            Ok(())
        }

        async fn next_event(&mut self) -> TaskProcResult<Option<PubSubEvent>> {
            Ok(self.receiver.recv().await)
        }
    }

    #[tokio::test]
    async fn subscribe_timeout_raises_and_keeps_partial_success() {
        // Enough confirmations for the control channel and the first real
        // channel; the second stays unconfirmed.
        let bus = MessageBusSubscription::from_connection(ScriptedPubSub::new(2, true));

        let err = bus
            .subscribe_to_channels(
                Duration::from_millis(100),
                &[MessageBusChannel::TaskSubmitted, MessageBusChannel::TaskCanceled],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TaskProcError::SubscribeTimeout { .. }));

        // The confirmed channel stays subscribed; nothing is rolled back.
        assert_eq!(bus.active_channels(), vec![MessageBusChannel::TaskSubmitted]);
        bus.close().await;
    }

    #[tokio::test]
    async fn unsubscribe_timeout_returns_false_without_throwing() {
        let bus = MessageBusSubscription::from_connection(ScriptedPubSub::new(2, false));

        bus.subscribe_to_channels(WAIT, &[MessageBusChannel::TaskSubmitted])
            .await
            .unwrap();

        let confirmed = bus
            .unsubscribe_from_channels(
                Duration::from_millis(100),
                &[MessageBusChannel::TaskSubmitted],
            )
            .await
            .unwrap();
        assert!(!confirmed);
        // Best effort: the channel is still counted as active until the
        // confirmation actually arrives.
        assert_eq!(bus.active_channels(), vec![MessageBusChannel::TaskSubmitted]);
        bus.close().await;
    }

    #[tokio::test]
    async fn control_message_performs_a_relayed_unsubscribe() {
        let store = store();
        let bus = MessageBusSubscription::connect(&store).await.unwrap();

        bus.subscribe_to_channels(WAIT, &[MessageBusChannel::TaskSubmitted])
            .await
            .unwrap();

        // Empty payload on the control channel: unsubscribe from everything.
        store.publish(bus.control_channel(), &[]).await.unwrap();

        let deadline = tokio::time::Instant::now() + WAIT;
        while !bus.active_channels().is_empty() {
            assert!(tokio::time::Instant::now() < deadline, "relay never applied");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        bus.close().await;
    }
}
