//! Pub/sub transport runtime.
//!
//! One actor task owns the live session and its state machine. Each session has a
//! publish worker (waits for the connection, then drains a bounded queue) and, once
//! subscribed, a decode worker fed by a second bounded queue. Every broker callback
//! is stamped with its session's generation; callbacks from an older session are
//! ignored.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use xwlink_core::engine::deliver_frame;
use xwlink_core::protocol::{tagged, Item, TAG_INVITE, TAG_MESSAGE};
use xwlink_core::pubsub::{
    ctrl_topic, decode_packet, device_topic, encode_packet, stream_topic, subscriptions, ConnectionState,
    ControlNotice, LastWill, SendStats, SessionState, LWT_TOPIC, TIMER_KEY,
};
use xwlink_core::store::Envelope;
use xwlink_core::{
    BackoffPolicy, Destination, DeviceId, Direction, EnvelopeStore, PayloadSink, Scheduler, StatusSink, StreamId,
    TimerClient, TransportKind,
};

use crate::broker::{BrokerClient, BrokerEvent, BrokerFactory, ConnectOptions, SessionEvent};

const CONNECT_POLL: Duration = Duration::from_millis(250);

type Key = (DeviceId, StreamId);

#[derive(Debug, Clone)]
pub struct PubSubSettings {
    pub device: DeviceId,
    pub qos: u8,
    pub policy: BackoffPolicy,
    /// Publish worker exits after this much cumulative time without a connection.
    pub idle_exit: Duration,
    pub queue_capacity: usize,
}

enum Command {
    Flush(Key),
    Tick,
    WorkerIdle { generation: u64 },
    Stats(oneshot::Sender<SendStats>),
    State(oneshot::Sender<Option<ConnectionState>>),
    Shutdown(oneshot::Sender<()>),
}

struct Outbound {
    token: u64,
    topic: String,
    payload: Vec<u8>,
}

/// Cheap handle for callers. Sends never block and never fail on a down transport.
#[derive(Clone)]
pub struct PubSubHandle {
    device: DeviceId,
    store: Arc<EnvelopeStore<Key>>,
    cmd_tx: mpsc::UnboundedSender<Command>,
}

impl PubSubHandle {
    pub fn device_id(&self) -> DeviceId {
        self.device
    }

    /// Queue a game message for `to` on `stream`. Returns bytes pending for that pair.
    pub fn enqueue_outbound(&self, to: DeviceId, stream: StreamId, bytes: &[u8]) -> usize {
        self.enqueue_item(to, stream, tagged(TAG_MESSAGE, bytes))
    }

    /// Queue an invitation for a new `stream`; published on the device topic.
    pub fn enqueue_invite(&self, to: DeviceId, stream: StreamId, invite: &[u8]) -> usize {
        self.enqueue_item(to, stream, tagged(TAG_INVITE, invite))
    }

    fn enqueue_item(&self, to: DeviceId, stream: StreamId, item: Vec<u8>) -> usize {
        let key = (to, stream);
        let total = self.store.add_tagged_if_absent(&key, item);
        if self.cmd_tx.send(Command::Flush(key)).is_err() {
            tracing::debug!(dest = %to, "pubsub transport stopped; payload stays queued");
        }
        total
    }

    pub fn pending_bytes(&self, to: DeviceId, stream: StreamId) -> usize {
        self.store.snapshot_for(&(to, stream)).len_bytes()
    }

    pub async fn stats(&self) -> SendStats {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Stats(tx)).is_err() {
            return SendStats::default();
        }
        rx.await.unwrap_or_default()
    }

    /// State of the current session, `None` if there is none.
    pub async fn state(&self) -> Option<ConnectionState> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx.send(Command::State(tx)).ok()?;
        rx.await.ok().flatten()
    }

    /// Tear down the session, join its workers and deregister from the scheduler.
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Shutdown(tx)).is_ok() {
            let _ = rx.await;
        }
    }
}

/// Scheduler hook: a fire becomes a `Tick` for the actor.
struct PubSubTimer {
    cmd_tx: mpsc::UnboundedSender<Command>,
    policy: BackoffPolicy,
}

impl TimerClient for PubSubTimer {
    fn timer_fired(&self) {
        let _ = self.cmd_tx.send(Command::Tick);
    }

    fn increment_backoff(&self, prev_ms: u64) -> u64 {
        self.policy.next(prev_ms)
    }
}

struct Session {
    generation: u64,
    client: Arc<dyn BrokerClient>,
    state: SessionState,
    /// Last connect attempt failed; the next send or tick rebuilds.
    connect_failed: bool,
    /// Built by a scheduler tick, whose own backoff growth already covers a failure.
    from_tick: bool,
    publish_tx: mpsc::Sender<Outbound>,
    publish_task: JoinHandle<()>,
    inbound_tx: Option<mpsc::Sender<(String, Vec<u8>)>>,
    decode_task: Option<JoinHandle<()>>,
}

/// Shared with the decode worker.
struct InboundCtx {
    device: DeviceId,
    payload_sink: Arc<dyn PayloadSink>,
    status_sink: Arc<dyn StatusSink>,
    scheduler: Arc<Scheduler>,
    store: Arc<EnvelopeStore<Key>>,
    cmd_tx: mpsc::UnboundedSender<Command>,
    floor_ms: u64,
}

struct Actor {
    settings: PubSubSettings,
    factory: Arc<dyn BrokerFactory>,
    scheduler: Arc<Scheduler>,
    status_sink: Arc<dyn StatusSink>,
    store: Arc<EnvelopeStore<Key>>,
    inbound: Arc<InboundCtx>,
    cmd_tx: mpsc::UnboundedSender<Command>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    session: Option<Session>,
    generation: u64,
    needs_resend: bool,
    inflight: HashMap<u64, Envelope<Key>>,
    busy: HashSet<Key>,
    dirty: HashSet<Key>,
    next_token: u64,
    stats: SendStats,
}

/// Start the transport. The session is created immediately so inbound traffic flows.
pub fn spawn(
    settings: PubSubSettings,
    factory: Arc<dyn BrokerFactory>,
    scheduler: Arc<Scheduler>,
    payload_sink: Arc<dyn PayloadSink>,
    status_sink: Arc<dyn StatusSink>,
) -> (PubSubHandle, JoinHandle<()>) {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let store = Arc::new(EnvelopeStore::new());
    scheduler.register_client(
        TIMER_KEY,
        Arc::new(PubSubTimer {
            cmd_tx: cmd_tx.clone(),
            policy: settings.policy,
        }),
    );
    let inbound = Arc::new(InboundCtx {
        device: settings.device,
        payload_sink,
        status_sink: status_sink.clone(),
        scheduler: scheduler.clone(),
        store: store.clone(),
        cmd_tx: cmd_tx.clone(),
        floor_ms: settings.policy.floor_ms,
    });
    let handle = PubSubHandle {
        device: settings.device,
        store: store.clone(),
        cmd_tx: cmd_tx.clone(),
    };
    let actor = Actor {
        settings,
        factory,
        scheduler,
        status_sink,
        store,
        inbound,
        cmd_tx,
        events_tx,
        session: None,
        generation: 0,
        needs_resend: false,
        inflight: HashMap::new(),
        busy: HashSet::new(),
        dirty: HashSet::new(),
        next_token: 1,
        stats: SendStats::default(),
    };
    let task = tokio::spawn(actor.run(cmd_rx, events_rx));
    (handle, task)
}

impl Actor {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::UnboundedReceiver<Command>,
        mut events_rx: mpsc::UnboundedReceiver<SessionEvent>,
    ) {
        self.build_session(false);
        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    None => break,
                    Some(Command::Shutdown(done)) => {
                        self.close_session().await;
                        self.scheduler.deregister_client(TIMER_KEY);
                        let _ = done.send(());
                        break;
                    }
                    Some(cmd) => self.on_command(cmd).await,
                },
                Some(ev) = events_rx.recv() => self.on_event(ev).await,
            }
        }
        self.scheduler.deregister_client(TIMER_KEY);
        tracing::info!(device = %self.settings.device, "pubsub transport stopped");
    }

    async fn on_command(&mut self, cmd: Command) {
        match cmd {
            Command::Flush(key) => {
                if self.session.as_ref().map_or(true, |s| s.connect_failed) {
                    self.close_session().await;
                    self.build_session(false);
                }
                self.submit(key);
            }
            Command::Tick => {
                let ready = self
                    .session
                    .as_ref()
                    .map_or(false, |s| s.state.state() == ConnectionState::Ready);
                if ready {
                    self.resend_all();
                } else {
                    self.close_session().await;
                    self.build_session(true);
                }
            }
            Command::WorkerIdle { generation } => {
                if self.session.as_ref().map(|s| s.generation) == Some(generation) {
                    tracing::info!(generation, "publish worker idle; dropping session");
                    self.close_session().await;
                    self.needs_resend = true;
                    if self.store.has_any_data() {
                        self.bump_backoff();
                    }
                }
            }
            Command::Stats(reply) => {
                let _ = reply.send(self.stats);
            }
            Command::State(reply) => {
                let _ = reply.send(self.session.as_ref().map(|s| s.state.state()));
            }
            Command::Shutdown(_) => {}
        }
    }

    async fn on_event(&mut self, ev: SessionEvent) {
        let current = self.session.as_ref().map(|s| s.generation);
        if current != Some(ev.generation) {
            tracing::debug!(generation = ev.generation, ?current, "stale session event ignored");
            return;
        }
        match ev.event {
            BrokerEvent::ConnectComplete { ok: true } => self.on_connected(),
            BrokerEvent::ConnectComplete { ok: false } => {
                tracing::warn!(generation = ev.generation, "connect failed");
                self.report(Direction::Outbound, false);
                let from_tick = match self.session.as_mut() {
                    Some(s) => {
                        s.connect_failed = true;
                        s.from_tick
                    }
                    None => false,
                };
                self.needs_resend = true;
                if !from_tick {
                    self.bump_backoff();
                }
            }
            BrokerEvent::SubscribeComplete { ok } => {
                if ok {
                    self.on_subscribed();
                } else {
                    tracing::warn!("subscribe failed");
                    self.report(Direction::Inbound, false);
                    self.bump_backoff();
                }
            }
            BrokerEvent::PublishComplete { token, ok } => self.on_published(token, ok),
            BrokerEvent::MessageArrived { topic, payload } => {
                self.stats.received += 1;
                let Some(tx) = self.session.as_ref().and_then(|s| s.inbound_tx.clone()) else {
                    tracing::debug!(%topic, "message before subscribe completed; dropped");
                    return;
                };
                if let Err(e) = tx.try_send((topic, payload)) {
                    tracing::warn!(error = %e, "inbound queue full; message dropped");
                }
            }
            BrokerEvent::ConnectionLost => {
                tracing::warn!(generation = ev.generation, "connection lost");
                self.stats.disconnects += 1;
                self.report(Direction::Inbound, false);
                self.close_session().await;
                self.needs_resend = true;
                self.build_session(false);
            }
        }
    }

    fn build_session(&mut self, from_tick: bool) {
        self.generation += 1;
        let generation = self.generation;
        let client = self.factory.create(generation, self.events_tx.clone());
        let (publish_tx, publish_rx) = mpsc::channel(self.settings.queue_capacity.max(1));
        let publish_task = tokio::spawn(publish_worker(
            generation,
            client.clone(),
            publish_rx,
            self.settings.qos,
            self.settings.idle_exit,
            self.cmd_tx.clone(),
            self.events_tx.clone(),
        ));
        let mut state = SessionState::new(generation);
        if let Err(e) = state.advance(ConnectionState::Idle, ConnectionState::Connecting) {
            tracing::error!(error = %e, "fresh session not idle");
        }
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let opts = ConnectOptions {
            client_id: self.settings.device.to_string(),
            will_topic: LWT_TOPIC.to_string(),
            will_payload: LastWill::new(self.settings.device, ts).to_json(),
            keep_alive: Duration::from_secs(60),
            persistent_session: true,
            auto_reconnect: true,
        };
        self.stats.sessions += 1;
        self.session = Some(Session {
            generation,
            client: client.clone(),
            state,
            connect_failed: false,
            from_tick,
            publish_tx,
            publish_task,
            inbound_tx: None,
            decode_task: None,
        });
        tracing::debug!(generation, "pubsub session created");
        if let Err(e) = client.connect(&opts) {
            tracing::warn!(error = %e, "connect request rejected");
            self.report(Direction::Outbound, false);
            if let Some(s) = self.session.as_mut() {
                s.connect_failed = true;
            }
        }
    }

    fn on_connected(&mut self) {
        let device = self.settings.device;
        let qos = self.settings.qos;
        let Some(s) = self.session.as_mut() else { return };
        if let Err(e) = s.state.advance(ConnectionState::Connecting, ConnectionState::Connected) {
            tracing::warn!(error = %e, "unexpected connect completion");
            return;
        }
        s.connect_failed = false;
        if let Err(e) = s.state.advance(ConnectionState::Connected, ConnectionState::Subscribing) {
            tracing::warn!(error = %e, "cannot start subscribing");
            return;
        }
        if let Err(e) = s.client.subscribe(&subscriptions(device), qos) {
            tracing::warn!(error = %e, "subscribe request rejected");
            self.report(Direction::Inbound, false);
        }
        if std::mem::take(&mut self.needs_resend) {
            self.resend_all();
        }
    }

    fn on_subscribed(&mut self) {
        let capacity = self.settings.queue_capacity.max(1);
        let ctx = self.inbound.clone();
        let Some(s) = self.session.as_mut() else { return };
        if let Err(e) = s.state.advance(ConnectionState::Subscribing, ConnectionState::Ready) {
            tracing::warn!(error = %e, "unexpected subscribe completion");
            return;
        }
        let (tx, rx) = mpsc::channel(capacity);
        s.inbound_tx = Some(tx);
        s.decode_task = Some(tokio::spawn(decode_worker(ctx, rx)));
        tracing::info!(generation = s.generation, "pubsub session ready");
    }

    fn on_published(&mut self, token: u64, ok: bool) {
        let Some(envelope) = self.inflight.remove(&token) else {
            tracing::debug!(token, "completion for unknown token");
            return;
        };
        let key = envelope.key;
        self.busy.remove(&key);
        if ok {
            self.store.remove_confirmed(&key, &envelope.items);
            self.stats.published += 1;
            self.report(Direction::Outbound, true);
            self.scheduler.set_backoff(TIMER_KEY, self.settings.policy.floor_ms);
            if self.dirty.remove(&key) || self.store.has_data(&key) {
                self.submit(key);
            }
        } else {
            tracing::warn!(dest = %key.0, stream = %key.1, "publish failed");
            self.stats.failed += 1;
            self.report(Direction::Outbound, false);
            self.dirty.remove(&key);
            self.needs_resend = true;
            self.bump_backoff();
        }
    }

    /// Queue the current envelope for `key` unless one is already in flight.
    fn submit(&mut self, key: Key) {
        if self.busy.contains(&key) {
            self.dirty.insert(key);
            return;
        }
        let envelope = self.store.snapshot_for(&key);
        if envelope.is_empty() {
            return;
        }
        let Some(s) = self.session.as_ref() else {
            self.needs_resend = true;
            return;
        };
        let (dest, stream) = key;
        let payload = match encode_packet(self.settings.device, stream, &envelope.items) {
            Ok(p) => p,
            Err(e) => {
                tracing::error!(error = %e, %dest, %stream, "envelope cannot be framed; dropping it");
                self.store.remove_confirmed(&key, &envelope.items);
                return;
            }
        };
        let token = self.next_token;
        self.next_token += 1;
        let out = Outbound {
            token,
            topic: topic_for(dest, stream, &envelope.items),
            payload,
        };
        match s.publish_tx.try_send(out) {
            Ok(()) => {
                self.busy.insert(key);
                self.inflight.insert(token, envelope);
            }
            Err(e) => {
                tracing::warn!(error = %e, %dest, "publish queue unavailable; will resend");
                self.needs_resend = true;
            }
        }
    }

    fn resend_all(&mut self) {
        for key in self.store.pending_keys() {
            self.submit(key);
        }
    }

    fn bump_backoff(&self) {
        let current = self.scheduler.record(TIMER_KEY).map_or(0, |r| r.backoff_ms);
        let next = self.settings.policy.next(current);
        tracing::debug!(current, next, "pubsub backoff");
        self.scheduler.set_backoff(TIMER_KEY, next);
    }

    fn report(&self, direction: Direction, success: bool) {
        self.status_sink
            .on_delivery_status(TransportKind::PubSub, direction, success);
    }

    /// Best-effort unsubscribe, disconnect, close; then stop and join the workers.
    async fn close_session(&mut self) {
        let Some(mut s) = self.session.take() else { return };
        s.state.close();
        let subs = subscriptions(self.settings.device);
        let steps = [
            ("unsubscribe", s.client.unsubscribe(&subs)),
            ("disconnect", s.client.disconnect()),
            ("close", s.client.close()),
        ];
        for (step, result) in steps {
            if let Err(e) = result {
                tracing::debug!(generation = s.generation, step, error = %e, "teardown step failed");
            }
        }
        drop(s.publish_tx);
        drop(s.inbound_tx);
        s.publish_task.abort();
        let _ = s.publish_task.await;
        if let Some(t) = s.decode_task {
            t.abort();
            let _ = t.await;
        }
        // Anything in flight stays in the store and goes out with the next session.
        if !self.inflight.is_empty() {
            self.needs_resend = true;
        }
        self.inflight.clear();
        self.busy.clear();
        self.dirty.clear();
        tracing::debug!(generation = s.generation, "pubsub session closed");
    }
}

/// Invitation-only envelopes go to the device topic; everything else to the stream topic.
fn topic_for(dest: DeviceId, stream: StreamId, items: &[Vec<u8>]) -> String {
    let invites_only = items
        .iter()
        .all(|i| matches!(Item::parse(i), Some(Item::Invite(_))));
    if invites_only {
        device_topic(dest)
    } else {
        stream_topic(dest, stream)
    }
}

async fn publish_worker(
    generation: u64,
    client: Arc<dyn BrokerClient>,
    mut rx: mpsc::Receiver<Outbound>,
    qos: u8,
    idle_exit: Duration,
    cmd_tx: mpsc::UnboundedSender<Command>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
) {
    let mut disconnected = Duration::ZERO;
    while let Some(out) = rx.recv().await {
        while !client.is_connected() {
            if disconnected >= idle_exit {
                let _ = cmd_tx.send(Command::WorkerIdle { generation });
                return;
            }
            tokio::time::sleep(CONNECT_POLL).await;
            disconnected += CONNECT_POLL;
        }
        tracing::debug!(topic = %out.topic, token = out.token, len = out.payload.len(), "publishing");
        if let Err(e) = client.publish(out.token, &out.topic, &out.payload, qos, true) {
            tracing::warn!(topic = %out.topic, error = %e, "publish rejected");
            let _ = events_tx.send(SessionEvent {
                generation,
                event: BrokerEvent::PublishComplete {
                    token: out.token,
                    ok: false,
                },
            });
        }
    }
}

async fn decode_worker(ctx: Arc<InboundCtx>, mut rx: mpsc::Receiver<(String, Vec<u8>)>) {
    let ctrl = ctrl_topic(ctx.device);
    while let Some((topic, payload)) = rx.recv().await {
        if topic == ctrl {
            match serde_json::from_slice::<ControlNotice>(&payload) {
                Ok(n) => ctx.status_sink.on_control_notice(&n.title, &n.msg),
                Err(e) => tracing::warn!(error = %e, "bad control payload"),
            }
            continue;
        }
        let (from, frame) = match decode_packet(&payload) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(%topic, error = %e, "undecodable packet dropped");
                continue;
            }
        };
        if from == ctx.device {
            continue;
        }
        let replies = deliver_frame(&frame, &Destination::PubSub(from), ctx.payload_sink.as_ref());
        ctx.status_sink
            .on_delivery_status(TransportKind::PubSub, Direction::Inbound, true);
        ctx.scheduler.set_backoff(TIMER_KEY, ctx.floor_ms);
        if !replies.is_empty() {
            let key = (from, frame.stream);
            for r in replies {
                ctx.store.add_tagged_if_absent(&key, r);
            }
            let _ = ctx.cmd_tx.send(Command::Flush(key));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::LoopbackHub;
    use std::sync::mpsc::Receiver;
    use xwlink_core::engine::{EngineEvent, EventSink};
    use xwlink_core::scheduler::{AlarmSink, SystemClock};
    use xwlink_core::MemoryKvStore;

    struct NoAlarm;

    impl AlarmSink for NoAlarm {
        fn arm(&self, _at_ms: u64) {}
        fn cancel(&self) {}
    }

    struct Node {
        handle: PubSubHandle,
        sink: Arc<EventSink>,
        events: Receiver<EngineEvent>,
        scheduler: Arc<Scheduler>,
    }

    fn node(hub: &LoopbackHub, dev: u64) -> Node {
        let scheduler = Arc::new(Scheduler::load(
            Arc::new(MemoryKvStore::new()),
            Arc::new(NoAlarm),
            Arc::new(SystemClock),
        ));
        let (sink, events) = EventSink::new();
        let sink = Arc::new(sink);
        let settings = PubSubSettings {
            device: DeviceId(dev),
            qos: 1,
            policy: BackoffPolicy::new(1_000, 60_000),
            idle_exit: Duration::from_secs(10),
            queue_capacity: 16,
        };
        let (handle, _task) = spawn(
            settings,
            Arc::new(hub.clone()),
            scheduler.clone(),
            sink.clone(),
            sink.clone(),
        );
        Node {
            handle,
            sink,
            events,
            scheduler,
        }
    }

    async fn wait_for<F: FnMut() -> bool>(mut f: F) -> bool {
        for _ in 0..300 {
            if f() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    async fn wait_ready(n: &Node) {
        for _ in 0..300 {
            if n.handle.state().await == Some(ConnectionState::Ready) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("session never became ready");
    }

    fn next_matching(rx: &Receiver<EngineEvent>, pred: impl Fn(&EngineEvent) -> bool) -> Option<EngineEvent> {
        while let Ok(e) = rx.try_recv() {
            if pred(&e) {
                return Some(e);
            }
        }
        None
    }

    #[tokio::test]
    async fn message_delivered_and_retired() {
        let hub = LoopbackHub::new();
        let a = node(&hub, 0xA);
        let b = node(&hub, 0xB);
        b.sink.add_stream(StreamId(7));
        wait_ready(&a).await;
        wait_ready(&b).await;

        a.handle.enqueue_outbound(DeviceId(0xB), StreamId(7), b"move");
        let mut got = None;
        assert!(
            wait_for(|| {
                got = next_matching(&b.events, |e| matches!(e, EngineEvent::Inbound { .. }));
                got.is_some()
            })
            .await
        );
        assert_eq!(
            got,
            Some(EngineEvent::Inbound {
                from: Destination::PubSub(DeviceId(0xA)),
                stream: StreamId(7),
                bytes: b"move".to_vec()
            })
        );
        assert!(wait_for(|| a.handle.pending_bytes(DeviceId(0xB), StreamId(7)) == 0).await);
        assert_eq!(a.handle.stats().await.published, 1);
        // A success resets the health check to the floor.
        assert_eq!(a.scheduler.record(TIMER_KEY).map(|r| r.backoff_ms), Some(1_000));
    }

    #[tokio::test]
    async fn unknown_stream_gets_nogame_back() {
        let hub = LoopbackHub::new();
        let a = node(&hub, 0xA);
        let b = node(&hub, 0xB);
        wait_ready(&a).await;
        wait_ready(&b).await;

        a.handle.enqueue_outbound(DeviceId(0xB), StreamId(9), b"x");
        assert!(
            wait_for(|| next_matching(&a.events, |e| matches!(
                e,
                EngineEvent::StreamGone { stream: StreamId(9), .. }
            ))
            .is_some())
            .await
        );
    }

    #[tokio::test]
    async fn invite_goes_to_device_topic() {
        let hub = LoopbackHub::new();
        let a = node(&hub, 0xA);
        let b = node(&hub, 0xB);
        wait_ready(&a).await;
        wait_ready(&b).await;
        a.handle.enqueue_invite(DeviceId(0xB), StreamId(3), b"join me");
        assert!(
            wait_for(|| next_matching(&b.events, |e| matches!(e, EngineEvent::Invite { .. })).is_some())
                .await
        );
        assert!(hub.retained(&device_topic(DeviceId(0xB))).is_some());
    }

    #[tokio::test]
    async fn connect_failures_grow_backoff() {
        let hub = LoopbackHub::new();
        hub.set_online(false);
        let a = node(&hub, 0xA);
        assert!(wait_for(|| a.scheduler.record(TIMER_KEY).map(|r| r.backoff_ms) == Some(1_000)).await);
        let first = a.scheduler.record(TIMER_KEY).map_or(0, |r| r.next_fire_ms);

        // A send rebuilds the failed session; the second failure grows the interval.
        a.handle.enqueue_outbound(DeviceId(0xB), StreamId(1), b"m");
        assert!(wait_for(|| a.scheduler.record(TIMER_KEY).map(|r| r.backoff_ms) == Some(1_500)).await);
        let rec = a.scheduler.record(TIMER_KEY).unwrap_or_default();
        assert!(rec.next_fire_ms >= first);
        assert!(a.handle.pending_bytes(DeviceId(0xB), StreamId(1)) > 0);
        assert_eq!(a.handle.state().await, Some(ConnectionState::Connecting));
    }

    #[tokio::test]
    async fn resend_after_outage() {
        let hub = LoopbackHub::new();
        let a = node(&hub, 0xA);
        let b = node(&hub, 0xB);
        b.sink.add_stream(StreamId(4));
        wait_ready(&a).await;
        wait_ready(&b).await;

        hub.set_online(false);
        tokio::time::sleep(Duration::from_millis(50)).await;
        a.handle.enqueue_outbound(DeviceId(0xB), StreamId(4), b"late");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(a.handle.pending_bytes(DeviceId(0xB), StreamId(4)) > 0);

        hub.set_online(true);
        a.scheduler.fire_all();
        b.scheduler.fire_all();
        wait_ready(&a).await;
        wait_ready(&b).await;
        assert!(
            wait_for(|| next_matching(&b.events, |e| matches!(e, EngineEvent::Inbound { .. })).is_some())
                .await
        );
        assert!(a.handle.stats().await.disconnects >= 1);
    }

    #[tokio::test]
    async fn control_notice_and_last_will() {
        let hub = LoopbackHub::new();
        let a = node(&hub, 0xA);
        wait_ready(&a).await;
        hub.inject(&ctrl_topic(DeviceId(0xA)), br#"{"msg":"maintenance","title":"Heads up"}"#, false);
        assert!(
            wait_for(|| next_matching(&a.events, |e| matches!(e, EngineEvent::Control { .. })).is_some())
                .await
        );

        hub.kick(&DeviceId(0xA).to_string());
        let will: serde_json::Value = serde_json::from_slice(&hub.retained(LWT_TOPIC).unwrap_or_default())
            .unwrap_or(serde_json::Value::Null);
        assert_eq!(will["devid"], DeviceId(0xA).to_string());
        // The lost connection is replaced by a new session.
        let mut replaced = false;
        for _ in 0..300 {
            if a.handle.stats().await.sessions >= 2 && a.handle.state().await == Some(ConnectionState::Ready) {
                replaced = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(replaced);
    }

    #[tokio::test]
    async fn shutdown_deregisters() {
        let hub = LoopbackHub::new();
        let a = node(&hub, 0xA);
        wait_ready(&a).await;
        a.scheduler.set_backoff(TIMER_KEY, 5_000);
        a.handle.shutdown().await;
        assert!(a.scheduler.record(TIMER_KEY).is_none());
        assert_eq!(a.handle.state().await, None);
        // Sends after shutdown still queue without blocking.
        assert!(a.handle.enqueue_outbound(DeviceId(1), StreamId(1), b"z") > 0);
    }
}
