//! Broker client seam for the pub/sub transport, plus an in-process loopback broker.
//!
//! Client calls are non-blocking; results come back as [`SessionEvent`]s stamped
//! with the generation of the session that created the client.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::sync::mpsc::UnboundedSender;
use xwlink_core::pubsub::topic_matches;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum BrokerError {
    #[error("not connected")]
    NotConnected,
    #[error("client closed")]
    Closed,
    #[error("rejected: {0}")]
    Rejected(String),
}

/// Options for one connect attempt.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub client_id: String,
    pub will_topic: String,
    pub will_payload: Vec<u8>,
    pub keep_alive: Duration,
    /// Keep subscriptions and queued QoS>0 messages across reconnects.
    pub persistent_session: bool,
    pub auto_reconnect: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerEvent {
    ConnectComplete { ok: bool },
    SubscribeComplete { ok: bool },
    PublishComplete { token: u64, ok: bool },
    MessageArrived { topic: String, payload: Vec<u8> },
    ConnectionLost,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEvent {
    pub generation: u64,
    pub event: BrokerEvent,
}

pub trait BrokerClient: Send + Sync {
    fn connect(&self, opts: &ConnectOptions) -> Result<(), BrokerError>;
    fn subscribe(&self, filters: &[String], qos: u8) -> Result<(), BrokerError>;
    fn publish(&self, token: u64, topic: &str, payload: &[u8], qos: u8, retain: bool) -> Result<(), BrokerError>;
    fn unsubscribe(&self, filters: &[String]) -> Result<(), BrokerError>;
    fn disconnect(&self) -> Result<(), BrokerError>;
    fn close(&self) -> Result<(), BrokerError>;
    fn is_connected(&self) -> bool;
}

/// Creates one client per session.
pub trait BrokerFactory: Send + Sync {
    fn create(&self, generation: u64, events: UnboundedSender<SessionEvent>) -> Arc<dyn BrokerClient>;
}

struct ClientState {
    client_id: Mutex<String>,
    generation: u64,
    events: UnboundedSender<SessionEvent>,
    connected: AtomicBool,
    closed: AtomicBool,
    filters: Mutex<Vec<String>>,
    will: Mutex<Option<(String, Vec<u8>)>>,
}

impl ClientState {
    fn emit(&self, event: BrokerEvent) {
        let _ = self.events.send(SessionEvent {
            generation: self.generation,
            event,
        });
    }

    fn wants(&self, topic: &str) -> bool {
        self.connected.load(Ordering::SeqCst)
            && lock(&self.filters).iter().any(|f| topic_matches(f, topic))
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

struct HubInner {
    online: bool,
    retained: BTreeMap<String, Vec<u8>>,
    clients: Vec<Weak<ClientState>>,
}

/// In-process broker with retained messages and `+`/`#` filters. Cloning shares the hub.
#[derive(Clone)]
pub struct LoopbackHub {
    inner: Arc<Mutex<HubInner>>,
}

impl LoopbackHub {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(HubInner {
                online: true,
                retained: BTreeMap::new(),
                clients: Vec::new(),
            })),
        }
    }

    /// Going offline drops every connection (each client sees `ConnectionLost`).
    pub fn set_online(&self, online: bool) {
        let dropped: Vec<Arc<ClientState>> = {
            let mut inner = lock(&self.inner);
            inner.online = online;
            if online {
                return;
            }
            inner.clients.iter().filter_map(Weak::upgrade).collect()
        };
        for c in dropped {
            if c.connected.swap(false, Ordering::SeqCst) {
                c.emit(BrokerEvent::ConnectionLost);
            }
        }
    }

    /// Abruptly drop one client: it sees `ConnectionLost` and its will is published.
    pub fn kick(&self, client_id: &str) {
        let victims: Vec<Arc<ClientState>> = lock(&self.inner)
            .clients
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|c| *lock(&c.client_id) == client_id)
            .collect();
        for c in victims {
            if c.connected.swap(false, Ordering::SeqCst) {
                c.emit(BrokerEvent::ConnectionLost);
                if let Some((topic, payload)) = lock(&c.will).take() {
                    self.route(&topic, &payload, true);
                }
            }
        }
    }

    /// Publish as the broker itself (operator tooling).
    pub fn inject(&self, topic: &str, payload: &[u8], retain: bool) {
        self.route(topic, payload, retain);
    }

    pub fn retained(&self, topic: &str) -> Option<Vec<u8>> {
        lock(&self.inner).retained.get(topic).cloned()
    }

    fn is_online(&self) -> bool {
        lock(&self.inner).online
    }

    fn route(&self, topic: &str, payload: &[u8], retain: bool) {
        let targets: Vec<Arc<ClientState>> = {
            let mut inner = lock(&self.inner);
            if retain {
                if payload.is_empty() {
                    inner.retained.remove(topic);
                } else {
                    inner.retained.insert(topic.to_string(), payload.to_vec());
                }
            }
            inner.clients.retain(|w| w.strong_count() > 0);
            inner.clients.iter().filter_map(Weak::upgrade).collect()
        };
        for c in targets.iter().filter(|c| c.wants(topic)) {
            c.emit(BrokerEvent::MessageArrived {
                topic: topic.to_string(),
                payload: payload.to_vec(),
            });
        }
    }

    fn retained_matching(&self, filters: &[String]) -> Vec<(String, Vec<u8>)> {
        lock(&self.inner)
            .retained
            .iter()
            .filter(|(t, _)| filters.iter().any(|f| topic_matches(f, t)))
            .map(|(t, p)| (t.clone(), p.clone()))
            .collect()
    }
}

impl Default for LoopbackHub {
    fn default() -> Self {
        Self::new()
    }
}

impl BrokerFactory for LoopbackHub {
    fn create(&self, generation: u64, events: UnboundedSender<SessionEvent>) -> Arc<dyn BrokerClient> {
        let state = Arc::new(ClientState {
            client_id: Mutex::new(String::new()),
            generation,
            events,
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            filters: Mutex::new(Vec::new()),
            will: Mutex::new(None),
        });
        lock(&self.inner).clients.push(Arc::downgrade(&state));
        Arc::new(LoopbackClient {
            hub: self.clone(),
            state,
        })
    }
}

pub struct LoopbackClient {
    hub: LoopbackHub,
    state: Arc<ClientState>,
}

impl LoopbackClient {
    fn check_open(&self) -> Result<(), BrokerError> {
        if self.state.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Closed);
        }
        Ok(())
    }

    fn check_connected(&self) -> Result<(), BrokerError> {
        self.check_open()?;
        if !self.state.connected.load(Ordering::SeqCst) {
            return Err(BrokerError::NotConnected);
        }
        Ok(())
    }
}

impl BrokerClient for LoopbackClient {
    fn connect(&self, opts: &ConnectOptions) -> Result<(), BrokerError> {
        self.check_open()?;
        *lock(&self.state.client_id) = opts.client_id.clone();
        let ok = self.hub.is_online();
        if ok {
            *lock(&self.state.will) = Some((opts.will_topic.clone(), opts.will_payload.clone()));
            self.state.connected.store(true, Ordering::SeqCst);
        }
        self.state.emit(BrokerEvent::ConnectComplete { ok });
        Ok(())
    }

    fn subscribe(&self, filters: &[String], _qos: u8) -> Result<(), BrokerError> {
        self.check_connected()?;
        lock(&self.state.filters).extend(filters.iter().cloned());
        self.state.emit(BrokerEvent::SubscribeComplete { ok: true });
        for (topic, payload) in self.hub.retained_matching(filters) {
            self.state.emit(BrokerEvent::MessageArrived { topic, payload });
        }
        Ok(())
    }

    fn publish(&self, token: u64, topic: &str, payload: &[u8], _qos: u8, retain: bool) -> Result<(), BrokerError> {
        self.check_connected()?;
        self.hub.route(topic, payload, retain);
        self.state.emit(BrokerEvent::PublishComplete { token, ok: true });
        Ok(())
    }

    fn unsubscribe(&self, filters: &[String]) -> Result<(), BrokerError> {
        self.check_connected()?;
        lock(&self.state.filters).retain(|f| !filters.contains(f));
        Ok(())
    }

    fn disconnect(&self) -> Result<(), BrokerError> {
        self.check_connected()?;
        // A clean disconnect suppresses the will.
        lock(&self.state.will).take();
        self.state.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn close(&self) -> Result<(), BrokerError> {
        if self.state.closed.swap(true, Ordering::SeqCst) {
            return Err(BrokerError::Closed);
        }
        self.state.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.state.connected.load(Ordering::SeqCst)
    }
}
