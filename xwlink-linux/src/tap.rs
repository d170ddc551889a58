//! Tap-exchange runtime: read-mode duty cycle, initiator runs on the blocking pool,
//! responder commands, and the single FIFO decode worker.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::sync::{mpsc, watch, Mutex, Notify};
use tokio::task::JoinHandle;
use xwlink_core::protocol::{TAG_INVITE, TAG_MESSAGE};
use xwlink_core::tap::{ReadModePolicy, TapEndpoint, TapError, TapLink};
use xwlink_core::{Direction, HaveDataListener, PayloadSink, StatusSink, StreamId, TransportKind};

/// Hardware reader control.
pub trait TapAdapter: Send + Sync {
    fn set_reader_mode(&self, on: bool);
}

/// Adapter for hosts without a proximity radio: reader mode is only logged.
pub struct LoggingAdapter;

impl TapAdapter for LoggingAdapter {
    fn set_reader_mode(&self, on: bool) {
        tracing::debug!(on, "tap reader mode");
    }
}

/// Wakes the read-mode loop when the store gains or loses data.
struct Wake(Arc<Notify>);

impl HaveDataListener<StreamId> for Wake {
    fn on_have_data(&self, stream: &StreamId, have_data: bool) {
        tracing::trace!(%stream, have_data, "tap store changed");
        self.0.notify_one();
    }
}

pub struct TapRuntime {
    endpoint: Arc<TapEndpoint>,
    status: Arc<dyn StatusSink>,
    decode_tx: mpsc::UnboundedSender<Vec<u8>>,
    connected: Arc<AtomicBool>,
    wake: Arc<Notify>,
    // Kept alive here; the store only holds it weakly.
    _listener: Arc<dyn HaveDataListener<StreamId>>,
    stop_tx: watch::Sender<bool>,
    read_task: Mutex<Option<JoinHandle<()>>>,
    decode_task: Mutex<Option<JoinHandle<()>>>,
}

impl TapRuntime {
    pub fn spawn(
        endpoint: Arc<TapEndpoint>,
        adapter: Arc<dyn TapAdapter>,
        policy: ReadModePolicy,
        payload_sink: Arc<dyn PayloadSink>,
        status: Arc<dyn StatusSink>,
    ) -> Arc<Self> {
        let wake = Arc::new(Notify::new());
        let listener: Arc<dyn HaveDataListener<StreamId>> = Arc::new(Wake(wake.clone()));
        endpoint.store().set_any_listener(&listener);
        let (decode_tx, decode_rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = watch::channel(false);
        let connected = Arc::new(AtomicBool::new(false));

        let read_task = tokio::spawn(read_mode_loop(
            endpoint.clone(),
            adapter,
            policy,
            connected.clone(),
            wake.clone(),
            stop_rx,
        ));
        let decode_task = tokio::spawn(decode_worker(
            endpoint.clone(),
            payload_sink,
            status.clone(),
            decode_rx,
        ));
        tracing::info!(device_id = endpoint.device_id(), "tap transport started");
        Arc::new(Self {
            endpoint,
            status,
            decode_tx,
            connected,
            wake,
            _listener: listener,
            stop_tx,
            read_task: Mutex::new(Some(read_task)),
            decode_task: Mutex::new(Some(decode_task)),
        })
    }

    pub fn endpoint(&self) -> &Arc<TapEndpoint> {
        &self.endpoint
    }

    /// Queue a message for the next tap; `stream` becomes the active stream.
    pub fn enqueue_outbound(&self, stream: StreamId, bytes: &[u8]) -> usize {
        self.endpoint.set_active_stream(stream);
        self.endpoint.store().add_if_absent(&stream, TAG_MESSAGE, bytes)
    }

    pub fn enqueue_invite(&self, stream: StreamId, invite: &[u8]) -> usize {
        self.endpoint.set_active_stream(stream);
        self.endpoint.store().add_if_absent(&stream, TAG_INVITE, invite)
    }

    /// A peer came into range and we are the initiator. Runs the whole exchange.
    pub async fn on_tag_discovered(&self, mut link: Box<dyn TapLink + Send>) -> Result<usize, TapError> {
        self.set_connected(true);
        let endpoint = self.endpoint.clone();
        let tx = self.decode_tx.clone();
        let result = tokio::task::spawn_blocking(move || {
            let mut on_payload = |payload: Vec<u8>| {
                let _ = tx.send(payload);
            };
            endpoint.run_initiator(link.as_mut(), &mut on_payload)
        })
        .await
        .map_err(|e| TapError::Link(e.to_string()))
        .and_then(|r| r);
        self.set_connected(false);
        match &result {
            Ok(rounds) => tracing::debug!(rounds, "tap exchange finished"),
            Err(e) => {
                tracing::warn!(error = %e, "tap exchange failed");
                self.status
                    .on_delivery_status(TransportKind::Tap, Direction::Outbound, false);
            }
        }
        result
    }

    /// Card-emulation side: answer one command. Completed payloads go to the decode worker.
    pub fn process_command(&self, apdu: &[u8]) -> Vec<u8> {
        let outcome = self.endpoint.process_command(apdu);
        if let Some(payload) = outcome.payload {
            let _ = self.decode_tx.send(payload);
        }
        outcome.response
    }

    fn set_connected(&self, on: bool) {
        self.connected.store(on, Ordering::SeqCst);
        self.wake.notify_one();
    }

    /// Stop the read-mode loop (reader off) and the decode worker, and join them.
    pub async fn shutdown(&self) {
        let _ = self.stop_tx.send(true);
        // The read loop turns the reader off on its way out.
        if let Some(t) = self.read_task.lock().await.take() {
            let _ = t.await;
        }
        if let Some(t) = self.decode_task.lock().await.take() {
            t.abort();
            let _ = t.await;
        }
    }
}

async fn read_mode_loop(
    endpoint: Arc<TapEndpoint>,
    adapter: Arc<dyn TapAdapter>,
    mut policy: ReadModePolicy,
    connected: Arc<AtomicBool>,
    wake: Arc<Notify>,
    mut stop: watch::Receiver<bool>,
) {
    let mut rng = StdRng::from_entropy();
    loop {
        let step = policy.step(
            connected.load(Ordering::SeqCst),
            endpoint.store().has_any_data(),
            &mut rng,
        );
        if let Some(on) = step.toggle {
            adapter.set_reader_mode(on);
        }
        let pause = async {
            match step.sleep {
                Some(d) => tokio::time::sleep(d).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            _ = pause => {}
            _ = wake.notified() => {}
            _ = stop.changed() => break,
        }
    }
    if policy.shutdown() {
        adapter.set_reader_mode(false);
    }
}

async fn decode_worker(
    endpoint: Arc<TapEndpoint>,
    sink: Arc<dyn PayloadSink>,
    status: Arc<dyn StatusSink>,
    mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
) {
    while let Some(payload) = rx.recv().await {
        match endpoint.decode_inbound(&payload, sink.as_ref()) {
            Ok(()) => status.on_delivery_status(TransportKind::Tap, Direction::Inbound, true),
            Err(e) => tracing::warn!(error = %e, len = payload.len(), "undecodable tap payload"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::Receiver;
    use xwlink_core::engine::{EngineEvent, EventSink};
    use xwlink_core::tap::DEFAULT_MAX_FRAME;
    use xwlink_core::{Destination, EnvelopeStore};

    #[derive(Default)]
    struct RecordingAdapter(std::sync::Mutex<Vec<bool>>);

    impl TapAdapter for RecordingAdapter {
        fn set_reader_mode(&self, on: bool) {
            self.0.lock().unwrap().push(on);
        }
    }

    struct Side {
        rt: Arc<TapRuntime>,
        sink: Arc<EventSink>,
        events: Receiver<EngineEvent>,
        adapter: Arc<RecordingAdapter>,
    }

    fn side(id: u32) -> Side {
        let (sink, events) = EventSink::new();
        let sink = Arc::new(sink);
        let endpoint = Arc::new(TapEndpoint::new(
            id,
            DEFAULT_MAX_FRAME,
            Arc::new(EnvelopeStore::new()),
            sink.clone(),
        ));
        let adapter = Arc::new(RecordingAdapter::default());
        let rt = TapRuntime::spawn(
            endpoint,
            adapter.clone(),
            ReadModePolicy::new(Duration::from_millis(20), Duration::from_millis(40)),
            sink.clone(),
            sink.clone(),
        );
        Side {
            rt,
            sink,
            events,
            adapter,
        }
    }

    /// Initiator link that hands each command to the responder runtime.
    struct Air(Arc<TapRuntime>);

    impl TapLink for Air {
        fn max_transceive(&self) -> usize {
            DEFAULT_MAX_FRAME
        }
        fn transceive(&mut self, command: &[u8]) -> Result<Vec<u8>, TapError> {
            Ok(self.0.process_command(command))
        }
    }

    struct Dead;

    impl TapLink for Dead {
        fn max_transceive(&self) -> usize {
            DEFAULT_MAX_FRAME
        }
        fn transceive(&mut self, _command: &[u8]) -> Result<Vec<u8>, TapError> {
            Err(TapError::Link("tag lost".into()))
        }
    }

    async fn next_event(rx: &Receiver<EngineEvent>, pred: impl Fn(&EngineEvent) -> bool) -> Option<EngineEvent> {
        for _ in 0..300 {
            while let Ok(e) = rx.try_recv() {
                if pred(&e) {
                    return Some(e);
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        None
    }

    #[tokio::test]
    async fn exchange_delivers_both_ways() {
        let a = side(11);
        let b = side(22);
        a.sink.add_stream(StreamId(5));
        b.sink.add_stream(StreamId(5));
        let long = vec![7u8; 300];
        a.rt.enqueue_outbound(StreamId(5), &long);
        b.rt.enqueue_outbound(StreamId(5), b"reply");

        a.rt.on_tag_discovered(Box::new(Air(b.rt.clone()))).await.unwrap();

        let got = next_event(&b.events, |e| matches!(e, EngineEvent::Inbound { .. })).await;
        assert_eq!(
            got,
            Some(EngineEvent::Inbound {
                from: Destination::Tap,
                stream: StreamId(5),
                bytes: long
            })
        );
        let got = next_event(&a.events, |e| matches!(e, EngineEvent::Inbound { .. })).await;
        assert!(matches!(got, Some(EngineEvent::Inbound { bytes, .. }) if bytes == b"reply"));
        assert!(!a.rt.endpoint().store().has_data(&StreamId(5)));
    }

    #[tokio::test]
    async fn failed_link_reports_status() {
        let a = side(1);
        a.rt.enqueue_outbound(StreamId(2), b"x");
        assert!(a.rt.on_tag_discovered(Box::new(Dead)).await.is_err());
        let got = next_event(&a.events, |e| matches!(e, EngineEvent::Status { .. })).await;
        assert_eq!(
            got,
            Some(EngineEvent::Status {
                kind: TransportKind::Tap,
                direction: Direction::Outbound,
                success: false
            })
        );
        assert!(a.rt.endpoint().store().has_data(&StreamId(2)));
    }

    #[tokio::test]
    async fn pending_data_drives_reader_mode() {
        let a = side(3);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(a.adapter.0.lock().unwrap().is_empty(), "idle without data");

        a.rt.enqueue_outbound(StreamId(9), b"hi");
        let mut toggled = false;
        for _ in 0..100 {
            let calls = a.adapter.0.lock().unwrap().clone();
            if calls.contains(&true) && calls.contains(&false) {
                toggled = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(toggled, "reader mode should cycle while data is pending");

        a.rt.shutdown().await;
        let calls = a.adapter.0.lock().unwrap().clone();
        assert_eq!(calls.last(), Some(&false));
    }
}
