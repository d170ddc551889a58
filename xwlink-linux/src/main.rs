// xwlink daemon: runs the enabled transports until SIGINT/SIGTERM.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::mpsc;
use xwlink_core::engine::{EngineEvent, EventSink};
use xwlink_core::mesh::LocalIdentity;
use xwlink_core::scheduler::{Clock, SystemClock};
use xwlink_core::tap::{ReadModePolicy, TapEndpoint};
use xwlink_core::{BackoffPolicy, EnvelopeStore, KvStore, Scheduler};
use xwlink_linux::alarm::{run_alarm, TokioAlarm};
use xwlink_linux::broker::LoopbackHub;
use xwlink_linux::config::{self, Config};
use xwlink_linux::logging;
use xwlink_linux::mesh::{self, MeshRuntime, MeshSettings, RadioEvent, StaticRadio};
use xwlink_linux::pubsub::{self, PubSubSettings};
use xwlink_linux::router::Router;
use xwlink_linux::storage::FileKvStore;
use xwlink_linux::tap::{LoggingAdapter, TapRuntime};

const VERSION: &str = env!("CARGO_PKG_VERSION");
const TAP_STORE_KEY: &str = "tap.store";

fn main() -> anyhow::Result<()> {
    for arg in std::env::args().skip(1) {
        if arg == "--version" || arg == "-V" {
            println!("xwlink-linux {}", VERSION);
            return Ok(());
        }
    }

    let cfg = config::load();
    logging::init(&cfg.log_level);

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(cfg))
}

async fn run(cfg: Config) -> anyhow::Result<()> {
    let kv: Arc<dyn KvStore> = Arc::new(
        FileKvStore::open(&cfg.storage_dir)
            .with_context(|| format!("opening storage dir {}", cfg.storage_dir.display()))?,
    );

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let (alarm, alarm_rx) = TokioAlarm::new();
    let scheduler = Arc::new(Scheduler::load(kv.clone(), Arc::new(alarm), clock.clone()));
    let alarm_task = tokio::spawn(run_alarm(scheduler.clone(), clock, alarm_rx));

    let (sink, events) = EventSink::new();
    let sink = Arc::new(sink);
    std::thread::Builder::new()
        .name("xwlink-events".into())
        .spawn(move || {
            for ev in events {
                log_event(&ev);
            }
        })?;

    let mut router = Router::new();

    if cfg.pubsub.enabled {
        let device = xwlink_core::pubsub::load_device_id(kv.as_ref());
        let settings = PubSubSettings {
            device,
            qos: cfg.pubsub.qos,
            policy: BackoffPolicy::new(cfg.pubsub.backoff_floor_ms, cfg.pubsub.backoff_ceiling_ms),
            idle_exit: Duration::from_millis(cfg.pubsub.idle_exit_ms),
            queue_capacity: cfg.pubsub.queue_capacity,
        };
        // No broker client ships with the daemon; the in-process hub stands in.
        let (handle, _task) = pubsub::spawn(
            settings,
            Arc::new(LoopbackHub::new()),
            scheduler.clone(),
            sink.clone(),
            sink.clone(),
        );
        tracing::info!(device_id = %device, "pubsub transport enabled");
        router = router.with_pubsub(handle);
    }

    if cfg.tap.enabled {
        let store = Arc::new(EnvelopeStore::persistent(kv.clone(), TAP_STORE_KEY));
        let endpoint = Arc::new(TapEndpoint::new(
            xwlink_core::tap::load_device_id(kv.as_ref()),
            cfg.tap.max_frame,
            store,
            sink.clone(),
        ));
        let policy = ReadModePolicy::new(
            Duration::from_millis(cfg.tap.read_mode_min_ms),
            Duration::from_millis(cfg.tap.read_mode_max_ms),
        );
        let tap = TapRuntime::spawn(endpoint, Arc::new(LoggingAdapter), policy, sink.clone(), sink.clone());
        router = router.with_tap(tap);
    }

    // Held until shutdown so the radio event loop stays alive.
    let mut radio_tx = None;
    if cfg.mesh.enabled {
        let local = LocalIdentity {
            mac: mesh::load_or_create_address(kv.as_ref(), &cfg.mesh.address),
            name: cfg.device_name.clone(),
        };
        tracing::info!(addr = %local.mac, name = %local.name, "mesh transport enabled");
        let settings = MeshSettings {
            local,
            owner_port: cfg.mesh.owner_port,
            failure_threshold: cfg.mesh.failure_threshold,
            step_retry: Duration::from_millis(cfg.mesh.step_retry_ms),
        };
        let runtime = MeshRuntime::new(settings, Arc::new(StaticRadio), kv.clone(), sink.clone(), sink.clone());
        let (tx, rx) = mpsc::unbounded_channel();
        runtime.start(rx);
        let _ = tx.send(RadioEvent::GroupFormed {
            is_owner: cfg.mesh.owner,
            owner_addr: cfg.mesh.owner_addr.clone(),
        });
        radio_tx = Some(tx);
        router = router.with_mesh(runtime);
    }

    tracing::info!(version = VERSION, "xwlink daemon running");
    shutdown_signal().await?;
    tracing::info!("shutting down");

    router.shutdown().await;
    drop(radio_tx);
    alarm_task.abort();
    Ok(())
}

fn log_event(ev: &EngineEvent) {
    match ev {
        EngineEvent::Inbound { from, stream, bytes } => {
            tracing::info!(from = %from, %stream, len = bytes.len(), "message received")
        }
        EngineEvent::Invite { from, bytes } => tracing::info!(from = %from, len = bytes.len(), "invite received"),
        EngineEvent::StreamGone { from, stream } => tracing::info!(from = %from, %stream, "peer has no such game"),
        EngineEvent::Status {
            kind,
            direction,
            success,
        } => tracing::debug!(?kind, ?direction, success, "delivery status"),
        EngineEvent::Control { title, msg } => tracing::warn!(title = %title, msg = %msg, "control notice"),
    }
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
