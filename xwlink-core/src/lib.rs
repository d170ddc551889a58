//! xwlink message delivery core.
//! Host-driven: no sockets, no runtime. Transports feed bytes in and get frames,
//! routes and callbacks out.

pub mod identity;
pub mod protocol;
pub mod engine;
pub mod storage;
pub mod scheduler;
pub mod store;
pub mod chunk;
pub mod tap;
pub mod mesh;
pub mod pubsub;

pub use engine::{DeliveryResult, EngineEvent, EventSink, PayloadSink, StatusSink};
pub use identity::{Destination, DeviceId, Direction, StreamId, TransportKind};
pub use scheduler::{AlarmSink, BackoffPolicy, BackoffRecord, Scheduler, TimerClient};
pub use storage::{KvStore, MemoryKvStore, StorageError};
pub use store::{Envelope, EnvelopeStore, HaveDataListener};
