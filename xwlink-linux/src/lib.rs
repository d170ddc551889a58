//! Linux host for the xwlink delivery core: config, logging, file storage, the
//! scheduler alarm, and tokio runtimes for the pub/sub, tap and mesh transports.

pub mod alarm;
pub mod broker;
pub mod config;
pub mod logging;
pub mod mesh;
pub mod pubsub;
pub mod router;
pub mod storage;
pub mod tap;
