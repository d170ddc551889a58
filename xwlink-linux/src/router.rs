//! Hands outbound payloads to the transport named by the destination.
//! Picking a transport is the caller's business; this only dispatches.

use std::sync::Arc;

use xwlink_core::{Destination, StreamId, TransportKind};

use crate::mesh::{MeshError, MeshRuntime};
use crate::pubsub::PubSubHandle;
use crate::tap::TapRuntime;

#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    #[error("transport {0:?} is not running")]
    Disabled(TransportKind),
    #[error("mesh: {0}")]
    Mesh(#[from] MeshError),
}

#[derive(Default, Clone)]
pub struct Router {
    pubsub: Option<PubSubHandle>,
    tap: Option<Arc<TapRuntime>>,
    mesh: Option<Arc<MeshRuntime>>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pubsub(mut self, handle: PubSubHandle) -> Self {
        self.pubsub = Some(handle);
        self
    }

    pub fn with_tap(mut self, tap: Arc<TapRuntime>) -> Self {
        self.tap = Some(tap);
        self
    }

    pub fn with_mesh(mut self, mesh: Arc<MeshRuntime>) -> Self {
        self.mesh = Some(mesh);
        self
    }

    pub fn pubsub(&self) -> Option<&PubSubHandle> {
        self.pubsub.as_ref()
    }

    pub fn tap(&self) -> Option<&Arc<TapRuntime>> {
        self.tap.as_ref()
    }

    pub fn mesh(&self) -> Option<&Arc<MeshRuntime>> {
        self.mesh.as_ref()
    }

    /// Queue `bytes` for `dest` on `stream`. Succeeds whenever the transport is
    /// running, connected or not; delivery is retried in the background.
    pub fn enqueue_outbound(&self, dest: &Destination, stream: StreamId, bytes: &[u8]) -> Result<(), RouteError> {
        match dest {
            Destination::PubSub(dev) => {
                let ps = self.pubsub.as_ref().ok_or(RouteError::Disabled(TransportKind::PubSub))?;
                let pending = ps.enqueue_outbound(*dev, stream, bytes);
                tracing::debug!(dest = %dest, %stream, pending, "queued on pubsub");
            }
            Destination::Tap => {
                let tap = self.tap.as_ref().ok_or(RouteError::Disabled(TransportKind::Tap))?;
                let pending = tap.enqueue_outbound(stream, bytes);
                tracing::debug!(%stream, pending, "queued for tap");
            }
            Destination::Mesh(addr) => {
                let mesh = self.mesh.as_ref().ok_or(RouteError::Disabled(TransportKind::Mesh))?;
                let sent = mesh.send_to(addr, stream, bytes)?;
                tracing::debug!(addr = %addr, %stream, sent, "handed to mesh");
            }
        }
        Ok(())
    }

    /// Queue an invitation that opens `stream` with `dest`.
    pub fn enqueue_invite(&self, dest: &Destination, stream: StreamId, invite: &[u8]) -> Result<(), RouteError> {
        match dest {
            Destination::PubSub(dev) => {
                let ps = self.pubsub.as_ref().ok_or(RouteError::Disabled(TransportKind::PubSub))?;
                ps.enqueue_invite(*dev, stream, invite);
            }
            Destination::Tap => {
                let tap = self.tap.as_ref().ok_or(RouteError::Disabled(TransportKind::Tap))?;
                tap.enqueue_invite(stream, invite);
            }
            Destination::Mesh(addr) => {
                let mesh = self.mesh.as_ref().ok_or(RouteError::Disabled(TransportKind::Mesh))?;
                mesh.send_invite(addr, invite)?;
            }
        }
        tracing::info!(dest = %dest, %stream, "invite queued");
        Ok(())
    }

    /// Stop every running transport.
    pub async fn shutdown(&self) {
        if let Some(ps) = &self.pubsub {
            ps.shutdown().await;
        }
        if let Some(tap) = &self.tap {
            tap.shutdown().await;
        }
        if let Some(mesh) = &self.mesh {
            mesh.shutdown().await;
        }
    }
}
