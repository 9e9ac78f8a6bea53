//! Session-server contract and the orchestrator-side automation handle.
//!
//! The socket/transport layer is an external collaborator; the
//! orchestrator wires it through the [`SessionServer`] trait and never
//! owns the protocol. Lifecycle notifications flow through
//! [`SessionBindings`], an explicit handler set the embedder registers —
//! handlers for one event fire in registration order.
//!
//! Real implementation: the embedding runner's server. Test double:
//! mock servers in the integration tests.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;
use uuid::Uuid;

use crate::config::{ConfigSnapshot, TestingType};
use crate::specs::SpecDescriptor;

/// Aggregate stats handed back when a session ends.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunStats {
    pub tests: u64,
    pub passes: u64,
    pub failures: u64,
    pub pending: u64,
    pub duration_ms: u64,
}

/// A proxied request announced ahead of time so the transport can
/// correlate it when it arrives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreRequest {
    pub request_id: String,
    pub method: String,
    pub url: String,
}

/// Socket-connect notification payload.
#[derive(Debug, Clone)]
pub struct SocketConnect {
    pub socket_id: String,
}

type Handler<T> = Box<dyn Fn(&T) + Send + Sync>;

/// Explicit subscription set for session events.
#[derive(Default)]
pub struct SessionBindings {
    on_socket_connect: Vec<Handler<SocketConnect>>,
    on_capture_video_frames: Vec<Handler<serde_json::Value>>,
    on_run_end: Vec<Handler<RunStats>>,
    on_focus_tests: Vec<Box<dyn Fn() + Send + Sync>>,
}

impl SessionBindings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_socket_connect(mut self, f: impl Fn(&SocketConnect) + Send + Sync + 'static) -> Self {
        self.on_socket_connect.push(Box::new(f));
        self
    }

    pub fn on_capture_video_frames(
        mut self,
        f: impl Fn(&serde_json::Value) + Send + Sync + 'static,
    ) -> Self {
        self.on_capture_video_frames.push(Box::new(f));
        self
    }

    pub fn on_run_end(mut self, f: impl Fn(&RunStats) + Send + Sync + 'static) -> Self {
        self.on_run_end.push(Box::new(f));
        self
    }

    pub fn on_focus_tests(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_focus_tests.push(Box::new(f));
        self
    }

    /// Handlers fire in registration order.
    pub fn emit_socket_connect(&self, event: &SocketConnect) {
        for handler in &self.on_socket_connect {
            handler(event);
        }
    }

    pub fn emit_capture_video_frames(&self, data: &serde_json::Value) {
        for handler in &self.on_capture_video_frames {
            handler(data);
        }
    }

    pub fn emit_run_end(&self, stats: &RunStats) {
        for handler in &self.on_run_end {
            handler(stats);
        }
    }

    pub fn emit_focus_tests(&self) {
        for handler in &self.on_focus_tests {
            handler();
        }
    }
}

impl std::fmt::Debug for SessionBindings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionBindings")
            .field("on_socket_connect", &self.on_socket_connect.len())
            .field(
                "on_capture_video_frames",
                &self.on_capture_video_frames.len(),
            )
            .field("on_run_end", &self.on_run_end.len())
            .field("on_focus_tests", &self.on_focus_tests.len())
            .finish()
    }
}

/// The external socket/transport collaborator.
#[async_trait]
pub trait SessionServer: Send + Sync {
    /// Bind and start serving. Returns the bound port (the config's
    /// pinned port, or an assigned one) and an optional warning to
    /// surface to the user.
    async fn open(
        &self,
        config: &ConfigSnapshot,
        bindings: SessionBindings,
    ) -> anyhow::Result<(u16, Option<String>)>;

    /// Wire the websocket/automation channel.
    async fn start_channel(
        &self,
        automation: Arc<Automation>,
        config: &ConfigSnapshot,
    ) -> anyhow::Result<()>;

    /// Push the current spec list to connected clients.
    async fn send_spec_list(
        &self,
        specs: &[SpecDescriptor],
        testing_type: TestingType,
    ) -> anyhow::Result<()>;

    async fn register_pre_request(&self, req: PreRequest) -> anyhow::Result<()>;

    async fn navigate_to(&self, url: &str) -> anyhow::Result<()>;

    /// Reset transient per-run state without tearing the server down.
    async fn reset(&self) -> anyhow::Result<()>;

    async fn close(&self) -> anyhow::Result<()>;

    /// Finish the session and collect stats.
    async fn end(&self) -> anyhow::Result<RunStats>;
}

/// Orchestrator-side handle to the browser-automation session.
///
/// Shared with the plugin re-init path, which must close any active
/// session before reporting a re-init failure.
#[derive(Debug)]
pub struct Automation {
    session_id: Uuid,
    active: AtomicBool,
}

impl Automation {
    pub fn create() -> Self {
        Self {
            session_id: Uuid::new_v4(),
            active: AtomicBool::new(true),
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Clear per-run automation state. Safe to call repeatedly.
    pub async fn reset(&self) {
        debug!(session = %self.session_id, "automation reset");
    }

    /// Tear the automation session down. Safe to call repeatedly.
    pub async fn close(&self) {
        if self.active.swap(false, Ordering::SeqCst) {
            debug!(session = %self.session_id, "automation closed");
        }
    }
}
