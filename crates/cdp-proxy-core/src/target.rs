//! Collaborator traits the proxy is built against.
//!
//! The host application implements [`CdpBrowserTarget`] and [`CdpTarget`];
//! attaching to a target yields a [`CdpConnection`]. The proxy itself is also
//! a `CdpConnection`, which is what the transport talks to.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;
use crate::event::Emitter;
use crate::protocol::{BrowserVersion, CdpEvent, TargetInfo, WindowForTarget};

/// Something that can be debugged: a page, a frame, a worker.
#[async_trait]
pub trait CdpTarget: Send + Sync {
    /// Current metadata. May be called repeatedly; must stay coherent for one target.
    async fn get_target_info(&self) -> anyhow::Result<TargetInfo>;

    /// Open a new debugging session for this target.
    async fn attach(&self) -> anyhow::Result<Arc<dyn CdpConnection>>;
}

/// A live debugging channel. Disposing it detaches.
#[async_trait]
pub trait CdpConnection: Send + Sync {
    fn session_id(&self) -> &str;

    fn on_event(&self) -> &Emitter<CdpEvent>;

    /// Fires exactly once, when the connection goes away for any reason.
    fn on_close(&self) -> &Emitter<()>;

    async fn send_message(
        &self,
        method: &str,
        params: Value,
        session_id: Option<&str>,
    ) -> Result<Value>;

    /// Tear the connection down. Must fire `on_close` if it has not fired yet.
    fn dispose(&self);
}

/// The browser itself: owns the targets and browser contexts.
#[async_trait]
pub trait CdpBrowserTarget: CdpTarget {
    fn on_target_created(&self) -> &Emitter<Arc<dyn CdpTarget>>;

    fn on_target_destroyed(&self) -> &Emitter<Arc<dyn CdpTarget>>;

    async fn get_version(&self) -> anyhow::Result<BrowserVersion>;

    async fn get_window_for_target(&self, target: Arc<dyn CdpTarget>) -> anyhow::Result<WindowForTarget>;

    /// Targets that already exist when the proxy is created.
    fn get_targets(&self) -> Vec<Arc<dyn CdpTarget>>;

    async fn create_target(
        &self,
        url: &str,
        browser_context_id: Option<&str>,
    ) -> anyhow::Result<Arc<dyn CdpTarget>>;

    async fn activate_target(&self, target: Arc<dyn CdpTarget>) -> anyhow::Result<()>;

    async fn close_target(&self, target: Arc<dyn CdpTarget>) -> anyhow::Result<bool>;

    fn get_browser_contexts(&self) -> Vec<String>;

    async fn create_browser_context(&self) -> anyhow::Result<String>;

    async fn dispose_browser_context(&self, browser_context_id: &str) -> anyhow::Result<()>;
}
