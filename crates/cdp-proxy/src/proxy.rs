//! Browser-level CDP proxy.
//!
//! Presents a single [`CdpConnection`] to the transport. `Browser.*` and
//! `Target.*` commands are answered from the handler table in
//! [`crate::methods`]; every other command is forwarded to the attached
//! session named by its `sessionId`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use futures::future::{self, BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use cdp_proxy_core::config::ProxyConfig;
use cdp_proxy_core::error::{CdpError, Result};
use cdp_proxy_core::event::{DisposableStore, Emitter};
use cdp_proxy_core::protocol::{CdpEvent, TargetInfo};
use cdp_proxy_core::target::{CdpBrowserTarget, CdpConnection, CdpTarget};

use crate::target_manager::{TargetEvent, TargetKey, TargetManager};

/// An attach in progress or completed. Every clone observes the same outcome.
pub type AttachFuture = Shared<BoxFuture<'static, Result<Arc<dyn CdpConnection>>>>;

struct SessionEntry {
    connection: Arc<dyn CdpConnection>,
    target_id: String,
    subscriptions: Arc<DisposableStore>,
}

struct PendingAttach {
    attach_id: u64,
    // Pins the allocation so the key cannot be reused by another target.
    _target: Arc<dyn CdpTarget>,
    future: AttachFuture,
}

#[derive(Default)]
struct ProxyState {
    sessions: HashMap<String, SessionEntry>,
    auto_attach_pending: HashMap<TargetKey, PendingAttach>,
    is_attached_to_browser_target: bool,
    auto_attach: bool,
    discover: bool,
    // Register events at or below this seq were covered by the last backfill.
    discover_since: u64,
}

pub struct CdpBrowserProxy {
    weak_self: Weak<CdpBrowserProxy>,
    session_id: String,
    browser: Arc<dyn CdpBrowserTarget>,
    target_manager: TargetManager,
    state: Mutex<ProxyState>,
    next_attach_id: AtomicU64,
    trace_events: bool,
    on_event: Emitter<CdpEvent>,
    on_close: Emitter<()>,
    closed: AtomicBool,
    subscriptions: DisposableStore,
}

impl CdpBrowserProxy {
    /// Create a proxy with default settings and register the browser's existing targets.
    pub async fn new(browser: Arc<dyn CdpBrowserTarget>) -> Arc<Self> {
        Self::with_config(browser, &ProxyConfig::default()).await
    }

    pub async fn with_config(browser: Arc<dyn CdpBrowserTarget>, config: &ProxyConfig) -> Arc<Self> {
        let session_id = format!("{}-{}", config.browser_session_prefix, Uuid::new_v4());
        let proxy = Arc::new_cyclic(|weak_self| Self {
            weak_self: weak_self.clone(),
            session_id,
            browser,
            target_manager: TargetManager::new(),
            state: Mutex::new(ProxyState {
                auto_attach: config.auto_attach,
                discover: config.discover_targets,
                ..ProxyState::default()
            }),
            next_attach_id: AtomicU64::new(1),
            trace_events: config.trace_events,
            on_event: Emitter::new(),
            on_close: Emitter::new(),
            closed: AtomicBool::new(false),
            subscriptions: DisposableStore::new(),
        });

        proxy.wire_collaborators();

        for target in proxy.browser.get_targets() {
            if let Err(e) = proxy.target_manager.register(target).await {
                warn!(%e, "Failed to register initial target");
            }
        }

        info!(session_id = %proxy.session_id, "CDP browser proxy ready");
        proxy
    }

    fn wire_collaborators(&self) {
        let weak = self.weak_self.clone();
        self.subscriptions
            .add(self.target_manager.on_did_register_target().subscribe(move |event| {
                if let Some(proxy) = weak.upgrade() {
                    proxy.handle_target_registered(event);
                }
            }));

        let weak = self.weak_self.clone();
        self.subscriptions
            .add(self.target_manager.on_did_unregister_target().subscribe(move |event| {
                if let Some(proxy) = weak.upgrade() {
                    proxy.handle_target_unregistered(event);
                }
            }));

        let weak = self.weak_self.clone();
        self.subscriptions
            .add(self.browser.on_target_created().subscribe(move |target| {
                let Some(proxy) = weak.upgrade() else {
                    return;
                };
                let target = target.clone();
                spawn_detached("register target", async move {
                    proxy.target_manager.register(target).await.map(|_| ())
                });
            }));

        let weak = self.weak_self.clone();
        self.subscriptions
            .add(self.browser.on_target_destroyed().subscribe(move |target| {
                if let Some(proxy) = weak.upgrade() {
                    proxy.target_manager.unregister(target);
                }
            }));
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn on_event(&self) -> &Emitter<CdpEvent> {
        &self.on_event
    }

    pub fn on_close(&self) -> &Emitter<()> {
        &self.on_close
    }

    pub fn target_manager(&self) -> &TargetManager {
        &self.target_manager
    }

    pub(crate) fn browser(&self) -> &Arc<dyn CdpBrowserTarget> {
        &self.browser
    }

    pub fn is_attached_to_browser_target(&self) -> bool {
        self.state.lock().is_attached_to_browser_target
    }

    pub fn auto_attach_enabled(&self) -> bool {
        self.state.lock().auto_attach
    }

    pub fn discover_enabled(&self) -> bool {
        self.state.lock().discover
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Browser-level methods answered by the proxy itself.
    pub fn supported_methods(&self) -> &'static [&'static str] {
        crate::methods::SUPPORTED_METHODS
    }

    /// Ids of the sessions currently attached through this proxy.
    pub fn session_ids(&self) -> Vec<String> {
        self.state.lock().sessions.keys().cloned().collect()
    }

    /// Entry point for the transport: run one command.
    pub async fn send_message(&self, method: &str, params: Value, session_id: Option<&str>) -> Result<Value> {
        if self.is_closed() {
            return Err(CdpError::server("Browser proxy is closed"));
        }
        debug!(method, session_id, "Dispatching CDP method");

        let browser_level = match session_id {
            None => true,
            Some(sid) if sid == self.session_id => true,
            Some(_) => method.starts_with("Browser.") || method.starts_with("Target."),
        };

        if browser_level {
            return crate::methods::dispatch_method(self, method, params, session_id)
                .await
                .map_err(CdpError::from_anyhow);
        }

        let sid = session_id.unwrap_or_default();
        let connection = self
            .state
            .lock()
            .sessions
            .get(sid)
            .map(|entry| entry.connection.clone())
            .ok_or_else(|| CdpError::server(format!("Session not found: {sid}")))?;

        let result = connection.send_message(method, params, None).await?;
        Ok(if result.is_null() { json!({}) } else { result })
    }

    /// Tear down every attached session, release collaborator subscriptions,
    /// and fire `on_close`. Later calls do nothing.
    pub fn dispose(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.subscriptions.dispose();

        let connections: Vec<Arc<dyn CdpConnection>> = {
            let mut state = self.state.lock();
            state.auto_attach_pending.clear();
            state.sessions.values().map(|e| e.connection.clone()).collect()
        };
        for connection in connections {
            connection.dispose();
        }

        info!(session_id = %self.session_id, "CDP browser proxy closed");
        self.on_close.fire(&());
    }

    pub(crate) fn set_attached_to_browser_target(&self) {
        self.state.lock().is_attached_to_browser_target = true;
    }

    pub(crate) fn set_auto_attach(&self, enabled: bool) {
        self.state.lock().auto_attach = enabled;
    }

    /// Store the discover flag. When this call turns discovery on, returns
    /// the already-announced targets to backfill.
    pub(crate) fn set_discover(&self, enabled: bool) -> Option<Vec<TargetInfo>> {
        let mut state = self.state.lock();
        let was = std::mem::replace(&mut state.discover, enabled);
        if !enabled || was {
            return None;
        }
        let (infos, mark) = self.target_manager.snapshot();
        state.discover_since = mark;
        Some(infos)
    }

    pub(crate) fn session_target_id(&self, session_id: &str) -> Option<String> {
        self.state
            .lock()
            .sessions
            .get(session_id)
            .map(|entry| entry.target_id.clone())
    }

    pub(crate) fn session_connection(&self, session_id: &str) -> Option<Arc<dyn CdpConnection>> {
        self.state
            .lock()
            .sessions
            .get(session_id)
            .map(|entry| entry.connection.clone())
    }

    pub(crate) fn session_for_target(&self, target_id: &str) -> Option<String> {
        self.state
            .lock()
            .sessions
            .iter()
            .find(|(_, entry)| entry.target_id == target_id)
            .map(|(sid, _)| sid.clone())
    }

    /// Session id to tag browser-level events with, if the client attached to the browser target.
    pub(crate) fn browser_event_session(&self) -> Option<String> {
        self.state
            .lock()
            .is_attached_to_browser_target
            .then(|| self.session_id.clone())
    }

    pub(crate) fn emit(&self, event: CdpEvent) {
        if self.trace_events {
            trace!(method = %event.method, session_id = ?event.session_id, "Emitting CDP event");
        }
        self.on_event.fire(&event);
    }

    pub(crate) fn emit_target_created(&self, target_info: &TargetInfo) {
        self.emit(
            CdpEvent::new("Target.targetCreated", json!({ "targetInfo": target_info }))
                .with_session(self.browser_event_session()),
        );
    }

    fn handle_target_registered(&self, event: &TargetEvent) {
        let (discover, auto_attach) = {
            let state = self.state.lock();
            (
                state.discover && event.seq > state.discover_since,
                state.auto_attach,
            )
        };

        if discover {
            self.emit_target_created(&event.target_info);
        }

        if auto_attach {
            let attach = self.attach_to_target(&event.target_info.target_id, true);
            spawn_detached("auto-attach", async move { attach.await.map(|_| ()) });
        }
    }

    fn handle_target_unregistered(&self, event: &TargetEvent) {
        let discover = {
            let mut state = self.state.lock();
            state.auto_attach_pending.remove(&TargetKey::of(&event.target));
            state.discover
        };

        if discover {
            self.emit(
                CdpEvent::new(
                    "Target.targetDestroyed",
                    json!({ "targetId": event.target_info.target_id }),
                )
                .with_session(self.browser_event_session()),
            );
        }
    }

    /// Attach to `target_id`.
    ///
    /// Auto-attach requests for a target that already has one in flight (or
    /// live) share it instead of attaching again. The returned future resolves
    /// after `Target.attachedToTarget` has been emitted.
    pub fn attach_to_target(&self, target_id: &str, is_auto_attach: bool) -> AttachFuture {
        let target = match self.target_manager.get_by_id(target_id) {
            Ok(target) => target,
            Err(e) => return future::ready(Err(e)).boxed().shared(),
        };
        let Some(proxy) = self.weak_self.upgrade() else {
            return future::ready(Err(CdpError::server("Browser proxy is closed")))
                .boxed()
                .shared();
        };
        let key = TargetKey::of(&target);

        // Check and populate the cache under one lock so concurrent callers cannot both miss.
        let mut state = self.state.lock();
        if is_auto_attach {
            if let Some(pending) = state.auto_attach_pending.get(&key) {
                return pending.future.clone();
            }
        }

        let attach_id = self.next_attach_id.fetch_add(1, Ordering::Relaxed);
        let attach = proxy
            .run_attach(target.clone(), target_id.to_string(), key, attach_id)
            .boxed()
            .shared();

        if is_auto_attach {
            state.auto_attach_pending.insert(
                key,
                PendingAttach {
                    attach_id,
                    _target: target,
                    future: attach.clone(),
                },
            );
        }
        attach
    }

    async fn run_attach(
        self: Arc<Self>,
        target: Arc<dyn CdpTarget>,
        target_id: String,
        key: TargetKey,
        attach_id: u64,
    ) -> Result<Arc<dyn CdpConnection>> {
        let connection = match target.attach().await {
            Ok(connection) => connection,
            Err(e) => {
                self.forget_attach(key, attach_id);
                return Err(CdpError::from_anyhow(e));
            }
        };
        let session_id = connection.session_id().to_string();
        let subscriptions = Arc::new(DisposableStore::new());

        self.state.lock().sessions.insert(
            session_id.clone(),
            SessionEntry {
                connection: connection.clone(),
                target_id: target_id.clone(),
                subscriptions: subscriptions.clone(),
            },
        );

        // Wire close before the next await so a session that dies early is still cleaned up.
        let weak = self.weak_self.clone();
        let (sid, tid) = (session_id.clone(), target_id.clone());
        subscriptions.add(connection.on_close().subscribe(move |_| {
            if let Some(proxy) = weak.upgrade() {
                proxy.handle_session_closed(&sid, &tid, key, attach_id);
            }
        }));

        let mut target_info = match target.get_target_info().await {
            Ok(info) => info,
            Err(e) => {
                let entry = self.state.lock().sessions.remove(&session_id);
                drop(entry);
                subscriptions.dispose();
                self.forget_attach(key, attach_id);
                connection.dispose();
                return Err(CdpError::from_anyhow(e));
            }
        };

        // The close handler has already reported the detach.
        if !self.state.lock().sessions.contains_key(&session_id) {
            debug!(session_id = %session_id, target_id = %target_id, "Session closed during attach");
            return Err(CdpError::server("Session closed during attach"));
        }

        // Child Target.* events never leak; the proxy synthesizes its own.
        let weak = self.weak_self.clone();
        let sid = session_id.clone();
        subscriptions.add(connection.on_event().subscribe(move |event| {
            if event.method.starts_with("Target.") {
                return;
            }
            if let Some(proxy) = weak.upgrade() {
                proxy.emit(
                    CdpEvent::new(event.method.clone(), event.params.clone())
                        .with_session(Some(sid.clone())),
                );
            }
        }));

        info!(session_id = %session_id, target_id = %target_id, "Attached to target");
        target_info.attached = true;
        // The host cannot pause a target until the client says go.
        self.emit(
            CdpEvent::new(
                "Target.attachedToTarget",
                json!({
                    "sessionId": session_id,
                    "targetInfo": target_info,
                    "waitingForDebugger": false,
                }),
            )
            .with_session(self.browser_event_session()),
        );

        Ok(connection)
    }

    fn handle_session_closed(&self, session_id: &str, target_id: &str, key: TargetKey, attach_id: u64) {
        self.emit(
            CdpEvent::new(
                "Target.detachedFromTarget",
                json!({ "sessionId": session_id, "targetId": target_id }),
            )
            .with_session(self.browser_event_session()),
        );

        let removed = {
            let mut state = self.state.lock();
            if state
                .auto_attach_pending
                .get(&key)
                .is_some_and(|p| p.attach_id == attach_id)
            {
                state.auto_attach_pending.remove(&key);
            }
            state.sessions.remove(session_id)
        };
        // Drop outside the lock: releasing the entry unsubscribes its listeners.
        if let Some(entry) = removed {
            entry.subscriptions.dispose();
        }
        info!(session_id, target_id, "Detached from target");
    }

    fn forget_attach(&self, key: TargetKey, attach_id: u64) {
        let mut state = self.state.lock();
        if state
            .auto_attach_pending
            .get(&key)
            .is_some_and(|p| p.attach_id == attach_id)
        {
            state.auto_attach_pending.remove(&key);
        }
    }
}

#[async_trait]
impl CdpConnection for CdpBrowserProxy {
    fn session_id(&self) -> &str {
        &self.session_id
    }

    fn on_event(&self) -> &Emitter<CdpEvent> {
        &self.on_event
    }

    fn on_close(&self) -> &Emitter<()> {
        &self.on_close
    }

    async fn send_message(&self, method: &str, params: Value, session_id: Option<&str>) -> Result<Value> {
        CdpBrowserProxy::send_message(self, method, params, session_id).await
    }

    fn dispose(&self) {
        CdpBrowserProxy::dispose(self)
    }
}

/// Run fire-and-forget work on the ambient runtime, logging failures.
fn spawn_detached<F>(what: &'static str, work: F)
where
    F: std::future::Future<Output = Result<()>> + Send + 'static,
{
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move {
                if let Err(e) = work.await {
                    warn!(%e, what, "Background proxy task failed");
                }
            });
        }
        Err(_) => warn!(what, "No tokio runtime available; dropping background proxy task"),
    }
}
