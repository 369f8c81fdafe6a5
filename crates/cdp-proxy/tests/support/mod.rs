//! In-memory browser, targets, and connections for driving the proxy in tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::Notify;

use cdp_proxy::CdpBrowserProxy;
use cdp_proxy_core::error::{CdpError, Result};
use cdp_proxy_core::event::{Emitter, Subscription};
use cdp_proxy_core::protocol::{BrowserVersion, CdpEvent, TargetInfo, WindowBounds, WindowForTarget};
use cdp_proxy_core::target::{CdpBrowserTarget, CdpConnection, CdpTarget};

pub fn page_info(target_id: &str, url: &str) -> TargetInfo {
    TargetInfo {
        target_id: target_id.into(),
        r#type: "page".into(),
        title: format!("Title of {url}"),
        url: url.into(),
        attached: false,
        can_access_opener: false,
        browser_context_id: None,
    }
}

pub struct FakeConnection {
    session_id: String,
    on_event: Emitter<CdpEvent>,
    on_close: Emitter<()>,
    closed: AtomicBool,
    pub sent: Mutex<Vec<(String, Value)>>,
}

impl FakeConnection {
    pub fn new(session_id: String) -> Arc<Self> {
        Arc::new(Self {
            session_id,
            on_event: Emitter::new(),
            on_close: Emitter::new(),
            closed: AtomicBool::new(false),
            sent: Mutex::new(Vec::new()),
        })
    }

    /// Simulate the page pushing a protocol event.
    pub fn push_event(&self, method: &str, params: Value) {
        self.on_event.fire(&CdpEvent::new(method, params));
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CdpConnection for FakeConnection {
    fn session_id(&self) -> &str {
        &self.session_id
    }

    fn on_event(&self) -> &Emitter<CdpEvent> {
        &self.on_event
    }

    fn on_close(&self) -> &Emitter<()> {
        &self.on_close
    }

    async fn send_message(&self, method: &str, params: Value, _session_id: Option<&str>) -> Result<Value> {
        if self.is_closed() {
            return Err(CdpError::server("Connection closed"));
        }
        self.sent.lock().push((method.to_string(), params.clone()));
        match method {
            "Runtime.evaluate" => Ok(json!({ "result": { "type": "number", "value": 2 } })),
            "Page.crash" => Err(CdpError::server("Renderer crashed")),
            _ => Ok(Value::Null),
        }
    }

    fn dispose(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.on_close.fire(&());
        }
    }
}

pub struct FakeTarget {
    info: TargetInfo,
    pub attach_calls: AtomicUsize,
    pub info_calls: AtomicUsize,
    pub connections: Mutex<Vec<Arc<FakeConnection>>>,
    attach_gate: Option<Arc<Notify>>,
    info_gate: Option<Arc<Notify>>,
}

impl FakeTarget {
    pub fn new(target_id: &str, url: &str) -> Arc<Self> {
        Arc::new(Self {
            info: page_info(target_id, url),
            attach_calls: AtomicUsize::new(0),
            info_calls: AtomicUsize::new(0),
            connections: Mutex::new(Vec::new()),
            attach_gate: None,
            info_gate: None,
        })
    }

    /// A target whose info lookups after the first (registration) block until `gate` is notified.
    pub fn slow_info(target_id: &str, url: &str, gate: Arc<Notify>) -> Arc<Self> {
        Arc::new(Self {
            info: page_info(target_id, url),
            attach_calls: AtomicUsize::new(0),
            info_calls: AtomicUsize::new(0),
            connections: Mutex::new(Vec::new()),
            attach_gate: None,
            info_gate: Some(gate),
        })
    }

    /// A target whose `attach()` blocks until `gate` is notified.
    pub fn gated(target_id: &str, url: &str, gate: Arc<Notify>) -> Arc<Self> {
        Arc::new(Self {
            info: page_info(target_id, url),
            attach_calls: AtomicUsize::new(0),
            info_calls: AtomicUsize::new(0),
            connections: Mutex::new(Vec::new()),
            attach_gate: Some(gate),
            info_gate: None,
        })
    }

    pub fn target_id(&self) -> &str {
        &self.info.target_id
    }

    pub fn attach_count(&self) -> usize {
        self.attach_calls.load(Ordering::SeqCst)
    }

    pub fn last_connection(&self) -> Option<Arc<FakeConnection>> {
        self.connections.lock().last().cloned()
    }
}

#[async_trait]
impl CdpTarget for FakeTarget {
    async fn get_target_info(&self) -> anyhow::Result<TargetInfo> {
        let earlier = self.info_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = self.info_gate.as_ref().filter(|_| earlier > 0) {
            gate.notified().await;
        }
        Ok(self.info.clone())
    }

    async fn attach(&self) -> anyhow::Result<Arc<dyn CdpConnection>> {
        let n = self.attach_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(gate) = &self.attach_gate {
            gate.notified().await;
        }
        let connection = FakeConnection::new(format!("session-{}-{n}", self.info.target_id));
        self.connections.lock().push(connection.clone());
        Ok(connection)
    }
}

pub struct FakeBrowser {
    targets: Mutex<Vec<Arc<FakeTarget>>>,
    contexts: Mutex<Vec<String>>,
    on_target_created: Emitter<Arc<dyn CdpTarget>>,
    on_target_destroyed: Emitter<Arc<dyn CdpTarget>>,
    next_id: AtomicUsize,
    pub activated: Mutex<Vec<String>>,
}

impl FakeBrowser {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            targets: Mutex::new(Vec::new()),
            contexts: Mutex::new(vec!["default-context".into()]),
            on_target_created: Emitter::new(),
            on_target_destroyed: Emitter::new(),
            next_id: AtomicUsize::new(1),
            activated: Mutex::new(Vec::new()),
        })
    }

    /// Add a target silently, as if it existed before the proxy.
    pub fn add_target(&self, target_id: &str, url: &str) -> Arc<FakeTarget> {
        let target = FakeTarget::new(target_id, url);
        self.targets.lock().push(target.clone());
        target
    }

    /// Add a target and announce it through `on_target_created`.
    pub fn open_target(&self, target: Arc<FakeTarget>) {
        self.targets.lock().push(target.clone());
        self.on_target_created.fire(&(target as Arc<dyn CdpTarget>));
    }

    pub fn destroy_target(&self, target_id: &str) -> bool {
        let removed = {
            let mut targets = self.targets.lock();
            let pos = targets.iter().position(|t| t.target_id() == target_id);
            pos.map(|i| targets.remove(i))
        };
        match removed {
            Some(target) => {
                self.on_target_destroyed.fire(&(target as Arc<dyn CdpTarget>));
                true
            }
            None => false,
        }
    }

    pub fn target(&self, target_id: &str) -> Option<Arc<FakeTarget>> {
        self.targets
            .lock()
            .iter()
            .find(|t| t.target_id() == target_id)
            .cloned()
    }

    fn window_id_of(&self, target_id: &str) -> Option<i64> {
        self.targets
            .lock()
            .iter()
            .position(|t| t.target_id() == target_id)
            .map(|i| i as i64 + 100)
    }
}

#[async_trait]
impl CdpTarget for FakeBrowser {
    async fn get_target_info(&self) -> anyhow::Result<TargetInfo> {
        Ok(TargetInfo {
            target_id: "browser".into(),
            r#type: "browser".into(),
            title: String::new(),
            url: String::new(),
            attached: true,
            can_access_opener: false,
            browser_context_id: None,
        })
    }

    async fn attach(&self) -> anyhow::Result<Arc<dyn CdpConnection>> {
        anyhow::bail!("The browser target cannot be attached directly")
    }
}

#[async_trait]
impl CdpBrowserTarget for FakeBrowser {
    fn on_target_created(&self) -> &Emitter<Arc<dyn CdpTarget>> {
        &self.on_target_created
    }

    fn on_target_destroyed(&self) -> &Emitter<Arc<dyn CdpTarget>> {
        &self.on_target_destroyed
    }

    async fn get_version(&self) -> anyhow::Result<BrowserVersion> {
        Ok(BrowserVersion {
            protocol_version: "1.3".into(),
            product: "HostBrowser/1.0".into(),
            revision: "@abc123".into(),
            user_agent: "Mozilla/5.0 HostBrowser/1.0".into(),
            js_version: "12.0".into(),
        })
    }

    async fn get_window_for_target(&self, target: Arc<dyn CdpTarget>) -> anyhow::Result<WindowForTarget> {
        let info = target.get_target_info().await?;
        let window_id = self
            .window_id_of(&info.target_id)
            .ok_or_else(|| anyhow::anyhow!("No window for target {}", info.target_id))?;
        Ok(WindowForTarget {
            window_id,
            bounds: WindowBounds {
                left: Some(0),
                top: Some(0),
                width: Some(1280),
                height: Some(720),
                window_state: Some("normal".into()),
            },
        })
    }

    fn get_targets(&self) -> Vec<Arc<dyn CdpTarget>> {
        self.targets
            .lock()
            .iter()
            .map(|t| t.clone() as Arc<dyn CdpTarget>)
            .collect()
    }

    async fn create_target(&self, url: &str, browser_context_id: Option<&str>) -> anyhow::Result<Arc<dyn CdpTarget>> {
        if let Some(ctx) = browser_context_id {
            if !self.contexts.lock().iter().any(|c| c == ctx) {
                anyhow::bail!("Unknown browser context: {ctx}");
            }
        }
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        let target = FakeTarget::new(&format!("created-{n}"), url);
        self.open_target(target.clone());
        Ok(target)
    }

    async fn activate_target(&self, target: Arc<dyn CdpTarget>) -> anyhow::Result<()> {
        let info = target.get_target_info().await?;
        self.activated.lock().push(info.target_id);
        Ok(())
    }

    async fn close_target(&self, target: Arc<dyn CdpTarget>) -> anyhow::Result<bool> {
        let info = target.get_target_info().await?;
        Ok(self.destroy_target(&info.target_id))
    }

    fn get_browser_contexts(&self) -> Vec<String> {
        self.contexts.lock().clone()
    }

    async fn create_browser_context(&self) -> anyhow::Result<String> {
        let id = format!("context-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.contexts.lock().push(id.clone());
        Ok(id)
    }

    async fn dispose_browser_context(&self, browser_context_id: &str) -> anyhow::Result<()> {
        let mut contexts = self.contexts.lock();
        let before = contexts.len();
        contexts.retain(|c| c != browser_context_id);
        if contexts.len() == before {
            anyhow::bail!("Unknown browser context: {browser_context_id}");
        }
        Ok(())
    }
}

/// Record every event the proxy emits.
pub fn capture_events(proxy: &CdpBrowserProxy) -> (Arc<Mutex<Vec<CdpEvent>>>, Subscription) {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    let sub = proxy.on_event().subscribe(move |event| sink.lock().push(event.clone()));
    (events, sub)
}

pub fn events_named(events: &Mutex<Vec<CdpEvent>>, method: &str) -> Vec<CdpEvent> {
    events
        .lock()
        .iter()
        .filter(|e| e.method == method)
        .cloned()
        .collect()
}

/// Let spawned background work (registration, auto-attach) run.
pub async fn settle() {
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
}

/// Poll `done` until it holds, for work running on other runtime workers.
pub async fn wait_until(mut done: impl FnMut() -> bool) {
    for _ in 0..400 {
        if done() {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    panic!("condition not reached within 2s");
}

pub async fn proxy_with_targets(ids: &[&str]) -> (Arc<FakeBrowser>, Arc<CdpBrowserProxy>) {
    let browser = FakeBrowser::new();
    for id in ids {
        browser.add_target(id, &format!("https://{id}.example.com"));
    }
    let proxy = CdpBrowserProxy::new(browser.clone()).await;
    (browser, proxy)
}
