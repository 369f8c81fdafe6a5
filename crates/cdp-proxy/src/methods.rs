//! `Browser.*` and `Target.*` handlers answered by the proxy itself.

use std::sync::Arc;

use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::{debug, warn};

use cdp_proxy_core::error::CdpError;
use cdp_proxy_core::target::CdpTarget;

use crate::proxy::CdpBrowserProxy;

/// Methods in the handler table.
pub const SUPPORTED_METHODS: &[&str] = &[
    "Browser.getVersion",
    "Browser.getWindowForTarget",
    "Target.getBrowserContexts",
    "Target.createBrowserContext",
    "Target.disposeBrowserContext",
    "Target.attachToBrowserTarget",
    "Target.activateTarget",
    "Target.closeTarget",
    "Target.setAutoAttach",
    "Target.setDiscoverTargets",
    "Target.getTargets",
    "Target.getTargetInfo",
    "Target.attachToTarget",
    "Target.detachFromTarget",
    "Target.createTarget",
];

/// Run a browser-level method. `session_id` is the session the call arrived on.
pub(crate) async fn dispatch_method(
    proxy: &CdpBrowserProxy,
    method: &str,
    params: Value,
    session_id: Option<&str>,
) -> anyhow::Result<Value> {
    match method {
        "Browser.getVersion" => {
            let version = proxy.browser().get_version().await?;
            Ok(serde_json::to_value(version)?)
        }
        "Browser.getWindowForTarget" => handle_get_window_for_target(proxy, params, session_id).await,
        "Target.getBrowserContexts" => Ok(json!({
            "browserContextIds": proxy.browser().get_browser_contexts(),
        })),
        "Target.createBrowserContext" => {
            let id = proxy.browser().create_browser_context().await?;
            Ok(json!({ "browserContextId": id }))
        }
        "Target.disposeBrowserContext" => {
            let p: BrowserContextParams = parse_params(params)?;
            proxy.browser().dispose_browser_context(&p.browser_context_id).await?;
            Ok(json!({}))
        }
        "Target.attachToBrowserTarget" => {
            proxy.set_attached_to_browser_target();
            Ok(json!({ "sessionId": proxy.session_id() }))
        }
        "Target.activateTarget" => {
            let p: TargetIdParams = parse_params(params)?;
            let target = proxy.target_manager().get_by_id(&p.target_id)?;
            proxy.browser().activate_target(target).await?;
            Ok(json!({}))
        }
        "Target.closeTarget" => Ok(handle_close_target(proxy, params).await),
        "Target.setAutoAttach" => {
            let p: SetAutoAttachParams = parse_params(params)?;
            require_flatten(p.flatten)?;
            // Only targets registered from now on are auto-attached.
            proxy.set_auto_attach(p.auto_attach);
            Ok(json!({}))
        }
        "Target.setDiscoverTargets" => {
            let p: SetDiscoverTargetsParams = parse_params(params)?;
            if let Some(backfill) = proxy.set_discover(p.discover) {
                for info in &backfill {
                    proxy.emit_target_created(info);
                }
            }
            Ok(json!({}))
        }
        "Target.getTargets" => {
            let infos: Vec<_> = proxy.target_manager().get_all_infos().collect();
            Ok(json!({ "targetInfos": infos }))
        }
        "Target.getTargetInfo" => {
            let p: OptionalTargetIdParams = parse_params(params)?;
            let info = match p.target_id {
                Some(id) => proxy.target_manager().get_by_id(&id)?.get_target_info().await?,
                None => proxy.browser().get_target_info().await?,
            };
            Ok(json!({ "targetInfo": info }))
        }
        "Target.attachToTarget" => {
            let p: AttachToTargetParams = parse_params(params)?;
            require_flatten(p.flatten)?;
            let connection = proxy.attach_to_target(&p.target_id, false).await?;
            Ok(json!({ "sessionId": connection.session_id() }))
        }
        "Target.detachFromTarget" => {
            let p: DetachFromTargetParams = parse_params(params)?;
            let sid = match (p.session_id, p.target_id) {
                (Some(sid), _) => sid,
                (None, Some(tid)) => proxy
                    .session_for_target(&tid)
                    .ok_or_else(|| CdpError::server(format!("No session attached to target: {tid}")))?,
                (None, None) => return Err(CdpError::invalid_params("sessionId is required").into()),
            };
            let connection = proxy
                .session_connection(&sid)
                .ok_or_else(|| CdpError::server(format!("Session not found: {sid}")))?;
            connection.dispose();
            Ok(json!({}))
        }
        "Target.createTarget" => {
            let p: CreateTargetParams = parse_params(params)?;
            let target = proxy
                .browser()
                .create_target(&p.url, p.browser_context_id.as_deref())
                .await?;
            let info = proxy.target_manager().register(target).await?;
            // Some clients require attachedToTarget to be observed before createTarget returns.
            if proxy.auto_attach_enabled() {
                proxy.attach_to_target(&info.target_id, true).await?;
            }
            Ok(json!({ "targetId": info.target_id }))
        }
        _ => Err(CdpError::method_not_found(method).into()),
    }
}

async fn handle_get_window_for_target(
    proxy: &CdpBrowserProxy,
    params: Value,
    session_id: Option<&str>,
) -> anyhow::Result<Value> {
    let p: OptionalTargetIdParams = parse_params(params)?;
    let target_id = p
        .target_id
        .or_else(|| session_id.and_then(|sid| proxy.session_target_id(sid)))
        .ok_or_else(|| CdpError::server("No target specified and session is not attached to a target"))?;
    let target: Arc<dyn CdpTarget> = proxy.target_manager().get_by_id(&target_id)?;
    let window = proxy.browser().get_window_for_target(target).await?;
    Ok(serde_json::to_value(window)?)
}

/// Closing is best-effort: every failure is reported as `success: false`.
async fn handle_close_target(proxy: &CdpBrowserProxy, params: Value) -> Value {
    let attempt = async {
        let p: TargetIdParams = parse_params(params)?;
        let target = proxy.target_manager().get_by_id(&p.target_id)?;
        let closed = proxy.browser().close_target(target).await?;
        Ok::<bool, anyhow::Error>(closed)
    };
    match attempt.await {
        Ok(success) => json!({ "success": success }),
        Err(e) => {
            warn!(%e, "Target.closeTarget failed");
            json!({ "success": false })
        }
    }
}

fn require_flatten(flatten: Option<bool>) -> Result<(), CdpError> {
    if flatten == Some(true) {
        Ok(())
    } else {
        Err(CdpError::invalid_params("Only flatten mode is supported (flatten: true)"))
    }
}

fn parse_params<T: DeserializeOwned>(params: Value) -> Result<T, CdpError> {
    let params = if params.is_null() { json!({}) } else { params };
    serde_json::from_value(params).map_err(|e| {
        debug!(%e, "Rejected method params");
        CdpError::invalid_params(format!("Invalid parameters: {e}"))
    })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TargetIdParams {
    target_id: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OptionalTargetIdParams {
    #[serde(default)]
    target_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BrowserContextParams {
    browser_context_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SetAutoAttachParams {
    #[serde(default)]
    auto_attach: bool,
    #[serde(default)]
    flatten: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SetDiscoverTargetsParams {
    #[serde(default)]
    discover: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AttachToTargetParams {
    target_id: String,
    #[serde(default)]
    flatten: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DetachFromTargetParams {
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    target_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateTargetParams {
    #[serde(default = "default_url")]
    url: String,
    #[serde(default)]
    browser_context_id: Option<String>,
}

fn default_url() -> String {
    "about:blank".into()
}
