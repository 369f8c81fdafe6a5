//! Glue between parsed wire envelopes and the proxy.
//!
//! The transport owns framing; these helpers take a parsed [`CdpRequest`] to a
//! [`CdpResponse`], and pump the proxy's events into a per-client channel as
//! serialized JSON.

use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, error};

use cdp_proxy_core::event::Subscription;
use cdp_proxy_core::protocol::{CdpRequest, CdpResponse};

use crate::proxy::CdpBrowserProxy;

/// Run one request and build its response. Never fails: errors become `error` objects.
pub async fn dispatch_request(proxy: &CdpBrowserProxy, request: CdpRequest) -> CdpResponse {
    let CdpRequest {
        id,
        method,
        params,
        session_id,
    } = request;

    let params = params.unwrap_or_else(|| json!({}));
    match proxy.send_message(&method, params, session_id.as_deref()).await {
        Ok(result) => CdpResponse::ok(id, result, session_id),
        Err(e) => {
            debug!(id, method = %method, code = e.code(), %e, "CDP request failed");
            CdpResponse::err(id, e.to_shape(), session_id)
        }
    }
}

/// Serialize every event the proxy emits and push it into `event_tx`.
///
/// Forwarding stops when the returned subscription is dropped.
pub fn forward_events(proxy: &CdpBrowserProxy, event_tx: mpsc::UnboundedSender<String>) -> Subscription {
    proxy.on_event().subscribe(move |event| {
        let msg = match serde_json::to_string(event) {
            Ok(m) => m,
            Err(e) => {
                error!(%e, method = %event.method, "Failed to serialize event");
                return;
            }
        };
        if event_tx.send(msg).is_err() {
            debug!(method = %event.method, "Event receiver gone; dropping event");
        }
    })
}
