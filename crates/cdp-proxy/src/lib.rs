//! Browser-level Chrome DevTools Protocol proxy.
//!
//! One external debugger connection is multiplexed across every target the
//! host exposes: `Browser.*`/`Target.*` commands are handled here, everything
//! else is routed to the attached session named by `sessionId`, and target
//! lifecycle is surfaced as CDP `Target.*` events.

pub mod dispatch;
pub mod methods;
pub mod proxy;
pub mod target_manager;

pub use dispatch::{dispatch_request, forward_events};
pub use proxy::{AttachFuture, CdpBrowserProxy};
pub use target_manager::{TargetEvent, TargetKey, TargetManager};
