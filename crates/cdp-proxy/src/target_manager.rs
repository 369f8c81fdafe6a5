//! Target registry: turns a noisy, possibly repeated, asynchronous stream of
//! target registrations into exactly one register and one unregister event
//! per target, plus lookup by external `targetId`.

use std::collections::HashMap;
use std::sync::Arc;

use futures::channel::oneshot;
use futures::future::{FutureExt, Shared};
use parking_lot::Mutex;
use tracing::{debug, info};

use cdp_proxy_core::error::{CdpError, Result};
use cdp_proxy_core::event::Emitter;
use cdp_proxy_core::protocol::TargetInfo;
use cdp_proxy_core::target::CdpTarget;

/// Stable handle for a target object, derived from its allocation.
///
/// Only meaningful while something holds the `Arc`; the manager and the proxy
/// keep the target alive for as long as a key is stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TargetKey(usize);

impl TargetKey {
    pub fn of(target: &Arc<dyn CdpTarget>) -> Self {
        Self(Arc::as_ptr(target) as *const () as usize)
    }
}

/// Payload of the register/unregister events.
#[derive(Clone)]
pub struct TargetEvent {
    pub target: Arc<dyn CdpTarget>,
    pub target_info: TargetInfo,
    /// Announcement order; see [`TargetManager::snapshot`].
    pub seq: u64,
}

impl std::fmt::Debug for TargetEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TargetEvent")
            .field("target_info", &self.target_info)
            .field("seq", &self.seq)
            .finish_non_exhaustive()
    }
}

type Announced = Shared<oneshot::Receiver<TargetInfo>>;

enum Resolution {
    /// Info is still being fetched; resolves once the owning `register` has announced it.
    Pending(Announced),
    Resolved { info: TargetInfo, seq: u64 },
}

struct Entry {
    target: Arc<dyn CdpTarget>,
    generation: u64,
    resolution: Resolution,
}

#[derive(Default)]
struct ManagerState {
    known: HashMap<TargetKey, Entry>,
    by_id: HashMap<String, TargetKey>,
    next_generation: u64,
    next_seq: u64,
}

#[derive(Default)]
pub struct TargetManager {
    state: Mutex<ManagerState>,
    on_did_register_target: Emitter<TargetEvent>,
    on_did_unregister_target: Emitter<TargetEvent>,
}

enum Claim {
    Owner {
        generation: u64,
        announce: oneshot::Sender<TargetInfo>,
    },
    Resolved(TargetInfo),
    Pending(Announced),
}

/// The owning side of a pending registration. Dropping it unannounced
/// releases the entry so waiters can claim the target again.
struct OwnerClaim<'a> {
    manager: &'a TargetManager,
    key: TargetKey,
    generation: u64,
    announce: Option<oneshot::Sender<TargetInfo>>,
}

impl OwnerClaim<'_> {
    fn announce(mut self, info: TargetInfo) {
        if let Some(announce) = self.announce.take() {
            let _ = announce.send(info);
        }
    }
}

impl Drop for OwnerClaim<'_> {
    fn drop(&mut self) {
        // Runs before the sender drops, so woken waiters find the entry gone.
        if self.announce.is_some() {
            self.manager.forget_generation(self.key, self.generation);
        }
    }
}

impl TargetManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_did_register_target(&self) -> &Emitter<TargetEvent> {
        &self.on_did_register_target
    }

    pub fn on_did_unregister_target(&self) -> &Emitter<TargetEvent> {
        &self.on_did_unregister_target
    }

    /// Register `target`, resolving its info. Repeated or concurrent calls for
    /// the same target announce it only once.
    ///
    /// Cancellation-safe: if the call that claimed the target is dropped or
    /// fails before announcing, the claim is released and a waiting caller
    /// takes it over.
    pub async fn register(&self, target: Arc<dyn CdpTarget>) -> Result<TargetInfo> {
        let key = TargetKey::of(&target);

        loop {
            match self.claim(key, &target) {
                Claim::Resolved(info) => return Ok(info),
                Claim::Pending(announced) => {
                    if let Ok(info) = announced.await {
                        return Ok(info);
                    }
                    // The owner went away without announcing; claim again.
                }
                Claim::Owner {
                    generation,
                    announce,
                } => {
                    let owner = OwnerClaim {
                        manager: self,
                        key,
                        generation,
                        announce: Some(announce),
                    };
                    return self.resolve(target, owner).await;
                }
            }
        }
    }

    /// Claim `key` before the first await so a concurrent call sees it.
    fn claim(&self, key: TargetKey, target: &Arc<dyn CdpTarget>) -> Claim {
        let mut state = self.state.lock();
        let existing = state.known.get(&key).map(|entry| match &entry.resolution {
            Resolution::Resolved { info, .. } => Claim::Resolved(info.clone()),
            Resolution::Pending(announced) => Claim::Pending(announced.clone()),
        });
        if let Some(claim) = existing {
            return claim;
        }

        state.next_generation += 1;
        let generation = state.next_generation;
        let (announce, announced) = oneshot::channel();
        state.known.insert(
            key,
            Entry {
                target: target.clone(),
                generation,
                resolution: Resolution::Pending(announced.shared()),
            },
        );
        Claim::Owner {
            generation,
            announce,
        }
    }

    async fn resolve(&self, target: Arc<dyn CdpTarget>, owner: OwnerClaim<'_>) -> Result<TargetInfo> {
        let info = target.get_target_info().await.map_err(CdpError::from_anyhow)?;

        let seq = {
            let mut state = self.state.lock();
            let ManagerState {
                known,
                by_id,
                next_seq,
                ..
            } = &mut *state;
            match known.get_mut(&owner.key) {
                Some(entry) if entry.generation == owner.generation => {
                    *next_seq += 1;
                    entry.resolution = Resolution::Resolved {
                        info: info.clone(),
                        seq: *next_seq,
                    };
                    by_id.insert(info.target_id.clone(), owner.key);
                    Some(*next_seq)
                }
                _ => None,
            }
        };

        let Some(seq) = seq else {
            debug!(target_id = %info.target_id, "Target went away before its info resolved");
            owner.announce(info.clone());
            return Ok(info);
        };

        info!(target_id = %info.target_id, kind = %info.r#type, "Target registered");
        self.on_did_register_target.fire(&TargetEvent {
            target,
            target_info: info.clone(),
            seq,
        });
        owner.announce(info.clone());
        Ok(info)
    }

    /// Forget `target`. Emits the unregister event only if the register event was emitted.
    pub fn unregister(&self, target: &Arc<dyn CdpTarget>) {
        let key = TargetKey::of(target);
        let removed = {
            let mut state = self.state.lock();
            let Some(entry) = state.known.remove(&key) else {
                return;
            };
            if let Resolution::Resolved { info, .. } = &entry.resolution {
                if state.by_id.get(&info.target_id) == Some(&key) {
                    state.by_id.remove(&info.target_id);
                }
            }
            entry
        };

        match removed.resolution {
            Resolution::Resolved { info, seq } => {
                info!(target_id = %info.target_id, "Target unregistered");
                self.on_did_unregister_target.fire(&TargetEvent {
                    target: removed.target,
                    target_info: info,
                    seq,
                });
            }
            Resolution::Pending(_) => {
                debug!("Target unregistered while its info was still resolving");
            }
        }
    }

    pub fn get_by_id(&self, target_id: &str) -> Result<Arc<dyn CdpTarget>> {
        let state = self.state.lock();
        state
            .by_id
            .get(target_id)
            .and_then(|key| state.known.get(key))
            .map(|entry| entry.target.clone())
            .ok_or_else(|| CdpError::server(format!("Unknown targetId: {target_id}")))
    }

    /// Snapshot of every resolved target's info, in the order they were announced.
    pub fn get_all_infos(&self) -> impl Iterator<Item = TargetInfo> + use<> {
        self.snapshot().0.into_iter()
    }

    /// Resolved infos in announce order, plus the highest `seq` handed out so far.
    ///
    /// Every register event with `seq` at or below the returned mark is
    /// covered by the snapshot, even if its listeners have not run yet.
    pub fn snapshot(&self) -> (Vec<TargetInfo>, u64) {
        let state = self.state.lock();
        let mut infos: Vec<(u64, TargetInfo)> = state
            .by_id
            .values()
            .filter_map(|key| match &state.known.get(key)?.resolution {
                Resolution::Resolved { info, seq } => Some((*seq, info.clone())),
                Resolution::Pending(_) => None,
            })
            .collect();
        infos.sort_by_key(|(seq, _)| *seq);
        let infos = infos.into_iter().map(|(_, info)| info).collect();
        (infos, state.next_seq)
    }

    pub fn is_known(&self, target: &Arc<dyn CdpTarget>) -> bool {
        self.state.lock().known.contains_key(&TargetKey::of(target))
    }

    pub fn len(&self) -> usize {
        self.state.lock().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn forget_generation(&self, key: TargetKey, generation: u64) {
        let mut state = self.state.lock();
        if state
            .known
            .get(&key)
            .is_some_and(|entry| entry.generation == generation)
        {
            state.known.remove(&key);
        }
    }
}
