//! Two-phase resource-state tracking.
//!
//! Each command list owns a private [`ResourceStateTracker`]. Transitions
//! whose before-state is locally known are resolved immediately (and elided
//! when redundant); transitions touching a resource the list has not seen
//! yet are parked as *pending* and resolved against the
//! [`GlobalStateTable`] at submission time, when the table lock is held and
//! global truth is authoritative. Committing the list's final states under
//! the same lock makes them visible to the next list's pending resolution —
//! synchronously at submission, not at GPU completion.

use rustc_hash::FxHashMap;

use crate::gpu::barrier::{BarrierRecord, ResourceState, TransitionBarrier, ALL_SUBRESOURCES};
use crate::gpu::device::{CommandRecorder, ResourceHandle};

/// Last-known state of one resource: a whole-resource state plus any
/// subresources that have diverged from it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateEntry {
    state: ResourceState,
    subresources: FxHashMap<u32, ResourceState>,
}

impl StateEntry {
    fn new(state: ResourceState) -> Self {
        Self {
            state,
            subresources: FxHashMap::default(),
        }
    }

    /// Record a state. An [`ALL_SUBRESOURCES`] write collapses every
    /// divergence.
    fn set(&mut self, subresource: u32, state: ResourceState) {
        if subresource == ALL_SUBRESOURCES {
            self.state = state;
            self.subresources.clear();
        } else {
            let _ = self.subresources.insert(subresource, state);
        }
    }

    /// State of one subresource, falling back to the whole-resource state.
    #[must_use]
    pub fn subresource_state(&self, subresource: u32) -> ResourceState {
        if subresource == ALL_SUBRESOURCES {
            self.state
        } else {
            self.subresources
                .get(&subresource)
                .copied()
                .unwrap_or(self.state)
        }
    }

    fn diverged(&self) -> &FxHashMap<u32, ResourceState> {
        &self.subresources
    }
}

/// Process-wide truth about every live resource's last committed state.
///
/// Owned by the render context (explicit lifecycle, no statics) and shared
/// behind one mutex. [`ResourceStateTracker::flush_pending_barriers`] and
/// [`ResourceStateTracker::commit_final_states`] both require the caller to
/// hold that mutex; the borrow they take on this table is only reachable
/// through its `MutexGuard`, which enforces the contract structurally.
#[derive(Debug, Default)]
pub struct GlobalStateTable {
    states: FxHashMap<ResourceHandle, StateEntry>,
}

impl GlobalStateTable {
    /// Empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a newly created resource with its initial state.
    pub fn register(&mut self, resource: ResourceHandle, state: ResourceState) {
        let _ = self.states.insert(resource, StateEntry::new(state));
    }

    /// Drop a destroyed resource's entry.
    pub fn unregister(&mut self, resource: ResourceHandle) {
        let _ = self.states.remove(&resource);
    }

    /// Committed state of a resource's subresource, if the resource is live.
    #[must_use]
    pub fn state_of(&self, resource: ResourceHandle, subresource: u32) -> Option<ResourceState> {
        self.states
            .get(&resource)
            .map(|e| e.subresource_state(subresource))
    }

    /// Number of live registered resources.
    #[must_use]
    pub fn len(&self) -> usize {
        self.states.len()
    }

    /// Whether no resources are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    fn get(&self, resource: ResourceHandle) -> Option<&StateEntry> {
        self.states.get(&resource)
    }

    fn set_entry(&mut self, resource: ResourceHandle, entry: StateEntry) {
        let _ = self.states.insert(resource, entry);
    }
}

/// Per-command-list barrier bookkeeping.
///
/// Minimizes and correctly orders transition barriers: redundant requests
/// (local final state already equals the requested after-state) append
/// nothing, and before-states are always computed from the true last-known
/// state at the time of emission.
#[derive(Debug, Default)]
pub struct ResourceStateTracker {
    /// Barriers whose before-state is unknown until submission.
    pending: Vec<TransitionBarrier>,
    /// Fully resolved barriers not yet flushed into the recorder.
    barriers: Vec<BarrierRecord>,
    /// State each resource will be in after all locally recorded barriers.
    final_states: FxHashMap<ResourceHandle, StateEntry>,
}

impl ResourceStateTracker {
    /// Empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a transition request.
    ///
    /// If the resource's locally final state is known, the true before-state
    /// comes from it: an [`ALL_SUBRESOURCES`] request against a resource with
    /// diverged subresources expands into one barrier per diverged
    /// subresource, and barriers with `before == after` are elided entirely.
    /// Unknown resources park the request as pending until
    /// [`Self::flush_pending_barriers`] resolves it against global state.
    pub fn transition(&mut self, barrier: TransitionBarrier) {
        let TransitionBarrier {
            resource,
            subresource,
            after,
        } = barrier;

        if let Some(entry) = self.final_states.get(&resource) {
            if subresource == ALL_SUBRESOURCES && !entry.diverged().is_empty() {
                for (&sub, &before) in entry.diverged() {
                    if before != after {
                        self.barriers.push(BarrierRecord {
                            resource,
                            subresource: sub,
                            before,
                            after,
                        });
                    }
                }
            } else {
                let before = entry.subresource_state(subresource);
                if before != after {
                    self.barriers.push(BarrierRecord {
                        resource,
                        subresource,
                        before,
                        after,
                    });
                }
            }
        } else {
            self.pending.push(barrier);
        }

        self.final_states
            .entry(resource)
            .or_default()
            .set(subresource, after);
    }

    /// Emit all accumulated concrete barriers into the recorder and clear
    /// them.
    pub fn flush_barriers(&mut self, recorder: &mut dyn CommandRecorder) {
        if self.barriers.is_empty() {
            return;
        }
        log::trace!("flushing {} resolved barriers", self.barriers.len());
        recorder.resource_barriers(&self.barriers);
        self.barriers.clear();
    }

    /// Resolve every pending barrier's before-state from global truth and
    /// emit the non-redundant ones into `recorder` (the auxiliary pending
    /// list). Returns the number of barriers emitted.
    ///
    /// Must be called exactly once per submission, with the global-state
    /// mutex held; the `&GlobalStateTable` parameter is only reachable
    /// through that mutex's guard.
    pub fn flush_pending_barriers(
        &mut self,
        global: &GlobalStateTable,
        recorder: &mut dyn CommandRecorder,
    ) -> usize {
        let mut resolved = Vec::new();

        for pending in self.pending.drain(..) {
            let Some(entry) = global.get(pending.resource) else {
                // Every live resource registers itself at creation; a miss
                // here means the caller destroyed it while still recorded.
                debug_assert!(false, "pending barrier on unregistered resource");
                log::error!(
                    "pending barrier on unregistered resource {:?}; dropping",
                    pending.resource
                );
                continue;
            };

            if pending.subresource == ALL_SUBRESOURCES && !entry.diverged().is_empty() {
                for (&sub, &before) in entry.diverged() {
                    if before != pending.after {
                        resolved.push(BarrierRecord {
                            resource: pending.resource,
                            subresource: sub,
                            before,
                            after: pending.after,
                        });
                    }
                }
            } else {
                let before = entry.subresource_state(pending.subresource);
                if before != pending.after {
                    resolved.push(BarrierRecord {
                        resource: pending.resource,
                        subresource: pending.subresource,
                        before,
                        after: pending.after,
                    });
                }
            }
        }

        if !resolved.is_empty() {
            log::trace!("emitting {} pending barriers", resolved.len());
            recorder.resource_barriers(&resolved);
        }
        resolved.len()
    }

    /// Publish this list's final states into the global table and clear the
    /// local map. Runs under the same lock acquisition as
    /// [`Self::flush_pending_barriers`].
    pub fn commit_final_states(&mut self, global: &mut GlobalStateTable) {
        for (resource, entry) in self.final_states.drain() {
            global.set_entry(resource, entry);
        }
    }

    /// Forget all local knowledge (list reset).
    pub fn reset(&mut self) {
        self.pending.clear();
        self.barriers.clear();
        self.final_states.clear();
    }

    /// Number of parked pending barriers.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Number of resolved barriers awaiting a flush.
    #[must_use]
    pub fn unflushed_len(&self) -> usize {
        self.barriers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::device::QueueKind;
    use crate::gpu::null::NullRecorder;

    const R: ResourceHandle = ResourceHandle(7);

    fn rt() -> ResourceState {
        ResourceState::RenderTarget
    }

    #[test]
    fn redundant_transition_appends_nothing() {
        let mut tracker = ResourceStateTracker::new();
        tracker.transition(TransitionBarrier::whole(R, rt()));
        assert_eq!(tracker.pending_len(), 1);

        // Local final state is already RenderTarget: no new barrier, no new
        // pending entry.
        tracker.transition(TransitionBarrier::whole(R, rt()));
        assert_eq!(tracker.pending_len(), 1);
        assert_eq!(tracker.unflushed_len(), 0);
    }

    #[test]
    fn chained_transitions_emit_consistent_befores() {
        let mut tracker = ResourceStateTracker::new();
        tracker.transition(TransitionBarrier::whole(R, ResourceState::CopyDest));
        tracker.transition(TransitionBarrier::whole(R, rt()));
        tracker.transition(TransitionBarrier::whole(R, ResourceState::PixelShaderResource));

        let mut recorder = NullRecorder::new(QueueKind::Direct);
        tracker.flush_barriers(&mut recorder);

        let barriers = recorder.barriers().to_vec();
        assert_eq!(barriers.len(), 2);
        assert_eq!(barriers[0].before, ResourceState::CopyDest);
        assert_eq!(barriers[0].after, rt());
        assert_eq!(barriers[1].before, rt());
        assert_eq!(barriers[1].after, ResourceState::PixelShaderResource);
        for b in &barriers {
            assert_ne!(b.before, b.after);
        }
    }

    #[test]
    fn round_trip_on_one_list_emits_exactly_two_barriers() {
        // Common -> RenderTarget (pending: before unknown locally), draw,
        // RenderTarget -> Common. After global resolution: exactly two
        // barriers, none with before == after.
        let mut global = GlobalStateTable::new();
        global.register(R, ResourceState::Common);

        let mut tracker = ResourceStateTracker::new();
        tracker.transition(TransitionBarrier::whole(R, rt()));
        tracker.transition(TransitionBarrier::whole(R, ResourceState::Common));

        let mut own = NullRecorder::new(QueueKind::Direct);
        let mut pending = NullRecorder::new(QueueKind::Direct);

        tracker.flush_barriers(&mut own);
        let emitted = tracker.flush_pending_barriers(&global, &mut pending);
        tracker.commit_final_states(&mut global);

        assert_eq!(emitted, 1);
        let total: Vec<_> = pending
            .barriers()
            .iter()
            .chain(own.barriers().iter())
            .copied()
            .collect();
        assert_eq!(total.len(), 2);
        assert_eq!(total[0].before, ResourceState::Common);
        assert_eq!(total[0].after, rt());
        assert_eq!(total[1].before, rt());
        assert_eq!(total[1].after, ResourceState::Common);
        for b in &total {
            assert_ne!(b.before, b.after);
        }
        assert_eq!(global.state_of(R, ALL_SUBRESOURCES), Some(ResourceState::Common));
    }

    #[test]
    fn commit_makes_states_visible_to_next_list_without_gpu_wait() {
        // L1 leaves R in PixelShaderResource; L2 submitted immediately
        // expects that state. L2's pending barrier resolves against the
        // committed global state and emits nothing.
        let mut global = GlobalStateTable::new();
        global.register(R, ResourceState::Common);

        let mut l1 = ResourceStateTracker::new();
        l1.transition(TransitionBarrier::whole(R, ResourceState::PixelShaderResource));
        let mut pending1 = NullRecorder::new(QueueKind::Direct);
        assert_eq!(l1.flush_pending_barriers(&global, &mut pending1), 1);
        l1.commit_final_states(&mut global);

        let mut l2 = ResourceStateTracker::new();
        l2.transition(TransitionBarrier::whole(R, ResourceState::PixelShaderResource));
        let mut pending2 = NullRecorder::new(QueueKind::Direct);
        assert_eq!(l2.flush_pending_barriers(&global, &mut pending2), 0);
        l2.commit_final_states(&mut global);
        assert!(pending2.barriers().is_empty());
    }

    #[test]
    fn all_subresources_request_expands_over_diverged_subresources() {
        let mut tracker = ResourceStateTracker::new();
        // Diverge two mips, then request the whole resource.
        tracker.transition(TransitionBarrier {
            resource: R,
            subresource: 0,
            after: ResourceState::CopyDest,
        });
        tracker.transition(TransitionBarrier {
            resource: R,
            subresource: 1,
            after: ResourceState::CopySource,
        });
        tracker.transition(TransitionBarrier::whole(R, ResourceState::PixelShaderResource));

        let mut recorder = NullRecorder::new(QueueKind::Direct);
        tracker.flush_barriers(&mut recorder);

        // Subresource 0 and 1 each get their own barrier; the first two
        // per-subresource requests were pending (resource unseen locally).
        let mut subs: Vec<u32> = recorder
            .barriers()
            .iter()
            .filter(|b| b.after == ResourceState::PixelShaderResource)
            .map(|b| b.subresource)
            .collect();
        subs.sort_unstable();
        assert_eq!(subs, vec![0, 1]);
    }

    #[test]
    fn unregister_removes_global_entry() {
        let mut global = GlobalStateTable::new();
        global.register(R, ResourceState::Common);
        assert_eq!(global.len(), 1);
        global.unregister(R);
        assert!(global.is_empty());
        assert_eq!(global.state_of(R, ALL_SUBRESOURCES), None);
    }
}
