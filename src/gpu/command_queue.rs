//! Command-list pooling, submission, and fence-driven reclamation.
//!
//! A [`CommandQueue`] owns a device execution queue, its monotone fence,
//! and a pool of recycled [`CommandList`]s. Submission is two-phase: every
//! list closes against a pooled auxiliary *pending* list that receives the
//! barriers whose before-states only became known at submission; a pending
//! list that received barriers executes immediately before its owner.
//!
//! Submitted lists travel as `(fence value, list)` entries over a channel
//! to a dedicated reclamation thread, which waits (bounded) on the fence
//! and only then resets the list and returns it to the pool. Channel
//! disconnect doubles as the shutdown signal, keeping teardown
//! deterministic.

use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::error::EngineError;
use crate::gpu::command_list::CommandList;
use crate::gpu::device::{
    CommandRecorder, Device, DeviceError, Fence, QueueKind, SubmitQueue,
};
use crate::gpu::state_tracker::GlobalStateTable;

struct InFlight {
    fence_value: u64,
    list: CommandList,
}

struct QueueShared {
    available: Mutex<Vec<CommandList>>,
    in_flight: Mutex<usize>,
    drained: Condvar,
}

struct SubmitState {
    next_fence_value: u64,
}

/// An ordered GPU submission channel with pooled command lists.
pub struct CommandQueue {
    kind: QueueKind,
    device: Arc<dyn Device>,
    globals: Arc<Mutex<GlobalStateTable>>,
    queue: Arc<dyn SubmitQueue>,
    fence: Arc<dyn Fence>,
    upload_page_size: usize,
    fence_timeout: Duration,
    /// Serializes fence-value assignment with submission order.
    submit: Mutex<SubmitState>,
    shared: Arc<QueueShared>,
    sender: Option<mpsc::Sender<InFlight>>,
    worker: Option<JoinHandle<()>>,
}

impl CommandQueue {
    /// Create a queue of `kind` with its reclamation worker.
    pub fn new(
        device: Arc<dyn Device>,
        globals: Arc<Mutex<GlobalStateTable>>,
        kind: QueueKind,
        upload_page_size: usize,
        fence_timeout: Duration,
    ) -> Result<Self, EngineError> {
        let queue = device.create_queue(kind)?;
        let fence = queue.fence();
        let shared = Arc::new(QueueShared {
            available: Mutex::new(Vec::new()),
            in_flight: Mutex::new(0),
            drained: Condvar::new(),
        });
        let (sender, receiver) = mpsc::channel::<InFlight>();

        let worker = {
            let fence = fence.clone();
            let shared = shared.clone();
            std::thread::Builder::new()
                .name(format!("lantern-{kind}-reclaim"))
                .spawn(move || reclamation_loop(&receiver, fence.as_ref(), &shared, fence_timeout))
                .map_err(EngineError::ThreadSpawn)?
        };

        Ok(Self {
            kind,
            device,
            globals,
            queue,
            fence,
            upload_page_size,
            fence_timeout,
            submit: Mutex::new(SubmitState {
                next_fence_value: 0,
            }),
            shared,
            sender: Some(sender),
            worker: Some(worker),
        })
    }

    /// Queue kind.
    #[must_use]
    pub fn kind(&self) -> QueueKind {
        self.kind
    }

    /// Check a recycled command list out of the pool, creating one when the
    /// pool is dry.
    pub fn command_list(&self) -> Result<CommandList, DeviceError> {
        let recycled = self
            .shared
            .available
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop();
        match recycled {
            Some(list) => Ok(list),
            None => CommandList::new(
                self.device.clone(),
                self.globals.clone(),
                self.kind,
                self.upload_page_size,
            ),
        }
    }

    /// Close and execute a batch of command lists, in order.
    ///
    /// Holds the global-state lock across every close (pending-barrier
    /// resolution + final-state commit form one serialization point), then
    /// submits, signals the fence, and hands every used list — auxiliary
    /// pending lists included — to the reclamation worker tagged with the
    /// new fence value. Returns that fence value.
    pub fn execute_command_lists(
        &self,
        lists: Vec<CommandList>,
    ) -> Result<u64, DeviceError> {
        let mut submit = self.lock_submit();
        let mut used: Vec<CommandList> = Vec::with_capacity(lists.len() * 2);

        {
            let mut global = self
                .globals
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            for mut list in lists {
                debug_assert_eq!(list.kind(), self.kind, "list submitted to wrong queue");
                let mut pending = self.command_list()?;
                let used_pending = list.close_into(&mut pending, &mut global)?;
                if used_pending {
                    // Pending barriers exist: the auxiliary list must run
                    // immediately before its owner.
                    pending.close_recorder()?;
                    used.push(pending);
                } else {
                    // Untouched; straight back to the pool, still open.
                    self.shared
                        .available
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .push(pending);
                }
                used.push(list);
            }
        }

        {
            let mut refs: Vec<&mut dyn CommandRecorder> =
                used.iter_mut().map(CommandList::recorder_mut).collect();
            self.queue.execute(&mut refs)?;
        }

        submit.next_fence_value += 1;
        let fence_value = submit.next_fence_value;
        self.queue.signal(fence_value)?;
        drop(submit);

        for mut list in used {
            list.on_submitted(fence_value);
            {
                let mut count = self
                    .shared
                    .in_flight
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                *count += 1;
            }
            if let Some(sender) = &self.sender {
                if sender
                    .send(InFlight {
                        fence_value,
                        list,
                    })
                    .is_err()
                {
                    log::error!("reclamation worker is gone; leaking a command list");
                }
            }
        }
        Ok(fence_value)
    }

    /// Signal a new fence value after all currently submitted work.
    pub fn signal(&self) -> Result<u64, DeviceError> {
        let mut submit = self.lock_submit();
        submit.next_fence_value += 1;
        let value = submit.next_fence_value;
        self.queue.signal(value)?;
        Ok(value)
    }

    /// Highest fence value the GPU has retired.
    #[must_use]
    pub fn completed_fence_value(&self) -> u64 {
        self.fence.completed_value()
    }

    /// Whether `value` has retired.
    #[must_use]
    pub fn is_fence_complete(&self, value: u64) -> bool {
        self.completed_fence_value() >= value
    }

    /// Block until `value` retires, within the configured bounded timeout.
    pub fn wait_for_fence_value(&self, value: u64) -> Result<(), DeviceError> {
        self.fence.wait(value, self.fence_timeout)
    }

    /// Block until every submitted list has retired *and* been reclaimed.
    ///
    /// Used at initialization and shutdown boundaries.
    pub fn flush(&self) -> Result<(), DeviceError> {
        let value = self.signal()?;
        self.wait_for_fence_value(value)?;

        let mut count = self
            .shared
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        while *count > 0 {
            let (guard, wait) = self
                .shared
                .drained
                .wait_timeout(count, self.fence_timeout)
                .unwrap_or_else(PoisonError::into_inner);
            count = guard;
            if wait.timed_out() && *count > 0 {
                return Err(DeviceError::DeviceLost(format!(
                    "{} reclamation queue failed to drain ({} lists in flight)",
                    self.kind, *count
                )));
            }
        }
        Ok(())
    }

    /// Lists currently resting in the available pool.
    #[must_use]
    pub fn available_lists(&self) -> usize {
        self.shared
            .available
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn lock_submit(&self) -> MutexGuard<'_, SubmitState> {
        self.submit.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for CommandQueue {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            log::warn!("flush on {} queue teardown failed: {e}", self.kind);
        }
        // Hanging up the channel is the worker's shutdown signal.
        drop(self.sender.take());
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!("{} reclamation worker panicked", self.kind);
            }
        }
    }
}

impl std::fmt::Debug for CommandQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandQueue")
            .field("kind", &self.kind)
            .field("completed_fence", &self.completed_fence_value())
            .field("available_lists", &self.available_lists())
            .finish()
    }
}

/// Drain the in-flight channel in submission order: wait for each entry's
/// fence, reset the list, and return it to the pool. FIFO by construction —
/// fence values are assigned in submission order and observed in that order
/// here.
fn reclamation_loop(
    receiver: &mpsc::Receiver<InFlight>,
    fence: &dyn Fence,
    shared: &QueueShared,
    timeout: Duration,
) {
    for entry in receiver.iter() {
        let InFlight {
            fence_value,
            mut list,
        } = entry;

        match fence.wait(fence_value, timeout) {
            Ok(()) => match list.reset_after(fence_value) {
                Ok(()) => shared
                    .available
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(list),
                Err(e) => {
                    log::error!("command-list reset failed: {e}; dropping the list");
                }
            },
            Err(e) => {
                // Likely device lost. The list may still be referenced by
                // the GPU, so it cannot be recycled.
                log::error!("fence wait for value {fence_value} failed: {e}; dropping the list");
            }
        }

        let mut count = shared
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *count = count.saturating_sub(1);
        if *count == 0 {
            shared.drained.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::barrier::{ResourceState, ALL_SUBRESOURCES};
    use crate::gpu::null::NullDevice;
    use crate::gpu::resource::Texture;
    use crate::gpu::device::{Format, ResourceDesc};
    use std::time::Instant;

    fn wait_until(deadline: Duration, mut ready: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if ready() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        ready()
    }

    fn queue_over(device: &Arc<NullDevice>) -> (CommandQueue, Arc<Mutex<GlobalStateTable>>) {
        let globals = Arc::new(Mutex::new(GlobalStateTable::new()));
        let queue = CommandQueue::new(
            device.clone(),
            globals.clone(),
            QueueKind::Direct,
            4096,
            Duration::from_secs(5),
        )
        .unwrap();
        (queue, globals)
    }

    #[test]
    fn lists_are_not_recycled_before_their_fence_retires() {
        let device = NullDevice::new_manual();
        let (queue, _globals) = queue_over(&device);

        let list = queue.command_list().unwrap();
        let fence_value = queue.execute_command_lists(vec![list]).unwrap();

        // The unused pending list returns immediately; the submitted list
        // must stay in flight while the fence is incomplete.
        assert!(!queue.is_fence_complete(fence_value));
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(queue.available_lists(), 1);

        device.retire_all(fence_value);
        assert!(wait_until(Duration::from_secs(2), || {
            queue.available_lists() == 2
        }));
        assert!(queue.is_fence_complete(fence_value));

        // Queue teardown needs live fences; retire everything outstanding.
        device.retire_all(u64::MAX);
    }

    #[test]
    fn global_state_is_visible_at_submission_not_gpu_completion() {
        let device = NullDevice::new_manual();
        let (queue, globals) = queue_over(&device);
        let dyn_device: Arc<dyn Device> = device.clone();

        let texture = Texture::new(
            &dyn_device,
            &globals,
            ResourceDesc::texture_2d(Format::Rgba16Float, 16, 16),
            ResourceState::Common,
            None,
        )
        .unwrap();

        // L1 leaves the texture shader-readable. Its pending barrier
        // resolves Common -> PixelShaderResource, so the auxiliary list is
        // consumed too.
        let mut l1 = queue.command_list().unwrap();
        l1.transition_barrier(&texture, ResourceState::PixelShaderResource);
        let f1 = queue.execute_command_lists(vec![l1]).unwrap();
        assert_eq!(
            globals
                .lock()
                .unwrap()
                .state_of(texture.handle(), ALL_SUBRESOURCES),
            Some(ResourceState::PixelShaderResource)
        );
        assert_eq!(queue.available_lists(), 0);

        // The GPU has not finished L1, yet L2's expectation of the state
        // already holds: its pending barrier resolves to a no-op and its
        // auxiliary list goes straight back to the pool.
        assert!(!queue.is_fence_complete(f1));
        let mut l2 = queue.command_list().unwrap();
        l2.transition_barrier(&texture, ResourceState::PixelShaderResource);
        let _f2 = queue.execute_command_lists(vec![l2]).unwrap();
        assert_eq!(queue.available_lists(), 1);

        device.retire_all(u64::MAX);
    }

    #[test]
    fn flush_drains_the_in_flight_queue() {
        let device = NullDevice::new();
        let (queue, _globals) = queue_over(&device);

        for _ in 0..3 {
            let list = queue.command_list().unwrap();
            let _ = queue.execute_command_lists(vec![list]).unwrap();
        }
        queue.flush().unwrap();

        // All submitted lists (pending lists were unused and returned
        // immediately) are back in the pool.
        assert!(wait_until(Duration::from_secs(2), || {
            queue.available_lists() >= 3
        }));
    }

    #[test]
    fn recycled_lists_start_from_a_clean_slate() {
        let device = NullDevice::new();
        let (queue, globals) = queue_over(&device);
        let dyn_device: Arc<dyn Device> = device.clone();

        let texture = Texture::new(
            &dyn_device,
            &globals,
            ResourceDesc::texture_2d(Format::Rgba8Unorm, 4, 4),
            ResourceState::Common,
            None,
        )
        .unwrap();

        let mut list = queue.command_list().unwrap();
        list.transition_barrier(&texture, ResourceState::RenderTarget);
        let fence_value = queue.execute_command_lists(vec![list]).unwrap();
        queue.flush().unwrap();
        assert!(queue.is_fence_complete(fence_value));

        assert!(wait_until(Duration::from_secs(2), || {
            queue.available_lists() >= 1
        }));
        let recycled = queue.command_list().unwrap();
        assert_eq!(recycled.retained_count(), 0);
        assert!(recycled.null_recorder().barriers().is_empty());
    }

    #[test]
    fn fence_values_increase_monotonically() {
        let device = NullDevice::new();
        let (queue, _globals) = queue_over(&device);
        let a = queue.execute_command_lists(vec![]).unwrap();
        let b = queue.execute_command_lists(vec![]).unwrap();
        let c = queue.signal().unwrap();
        assert!(a < b && b < c);
    }
}
