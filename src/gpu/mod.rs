//! GPU resource and command-list lifecycle management.
//!
//! Provides the explicit-API substrate every render pass records through:
//! resource-state tracking, descriptor allocation, command-list/queue
//! pooling, and upload-heap memory management.

/// Resource-state and transition-barrier types.
pub mod barrier;
/// Command-list recording facade over the device recorder.
pub mod command_list;
/// Command-list pooling, submission, and fence-driven reclamation.
pub mod command_queue;
/// Best-fit descriptor-heap allocator with frame-delayed release.
pub mod descriptor;
/// Object-safe device boundary traits and plain descriptor types.
pub mod device;
/// Headless device implementation for tests and CI.
pub mod null;
/// Device, queues, descriptor allocators, and global state ownership.
pub mod render_context;
/// Attachment-point render-target bundle.
pub mod render_target;
/// GPU resource wrappers: `Resource`, `Buffer`, `Texture`.
pub mod resource;
/// Per-list and global resource-state tracking.
pub mod state_tracker;
/// Linear upload-heap allocators for transient per-frame data.
pub mod upload;
