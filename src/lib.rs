// -- Lint policy ---------------------------------------------------------
// This is the single source of truth for crate-wide lints.

// Broad lint groups
#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![deny(clippy::nursery)]
// Documentation
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![deny(rustdoc::private_intra_doc_links)]
#![deny(rustdoc::bare_urls)]
// No panicking in library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::todo)]
#![deny(clippy::unimplemented)]
// No debug/print artifacts
#![deny(clippy::dbg_macro)]
#![deny(clippy::print_stdout)]
#![deny(clippy::print_stderr)]
// Import hygiene
#![deny(clippy::wildcard_imports)]
// Clone / pass-by-value hygiene
#![deny(clippy::needless_pass_by_value)]
#![deny(clippy::implicit_clone)]
// String hygiene
#![deny(clippy::inefficient_to_string)]
#![deny(clippy::redundant_closure_for_method_calls)]
#![deny(clippy::manual_string_new)]
#![deny(clippy::str_to_string)]
// Cast hygiene
#![deny(trivial_casts)]
#![deny(trivial_numeric_casts)]
// Graphics allowances — casts between index/size types are pervasive and intentional
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::cast_lossless)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
// Tests panic freely
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used, clippy::panic))]

//! Real-time 3D rendering engine core built atop an explicit graphics API.
//!
//! Lantern provides the resource and command-list lifecycle layer that every
//! rendering pass depends on: resource-state tracking across asynchronous
//! command-list execution, descriptor-heap allocation with frame-delayed
//! recycling, command-list pooling with fence-driven reclamation, and linear
//! upload-heap allocators for transient per-frame data.
//!
//! The concrete graphics device is an external collaborator, represented by
//! the object-safe traits in [`gpu::device`]. A headless implementation
//! ([`gpu::null`]) backs the test suite and CI.
//!
//! # Key entry points
//!
//! - [`engine::RenderEngine`] - the main rendering engine and frame loop
//! - [`gpu::render_context::RenderContext`] - device, queues, descriptor
//!   allocators, and the global resource-state table
//! - [`gpu::command_queue::CommandQueue`] - command-list pooling, two-phase
//!   barrier submission, and background reclamation
//! - [`options::EngineOptions`] - runtime configuration (page sizes,
//!   frames in flight, fence timeouts)
//!
//! # Architecture
//!
//! Each [`gpu::command_list::CommandList`] records through a private
//! [`gpu::state_tracker::ResourceStateTracker`]; transitions whose
//! before-state is unknown at record time are deferred as *pending* barriers
//! and resolved against the context-wide
//! [`gpu::state_tracker::GlobalStateTable`] at submission, under a single
//! lock spanning resolve and commit. Submitted lists travel through a
//! per-queue reclamation thread that waits on the queue fence before
//! returning them to the pool. Render passes (geometry → lighting → skybox →
//! blur, plus equirect-to-cubemap conversion) are a closed set of consumers
//! layered on this substrate.

pub mod engine;
pub mod error;
pub mod gpu;
pub mod options;
pub mod renderer;
