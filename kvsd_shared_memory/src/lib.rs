//! # kvsd Shared Memory
//!
//! Cross-process storage machinery of the kvsd server: a growable
//! shared-memory heap with a free-list allocator, an offset-addressed
//! hash map that works across address spaces, a process-shared
//! reader/writer gate and the SysV notification queue.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────┐   offsets   ┌────────────────────────────┐
//! │  OffsetMap   ├────────────►│  SharedHeap (data segment) │
//! └──────────────┘             │  [HeapHeader|blocks…|stop] │
//!        ▲                     └──────────┬─────────────────┘
//!        │ gate-guarded                   │ generation
//! ┌──────┴───────┐             ┌──────────▼─────────────────┐
//! │ StorageGate  │             │  UpdateSegment             │
//! └──────────────┘             └────────────────────────────┘
//! ```
//!
//! Every pointer stored inside the segment is an [`alloc::Offset`]
//! relative to the segment base, which makes live segment growth (a new
//! generation published through the update segment) transparent to all
//! attached processes.
//!
//! ## Process model
//!
//! The server parent creates the heap, gate and queue once; forked
//! children inherit the mappings, the semaphore set and the queue id.
//! Only the process holding the gate mutates allocator state.

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod alloc;
pub mod error;
pub mod gate;
pub mod heap;
pub mod map;
pub mod platform;
pub mod queue;
pub mod segment;

pub use alloc::{Allocator, Offset, PrivateAllocator};
pub use error::{ShmError, ShmResult};
pub use gate::StorageGate;
pub use heap::SharedHeap;
pub use map::{MapCursor, OffsetMap, hash32};
pub use queue::{MAX_MESSAGE_LEN, NotifyQueue};
