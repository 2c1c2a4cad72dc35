//! A per-thread engine that multiplexes file operations onto a
//! submission/completion ring.
//!
//! Requests are queued with [`Engine::queue_request`] (or the free functions
//! operating on the thread's shared engine), staged into the ring as capacity
//! allows, and finished through a completion callback that receives the
//! request back with its result slot resolved. Transfers larger than a single
//! ring entry may carry are split and resumed transparently.

pub mod backend;
pub use backend::{EmulatedRing, RingBackend, UringRing};

pub mod engine;
pub use engine::{
    queue_request, submit_requests, supports_operation, wait_for_request, with_shared_instance,
    Builder, Engine, EngineConfig, EngineStats,
};

mod queue;
pub use queue::RequestHandle;

pub mod request;
pub use request::{
    CancelRequest, CloseRequest, FileError, FlushRequest, OpenMode, OpenRequest, Operation,
    ReadRequest, Request, StatRequest, VectoredReadRequest, VectoredWriteRequest, WriteRequest,
};

mod utils;
pub use utils::{Deadline, WakeSource};

#[cfg(test)]
mod test_utils;
