pub(crate) mod scope_guard;
pub(crate) use scope_guard::ScopeGuard;

mod deadline;
pub use deadline::Deadline;

mod wake;
pub use wake::WakeSource;
