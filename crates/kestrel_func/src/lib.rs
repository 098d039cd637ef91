//! Module and function registries for the CALL path.
//!
//! Dynamic loading itself is a collaborator: the registry drives a
//! [`ModuleBackend`] and owns only the cache and the reload lifecycle. A
//! module moves Loaded → PendingUnload → Closed; the transition to Closed
//! waits for the last in-flight call, so a reload never invalidates a
//! running invocation.

pub mod registry;

pub use registry::{
    FuncPtr, FuncRegistry, ModuleBackend, ModuleHandle, ModuleId, ModuleRegistry, ModuleState,
};
