//! In-memory reference implementation of the Conveyor [`TaskStore`] contract.
//!
//! Good for single-process deployments and tests. The atomic claim is a
//! conditional update under one write lock, which is sufficient only while
//! a single store instance backs all executors; a shared-storage
//! implementation must provide the same conditional-update semantics.
//!
//! [`TaskStore`]: conveyor_core::TaskStore

/// The in-memory store.
pub mod memory;

pub use memory::MemoryTaskStore;
