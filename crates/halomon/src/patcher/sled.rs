//! Seam to the compiler-provided trampoline runtime.
//!
//! The compiler inserts a short sled at every patchable function's
//! prologue and ships a C runtime that can flip individual sleds between
//! their dormant and redirecting forms. The agent drives that runtime
//! through the [`SledRuntime`] trait; production uses the C ABI bindings,
//! tests use an in-memory stub.

use crate::patcher::redirection::RedirectionEntry;

/// Operations the agent needs from the trampoline runtime.
///
/// Slot ids are the dense function ids assigned by the compiler. All
/// operations are idempotent at the runtime level; the patcher tracks
/// state and avoids redundant flips anyway.
pub trait SledRuntime: Send {
    /// Highest assigned slot id. Slots are dense in `0..=max`.
    fn max_slot_id(&self) -> u32;

    /// Entry address of the function owning `slot`, or 0 for an
    /// unassigned slot.
    fn function_address(&self, slot: u32) -> u64;

    /// Flip the sled into its redirecting form. Returns false if the
    /// runtime rejected the slot.
    fn enable_redirect(&self, slot: u32) -> bool;

    /// Restore the sled to its dormant form.
    fn disable(&self, slot: u32) -> bool;

    /// Publish the redirection table base. Called exactly once, before
    /// any sled is enabled.
    fn publish_table(&self, base: *const RedirectionEntry) -> bool;
}

// C ABI of the runtime linked into instrumented binaries. Only available
// when the final link actually provides these symbols, hence the feature
// gate: plain builds (and the test suite) use stub runtimes instead.
#[cfg(feature = "compiler-runtime")]
extern "C" {
    fn __halo_max_function_id() -> u32;
    fn __halo_function_address(id: u32) -> u64;
    fn __halo_redirect_function(id: u32) -> i32;
    fn __halo_unpatch_function(id: u32) -> i32;
    fn __halo_set_redirection_table(base: *const RedirectionEntry) -> i32;
}

/// Production implementation over the compiler runtime's C ABI.
#[cfg(feature = "compiler-runtime")]
pub struct CompilerRuntime;

#[cfg(feature = "compiler-runtime")]
impl SledRuntime for CompilerRuntime {
    fn max_slot_id(&self) -> u32 {
        // Safety: the runtime is linked into every instrumented binary and
        // these entry points are callable from any thread after startup.
        unsafe { __halo_max_function_id() }
    }

    fn function_address(&self, slot: u32) -> u64 {
        unsafe { __halo_function_address(slot) }
    }

    fn enable_redirect(&self, slot: u32) -> bool {
        unsafe { __halo_redirect_function(slot) == 0 }
    }

    fn disable(&self, slot: u32) -> bool {
        unsafe { __halo_unpatch_function(slot) == 0 }
    }

    fn publish_table(&self, base: *const RedirectionEntry) -> bool {
        unsafe { __halo_set_redirection_table(base) == 0 }
    }
}

#[cfg(test)]
pub mod stub {
    //! In-memory sled runtime for tests.

    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    /// Observable state of the stub runtime.
    #[derive(Debug, Default)]
    pub struct StubState {
        /// Slots whose sled is currently in redirecting form.
        pub enabled: Vec<u32>,
        /// Every enable/disable call, in order, as (slot, enabled).
        pub flips: Vec<(u32, bool)>,
        /// The published table base, if any.
        pub table_base: Option<usize>,
    }

    /// Stub runtime over a fixed function-address list.
    pub struct StubRuntime {
        addresses: Vec<u64>,
        /// Shared so tests can assert on it after handing the runtime to
        /// the patcher.
        pub state: Arc<Mutex<StubState>>,
        /// When true, `publish_table` reports failure.
        pub fail_publish: bool,
    }

    impl StubRuntime {
        /// Runtime with one slot per address, ids in order.
        pub fn new(addresses: Vec<u64>) -> Self {
            StubRuntime {
                addresses,
                state: Arc::new(Mutex::new(StubState::default())),
                fail_publish: false,
            }
        }
    }

    impl SledRuntime for StubRuntime {
        fn max_slot_id(&self) -> u32 {
            (self.addresses.len() as u32).saturating_sub(1)
        }

        fn function_address(&self, slot: u32) -> u64 {
            self.addresses.get(slot as usize).copied().unwrap_or(0)
        }

        fn enable_redirect(&self, slot: u32) -> bool {
            let mut st = self.state.lock();
            if !st.enabled.contains(&slot) {
                st.enabled.push(slot);
            }
            st.flips.push((slot, true));
            true
        }

        fn disable(&self, slot: u32) -> bool {
            let mut st = self.state.lock();
            st.enabled.retain(|&s| s != slot);
            st.flips.push((slot, false));
            true
        }

        fn publish_table(&self, base: *const RedirectionEntry) -> bool {
            if self.fail_publish {
                return false;
            }
            self.state.lock().table_base = Some(base as usize);
            true
        }
    }
}
