//! halomon: the in-process monitoring agent of the halo feedback-directed
//! dynamic optimization system.
//!
//! Linked into a target application, the agent collects hardware
//! performance samples, call-entry counts from compiler-instrumented
//! functions, and an inventory of the application's code, and streams all
//! of it to an external optimization server. The server replies with
//! relocatable object modules and patching directives; the agent links the
//! objects into executable memory and installs them as live replacements
//! for running functions.
//!
//! - **inventory**: virtual-address → function resolution for the
//!   executable and every JIT-loaded module
//! - **sampler**: per-CPU kernel ring buffers, drained on signal-fd
//!   readiness
//! - **patcher**: the redirection table and per-function patch state
//!   machine behind the compiler-inserted sleds
//! - **linker**: materialization of server-supplied relocatable objects,
//!   with use-counted symbols
//! - **monitor**: the single control thread tying the above to the framed
//!   server protocol
//!
//! The agent owns exactly one thread. Application threads never take agent
//! locks; their only contact surface is the redirection table, which they
//! reach through compiler-inserted code.

pub mod bitcode;
pub mod config;
pub mod error;
pub mod host;
pub mod inventory;
pub mod linker;
pub mod monitor;
pub mod net;
pub mod patcher;
pub mod sampler;
pub mod stats;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use log::{error, info};

pub use config::AgentConfig;
pub use error::{HaloError, Result};

use patcher::sled::SledRuntime;

/// Reserved module name for the original executable.
pub const ORIGINAL_MODULE: &str = "<original>";

/// Handle to the running agent: the monitor thread plus its shutdown flag.
pub struct HaloAgent {
    thread: Option<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
}

impl HaloAgent {
    /// Launch the agent with an explicit sled runtime. Configuration
    /// comes from `HALO_*` environment variables.
    ///
    /// Must be called before the application spawns threads of its own:
    /// the sampling signal is blocked on the calling thread here, and
    /// later-spawned threads inherit that mask. A thread created first
    /// would receive ring wakeups as interrupts instead.
    pub fn launch_with(runtime: Box<dyn SledRuntime>) -> Self {
        // Logging sink for the whole process, controlled by RUST_LOG.
        // Ignore the error if the host application initialized one first.
        let _ = env_logger::try_init();

        // Block the sampling signal here, on the thread every other
        // thread will inherit its mask from.
        if let Err(e) = sampler::signal::block_sampling_signal() {
            error!("halo agent: cannot block sampling signal: {e}");
        }

        let config = AgentConfig::from_env();
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = shutdown.clone();

        let thread = std::thread::Builder::new()
            .name("halo-monitor".to_string())
            .spawn(move || monitor::monitor_loop(config, runtime, flag));

        match thread {
            Ok(handle) => {
                info!("halo agent running");
                HaloAgent {
                    thread: Some(handle),
                    shutdown,
                }
            }
            Err(e) => {
                error!("halo agent failed to spawn monitor thread: {e}");
                HaloAgent {
                    thread: None,
                    shutdown,
                }
            }
        }
    }

    /// Launch against the compiler-provided trampoline runtime.
    #[cfg(feature = "compiler-runtime")]
    pub fn launch() -> Self {
        Self::launch_with(Box::new(patcher::sled::CompilerRuntime))
    }

    /// Request cooperative shutdown and join the monitor thread.
    pub fn shutdown(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }

    /// Whether the monitor thread is still attached.
    pub fn is_running(&self) -> bool {
        self.thread.is_some()
    }
}

impl Drop for HaloAgent {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ---------------------------------------------------------------------------
// C entry points for the instrumented-binary startup hook
// ---------------------------------------------------------------------------

#[cfg(feature = "compiler-runtime")]
mod c_api {
    use super::*;
    use parking_lot::Mutex;

    static AGENT: Mutex<Option<HaloAgent>> = Mutex::new(None);

    /// Start the agent. Idempotent; meant to be called from the host
    /// runtime's startup hook.
    #[no_mangle]
    pub extern "C" fn __halo_agent_launch() {
        let mut agent = AGENT.lock();
        if agent.is_none() {
            *agent = Some(HaloAgent::launch());
        }
    }

    /// Stop the agent and join its thread. Idempotent.
    #[no_mangle]
    pub extern "C" fn __halo_agent_shutdown() {
        if let Some(mut agent) = AGENT.lock().take() {
            agent.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_without_server_exits_cleanly() {
        // Point the agent at a dead port; the monitor thread must give up
        // after its retries and leave the process alone.
        std::env::set_var("HALO_HOSTNAME", "127.0.0.1");
        std::env::set_var("HALO_PORT", "1");

        let runtime = patcher::sled::stub::StubRuntime::new(vec![0x1000]);
        let mut agent = HaloAgent::launch_with(Box::new(runtime));
        assert!(agent.is_running());
        agent.shutdown();
        assert!(!agent.is_running());

        std::env::remove_var("HALO_HOSTNAME");
        std::env::remove_var("HALO_PORT");
    }
}
