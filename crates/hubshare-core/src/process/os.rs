//! The current operating-system process.
//!
//! Process ids take the form `<pid>:<nonce>`. Liveness of any id is answered
//! from its PID alone, so a recycled PID reads as alive until it exits.

use super::traits::{LivenessOracle, ProcessLifecycle, TerminateHook};
use crate::types::ProcessId;
use std::sync::Mutex;
use tracing::{debug, warn};

/// Check if a process with the given PID is running.
#[allow(unsafe_code)]
pub fn is_process_alive(pid: u32) -> bool {
    #[cfg(unix)]
    {
        let Ok(pid) = i32::try_from(pid) else {
            return false;
        };
        if pid <= 0 {
            return false;
        }
        // SAFETY: signal 0 performs only the existence and permission check;
        // no signal is delivered.
        let rc = unsafe { libc::kill(pid, 0) };
        if rc == 0 {
            return true;
        }
        // EPERM means the process exists but belongs to another user.
        std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }

    #[cfg(windows)]
    {
        use windows_sys::Win32::Foundation::CloseHandle;
        use windows_sys::Win32::System::Threading::{
            OpenProcess, PROCESS_QUERY_LIMITED_INFORMATION,
        };

        // SAFETY: OpenProcess has no preconditions; a non-null handle is
        // owned here and closed exactly once.
        unsafe {
            let handle = OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, 0, pid);
            if handle.is_null() {
                false
            } else {
                CloseHandle(handle);
                true
            }
        }
    }

    #[cfg(not(any(unix, windows)))]
    {
        warn!("Process alive check not implemented for this platform");
        true
    }
}

/// Extract the PID from a `<pid>:<nonce>` process id.
fn pid_of(process: &ProcessId) -> Option<u32> {
    process.as_str().split(':').next()?.parse().ok()
}

/// Identity and liveness for the running operating-system process.
pub struct OsProcess {
    id: ProcessId,
    hooks: Mutex<Vec<TerminateHook>>,
}

impl OsProcess {
    /// Identify the current process with a fresh nonce.
    pub fn current() -> Self {
        let nonce = uuid::Uuid::new_v4().simple().to_string();
        let id = ProcessId::new(format!("{}:{}", std::process::id(), &nonce[..12]));
        debug!("Current process id is {}", id);
        Self {
            id,
            hooks: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> &ProcessId {
        &self.id
    }

    /// Run the registered termination hooks. Call before exiting.
    pub async fn terminate(&self) {
        let hooks: Vec<TerminateHook> = match self.hooks.lock() {
            Ok(mut hooks) => hooks.drain(..).collect(),
            Err(_) => {
                warn!("Termination hooks lost to a poisoned mutex");
                Vec::new()
            }
        };
        for hook in hooks {
            hook().await;
        }
    }
}

#[async_trait::async_trait]
impl LivenessOracle for OsProcess {
    async fn ready(&self) {}

    fn is_alive(&self, process: &ProcessId) -> bool {
        if process == &self.id {
            return true;
        }
        match pid_of(process) {
            Some(pid) => is_process_alive(pid),
            None => false,
        }
    }
}

impl ProcessLifecycle for OsProcess {
    fn process_id(&self) -> ProcessId {
        self.id.clone()
    }

    fn on_terminate(&self, hook: TerminateHook) {
        if let Ok(mut hooks) = self.hooks.lock() {
            hooks.push(hook);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_process_is_alive() {
        assert!(is_process_alive(std::process::id()));
    }

    #[test]
    fn test_nonexistent_process() {
        assert!(!is_process_alive(999_999_999));
    }

    #[test]
    fn test_process_id_format() {
        let process = OsProcess::current();
        assert_eq!(pid_of(process.id()), Some(std::process::id()));
        assert!(process.is_alive(process.id()));
        assert!(!process.is_alive(&ProcessId::new("not-a-pid")));
        assert!(!process.is_alive(&ProcessId::new("999999999:deadbeef")));
    }

    #[tokio::test]
    async fn test_terminate_drains_hooks() {
        use futures::FutureExt;
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        let process = OsProcess::current();
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        process.on_terminate(Box::new(move || {
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
            .boxed()
        }));

        process.terminate().await;
        process.terminate().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
