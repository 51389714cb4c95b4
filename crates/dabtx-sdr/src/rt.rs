//! Best-effort realtime thread spawning
//!
//! The transmitter worker runs with elevated scheduling priority so a busy
//! host does not starve the hardware hand-off. Elevation requires
//! CAP_SYS_NICE or root on Linux; when it is denied the thread proceeds at
//! normal priority with a logged warning. On platforms without realtime
//! scheduling the request is skipped silently.

use std::io;
use std::thread::{self, JoinHandle};

/// Spawn a named thread and raise it to realtime priority, best-effort.
pub fn spawn_rt_thread<F, T>(name: &str, priority: i32, f: F) -> io::Result<JoinHandle<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    thread::Builder::new().name(name.to_string()).spawn(move || {
        if let Err(e) = set_realtime_priority(priority) {
            tracing::warn!("could not set realtime priority: {}", e);
        }
        f()
    })
}

/// Request SCHED_FIFO with the given priority for the calling thread.
#[cfg(target_os = "linux")]
pub fn set_realtime_priority(priority: i32) -> io::Result<()> {
    use std::mem;

    unsafe {
        let mut param: libc::sched_param = mem::zeroed();
        param.sched_priority = priority.clamp(1, 99);

        if libc::sched_setscheduler(0, libc::SCHED_FIFO, &param) != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn set_realtime_priority(_priority: i32) -> io::Result<()> {
    tracing::debug!("realtime priority not supported on this platform");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spawn_runs_closure() {
        let handle = spawn_rt_thread("rt-test", 1, || 42).unwrap();
        assert_eq!(handle.join().unwrap(), 42);
    }
}
