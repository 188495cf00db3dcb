//! Process liveness probing for dead-holder reclamation.
//!
//! A slot records the process id and hostname of its holder. When that process is gone the slot
//! can be taken back without an explicit release. [`ProcessProbe`] sends the null signal to the
//! pid: success or `EPERM` means the process exists, anything else means it does not.
//!
//! Platforms without signals, or deployments where the pid of another host is meaningless, can
//! plug in their own [`LivenessProbe`] (for example a lease or heartbeat check).

/// Result of probing one process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Alive,
    Dead,
    /// The probe cannot tell. Reclamation leaves such slots alone.
    Unknown,
}

/// Reports whether a process still exists. Must not block.
pub trait LivenessProbe: Send + Sync + std::fmt::Debug {
    fn probe(&self, process_id: i32) -> Liveness;
}

/// Null-signal probe for processes on the local host.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessProbe;

impl LivenessProbe for ProcessProbe {
    #[cfg(unix)]
    fn probe(&self, process_id: i32) -> Liveness {
        use nix::errno::Errno;
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        // 0 and negative values address process groups, never a single holder.
        if process_id <= 0 {
            return Liveness::Dead;
        }

        match kill(Pid::from_raw(process_id), None) {
            Ok(()) => Liveness::Alive,
            Err(Errno::EPERM) => Liveness::Alive,
            Err(_) => Liveness::Dead,
        }
    }

    #[cfg(not(unix))]
    fn probe(&self, _process_id: i32) -> Liveness {
        Liveness::Unknown
    }
}

/// Hostname recorded on slots held by this process.
pub fn local_hostname() -> String {
    #[cfg(unix)]
    {
        if let Ok(name) = nix::unistd::gethostname() {
            if let Some(name) = name.to_str() {
                return name.to_string();
            }
        }
    }

    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "localhost".to_string())
}
