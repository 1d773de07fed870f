//! CPU time accounting for child processes via `/proc/<pid>/stat`.
//!
//! Totals include descendants the process has already reaped. The final
//! sample is taken from the zombie, after [`wait_exited`] reports the exit
//! but before the child is reaped.

/// Kernel clock ticks per second (`USER_HZ`), fixed at 100 on Linux.
const CLOCK_TICKS_PER_SEC: u64 = 100;
const NANOS_PER_TICK: u64 = 1_000_000_000 / CLOCK_TICKS_PER_SEC;

/// User and system CPU time consumed by a process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuTimes {
    pub user_ns: u64,
    pub system_ns: u64,
}

impl CpuTimes {
    /// Keep the larger of two samples field by field; counters only grow.
    pub fn max(self, other: CpuTimes) -> CpuTimes {
        CpuTimes {
            user_ns: self.user_ns.max(other.user_ns),
            system_ns: self.system_ns.max(other.system_ns),
        }
    }
}

/// Parse the contents of `/proc/<pid>/stat`, adding the times of reaped
/// children to the process's own.
///
/// The command name (field 2) is parenthesized and may itself contain spaces
/// or parentheses, so fields are counted from the last `)`.
pub fn parse_stat(content: &str) -> Option<CpuTimes> {
    let after_comm = &content[content.rfind(')')? + 1..];
    let fields: Vec<&str> = after_comm.split_whitespace().collect();
    // fields[0] is state (field 3); utime, stime, cutime and cstime are
    // fields 14 through 17.
    let ticks = |index: usize| -> Option<u64> { fields.get(index)?.parse().ok() };
    let user = ticks(11)?.saturating_add(ticks(13)?);
    let system = ticks(12)?.saturating_add(ticks(14)?);
    Some(CpuTimes {
        user_ns: user.saturating_mul(NANOS_PER_TICK),
        system_ns: system.saturating_mul(NANOS_PER_TICK),
    })
}

/// Sample a live process. Returns `None` once it has exited or on platforms
/// without procfs.
pub fn sample(pid: u32) -> Option<CpuTimes> {
    if !cfg!(target_os = "linux") {
        return None;
    }
    let content = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    parse_stat(&content)
}

/// Block until `pid` has exited, leaving it unreaped so its final
/// `/proc/<pid>/stat` can still be read.
#[cfg(target_os = "linux")]
#[allow(unsafe_code)]
pub fn wait_exited(pid: u32) -> std::io::Result<()> {
    let id = pid as libc::id_t;
    loop {
        // SAFETY: siginfo_t is plain data and only written by the kernel.
        // WNOWAIT leaves the child waitable for tokio's own reaping.
        let rc = unsafe {
            let mut info: libc::siginfo_t = std::mem::zeroed();
            libc::waitid(libc::P_PID, id, &mut info, libc::WEXITED | libc::WNOWAIT)
        };
        if rc == 0 {
            return Ok(());
        }
        let err = std::io::Error::last_os_error();
        if err.kind() != std::io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

#[cfg(not(target_os = "linux"))]
pub fn wait_exited(_pid: u32) -> std::io::Result<()> {
    Err(std::io::Error::from(std::io::ErrorKind::Unsupported))
}
