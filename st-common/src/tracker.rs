//! Registry of live sessions and the child processes they own.
//!
//! All state sits behind one mutex that is never held across an `.await`.
//! Each session carries a completion signal; [`SessionTracker::swap_connection`]
//! re-points a running session at a new connection and then waits on that
//! signal so a joining client sees the rest of the session's output.

use crate::channel::Channel;
use crate::connection::Connection;
use crate::errors::{ErrorKind, Result, StError};
use crate::executor::ProcessRegistrar;
use crate::proc_times::CpuTimes;
use crate::protocol::{JobList, JobRecord, ProcessList, ProcessSnapshot, Request};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info};

/// Session identifier; 0 means "not yet registered".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionId(pub u64);

impl SessionId {
    pub const UNREGISTERED: SessionId = SessionId(0);

    pub fn is_registered(self) -> bool {
        self.0 != 0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for SessionId {
    type Err = StError;

    fn from_str(s: &str) -> Result<Self> {
        let id: u64 = s.trim().parse().map_err(|_| {
            StError::with_message(ErrorKind::InvalidArgument, format!("'{s}' is not a job id"))
        })?;
        if id == 0 {
            return Err(StError::with_message(
                ErrorKind::InvalidArgument,
                "job ids start at 1",
            ));
        }
        Ok(SessionId(id))
    }
}

/// Tracker-assigned process identifier (distinct from the OS pid).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProcessId(pub u64);

/// A session as presented for registration.
#[derive(Debug, Clone)]
pub struct SessionEntry {
    pub id: SessionId,
    pub request: Request,
    pub channel: Channel,
}

impl SessionEntry {
    pub fn new(request: Request, channel: Channel) -> Self {
        Self {
            id: SessionId::UNREGISTERED,
            request,
            channel,
        }
    }
}

struct SessionRecord {
    request: Request,
    channel: Channel,
    started_at: DateTime<Utc>,
    started: Instant,
    done: watch::Sender<bool>,
}

struct ProcessRecord {
    session: SessionId,
    command: Vec<String>,
    pid: u32,
    started_at: DateTime<Utc>,
    started: Instant,
    ended_at: Option<DateTime<Utc>>,
    elapsed: Option<Duration>,
    times: CpuTimes,
}

impl ProcessRecord {
    fn snapshot(&self) -> ProcessSnapshot {
        let elapsed = self.elapsed.unwrap_or_else(|| self.started.elapsed());
        ProcessSnapshot {
            command: self.command.clone(),
            pid: self.pid,
            start_time: self.started_at,
            running: self.ended_at.is_none(),
            end_time: self.ended_at,
            elapsed_ms: duration_ms(elapsed),
            system_time_ns: self.times.system_ns,
            user_time_ns: self.times.user_ns,
        }
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[derive(Default)]
struct Registry {
    last_session: u64,
    last_process: u64,
    sessions: BTreeMap<SessionId, SessionRecord>,
    processes: BTreeMap<ProcessId, ProcessRecord>,
}

/// Server-wide session and process registry.
#[derive(Default)]
pub struct SessionTracker {
    registry: Mutex<Registry>,
}

impl SessionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        match self.registry.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Register `entry`, assigning an id if it has none. Registering an
    /// already registered entry is a no-op.
    pub fn add_session(&self, entry: &mut SessionEntry) -> Result<SessionId> {
        let mut reg = self.lock();
        if entry.id.is_registered() {
            if reg.sessions.contains_key(&entry.id) {
                return Ok(entry.id);
            }
            error!("Session {} re-registered after removal", entry.id);
            return Err(StError::with_message(
                ErrorKind::InvalidArgument,
                format!("session {} is not registered", entry.id),
            ));
        }
        reg.last_session += 1;
        let id = SessionId(reg.last_session);
        let (done, _) = watch::channel(false);
        reg.sessions.insert(
            id,
            SessionRecord {
                request: entry.request.clone(),
                channel: entry.channel.clone(),
                started_at: Utc::now(),
                started: Instant::now(),
                done,
            },
        );
        entry.id = id;
        debug!("Registered session {} ({})", id, entry.request.command);
        Ok(id)
    }

    /// Drop a session and its process records and wake any joined waiter.
    pub fn remove_session(&self, id: SessionId) {
        let mut reg = self.lock();
        reg.processes.retain(|_, p| p.session != id);
        if let Some(record) = reg.sessions.remove(&id) {
            record.done.send_replace(true);
            debug!("Removed session {}", id);
        }
    }

    pub fn session_count(&self) -> usize {
        self.lock().sessions.len()
    }

    pub fn contains(&self, id: SessionId) -> bool {
        self.lock().sessions.contains_key(&id)
    }

    /// Record a child process of `session`. Returns `None` when the session is
    /// not registered.
    pub fn add_process(&self, session: SessionId, command: &[String], pid: u32) -> Option<ProcessId> {
        let mut reg = self.lock();
        if !reg.sessions.contains_key(&session) {
            debug!("Ignoring pid {} for unknown session {}", pid, session);
            return None;
        }
        reg.last_process += 1;
        let id = ProcessId(reg.last_process);
        reg.processes.insert(
            id,
            ProcessRecord {
                session,
                command: command.to_vec(),
                pid,
                started_at: Utc::now(),
                started: Instant::now(),
                ended_at: None,
                elapsed: None,
                times: CpuTimes::default(),
            },
        );
        Some(id)
    }

    /// Mark a process as exited. The record stays until its session ends.
    pub fn remove_process(&self, id: ProcessId, times: CpuTimes) {
        let mut reg = self.lock();
        if let Some(process) = reg.processes.get_mut(&id) {
            process.ended_at = Some(Utc::now());
            process.elapsed = Some(process.started.elapsed());
            process.times = times;
        }
    }

    /// Point session `id` at `connection`, close the previous connection and
    /// wait until the session finishes.
    pub async fn swap_connection(&self, id: SessionId, connection: Arc<dyn Connection>) -> Result<()> {
        let (previous, mut done) = {
            let reg = self.lock();
            let record = reg.sessions.get(&id).ok_or_else(|| {
                StError::with_message(ErrorKind::InvalidArgument, format!("no job with id {id}"))
            })?;
            let previous = record.channel.swap_connection(connection);
            (previous, record.done.subscribe())
        };
        info!("Joined session {} (was {})", id, previous.describe());
        if let Err(e) = previous.close().await {
            debug!("Closing replaced connection for session {}: {}", id, e);
        }
        // A dropped sender means the session is already gone.
        let _ = done.wait_for(|finished| *finished).await;
        Ok(())
    }

    /// Snapshot of every live session and its processes.
    pub fn get_job_list(&self) -> JobList {
        let reg = self.lock();
        let jobs = reg
            .sessions
            .iter()
            .map(|(id, session)| JobRecord {
                id: id.0,
                request: session.request.clone(),
                start_time: session.started_at,
                elapsed_ms: duration_ms(session.started.elapsed()),
                processes: reg
                    .processes
                    .values()
                    .filter(|p| p.session == *id)
                    .map(ProcessRecord::snapshot)
                    .collect(),
            })
            .collect();
        JobList { jobs }
    }

    /// Send a kill to every running child process. Does not wait for exit.
    pub fn kill_running_processes(&self) -> ProcessList {
        let running: Vec<ProcessSnapshot> = {
            let reg = self.lock();
            reg.processes
                .values()
                .filter(|p| p.ended_at.is_none())
                .map(ProcessRecord::snapshot)
                .collect()
        };
        for process in &running {
            if !kill_process(process.pid) {
                debug!("Kill of pid {} ({:?}) reported failure", process.pid, process.command);
            }
        }
        info!("Killed {} running processes", running.len());
        ProcessList { processes: running }
    }

    /// A registrar that files processes under `session`.
    pub fn registrar(self: &Arc<Self>, session: SessionId) -> Arc<dyn ProcessRegistrar> {
        Arc::new(SessionProcesses {
            tracker: Arc::clone(self),
            session,
        })
    }
}

struct SessionProcesses {
    tracker: Arc<SessionTracker>,
    session: SessionId,
}

impl ProcessRegistrar for SessionProcesses {
    fn add_process(&self, command: &[String], pid: u32) -> Option<ProcessId> {
        self.tracker.add_process(self.session, command, pid)
    }

    fn remove_process(&self, id: ProcessId, times: CpuTimes) {
        self.tracker.remove_process(id, times);
    }
}

/// Forcefully terminate `pid` with the platform's kill utility.
fn kill_process(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    let result = if cfg!(windows) {
        std::process::Command::new("taskkill")
            .args(["/F", "/PID", &pid.to_string()])
            .output()
    } else {
        std::process::Command::new("kill")
            .arg("-KILL")
            .arg(pid.to_string())
            .output()
    };
    match result {
        Ok(output) => output.status.success(),
        Err(e) => {
            debug!("Failed to kill process {}: {}", pid, e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::LoopbackConnection;
    use crate::protocol::Event;

    fn entry(command: &str) -> (SessionEntry, tokio::sync::mpsc::UnboundedReceiver<Event>) {
        let (conn, rx) = LoopbackConnection::pair();
        (
            SessionEntry::new(Request::new(command), Channel::new(Arc::new(conn))),
            rx,
        )
    }

    #[test]
    fn session_ids_are_monotonic_and_start_at_one() {
        let tracker = SessionTracker::new();
        let (mut a, _ra) = entry("build");
        let (mut b, _rb) = entry("clean");
        assert_eq!(tracker.add_session(&mut a).unwrap(), SessionId(1));
        assert_eq!(tracker.add_session(&mut b).unwrap(), SessionId(2));
        tracker.remove_session(a.id);
        let (mut c, _rc) = entry("ping");
        assert_eq!(tracker.add_session(&mut c).unwrap(), SessionId(3));
    }

    #[test]
    fn re_adding_a_registered_session_is_a_no_op() {
        let tracker = SessionTracker::new();
        let (mut a, _ra) = entry("build");
        let id = tracker.add_session(&mut a).unwrap();
        assert_eq!(tracker.add_session(&mut a).unwrap(), id);
        assert_eq!(tracker.session_count(), 1);
    }

    #[test]
    fn adding_an_unknown_nonzero_id_fails() {
        let tracker = SessionTracker::new();
        let (mut a, _ra) = entry("build");
        a.id = SessionId(17);
        let err = tracker.add_session(&mut a).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn removed_sessions_disappear_from_job_list() {
        let tracker = SessionTracker::new();
        let (mut a, _ra) = entry("build");
        let (mut b, _rb) = entry("jobs");
        tracker.add_session(&mut a).unwrap();
        tracker.add_session(&mut b).unwrap();
        let pid = tracker.add_process(a.id, &["ninja".to_string()], 1234).unwrap();
        assert_eq!(tracker.get_job_list().jobs.len(), 2);

        tracker.remove_session(a.id);
        let jobs = tracker.get_job_list().jobs;
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].id, b.id.0);
        assert_eq!(jobs[0].request.command, "jobs");
        // Late completion of a removed process is harmless.
        tracker.remove_process(pid, CpuTimes::default());
    }

    #[test]
    fn exited_processes_are_retained_until_session_ends() {
        let tracker = SessionTracker::new();
        let (mut a, _ra) = entry("build");
        tracker.add_session(&mut a).unwrap();
        let pid = tracker.add_process(a.id, &["ninja".to_string()], 42).unwrap();
        let job = &tracker.get_job_list().jobs[0];
        assert!(job.processes[0].running);
        assert!(job.processes[0].end_time.is_none());

        tracker.remove_process(pid, CpuTimes { user_ns: 7, system_ns: 3 });
        let job = &tracker.get_job_list().jobs[0];
        assert_eq!(job.processes.len(), 1);
        assert!(!job.processes[0].running);
        assert!(job.processes[0].end_time.is_some());
        assert_eq!(job.processes[0].user_time_ns, 7);
        assert_eq!(job.processes[0].system_time_ns, 3);
    }

    #[test]
    fn processes_for_unknown_sessions_are_ignored() {
        let tracker = SessionTracker::new();
        assert!(tracker.add_process(SessionId(5), &["x".to_string()], 1).is_none());
    }

    #[test]
    fn job_ids_parse_strictly() {
        assert_eq!("12".parse::<SessionId>().unwrap(), SessionId(12));
        assert_eq!("0".parse::<SessionId>().unwrap_err().kind(), ErrorKind::InvalidArgument);
        assert_eq!("abc".parse::<SessionId>().unwrap_err().kind(), ErrorKind::InvalidArgument);
    }

    #[tokio::test]
    async fn swapping_an_unknown_session_fails() {
        let tracker = SessionTracker::new();
        let (conn, _rx) = LoopbackConnection::pair();
        let err = tracker
            .swap_connection(SessionId(9), Arc::new(conn))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[tokio::test]
    async fn swap_redirects_output_and_waits_for_completion() {
        let tracker = Arc::new(SessionTracker::new());
        let (mut a, mut first_rx) = entry("build");
        tracker.add_session(&mut a).unwrap();
        let channel = a.channel.clone();
        channel.info("first").await;

        let (joiner, mut second_rx) = LoopbackConnection::pair();
        let join = {
            let tracker = Arc::clone(&tracker);
            let id = a.id;
            tokio::spawn(async move { tracker.swap_connection(id, Arc::new(joiner)).await })
        };

        // Wait for the swap to land, then finish the session.
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                channel.info("second").await;
                if let Ok(Event::Info(msg)) = second_rx.try_recv() {
                    assert_eq!(msg, "second");
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert!(!join.is_finished());
        tracker.remove_session(a.id);
        tokio::time::timeout(Duration::from_secs(5), join)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        assert_eq!(first_rx.recv().await, Some(Event::info("first")));
        // The replaced loopback was closed; anything after is the joiner's.
        while let Some(event) = first_rx.recv().await {
            assert_eq!(event, Event::info("second"));
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn kill_running_processes_terminates_children() {
        let tracker = SessionTracker::new();
        let (mut a, _ra) = entry("build");
        tracker.add_session(&mut a).unwrap();
        let mut child = tokio::process::Command::new("sleep")
            .arg("30")
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        let pid = child.id().unwrap();
        tracker.add_process(a.id, &["sleep".to_string(), "30".to_string()], pid);

        let killed = tracker.kill_running_processes();
        assert_eq!(killed.processes.len(), 1);
        assert_eq!(killed.processes[0].pid, pid);
        let status = tokio::time::timeout(Duration::from_secs(5), child.wait())
            .await
            .unwrap()
            .unwrap();
        assert!(!status.success());
    }
}
