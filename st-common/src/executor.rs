//! Streaming execution of external commands.
//!
//! [`Executor::run`] spawns a child, emits `BeginCommand`, forwards every
//! stderr line (and stdout, unless captured) as `TerminalOutput`, registers
//! the child with a [`ProcessRegistrar`], and finishes with `EndCommand`.
//! `EndCommand` is only sent after both pipes have been drained.

use crate::channel::Channel;
use crate::errors::{ErrorKind, Result, StError};
use crate::proc_times::{self, CpuTimes};
use crate::protocol::{BeginCommand, EndCommand, Event, OutputStream, TerminalOutput};
use crate::tracker::ProcessId;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Lines longer than this are split at the boundary.
pub const MAX_LINE_LENGTH: usize = 1024 * 1024 * 1024;

const CPU_SAMPLE_INTERVAL: Duration = Duration::from_millis(250);
/// How long to keep draining pipes after a cancelled child was killed.
const CANCEL_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Receives child process lifecycle notifications.
pub trait ProcessRegistrar: Send + Sync {
    fn add_process(&self, command: &[String], pid: u32) -> Option<ProcessId>;
    fn remove_process(&self, id: ProcessId, times: CpuTimes);
}

/// What to run and how.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub argv: Vec<String>,
    pub workdir: PathBuf,
    pub env: Vec<(String, String)>,
    pub capture_stdout: bool,
}

impl CommandSpec {
    pub fn new<I, S>(workdir: impl AsRef<Path>, argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
            workdir: workdir.as_ref().to_path_buf(),
            env: Vec::new(),
            capture_stdout: false,
        }
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn capture(mut self) -> Self {
        self.capture_stdout = true;
        self
    }
}

/// Outcome of a streamed command.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    /// Trimmed stdout when captured, empty otherwise.
    pub stdout: String,
    pub success: bool,
    pub exit_code: Option<i32>,
    pub times: CpuTimes,
}

/// Runs commands on behalf of one session.
#[derive(Clone)]
pub struct Executor {
    host: String,
    channel: Channel,
    registrar: Option<Arc<dyn ProcessRegistrar>>,
    cancel: CancellationToken,
}

impl Executor {
    pub fn new(host: impl Into<String>, channel: Channel) -> Self {
        Self {
            host: host.into(),
            channel,
            registrar: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_registrar(mut self, registrar: Arc<dyn ProcessRegistrar>) -> Self {
        self.registrar = Some(registrar);
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Stream a command; fails with `ExternalCommandFailed` on non-zero exit.
    pub async fn execute(&self, workdir: &Path, argv: &[&str]) -> Result<()> {
        self.execute_spec(&CommandSpec::new(workdir, argv.iter().copied()))
            .await
            .map(|_| ())
    }

    /// Stream stderr and return captured stdout.
    pub async fn execute_capture(&self, workdir: &Path, argv: &[&str]) -> Result<String> {
        self.execute_spec(&CommandSpec::new(workdir, argv.iter().copied()).capture())
            .await
    }

    /// Run `spec` and convert a non-zero exit into an error.
    pub async fn execute_spec(&self, spec: &CommandSpec) -> Result<String> {
        let output = self.run(spec).await?;
        if output.success {
            Ok(output.stdout)
        } else {
            Err(command_failed(&spec.argv, output.exit_code))
        }
    }

    /// Run `spec`, emitting lifecycle events. A non-zero exit is reported in
    /// the returned [`CommandOutput`], not as an error.
    pub async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        let Some((program, args)) = spec.argv.split_first() else {
            return Err(StError::new(ErrorKind::EmptyCommand));
        };

        self.channel
            .begin_command(BeginCommand {
                command: spec.argv.clone(),
                workdir: spec.workdir.display().to_string(),
                host: self.host.clone(),
                interactive: false,
            })
            .await;

        let mut command = Command::new(program);
        command
            .args(args)
            .current_dir(&spec.workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in &spec.env {
            command.env(key, value);
        }

        debug!("Running {:?} in {}", spec.argv, spec.workdir.display());
        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                let message = format!("failed to start {program}: {e}");
                self.channel.stderr(message.clone()).await;
                self.channel
                    .end_command(EndCommand {
                        return_code: 1,
                        ..EndCommand::default()
                    })
                    .await;
                return Err(
                    StError::with_message(ErrorKind::ExternalCommandFailed, message).with_source(e)
                );
            }
        };
        let pid = child.id().unwrap_or(0);

        let stderr_task = child.stderr.take().map(|pipe| {
            let channel = self.channel.clone();
            tokio::spawn(async move {
                stream_lines(pipe, &channel, OutputStream::Err).await?;
                Ok::<_, std::io::Error>(None)
            })
        });
        let stdout_task = child.stdout.take().map(|mut pipe| {
            let channel = self.channel.clone();
            let capture = spec.capture_stdout;
            tokio::spawn(async move {
                if capture {
                    let mut buf = Vec::new();
                    pipe.read_to_end(&mut buf).await?;
                    Ok::<_, std::io::Error>(Some(String::from_utf8_lossy(&buf).into_owned()))
                } else {
                    stream_lines(pipe, &channel, OutputStream::Out).await?;
                    Ok(None)
                }
            })
        });

        let process_id = self
            .registrar
            .as_ref()
            .and_then(|r| r.add_process(&spec.argv, pid));

        let mut times = CpuTimes::default();
        let mut ticker = tokio::time::interval(CPU_SAMPLE_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut cancelled = false;
        let mut kill_sent = false;
        let mut exit_watch = (pid != 0)
            .then(|| tokio::task::spawn_blocking(move || proc_times::wait_exited(pid)));
        let status = loop {
            tokio::select! {
                status = child.wait(), if exit_watch.is_none() => break status,
                exited = exit_notice(&mut exit_watch), if exit_watch.is_some() => {
                    // The child is a zombie now; its counters are final.
                    if exited && let Some(sample) = proc_times::sample(pid) {
                        times = times.max(sample);
                    }
                    exit_watch = None;
                }
                _ = self.cancel.cancelled(), if !cancelled => cancelled = true,
                _ = ticker.tick() => {
                    if let Some(sample) = proc_times::sample(pid) {
                        times = times.max(sample);
                    }
                }
            }
            if cancelled && !kill_sent {
                debug!("Cancelling {:?} (pid {})", spec.argv, pid);
                if let Err(e) = child.start_kill() {
                    debug!("Failed to kill pid {}: {}", pid, e);
                }
                kill_sent = true;
            }
        };

        let drain_limit = cancelled.then_some(CANCEL_DRAIN_TIMEOUT);
        join_scanner(stderr_task, drain_limit).await;
        let captured = join_scanner(stdout_task, drain_limit).await;

        if let (Some(registrar), Some(id)) = (&self.registrar, process_id) {
            registrar.remove_process(id, times);
        }

        let (success, exit_code) = match &status {
            Ok(status) => (status.success(), status.code()),
            Err(e) => {
                warn!("Failed to wait for {:?}: {}", spec.argv, e);
                (false, None)
            }
        };

        self.channel
            .end_command(EndCommand {
                return_code: if success { 0 } else { 1 },
                system_time_ns: times.system_ns,
                user_time_ns: times.user_ns,
            })
            .await;

        Ok(CommandOutput {
            stdout: captured.map(|s| s.trim().to_string()).unwrap_or_default(),
            success,
            exit_code,
            times,
        })
    }

    /// Run a command without emitting events or registering it. Returns
    /// trimmed stdout.
    pub async fn run_silently(&self, workdir: &Path, argv: &[&str]) -> Result<String> {
        let output = self.silent_output(workdir, argv).await?;
        if !output.status.success() {
            return Err(silent_failure(argv, &output));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Like [`run_silently`](Self::run_silently), but an exit with
    /// `empty_code` means "no result" and yields `None`.
    pub async fn run_silently_or_empty(
        &self,
        workdir: &Path,
        argv: &[&str],
        empty_code: i32,
    ) -> Result<Option<String>> {
        let output = self.silent_output(workdir, argv).await?;
        match output.status.code() {
            Some(0) => Ok(Some(String::from_utf8_lossy(&output.stdout).trim().to_string())),
            Some(code) if code == empty_code => Ok(None),
            _ => Err(silent_failure(argv, &output)),
        }
    }

    async fn silent_output(&self, workdir: &Path, argv: &[&str]) -> Result<std::process::Output> {
        let Some((program, args)) = argv.split_first() else {
            return Err(StError::new(ErrorKind::EmptyCommand));
        };
        let mut command = Command::new(program);
        command
            .args(args)
            .current_dir(workdir)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        tokio::select! {
            output = command.output() => output.map_err(|e| {
                StError::with_message(
                    ErrorKind::ExternalCommandFailed,
                    format!("failed to start {program}: {e}"),
                )
                .with_source(e)
            }),
            _ = self.cancel.cancelled() => Err(StError::with_message(
                ErrorKind::ExternalCommandFailed,
                format!("{program} cancelled"),
            )),
        }
    }
}

/// Error for a silent run that exited unsuccessfully, carrying its stderr.
fn silent_failure(argv: &[&str], output: &std::process::Output) -> StError {
    let argv: Vec<String> = argv.iter().map(|s| s.to_string()).collect();
    let err = command_failed(&argv, output.status.code());
    match String::from_utf8_lossy(&output.stderr).trim() {
        "" => err,
        detail => StError::with_message(
            ErrorKind::ExternalCommandFailed,
            format!("{}: {}", err.detail().unwrap_or_default(), detail),
        ),
    }
}

fn command_failed(argv: &[String], code: Option<i32>) -> StError {
    let rendered = shell_escape_argv(argv);
    match code {
        Some(code) => StError::with_message(
            ErrorKind::ExternalCommandFailed,
            format!("`{rendered}` exited with status {code}"),
        ),
        None => StError::with_message(
            ErrorKind::ExternalCommandFailed,
            format!("`{rendered}` was terminated"),
        ),
    }
}

/// Render argv as a copy-pasteable shell command.
pub fn shell_escape_argv(argv: &[String]) -> String {
    argv.iter()
        .map(|arg| shell_escape::escape(arg.as_str().into()).into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}

type ScannerTask = JoinHandle<std::io::Result<Option<String>>>;
type ExitWatch = JoinHandle<std::io::Result<()>>;

/// Resolves once the watched child has exited; `false` if the watch failed
/// and the caller should fall back to reaping directly.
async fn exit_notice(watch: &mut Option<ExitWatch>) -> bool {
    let Some(task) = watch else {
        return std::future::pending().await;
    };
    match task.await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            debug!("Exit watch failed: {}", e);
            false
        }
        Err(e) => {
            debug!("Exit watch task failed: {}", e);
            false
        }
    }
}

async fn join_scanner(task: Option<ScannerTask>, limit: Option<Duration>) -> Option<String> {
    let mut task = task?;
    let joined = match limit {
        Some(limit) => match tokio::time::timeout(limit, &mut task).await {
            Ok(joined) => joined,
            Err(_) => {
                debug!("Pipe still open after kill; abandoning scanner");
                task.abort();
                return None;
            }
        },
        None => task.await,
    };
    match joined {
        Ok(Ok(captured)) => captured,
        Ok(Err(e)) => {
            warn!("Error reading child output: {}", e);
            None
        }
        Err(e) => {
            warn!("Output scanner failed: {}", e);
            None
        }
    }
}

async fn stream_lines<R>(reader: R, channel: &Channel, stream: OutputStream) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut line = Vec::new();
    loop {
        line.clear();
        if read_line_limited(&mut reader, &mut line, MAX_LINE_LENGTH).await? == 0 {
            return Ok(());
        }
        channel
            .emit(Event::TerminalOutput(TerminalOutput {
                output: decode_line(&line),
                stream,
            }))
            .await;
    }
}

/// Read up to and including the next `\n`, or until `limit` bytes are
/// buffered. Returns the number of bytes consumed; 0 means end-of-stream.
pub(crate) async fn read_line_limited<R>(
    reader: &mut R,
    buf: &mut Vec<u8>,
    limit: usize,
) -> std::io::Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    let mut total = 0;
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(total);
        }
        let room = limit.saturating_sub(buf.len());
        let window = &available[..available.len().min(room)];
        if let Some(pos) = window.iter().position(|b| *b == b'\n') {
            buf.extend_from_slice(&window[..=pos]);
            reader.consume(pos + 1);
            return Ok(total + pos + 1);
        }
        let taken = window.len();
        buf.extend_from_slice(window);
        reader.consume(taken);
        total += taken;
        if buf.len() >= limit {
            return Ok(total);
        }
    }
}

fn decode_line(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\n").unwrap_or(raw);
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::LoopbackConnection;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    fn executor() -> (Executor, mpsc::UnboundedReceiver<Event>) {
        let (conn, rx) = LoopbackConnection::pair();
        (Executor::new("testhost", Channel::new(Arc::new(conn))), rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Event>) -> Vec<Event> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[derive(Default)]
    struct RecordingRegistrar {
        added: Mutex<Vec<(Vec<String>, u32)>>,
        removed: Mutex<Vec<ProcessId>>,
    }

    impl ProcessRegistrar for RecordingRegistrar {
        fn add_process(&self, command: &[String], pid: u32) -> Option<ProcessId> {
            self.added.lock().unwrap().push((command.to_vec(), pid));
            Some(ProcessId(99))
        }

        fn remove_process(&self, id: ProcessId, _times: CpuTimes) {
            self.removed.lock().unwrap().push(id);
        }
    }

    #[tokio::test]
    async fn read_line_limited_splits_long_lines() {
        let mut reader = BufReader::new(&b"abcdefgh\nxy"[..]);
        let mut buf = Vec::new();
        assert_eq!(read_line_limited(&mut reader, &mut buf, 5).await.unwrap(), 5);
        assert_eq!(buf, b"abcde");
        buf.clear();
        assert_eq!(read_line_limited(&mut reader, &mut buf, 5).await.unwrap(), 4);
        assert_eq!(buf, b"fgh\n");
        buf.clear();
        assert_eq!(read_line_limited(&mut reader, &mut buf, 5).await.unwrap(), 2);
        assert_eq!(buf, b"xy");
        buf.clear();
        assert_eq!(read_line_limited(&mut reader, &mut buf, 5).await.unwrap(), 0);
    }

    #[test]
    fn decode_line_strips_terminators() {
        assert_eq!(decode_line(b"hello\r\n"), "hello");
        assert_eq!(decode_line(b"hello\n"), "hello");
        assert_eq!(decode_line(b"tail"), "tail");
        assert_eq!(decode_line(b"bad \xff byte\n"), "bad \u{fffd} byte");
    }

    #[tokio::test]
    async fn empty_command_emits_nothing() {
        let (exec, mut rx) = executor();
        let err = exec.run(&CommandSpec::new(".", Vec::<String>::new())).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::EmptyCommand);
        assert!(drain(&mut rx).is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn begin_precedes_output_and_end_follows() {
        let (exec, mut rx) = executor();
        let registrar = Arc::new(RecordingRegistrar::default());
        let exec = exec.with_registrar(registrar.clone());
        exec.execute(Path::new("/"), &["sh", "-c", "echo out; echo err 1>&2; echo more"])
            .await
            .unwrap();

        let events = drain(&mut rx);
        match events.first() {
            Some(Event::BeginCommand(begin)) => {
                assert_eq!(begin.command[0], "sh");
                assert_eq!(begin.workdir, "/");
                assert_eq!(begin.host, "testhost");
            }
            other => panic!("expected BeginCommand first, got {other:?}"),
        }
        match events.last() {
            Some(Event::EndCommand(end)) => assert_eq!(end.return_code, 0),
            other => panic!("expected EndCommand last, got {other:?}"),
        }
        let middle = &events[1..events.len() - 1];
        assert!(middle.contains(&Event::stdout("out")));
        assert!(middle.contains(&Event::stdout("more")));
        assert!(middle.contains(&Event::stderr("err")));
        assert_eq!(middle.len(), 3);
        let out_order: Vec<_> = middle
            .iter()
            .filter(|e| matches!(e, Event::TerminalOutput(t) if t.stream == OutputStream::Out))
            .collect();
        assert_eq!(out_order, vec![&Event::stdout("out"), &Event::stdout("more")]);

        assert_eq!(registrar.added.lock().unwrap().len(), 1);
        assert_eq!(*registrar.removed.lock().unwrap(), vec![ProcessId(99)]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn captured_stdout_is_returned_not_streamed() {
        let (exec, mut rx) = executor();
        let out = exec
            .execute_capture(Path::new("/"), &["sh", "-c", "printf '  abc\\n'"])
            .await
            .unwrap();
        assert_eq!(out, "abc");
        let events = drain(&mut rx);
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], Event::BeginCommand(_)));
        assert!(matches!(events[1], Event::EndCommand(EndCommand { return_code: 0, .. })));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn non_zero_exit_reports_failure() {
        let (exec, mut rx) = executor();
        let err = exec
            .execute(Path::new("/"), &["sh", "-c", "exit 3"])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ExternalCommandFailed);
        assert!(err.to_string().contains("status 3"));
        let events = drain(&mut rx);
        assert!(matches!(events.last(), Some(Event::EndCommand(EndCommand { return_code: 1, .. }))));
    }

    #[tokio::test]
    async fn spawn_failure_still_ends_the_command() {
        let (exec, mut rx) = executor();
        let err = exec
            .execute(Path::new("."), &["/definitely/not/a/binary"])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ExternalCommandFailed);
        let events = drain(&mut rx);
        assert_eq!(events.len(), 3);
        assert!(matches!(events[0], Event::BeginCommand(_)));
        assert!(matches!(&events[1], Event::TerminalOutput(t) if t.stream == OutputStream::Err));
        assert!(matches!(events[2], Event::EndCommand(EndCommand { return_code: 1, .. })));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn cancellation_kills_the_child() {
        let (exec, mut rx) = executor();
        let cancel = CancellationToken::new();
        let exec = exec.with_cancellation(cancel.clone());
        let trigger = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            cancel.cancel();
        });
        let started = std::time::Instant::now();
        let output = exec
            .run(&CommandSpec::new("/", ["sleep", "30"]))
            .await
            .unwrap();
        trigger.await.unwrap();
        assert!(!output.success);
        assert!(started.elapsed() < Duration::from_secs(10));
        let events = drain(&mut rx);
        assert!(matches!(events.last(), Some(Event::EndCommand(EndCommand { return_code: 1, .. }))));
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn cpu_time_of_descendants_is_reported() {
        let (exec, mut rx) = executor();
        let burn = "i=0; while [ $i -lt 400000 ]; do i=$((i+1)); done";
        let script = format!("sh -c '{burn}'; true");
        let output = exec
            .run(&CommandSpec::new("/", ["sh", "-c", script.as_str()]))
            .await
            .unwrap();
        assert!(output.success);
        let total = output.times.user_ns + output.times.system_ns;
        assert!(total >= 100_000_000, "only {total}ns recorded");
        match drain(&mut rx).last() {
            Some(Event::EndCommand(end)) => {
                assert_eq!(end.user_time_ns, output.times.user_ns);
                assert_eq!(end.system_time_ns, output.times.system_ns);
            }
            other => panic!("expected EndCommand last, got {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn extra_environment_reaches_the_child() {
        let (exec, _rx) = executor();
        let spec = CommandSpec::new("/", ["sh", "-c", "echo $ST_MARKER"])
            .env("ST_MARKER", "visible")
            .capture();
        assert_eq!(exec.execute_spec(&spec).await.unwrap(), "visible");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn silent_runs_emit_no_events() {
        let (exec, mut rx) = executor();
        let out = exec
            .run_silently(Path::new("/"), &["sh", "-c", "echo hi; echo noise 1>&2"])
            .await
            .unwrap();
        assert_eq!(out, "hi");
        assert!(drain(&mut rx).is_empty());

        let err = exec
            .run_silently(Path::new("/"), &["sh", "-c", "echo broken 1>&2; exit 1"])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("broken"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn designated_exit_code_means_no_result() {
        let (exec, mut rx) = executor();
        let root = Path::new("/");
        let found = exec
            .run_silently_or_empty(root, &["sh", "-c", "echo found"], 1)
            .await
            .unwrap();
        assert_eq!(found.as_deref(), Some("found"));
        let none = exec
            .run_silently_or_empty(root, &["sh", "-c", "exit 1"], 1)
            .await
            .unwrap();
        assert!(none.is_none());
        let err = exec
            .run_silently_or_empty(root, &["sh", "-c", "echo fatal 1>&2; exit 128"], 1)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ExternalCommandFailed);
        assert!(err.to_string().contains("fatal"));
        assert!(drain(&mut rx).is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn shell_escape_quotes_spaces() {
        let argv = vec!["git".to_string(), "commit".to_string(), "-m".to_string(), "two words".to_string()];
        assert_eq!(shell_escape_argv(&argv), "git commit -m 'two words'");
    }
}
