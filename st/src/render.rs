//! Console sink for session events.
//!
//! Events arrive over an mpsc channel from whichever route served the
//! request. Plain mode prints them for a person, with command output passed
//! through verbatim; JSON mode prints one envelope per line.

use st_common::protocol::{
    BeginCommand, CommandList, Envelope, Event, JobList, OutputStream, ProcessList,
};
use tokio::sync::mpsc;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    Plain,
    Json,
}

/// One line of console output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Line {
    pub stderr: bool,
    pub text: String,
}

impl Line {
    fn out(text: impl Into<String>) -> Self {
        Self {
            stderr: false,
            text: text.into(),
        }
    }

    fn err(text: impl Into<String>) -> Self {
        Self {
            stderr: true,
            text: text.into(),
        }
    }

    fn print(&self) {
        if self.stderr {
            eprintln!("{}", self.text);
        } else {
            println!("{}", self.text);
        }
    }
}

/// Formats events for the terminal and remembers whether any `Error` was
/// seen.
pub struct Console {
    mode: OutputMode,
    host: String,
    saw_error: bool,
}

impl Console {
    /// `host` labels server messages; only its first DNS label is shown.
    pub fn new(host: &str, mode: OutputMode) -> Self {
        let host = host.split('.').next().unwrap_or(host).to_string();
        Self {
            mode,
            host,
            saw_error: false,
        }
    }

    pub fn saw_error(&self) -> bool {
        self.saw_error
    }

    pub fn format(&mut self, event: &Event) -> Vec<Line> {
        if let Event::Error(_) = event {
            self.saw_error = true;
        }
        match self.mode {
            OutputMode::Json => match serde_json::to_string(&Envelope::from(event.clone())) {
                Ok(json) => vec![Line::out(json)],
                Err(e) => {
                    warn!("Cannot encode '{}' event: {}", event.kind_name(), e);
                    Vec::new()
                }
            },
            OutputMode::Plain => self.format_plain(event),
        }
    }

    fn format_plain(&self, event: &Event) -> Vec<Line> {
        match event {
            Event::Info(message) => vec![Line::out(format!("{}:Info: {}", self.host, message))],
            Event::Error(message) => vec![Line::err(format!("{}:Error: {}", self.host, message))],
            Event::BeginCommand(begin) => vec![self.begin_line(begin)],
            Event::TerminalOutput(output) => match output.stream {
                OutputStream::Out => vec![Line::out(output.output.as_str())],
                OutputStream::Err => vec![Line::err(output.output.as_str())],
            },
            Event::EndCommand(end) if end.return_code == 0 => Vec::new(),
            Event::EndCommand(end) => vec![
                Line::err(format!("Failed: Return code {}", end.return_code)),
                Line::err(""),
            ],
            Event::CommandList(list) => command_list(list),
            Event::JobList(jobs) => job_list(jobs),
            Event::ProcessList(processes) => process_list(processes),
            Event::Request(request) => {
                debug!("Ignoring request '{}' from the server", request.command);
                Vec::new()
            }
        }
    }

    fn begin_line(&self, begin: &BeginCommand) -> Line {
        let mut text = format!("{}: {}", self.host, begin.command.join(" "));
        if !begin.workdir.is_empty() {
            text.push_str(&format!(" [{}]", begin.workdir));
        }
        Line::out(text)
    }
}

fn command_list(list: &CommandList) -> Vec<Line> {
    let mut lines = Vec::with_capacity(list.commands.len() + 4);
    if !list.synopsis.is_empty() {
        lines.push(Line::out(format!("Usage: {}", list.synopsis)));
        lines.push(Line::out(""));
    }
    let width = list.commands.iter().map(|c| c.name.len()).max().unwrap_or(0);
    for command in &list.commands {
        lines.push(Line::out(format!("  {:width$}  {}", command.name, command.doc)));
    }
    if !list.config_file.is_empty() {
        lines.push(Line::out(""));
        lines.push(Line::out(format!("Configuration: {}", list.config_file)));
    }
    lines
}

fn job_list(jobs: &JobList) -> Vec<Line> {
    if jobs.jobs.is_empty() {
        return vec![Line::out("No running jobs")];
    }
    let mut lines = Vec::new();
    for job in &jobs.jobs {
        let mut command = job.request.command.clone();
        for arg in &job.request.arguments {
            command.push(' ');
            command.push_str(arg);
        }
        lines.push(Line::out(format!(
            "[{}] {} ({:.1}s)",
            job.id,
            command,
            job.elapsed_ms as f64 / 1000.0
        )));
        for process in &job.processes {
            let state = if process.running { "running" } else { "done" };
            lines.push(Line::out(format!(
                "    {} {} {}",
                process.pid,
                state,
                process.command.join(" ")
            )));
        }
    }
    lines
}

fn process_list(processes: &ProcessList) -> Vec<Line> {
    if processes.processes.is_empty() {
        return vec![Line::out("No processes to kill")];
    }
    processes
        .processes
        .iter()
        .map(|process| Line::out(format!("Killed {}: {}", process.pid, process.command.join(" "))))
        .collect()
}

/// Print every event until all senders are gone. Returns whether the server
/// reported an error.
pub async fn drain(mut events: mpsc::UnboundedReceiver<Event>, mut console: Console) -> bool {
    while let Some(event) = events.recv().await {
        for line in console.format(&event) {
            line.print();
        }
    }
    console.saw_error()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use st_common::protocol::{CommandInfo, EndCommand, JobRecord, ProcessSnapshot, Request};

    fn plain() -> Console {
        Console::new("builder.example.com", OutputMode::Plain)
    }

    fn texts(lines: Vec<Line>) -> Vec<String> {
        lines.into_iter().map(|l| l.text).collect()
    }

    #[test]
    fn messages_are_labelled_with_the_short_host() {
        let mut console = plain();
        assert_eq!(texts(console.format(&Event::info("Pong"))), ["builder:Info: Pong"]);
        assert!(!console.saw_error());

        let lines = console.format(&Event::error("Invalid method"));
        assert_eq!(lines, vec![Line::err("builder:Error: Invalid method")]);
        assert!(console.saw_error());
    }

    #[test]
    fn command_output_passes_through_verbatim() {
        let mut console = plain();
        let begin = Event::BeginCommand(BeginCommand {
            command: vec!["ninja".into(), "-C".into(), "out/Default".into(), "chrome".into()],
            workdir: "/src/chrome".to_string(),
            host: "builder".to_string(),
            interactive: false,
        });
        assert_eq!(
            texts(console.format(&begin)),
            ["builder: ninja -C out/Default chrome [/src/chrome]"]
        );
        for line in [
            "FAILED: obj/base/base.o",
            "../../base/files/file.cc:10:3: error: expected ';'",
            "In file /src/chrome/base/a.h",
            "/src/chrome_out/x",
        ] {
            assert_eq!(console.format(&Event::stdout(line)), vec![Line::out(line)]);
        }
        assert!(console.format(&Event::EndCommand(EndCommand::default())).is_empty());
    }

    #[test]
    fn failed_commands_report_the_return_code() {
        let mut console = plain();
        let lines = console.format(&Event::EndCommand(EndCommand {
            return_code: 1,
            ..EndCommand::default()
        }));
        assert_eq!(lines, vec![Line::err("Failed: Return code 1"), Line::err("")]);
        assert!(!console.saw_error());
    }

    #[test]
    fn stderr_output_stays_on_stderr() {
        let mut console = plain();
        let lines = console.format(&Event::stderr("warning: something"));
        assert_eq!(lines, vec![Line::err("warning: something")]);
    }

    #[test]
    fn command_list_is_aligned() {
        let mut console = plain();
        let list = CommandList {
            synopsis: "st [options] <command>".to_string(),
            config_file: "/home/me/.stonesthrow".to_string(),
            commands: vec![
                CommandInfo {
                    name: "build".to_string(),
                    doc: "Build targets.".to_string(),
                },
                CommandInfo {
                    name: "ping".to_string(),
                    doc: "Check that the server is alive.".to_string(),
                },
            ],
        };
        let lines = texts(console.format(&Event::CommandList(list)));
        assert_eq!(lines[0], "Usage: st [options] <command>");
        assert_eq!(lines[2], "  build  Build targets.");
        assert_eq!(lines[3], "  ping   Check that the server is alive.");
        assert_eq!(lines.last().unwrap(), "Configuration: /home/me/.stonesthrow");
    }

    #[test]
    fn jobs_list_their_processes() {
        let mut console = plain();
        let jobs = JobList {
            jobs: vec![JobRecord {
                id: 3,
                request: Request::new("build").with_arguments(["chrome"]),
                start_time: Utc::now(),
                elapsed_ms: 1500,
                processes: vec![ProcessSnapshot {
                    command: vec!["ninja".into(), "chrome".into()],
                    pid: 77,
                    start_time: Utc::now(),
                    running: true,
                    end_time: None,
                    elapsed_ms: 1400,
                    system_time_ns: 0,
                    user_time_ns: 0,
                }],
            }],
        };
        assert_eq!(
            texts(console.format(&Event::JobList(jobs))),
            ["[3] build chrome (1.5s)", "    77 running ninja chrome"]
        );
    }

    #[test]
    fn empty_listings_say_so() {
        let mut console = plain();
        assert_eq!(texts(console.format(&Event::JobList(JobList::default()))), ["No running jobs"]);
        assert_eq!(
            texts(console.format(&Event::ProcessList(ProcessList::default()))),
            ["No processes to kill"]
        );
    }

    #[test]
    fn json_mode_prints_envelopes() {
        let mut console = Console::new("builder", OutputMode::Json);
        let lines = texts(console.format(&Event::info("Pong")));
        assert_eq!(lines, [r#"{"info":"Pong"}"#]);
        assert!(console.format(&Event::Request(Request::new("ping"))).len() == 1);
        console.format(&Event::error("boom"));
        assert!(console.saw_error());
    }
}
