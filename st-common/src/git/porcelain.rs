//! Parsers for machine-readable git output.

use crate::errors::{ErrorKind, Result, StError};
use crate::protocol::BranchConfig;
use std::collections::{BTreeMap, BTreeSet};

/// Branch pattern that selects every local branch.
pub const ALL_BRANCHES: &str = "refs/heads/*";

/// Summary of `git status --porcelain=2`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GitStatus {
    pub has_unmerged: bool,
    pub has_modified: bool,
    /// Paths with unstaged worktree changes, in the order git listed them.
    pub modified_files: Vec<String>,
}

impl GitStatus {
    pub fn is_clean(&self) -> bool {
        !self.has_unmerged && !self.has_modified
    }
}

/// Parse `git status --porcelain=2 --untracked-files=no`.
///
/// Only entries with a worktree change (second `XY` character other than
/// `.`) count as modified. Paths are taken verbatim, spaces included.
pub fn parse_status(output: &str) -> GitStatus {
    let mut status = GitStatus::default();
    for line in output.lines() {
        if line.starts_with('#') {
            continue;
        }
        if line.starts_with("u ") {
            status.has_unmerged = true;
            continue;
        }
        if line.starts_with("1 ") {
            // 1 XY sub mH mI mW hH hI <path>
            let fields: Vec<&str> = line.splitn(9, ' ').collect();
            if fields.len() == 9 && worktree_changed(fields[1]) {
                status.modified_files.push(fields[8].to_string());
                status.has_modified = true;
            }
        } else if line.starts_with("2 ") {
            // 2 XY sub mH mI mW hH hI Xscore <path>\t<origPath>
            let fields: Vec<&str> = line.splitn(10, ' ').collect();
            if fields.len() == 10
                && worktree_changed(fields[1])
                && let Some((path, _orig)) = fields[9].split_once('\t')
            {
                status.modified_files.push(path.to_string());
                status.has_modified = true;
            }
        }
    }
    status
}

fn worktree_changed(xy: &str) -> bool {
    let bytes = xy.as_bytes();
    bytes.len() == 2 && bytes[1] != b'.'
}

/// Result of `git push --porcelain`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PushReport {
    /// Remote ref name to git's summary for every ref that was updated or
    /// already up to date.
    pub known_branches: BTreeMap<String, String>,
    /// Whether git printed the closing `Done`.
    pub done: bool,
}

/// Parse the porcelain output of `git push`. A rejected ref (`!` flag) is a
/// `FailedToPushGitBranch` error naming the ref.
pub fn parse_push_output(output: &str) -> Result<PushReport> {
    let mut report = PushReport::default();
    for raw in output.lines() {
        let line = raw.trim_end_matches('\r');
        if let Some(rest) = line.strip_prefix("!\t") {
            return Err(StError::with_message(
                ErrorKind::FailedToPushGitBranch,
                rest.replace('\t', " "),
            ));
        }
        if line.trim() == "Done" {
            report.done = true;
            continue;
        }
        let mut fields = line.splitn(3, '\t');
        let (Some(flag), Some(refs), Some(summary)) = (fields.next(), fields.next(), fields.next())
        else {
            continue;
        };
        if !matches!(flag, "+" | "*" | "=" | " ") {
            continue;
        }
        if let Some((_from, to)) = refs.split_once(':') {
            report
                .known_branches
                .insert(to.to_string(), summary.trim().to_string());
        }
    }
    Ok(report)
}

/// Parse `git config --local -z --get-regex ^branch\..*` into per-branch
/// records.
///
/// Only `properties` are kept. When `branches` is exactly
/// [`ALL_BRANCHES`], every branch seen in the config is reported; otherwise
/// each requested branch gets a record (possibly empty) and others are
/// ignored. Revisions are left empty for the caller to fill in.
pub fn parse_branch_config(
    output: &str,
    branches: &[String],
    properties: &[String],
) -> Result<Vec<BranchConfig>> {
    let include_all = branches.len() == 1 && branches[0] == ALL_BRANCHES;
    let wanted: BTreeSet<&str> = properties.iter().map(String::as_str).collect();
    let mut found: BTreeMap<String, BranchConfig> = BTreeMap::new();
    if !include_all {
        for branch in branches {
            found.insert(branch.clone(), empty_branch(branch));
        }
    }

    for record in output.split('\0') {
        if record.is_empty() {
            continue;
        }
        let (name, value) = record.split_once('\n').ok_or_else(|| unexpected(record))?;
        let rest = name.strip_prefix("branch.").ok_or_else(|| unexpected(record))?;
        let (branch, property) = rest.rsplit_once('.').ok_or_else(|| unexpected(record))?;
        if branch.is_empty() || property.is_empty() {
            return Err(unexpected(record));
        }

        let entry = if include_all {
            found
                .entry(branch.to_string())
                .or_insert_with(|| empty_branch(branch))
        } else {
            match found.get_mut(branch) {
                Some(entry) => entry,
                None => continue,
            }
        };
        if wanted.contains(property) {
            entry.config.insert(property.to_string(), value.to_string());
        }
    }
    Ok(found.into_values().collect())
}

fn empty_branch(name: &str) -> BranchConfig {
    BranchConfig {
        name: name.to_string(),
        ..BranchConfig::default()
    }
}

fn unexpected(record: &str) -> StError {
    StError::with_message(
        ErrorKind::UnrecognizedResponse,
        format!("unexpected config format: {record:?}"),
    )
}

/// Parse `git rev-list --left-right --count a...b` into (ahead, behind).
pub fn parse_ahead_behind(output: &str) -> Result<(u32, u32)> {
    let fields: Vec<&str> = output.trim().split('\t').collect();
    let parsed: Option<(u32, u32)> = match fields.as_slice() {
        [ahead, behind] => ahead.trim().parse().ok().zip(behind.trim().parse().ok()),
        _ => None,
    };
    parsed.ok_or_else(|| {
        StError::with_message(
            ErrorKind::UnrecognizedResponse,
            format!("unexpected output from 'git rev-list --count --left-right': [{output}]"),
        )
    })
}
