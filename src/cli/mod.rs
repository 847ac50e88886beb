use crate::domain::{
    BranchRecord, MutationRequest, SessionIdentity, SessionStatus, ToolCallState, TurnsView,
    derive_status, derive_status_from_text, parse_log, segment_turns, tail_window,
};
use crate::infra::{
    BranchError, BranchManager, CoreConfig, LogStoreError, PersistentHistory, WatchSessionLogError,
    WatchSignal, dispatch, watch_session_log,
};
use std::io::{self, Read, Write};
use std::time::Duration;
use thiserror::Error;

const DEFAULT_LIMIT: usize = 20;
const PREVIEW_WIDTH: usize = 60;
const WATCH_POLL: Duration = Duration::from_millis(500);
const WATCH_TAIL_BYTES: usize = 1024 * 1024;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum CliInvocation {
    PrintHelp,
    PrintVersion,
    Command(CliCommand),
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum CliCommand {
    Sessions {
        dir_name: String,
        limit: usize,
    },
    Status {
        identity: SessionIdentity,
        json: bool,
    },
    Turns {
        identity: SessionIdentity,
        offset: usize,
        limit: usize,
        json: bool,
    },
    Restore {
        identity: SessionIdentity,
        turn_index: usize,
    },
    Branches {
        identity: SessionIdentity,
        turn_index: Option<usize>,
        json: bool,
    },
    Materialize {
        identity: SessionIdentity,
        branch_id: String,
        through_turn: Option<usize>,
    },
    Duplicate {
        identity: SessionIdentity,
        turn_index: Option<usize>,
    },
    Apply,
    Watch {
        identity: SessionIdentity,
    },
    History(HistoryCommand),
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum HistoryCommand {
    Visit(SessionIdentity),
    Back,
    Forward,
    Commit,
    List,
}

#[derive(Debug, Error)]
pub enum CliParseError {
    #[error("unknown subcommand: {0}")]
    UnknownSubcommand(String),

    #[error("unknown flag: {0}")]
    UnknownFlag(String),

    #[error("missing value for flag: {0}")]
    MissingFlagValue(String),

    #[error("invalid value for {flag}: {value}")]
    InvalidFlagValue { flag: String, value: String },

    #[error("missing argument: {0}")]
    MissingArgument(&'static str),

    #[error("unexpected argument: {0}")]
    UnexpectedArgument(String),

    #[error("invalid session: {0}\nHint: pass <project-dir>/<session-id>, e.g. -home-me-app/5f1c….jsonl")]
    InvalidSession(String),
}

pub fn parse_invocation(args: &[String]) -> Result<CliInvocation, CliParseError> {
    if args.iter().any(|arg| arg == "--help" || arg == "-h") {
        return Ok(CliInvocation::PrintHelp);
    }
    if args.iter().any(|arg| arg == "--version" || arg == "-V") {
        return Ok(CliInvocation::PrintVersion);
    }

    let mut iter = args.iter().skip(1);
    let Some(subcommand) = iter.next() else {
        return Ok(CliInvocation::PrintHelp);
    };

    let mut args = iter.peekable();
    let command = match subcommand.as_str() {
        "sessions" => {
            let mut dir_name: Option<String> = None;
            let mut limit = DEFAULT_LIMIT;
            while let Some(arg) = args.next() {
                match arg.as_str() {
                    "--limit" | "-l" => {
                        let value = args.next().ok_or_else(|| {
                            CliParseError::MissingFlagValue("--limit".to_string())
                        })?;
                        limit = parse_usize_flag("--limit", value)?;
                    }
                    _ if arg.starts_with('-') => {
                        return Err(CliParseError::UnknownFlag(arg.to_string()));
                    }
                    _ if dir_name.is_none() => dir_name = Some(arg.to_string()),
                    _ => return Err(CliParseError::UnexpectedArgument(arg.to_string())),
                }
            }
            CliCommand::Sessions {
                dir_name: dir_name.ok_or(CliParseError::MissingArgument("project-dir"))?,
                limit,
            }
        }
        "status" => {
            let mut identity: Option<SessionIdentity> = None;
            let mut json = false;
            for arg in args {
                match arg.as_str() {
                    "--json" => json = true,
                    _ if arg.starts_with('-') => {
                        return Err(CliParseError::UnknownFlag(arg.to_string()));
                    }
                    _ if identity.is_none() => identity = Some(parse_identity(arg)?),
                    _ => return Err(CliParseError::UnexpectedArgument(arg.to_string())),
                }
            }
            CliCommand::Status {
                identity: identity.ok_or(CliParseError::MissingArgument("session"))?,
                json,
            }
        }
        "turns" => {
            let mut identity: Option<SessionIdentity> = None;
            let mut offset = 0usize;
            let mut limit = usize::MAX;
            let mut json = false;
            while let Some(arg) = args.next() {
                match arg.as_str() {
                    "--json" => json = true,
                    "--limit" | "-l" => {
                        let value = args.next().ok_or_else(|| {
                            CliParseError::MissingFlagValue("--limit".to_string())
                        })?;
                        limit = parse_usize_flag("--limit", value)?;
                    }
                    "--offset" | "-o" => {
                        let value = args.next().ok_or_else(|| {
                            CliParseError::MissingFlagValue("--offset".to_string())
                        })?;
                        offset = parse_usize_flag("--offset", value)?;
                    }
                    _ if arg.starts_with('-') => {
                        return Err(CliParseError::UnknownFlag(arg.to_string()));
                    }
                    _ if identity.is_none() => identity = Some(parse_identity(arg)?),
                    _ => return Err(CliParseError::UnexpectedArgument(arg.to_string())),
                }
            }
            CliCommand::Turns {
                identity: identity.ok_or(CliParseError::MissingArgument("session"))?,
                offset,
                limit,
                json,
            }
        }
        "restore" => {
            let mut positional = Vec::new();
            for arg in args {
                if arg.starts_with('-') {
                    return Err(CliParseError::UnknownFlag(arg.to_string()));
                }
                positional.push(arg.as_str());
            }
            match positional.as_slice() {
                [session, turn] => CliCommand::Restore {
                    identity: parse_identity(session)?,
                    turn_index: parse_usize_flag("turn", turn)?,
                },
                [] => return Err(CliParseError::MissingArgument("session")),
                [_] => return Err(CliParseError::MissingArgument("turn")),
                [_, _, extra, ..] => {
                    return Err(CliParseError::UnexpectedArgument(extra.to_string()));
                }
            }
        }
        "branches" => {
            let mut identity: Option<SessionIdentity> = None;
            let mut turn_index: Option<usize> = None;
            let mut json = false;
            while let Some(arg) = args.next() {
                match arg.as_str() {
                    "--json" => json = true,
                    "--turn" | "-t" => {
                        let value = args.next().ok_or_else(|| {
                            CliParseError::MissingFlagValue("--turn".to_string())
                        })?;
                        turn_index = Some(parse_usize_flag("--turn", value)?);
                    }
                    _ if arg.starts_with('-') => {
                        return Err(CliParseError::UnknownFlag(arg.to_string()));
                    }
                    _ if identity.is_none() => identity = Some(parse_identity(arg)?),
                    _ => return Err(CliParseError::UnexpectedArgument(arg.to_string())),
                }
            }
            CliCommand::Branches {
                identity: identity.ok_or(CliParseError::MissingArgument("session"))?,
                turn_index,
                json,
            }
        }
        "materialize" => {
            let mut positional: Vec<&str> = Vec::new();
            let mut through_turn: Option<usize> = None;
            while let Some(arg) = args.next() {
                match arg.as_str() {
                    "--through" => {
                        let value = args.next().ok_or_else(|| {
                            CliParseError::MissingFlagValue("--through".to_string())
                        })?;
                        through_turn = Some(parse_usize_flag("--through", value)?);
                    }
                    _ if arg.starts_with('-') => {
                        return Err(CliParseError::UnknownFlag(arg.to_string()));
                    }
                    _ => positional.push(arg.as_str()),
                }
            }
            match positional.as_slice() {
                [session, branch_id] => CliCommand::Materialize {
                    identity: parse_identity(session)?,
                    branch_id: branch_id.to_string(),
                    through_turn,
                },
                [] => return Err(CliParseError::MissingArgument("session")),
                [_] => return Err(CliParseError::MissingArgument("branch-id")),
                [_, _, extra, ..] => {
                    return Err(CliParseError::UnexpectedArgument(extra.to_string()));
                }
            }
        }
        "duplicate" => {
            let mut identity: Option<SessionIdentity> = None;
            let mut turn_index: Option<usize> = None;
            while let Some(arg) = args.next() {
                match arg.as_str() {
                    "--turn" | "-t" => {
                        let value = args.next().ok_or_else(|| {
                            CliParseError::MissingFlagValue("--turn".to_string())
                        })?;
                        turn_index = Some(parse_usize_flag("--turn", value)?);
                    }
                    _ if arg.starts_with('-') => {
                        return Err(CliParseError::UnknownFlag(arg.to_string()));
                    }
                    _ if identity.is_none() => identity = Some(parse_identity(arg)?),
                    _ => return Err(CliParseError::UnexpectedArgument(arg.to_string())),
                }
            }
            CliCommand::Duplicate {
                identity: identity.ok_or(CliParseError::MissingArgument("session"))?,
                turn_index,
            }
        }
        "apply" => {
            if let Some(arg) = args.next() {
                return Err(CliParseError::UnexpectedArgument(arg.to_string()));
            }
            CliCommand::Apply
        }
        "watch" => {
            let session = args
                .next()
                .ok_or(CliParseError::MissingArgument("session"))?;
            if let Some(arg) = args.next() {
                return Err(CliParseError::UnexpectedArgument(arg.to_string()));
            }
            CliCommand::Watch {
                identity: parse_identity(session)?,
            }
        }
        "history" => {
            let action = args.next().map(String::as_str).unwrap_or("list");
            let command = match action {
                "visit" => {
                    let session = args
                        .next()
                        .ok_or(CliParseError::MissingArgument("session"))?;
                    HistoryCommand::Visit(parse_identity(session)?)
                }
                "back" => HistoryCommand::Back,
                "forward" => HistoryCommand::Forward,
                "commit" => HistoryCommand::Commit,
                "list" => HistoryCommand::List,
                other => return Err(CliParseError::UnknownSubcommand(format!("history {other}"))),
            };
            if let Some(arg) = args.next() {
                return Err(CliParseError::UnexpectedArgument(arg.to_string()));
            }
            CliCommand::History(command)
        }
        other => return Err(CliParseError::UnknownSubcommand(other.to_string())),
    };

    Ok(CliInvocation::Command(command))
}

/// `<dirName>/<fileName>`; `.jsonl` is appended to a bare session id.
fn parse_identity(value: &str) -> Result<SessionIdentity, CliParseError> {
    let Some((dir_name, file_name)) = value.split_once('/') else {
        return Err(CliParseError::InvalidSession(value.to_string()));
    };
    let file_name = if file_name.ends_with(".jsonl") {
        file_name.to_string()
    } else {
        format!("{file_name}.jsonl")
    };
    let identity = SessionIdentity::new(dir_name, file_name);
    if !identity.is_well_formed() {
        return Err(CliParseError::InvalidSession(value.to_string()));
    }
    Ok(identity)
}

#[derive(Debug, Error)]
pub enum CliRunError {
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Branch(#[from] BranchError),

    #[error(transparent)]
    LogStore(#[from] LogStoreError),

    #[error(transparent)]
    Watch(#[from] WatchSessionLogError),

    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("history is empty\nHint: run `ccdeck history visit <session>` first.")]
    EmptyHistory,
}

pub fn run(command: CliCommand, config: &CoreConfig) -> Result<(), CliRunError> {
    let stdout = io::stdout();
    let mut out = io::BufWriter::new(stdout.lock());
    let stderr = io::stderr();
    let mut err = io::BufWriter::new(stderr.lock());
    let manager = BranchManager::new(config);

    match command {
        CliCommand::Sessions { dir_name, limit } => {
            for identity in manager.logs().list_sessions(&dir_name)?.into_iter().take(limit) {
                if !write_line(&mut out, &identity.to_string())? {
                    return Ok(());
                }
            }
        }
        CliCommand::Status { identity, json } => {
            let snapshot = manager.read_session(&identity)?;
            let status = derive_status_from_text(&snapshot.text);
            let line = if json {
                serde_json::to_string(&status)?
            } else {
                status_row(&status)
            };
            write_line(&mut out, &line)?;
        }
        CliCommand::Turns {
            identity,
            offset,
            limit,
            json,
        } => {
            let snapshot = manager.read_session(&identity)?;
            let parsed = parse_log(&snapshot.text);
            let turns = segment_turns(&parsed.events, snapshot.text.len());
            let view = TurnsView::from_turns(&turns);
            if json {
                write_line(&mut out, &serde_json::to_string(&view)?)?;
            } else {
                for turn in view.turns.iter().skip(offset).take(limit) {
                    let pending = turn
                        .tool_calls
                        .iter()
                        .filter(|call| call.state == ToolCallState::Pending)
                        .count();
                    let line = format!(
                        "{}\t{}\t{}\t{}\t{}",
                        turn.index,
                        turn.timestamp.as_deref().unwrap_or("-"),
                        turn.event_count,
                        pending,
                        truncate_end(turn.prompt.as_deref().unwrap_or(""), PREVIEW_WIDTH),
                    );
                    if !write_line(&mut out, &line)? {
                        return Ok(());
                    }
                }
            }
            if parsed.skipped_lines > 0 {
                write_line(&mut err, &format!("skipped lines: {}", parsed.skipped_lines))?;
            }
        }
        CliCommand::Restore {
            identity,
            turn_index,
        } => {
            let snapshot = manager.read_session(&identity)?;
            let outcome =
                manager.restore_to_turn(&identity, turn_index, Some(&snapshot.fingerprint))?;
            let branch = outcome
                .branch
                .map(|record| record.id)
                .unwrap_or_else(|| "-".to_string());
            write_line(&mut out, &format!("{identity}\t{branch}"))?;
        }
        CliCommand::Branches {
            identity,
            turn_index,
            json,
        } => {
            let branches = match turn_index {
                Some(turn_index) => manager.list_branches(&identity, turn_index)?,
                None => manager.list_all_branches(&identity)?,
            };
            if json {
                write_line(&mut out, &serde_json::to_string(&branches)?)?;
            } else {
                for branch in &branches {
                    if !write_line(&mut out, &branch_row(branch))? {
                        return Ok(());
                    }
                }
            }
        }
        CliCommand::Materialize {
            identity,
            branch_id,
            through_turn,
        } => {
            let snapshot = manager.read_session(&identity)?;
            let outcome = manager.materialize_branch(
                &identity,
                &branch_id,
                through_turn,
                Some(&snapshot.fingerprint),
            )?;
            write_line(&mut out, &identity.to_string())?;
            for record in &outcome.archived {
                write_line(&mut err, &format!("archived: {}", branch_row(record)))?;
            }
        }
        CliCommand::Duplicate {
            identity,
            turn_index,
        } => {
            let created = manager.duplicate_session(&identity, turn_index)?;
            write_line(&mut out, &created.to_string())?;
        }
        CliCommand::Apply => {
            let mut raw = String::new();
            io::stdin().read_to_string(&mut raw)?;
            let request: MutationRequest = serde_json::from_str(&raw)?;
            let response = dispatch(&manager, request);
            write_line(&mut out, &serde_json::to_string(&response)?)?;
        }
        CliCommand::Watch { identity } => {
            out.flush()?;
            return watch_status(&manager, &identity, &mut out, &mut err);
        }
        CliCommand::History(command) => {
            let mut history = PersistentHistory::load(&config.state_dir, config.history_capacity);
            match command {
                HistoryCommand::Visit(identity) => {
                    history.push(identity);
                }
                HistoryCommand::Back => {
                    let target = history.go_back().ok_or(CliRunError::EmptyHistory)?;
                    write_line(&mut out, &target.to_string())?;
                    return Ok(out.flush()?);
                }
                HistoryCommand::Forward => {
                    let target = history.go_forward().ok_or(CliRunError::EmptyHistory)?;
                    write_line(&mut out, &target.to_string())?;
                    return Ok(out.flush()?);
                }
                HistoryCommand::Commit => {
                    history.commit_navigation();
                }
                HistoryCommand::List => {}
            }
            let stack = history.stack();
            for (index, identity) in stack.entries().iter().enumerate() {
                let marker = if stack.is_navigating() && index == stack.cursor() {
                    "*"
                } else {
                    " "
                };
                if !write_line(&mut out, &format!("{index}\t{marker}\t{identity}"))? {
                    return Ok(());
                }
            }
        }
    }

    out.flush()?;
    err.flush()?;
    Ok(())
}

/// Prints a status row now and after every change that alters it. Runs until interrupted.
fn watch_status(
    manager: &BranchManager,
    identity: &SessionIdentity,
    out: &mut impl Write,
    err: &mut impl Write,
) -> Result<(), CliRunError> {
    let path = manager.logs().path_for(identity)?;
    let watcher = watch_session_log(&path)?;

    let mut last: Option<SessionStatus> = None;
    if !refresh_status(manager, identity, &mut last, out)? {
        return Ok(());
    }
    loop {
        match watcher.recv_timeout(WATCH_POLL) {
            Some(WatchSignal::Changed) => {
                if let Some(WatchSignal::Error(message)) = watcher.drain() {
                    tracing::warn!(session = %identity, error = %message, "watch error");
                }
                if !refresh_status(manager, identity, &mut last, out)? {
                    return Ok(());
                }
            }
            Some(WatchSignal::Error(message)) => {
                if !write_line(err, &format!("watch error: {message}"))? {
                    return Ok(());
                }
                err.flush()?;
            }
            None => {}
        }
    }
}

/// Re-derives status from the log tail; prints only when it differs from `last`.
fn refresh_status(
    manager: &BranchManager,
    identity: &SessionIdentity,
    last: &mut Option<SessionStatus>,
    out: &mut impl Write,
) -> Result<bool, CliRunError> {
    let text = match manager.logs().read_log(identity) {
        Ok(text) => text,
        Err(LogStoreError::NotFound(_)) => String::new(),
        Err(error) => return Err(error.into()),
    };
    let status = derive_status(&parse_log(tail_window(&text, WATCH_TAIL_BYTES)).events);
    if last.as_ref() == Some(&status) {
        return Ok(true);
    }
    let keep_going = write_line(out, &status_row(&status))?;
    out.flush()?;
    *last = Some(status);
    Ok(keep_going)
}

fn status_row(status: &SessionStatus) -> String {
    format!(
        "{}\t{}\t{}",
        status.status.label(),
        status.tool_name.as_deref().unwrap_or("-"),
        status.pending_queue
    )
}

fn branch_row(branch: &BranchRecord) -> String {
    format!(
        "{}\t{}\t{}\t{}\t{}\t{}\t{}",
        branch.id,
        branch.turn_index,
        branch.created_at,
        branch.origin.label(),
        branch.turn_count,
        branch.byte_len,
        truncate_end(branch.preview.as_deref().unwrap_or(""), PREVIEW_WIDTH),
    )
}

fn truncate_end(text: &str, width: usize) -> String {
    let line = text.lines().next().unwrap_or("");
    if line.chars().count() <= width {
        return line.to_string();
    }
    let mut out: String = line.chars().take(width.saturating_sub(1)).collect();
    out.push('…');
    out
}

fn write_line(out: &mut (impl Write + ?Sized), line: &str) -> io::Result<bool> {
    match writeln!(out, "{line}") {
        Ok(()) => Ok(true),
        Err(error) if error.kind() == io::ErrorKind::BrokenPipe => Ok(false),
        Err(error) => Err(error),
    }
}

fn parse_usize_flag(flag: &str, value: &str) -> Result<usize, CliParseError> {
    value
        .parse::<usize>()
        .map_err(|_| CliParseError::InvalidFlagValue {
            flag: flag.to_string(),
            value: value.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| (*v).to_string()).collect()
    }

    fn id(file: &str) -> SessionIdentity {
        SessionIdentity::new("-home-me-app", file)
    }

    #[test]
    fn no_args_prints_help() {
        let parsed = parse_invocation(&args(&["ccdeck"])).expect("parse");
        assert_eq!(parsed, CliInvocation::PrintHelp);
    }

    #[test]
    fn help_flag_wins() {
        let parsed = parse_invocation(&args(&["ccdeck", "restore", "--help"])).expect("parse");
        assert_eq!(parsed, CliInvocation::PrintHelp);
    }

    #[test]
    fn parses_status_with_bare_session_id() {
        let parsed =
            parse_invocation(&args(&["ccdeck", "status", "-home-me-app/abc", "--json"]))
                .expect("parse");
        assert_eq!(
            parsed,
            CliInvocation::Command(CliCommand::Status {
                identity: id("abc.jsonl"),
                json: true,
            })
        );
    }

    #[test]
    fn parses_restore_positionals() {
        let parsed = parse_invocation(&args(&["ccdeck", "restore", "-home-me-app/s.jsonl", "3"]))
            .expect("parse");
        assert_eq!(
            parsed,
            CliInvocation::Command(CliCommand::Restore {
                identity: id("s.jsonl"),
                turn_index: 3,
            })
        );

        let error = parse_invocation(&args(&["ccdeck", "restore", "-home-me-app/s.jsonl"]))
            .expect_err("missing turn");
        assert!(matches!(error, CliParseError::MissingArgument("turn")));
    }

    #[test]
    fn parses_materialize_with_through() {
        let parsed = parse_invocation(&args(&[
            "ccdeck",
            "materialize",
            "-home-me-app/s",
            "0190-b",
            "--through",
            "4",
        ]))
        .expect("parse");
        assert_eq!(
            parsed,
            CliInvocation::Command(CliCommand::Materialize {
                identity: id("s.jsonl"),
                branch_id: "0190-b".to_string(),
                through_turn: Some(4),
            })
        );
    }

    #[test]
    fn parses_branches_and_duplicate_flags() {
        let parsed = parse_invocation(&args(&["ccdeck", "branches", "-home-me-app/s", "-t", "2"]))
            .expect("parse");
        assert_eq!(
            parsed,
            CliInvocation::Command(CliCommand::Branches {
                identity: id("s.jsonl"),
                turn_index: Some(2),
                json: false,
            })
        );

        let parsed =
            parse_invocation(&args(&["ccdeck", "duplicate", "-home-me-app/s"])).expect("parse");
        assert_eq!(
            parsed,
            CliInvocation::Command(CliCommand::Duplicate {
                identity: id("s.jsonl"),
                turn_index: None,
            })
        );
    }

    #[test]
    fn parses_history_actions() {
        let parsed = parse_invocation(&args(&["ccdeck", "history"])).expect("parse");
        assert_eq!(
            parsed,
            CliInvocation::Command(CliCommand::History(HistoryCommand::List))
        );
        let parsed = parse_invocation(&args(&["ccdeck", "history", "visit", "-home-me-app/s"]))
            .expect("parse");
        assert_eq!(
            parsed,
            CliInvocation::Command(CliCommand::History(HistoryCommand::Visit(id("s.jsonl"))))
        );
        assert!(parse_invocation(&args(&["ccdeck", "history", "sideways"])).is_err());
    }

    #[test]
    fn rejects_bad_sessions_and_flags() {
        assert!(matches!(
            parse_invocation(&args(&["ccdeck", "status", "no-slash"])),
            Err(CliParseError::InvalidSession(_))
        ));
        assert!(matches!(
            parse_invocation(&args(&["ccdeck", "status", "../etc"])),
            Err(CliParseError::InvalidSession(_))
        ));
        assert!(matches!(
            parse_invocation(&args(&["ccdeck", "turns", "p/s", "--limit", "x"])),
            Err(CliParseError::InvalidFlagValue { .. })
        ));
        assert!(matches!(
            parse_invocation(&args(&["ccdeck", "frobnicate"])),
            Err(CliParseError::UnknownSubcommand(_))
        ));
    }

    #[test]
    fn truncates_to_first_line() {
        assert_eq!(truncate_end("hello\nworld", 10), "hello");
        assert_eq!(truncate_end("abcdef", 4), "abc…");
        assert_eq!(truncate_end("", 4), "");
    }
}
