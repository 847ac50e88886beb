use ccdeck::cli::{self, CliInvocation};
use ccdeck::infra::{CoreConfig, ResolveConfigError};
use std::io::{self, Write};
use thiserror::Error;
use tracing_subscriber::EnvFilter;

const LOG_ENV: &str = "CCDECK_LOG";

#[derive(Debug, Error)]
enum MainError {
    #[error(transparent)]
    Config(#[from] ResolveConfigError),

    #[error(transparent)]
    Cli(#[from] cli::CliRunError),
}

fn main() {
    if let Err(error) = run_main() {
        let mut err = io::stderr().lock();
        let _ = writeln!(err, "{error}");
        std::process::exit(1);
    }
}

fn run_main() -> Result<(), MainError> {
    let args = std::env::args().collect::<Vec<_>>();
    let invocation = match cli::parse_invocation(&args) {
        Ok(invocation) => invocation,
        Err(error) => {
            let mut err = io::stderr().lock();
            let _ = writeln!(err, "{error}");
            let _ = writeln!(err);
            print_help();
            std::process::exit(2);
        }
    };

    match invocation {
        CliInvocation::PrintHelp => {
            print_help();
            Ok(())
        }
        CliInvocation::PrintVersion => {
            let mut out = io::stdout().lock();
            let _ = writeln!(out, "{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        CliInvocation::Command(command) => {
            init_logging();
            let config = CoreConfig::resolve()?;
            tracing::debug!(
                projects_dir = %config.projects_dir.display(),
                state_dir = %config.state_dir.display(),
                "resolved configuration"
            );
            cli::run(command, &config)?;
            Ok(())
        }
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .init();
}

fn print_help() {
    let text = format!(
        "{name} - inspect, rewind and branch agent session logs\n\nUSAGE:\n  {name} sessions <project-dir> [--limit N]           List session logs, newest first\n  {name} status <session> [--json]                    Derive the live status\n  {name} turns <session> [--offset N] [--limit N] [--json]  List turns\n  {name} restore <session> <turn>                     Keep turns 0..=turn, archive the rest\n  {name} branches <session> [--turn N] [--json]       List archived branches\n  {name} materialize <session> <branch-id> [--through N]  Re-attach a branch\n  {name} duplicate <session> [--turn N]               Copy a session (or its prefix) to a new id\n  {name} apply                                        Run one JSON mutation request from stdin\n  {name} watch <session>                              Print status whenever the log changes\n  {name} history [list|visit <session>|back|forward|commit]  Recent-session history\n  {name} --help | --version\n\nSESSION:\n  <project-dir>/<session-id>[.jsonl], relative to the projects dir\n\nOUTPUT:\n  status:   status<TAB>tool<TAB>pending_queue\n  turns:    index<TAB>timestamp<TAB>events<TAB>pending_tools<TAB>prompt\n  branches: id<TAB>turn<TAB>created_at<TAB>origin<TAB>turns<TAB>bytes<TAB>preview\n  restore:  session<TAB>branch-id (- when nothing was removed)\n\nENV:\n  CLAUDE_PROJECTS_DIR      Override projects dir (default: ~/.claude/projects)\n  CCDECK_STATE_DIR         Override state dir for branches and history (default: ~/.ccdeck)\n  CCDECK_HISTORY_CAPACITY  Max remembered sessions (default: 50)\n  CCDECK_LOG               Log filter, e.g. info or ccdeck=debug (default: warn)\n",
        name = env!("CARGO_PKG_NAME")
    );
    let mut out = io::stdout().lock();
    let _ = write!(out, "{text}");
}
