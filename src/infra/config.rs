use crate::domain::DEFAULT_HISTORY_CAPACITY;
use dirs::home_dir;
use std::ffi::OsString;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CoreConfig {
    /// Root of session scopes: `<projects_dir>/<dirName>/<fileName>`.
    pub projects_dir: PathBuf,
    /// Branch arena and client history live here.
    pub state_dir: PathBuf,
    pub history_capacity: usize,
}

#[derive(Debug, Error)]
pub enum ResolveConfigError {
    #[error("home directory not found")]
    HomeDirNotFound,

    #[error("invalid value for {var}: {value}")]
    InvalidValue { var: &'static str, value: String },
}

impl CoreConfig {
    pub fn new(projects_dir: impl Into<PathBuf>, state_dir: impl Into<PathBuf>) -> Self {
        Self {
            projects_dir: projects_dir.into(),
            state_dir: state_dir.into(),
            history_capacity: DEFAULT_HISTORY_CAPACITY,
        }
    }

    /// Env overrides first, then `~/.claude/projects` and `~/.ccdeck`.
    pub fn resolve() -> Result<Self, ResolveConfigError> {
        Self::resolve_with(|name| std::env::var_os(name), home_dir)
    }

    fn resolve_with(
        var: impl Fn(&str) -> Option<OsString>,
        home: impl Fn() -> Option<PathBuf>,
    ) -> Result<Self, ResolveConfigError> {
        let projects_dir = match var("CLAUDE_PROJECTS_DIR") {
            Some(dir) => PathBuf::from(dir),
            None => home()
                .ok_or(ResolveConfigError::HomeDirNotFound)?
                .join(".claude")
                .join("projects"),
        };

        let state_dir = match var("CCDECK_STATE_DIR") {
            Some(dir) => PathBuf::from(dir),
            None => home()
                .ok_or(ResolveConfigError::HomeDirNotFound)?
                .join(".ccdeck"),
        };

        let history_capacity = match var("CCDECK_HISTORY_CAPACITY") {
            Some(raw) => {
                let text = raw.to_string_lossy().to_string();
                match text.trim().parse::<usize>() {
                    Ok(value) if value > 0 => value,
                    _ => {
                        return Err(ResolveConfigError::InvalidValue {
                            var: "CCDECK_HISTORY_CAPACITY",
                            value: text,
                        });
                    }
                }
            }
            None => DEFAULT_HISTORY_CAPACITY,
        };

        Ok(Self {
            projects_dir,
            state_dir,
            history_capacity,
        })
    }

    pub fn branches_dir(&self) -> PathBuf {
        self.state_dir.join("branches")
    }
}
