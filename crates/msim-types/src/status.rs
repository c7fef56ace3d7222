//! Model run status shared by every coordinator role and every sub-value.
//!
//! ```text
//! undefined → init → { progress ⇄ wait } → { done | exit | error }
//! ```
//!
//! `shutdown` is a driver-only pseudo-state: "no more work, stop polling".
//! It is not terminal, but the driver treats it like one.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Modeling status, totally ordered by severity.
///
/// Discriminants leave a gap between `shutdown` and `done` so that every
/// terminal status compares greater than every live one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ModelStatus {
    Undefined = 0,
    Init = 1,
    Progress = 2,
    /// Run in progress under external supervision.
    Wait = 3,
    Shutdown = 4,
    Done = 64,
    /// Exit and not completed.
    Exit = 65,
    Error = 128,
}

impl ModelStatus {
    /// `true` for `done`, `exit` and `error`: the status can never change again.
    pub fn is_exit(self) -> bool {
        self >= Self::Done
    }

    pub fn is_error(self) -> bool {
        self == Self::Error
    }

    /// `true` if there is no more work: terminal, or the `shutdown` pseudo-state.
    pub fn is_shutdown_or_exit(self) -> bool {
        self == Self::Shutdown || self.is_exit()
    }
}

impl Default for ModelStatus {
    fn default() -> Self {
        Self::Undefined
    }
}

impl fmt::Display for ModelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Undefined => write!(f, "undefined"),
            Self::Init      => write!(f, "init"),
            Self::Progress  => write!(f, "progress"),
            Self::Wait      => write!(f, "wait"),
            Self::Shutdown  => write!(f, "shutdown"),
            Self::Done      => write!(f, "done"),
            Self::Exit      => write!(f, "exit"),
            Self::Error     => write!(f, "error"),
        }
    }
}

// ── Persisted codes ───────────────────────────────────────────────────────────

/// Single-letter run status stored in run and task-run records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RunStatusCode {
    Init,
    Progress,
    Wait,
    Done,
    Exit,
    Error,
}

impl RunStatusCode {
    pub fn as_char(self) -> char {
        match self {
            Self::Init     => 'i',
            Self::Progress => 'p',
            Self::Wait     => 'w',
            Self::Done     => 's',
            Self::Exit     => 'x',
            Self::Error    => 'e',
        }
    }

    pub fn from_char(c: char) -> Option<Self> {
        match c {
            'i' => Some(Self::Init),
            'p' => Some(Self::Progress),
            'w' => Some(Self::Wait),
            's' => Some(Self::Done),
            'x' => Some(Self::Exit),
            'e' => Some(Self::Error),
            _ => None,
        }
    }

    pub fn is_final(self) -> bool {
        matches!(self, Self::Done | Self::Exit | Self::Error)
    }
}

impl From<ModelStatus> for RunStatusCode {
    /// `undefined` and `init` persist as init; `shutdown` is still in progress.
    fn from(status: ModelStatus) -> Self {
        match status {
            ModelStatus::Undefined | ModelStatus::Init => Self::Init,
            ModelStatus::Progress | ModelStatus::Shutdown => Self::Progress,
            ModelStatus::Wait => Self::Wait,
            ModelStatus::Done => Self::Done,
            ModelStatus::Exit => Self::Exit,
            ModelStatus::Error => Self::Error,
        }
    }
}

impl fmt::Display for RunStatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_char())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_order() {
        let ordered = [
            ModelStatus::Undefined,
            ModelStatus::Init,
            ModelStatus::Progress,
            ModelStatus::Wait,
            ModelStatus::Shutdown,
            ModelStatus::Done,
            ModelStatus::Exit,
            ModelStatus::Error,
        ];
        for pair in ordered.windows(2) {
            assert!(pair[0] < pair[1], "{} should sort before {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn exit_predicates() {
        assert!(!ModelStatus::Wait.is_exit());
        assert!(!ModelStatus::Shutdown.is_exit());
        assert!(ModelStatus::Done.is_exit());
        assert!(ModelStatus::Exit.is_exit());
        assert!(ModelStatus::Error.is_exit());

        assert!(ModelStatus::Error.is_error());
        assert!(!ModelStatus::Exit.is_error());

        assert!(ModelStatus::Shutdown.is_shutdown_or_exit());
        assert!(ModelStatus::Done.is_shutdown_or_exit());
        assert!(!ModelStatus::Progress.is_shutdown_or_exit());
    }

    #[test]
    fn persisted_codes() {
        assert_eq!(RunStatusCode::from(ModelStatus::Done).as_char(), 's');
        assert_eq!(RunStatusCode::from(ModelStatus::Shutdown), RunStatusCode::Progress);
        assert_eq!(RunStatusCode::from_char('w'), Some(RunStatusCode::Wait));
        assert_eq!(RunStatusCode::from_char('z'), None);
        assert!(RunStatusCode::Error.is_final());
        assert!(!RunStatusCode::Wait.is_final());
    }
}
