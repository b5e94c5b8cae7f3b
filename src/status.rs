//! Per-kind status vocabularies and classification.
//!
//! Every job kind reports its progress with its own set of non-terminal
//! statuses, while the terminal set is always drawn from
//! `FINISHED`, `FAILED` and `STOPPED`. Remote status strings are parsed
//! into typed enums with an explicit parse-or-fail step; an unrecognized
//! string is a [`TrackerError::UnknownStatus`], never coerced.
//!
//! # State Machine
//!
//! ```text
//! ACTIVE(non-terminal) ──poll──> ACTIVE(non-terminal)
//!        │
//!        └──poll──> FINISHED | FAILED | STOPPED   (absorbing)
//! ```

use serde::{Serialize, Serializer};
use std::fmt;
use std::hash::Hash;

use crate::error::{Result, TrackerError};
use crate::task::TaskKind;

/// The terminal outcomes shared by every kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TerminalStatus {
    Finished,
    Failed,
    Stopped,
}

/// A kind-specific job status.
pub trait JobStatus:
    Copy + Eq + Hash + fmt::Debug + fmt::Display + Serialize + Send + Sync + 'static
{
    /// Every value of the vocabulary.
    fn all() -> &'static [Self];

    /// Status a freshly submitted job is assumed to be in.
    fn initial() -> Self;

    /// Upper-case wire name.
    fn as_str(&self) -> &'static str;

    /// The terminal outcome, or `None` while the job is still active.
    fn terminal(&self) -> Option<TerminalStatus>;

    /// True iff the status is FINISHED, FAILED or STOPPED.
    fn is_finalized(&self) -> bool {
        self.terminal().is_some()
    }

    /// True iff the status is FINISHED.
    fn is_succeeded(&self) -> bool {
        self.terminal() == Some(TerminalStatus::Finished)
    }

    /// Parse a remote status string for `kind`.
    ///
    /// Case and surrounding whitespace are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`TrackerError::UnknownStatus`] if the string is not part of
    /// the vocabulary.
    fn parse(kind: TaskKind, raw: &str) -> Result<Self> {
        let normalized = raw.trim().to_ascii_uppercase();
        Self::all()
            .iter()
            .copied()
            .find(|status| status.as_str() == normalized)
            .ok_or_else(|| TrackerError::unknown_status(kind, raw))
    }
}

macro_rules! job_status {
    (
        $(#[$meta:meta])*
        $name:ident {
            initial: $initial:ident,
            active: [$($active:ident => $active_str:literal),* $(,)?],
            terminal: [$($terminal:ident => $terminal_str:literal),* $(,)?] $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $($active,)*
            $($terminal,)*
        }

        impl JobStatus for $name {
            fn all() -> &'static [Self] {
                &[$(Self::$active,)* $(Self::$terminal,)*]
            }

            fn initial() -> Self {
                Self::$initial
            }

            fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$active => $active_str,)*
                    $(Self::$terminal => $terminal_str,)*
                }
            }

            fn terminal(&self) -> Option<TerminalStatus> {
                match self {
                    $(Self::$terminal => Some(TerminalStatus::$terminal),)*
                    #[allow(unreachable_patterns)]
                    _ => None,
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
                serializer.serialize_str(self.as_str())
            }
        }
    };
}

job_status! {
    /// Candidate SQL generation progress.
    AskStatus {
        initial: Understanding,
        active: [
            Understanding => "UNDERSTANDING",
            Searching => "SEARCHING",
            Planning => "PLANNING",
            Generating => "GENERATING",
            Correcting => "CORRECTING",
        ],
        terminal: [Finished => "FINISHED", Failed => "FAILED", Stopped => "STOPPED"],
    }
}

job_status! {
    /// SQL breakdown progress.
    AskDetailStatus {
        initial: Understanding,
        active: [
            Understanding => "UNDERSTANDING",
            Searching => "SEARCHING",
            Generating => "GENERATING",
        ],
        terminal: [Finished => "FINISHED", Failed => "FAILED", Stopped => "STOPPED"],
    }
}

job_status! {
    /// SQL explanation progress. Explanations cannot be stopped.
    ExplainStatus {
        initial: Understanding,
        active: [Understanding => "UNDERSTANDING", Generating => "GENERATING"],
        terminal: [Finished => "FINISHED", Failed => "FAILED"],
    }
}

job_status! {
    /// Chart generation and chart adjustment progress.
    ChartStatus {
        initial: Fetching,
        active: [Fetching => "FETCHING", Generating => "GENERATING"],
        terminal: [Finished => "FINISHED", Failed => "FAILED", Stopped => "STOPPED"],
    }
}

job_status! {
    /// Question recommendation progress.
    RecommendationStatus {
        initial: NotStarted,
        active: [NotStarted => "NOT_STARTED", Generating => "GENERATING"],
        terminal: [Finished => "FINISHED", Failed => "FAILED"],
    }
}

job_status! {
    /// SQL adjustment progress.
    AdjustmentStatus {
        initial: Understanding,
        active: [
            Understanding => "UNDERSTANDING",
            Generating => "GENERATING",
            Correcting => "CORRECTING",
        ],
        terminal: [Finished => "FINISHED", Failed => "FAILED", Stopped => "STOPPED"],
    }
}

/// Classify a raw status string for any kind without knowing its enum.
///
/// Used by start-up re-hydration, which reads statuses of every kind from a
/// single table.
///
/// # Errors
///
/// Returns [`TrackerError::UnknownStatus`] for strings outside the kind's
/// vocabulary.
pub fn is_finalized_raw(kind: TaskKind, raw: &str) -> Result<bool> {
    Ok(match kind {
        TaskKind::Ask => AskStatus::parse(kind, raw)?.is_finalized(),
        TaskKind::AskDetail => AskDetailStatus::parse(kind, raw)?.is_finalized(),
        TaskKind::Explain => ExplainStatus::parse(kind, raw)?.is_finalized(),
        TaskKind::Chart | TaskKind::ChartAdjustment => ChartStatus::parse(kind, raw)?.is_finalized(),
        TaskKind::RecommendQuestions => RecommendationStatus::parse(kind, raw)?.is_finalized(),
        TaskKind::Adjustment => AdjustmentStatus::parse(kind, raw)?.is_finalized(),
    })
}
