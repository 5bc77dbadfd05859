use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Which layer of a composite dataset a query should consult.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text")]
pub enum SpaceContext {
    Default,
    Extension,
    Super,
}

impl fmt::Display for SpaceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Default => "DEFAULT",
            Self::Extension => "EXTENSION",
            Self::Super => "SUPER",
        };
        f.write_str(s)
    }
}

impl FromStr for SpaceContext {
    type Err = SpaceContextParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DEFAULT" => Ok(Self::Default),
            "EXTENSION" => Ok(Self::Extension),
            "SUPER" => Ok(Self::Super),
            other => Err(SpaceContextParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`SpaceContext`] string.
#[derive(Debug, Clone)]
pub struct SpaceContextParseError(pub String);

impl fmt::Display for SpaceContextParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid space context: {:?}", self.0)
    }
}

impl std::error::Error for SpaceContextParseError {}

// ---------------------------------------------------------------------------

/// Tile-id encoding scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text")]
pub enum QuadType {
    HereQuad,
    MercatorQuad,
}

impl fmt::Display for QuadType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::HereQuad => "HERE_QUAD",
            Self::MercatorQuad => "MERCATOR_QUAD",
        };
        f.write_str(s)
    }
}

impl FromStr for QuadType {
    type Err = QuadTypeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "HERE_QUAD" => Ok(Self::HereQuad),
            "MERCATOR_QUAD" => Ok(Self::MercatorQuad),
            other => Err(QuadTypeParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`QuadType`] string.
#[derive(Debug, Clone)]
pub struct QuadTypeParseError(pub String);

impl fmt::Display for QuadTypeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid quad type: {:?}", self.0)
    }
}

impl std::error::Error for QuadTypeParseError {}

// ---------------------------------------------------------------------------

/// A reference to a dataset version: concrete, symbolic, named, or a range.
///
/// Invariant: after the engine's `prepare` step runs, only [`Self::Concrete`]
/// and [`Self::Range`] remain in play; [`Self::Head`] and [`Self::Tag`] are
/// resolved away by consulting the feature-store statistics/tag services.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionRef {
    Concrete(i64),
    Head,
    Tag(String),
    Range { start: i64, end: i64 },
}

impl VersionRef {
    /// True if this reference already carries only integers and needs no
    /// further resolution against the tag/statistics services.
    pub fn is_resolved(&self) -> bool {
        matches!(self, Self::Concrete(_) | Self::Range { .. })
    }
}

impl fmt::Display for VersionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Concrete(v) => write!(f, "{v}"),
            Self::Head => f.write_str("HEAD"),
            Self::Tag(name) => write!(f, "tag:{name}"),
            Self::Range { start, end } => write!(f, "[{start},{end})"),
        }
    }
}

// ---------------------------------------------------------------------------
// Row structs
// ---------------------------------------------------------------------------

/// One row of a step's task table.
///
/// Column layout is bit-stable (see the external-interfaces contract) so
/// that a step table written by one version of this engine can be resumed
/// by another.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TaskItem {
    pub task_id: i32,
    pub task_data: serde_json::Value,
    pub bytes_uploaded: i64,
    pub rows_uploaded: i64,
    pub files_uploaded: i32,
    pub started: bool,
    pub finalized: bool,
}

/// Read-model returned by `pick_next_and_report`, derived from the task
/// table in a single atomic query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskProgress {
    pub total: i64,
    pub started: i64,
    pub finalized: i64,
    pub next_task_id: Option<i32>,
    pub next_task_data: Option<serde_json::Value>,
}

impl TaskProgress {
    /// `finalizedTasks / totalTasks`, `0.0` when there are no tasks at all.
    pub fn progress_fraction(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.finalized as f64 / self.total as f64
        }
    }

    /// Every row is finalized and no unstarted row remains.
    pub fn is_complete(&self) -> bool {
        self.next_task_id.is_none() && self.finalized == self.total
    }
}

/// Aggregated statistics across every row of a task table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AggregateStats {
    pub rows_uploaded: i64,
    pub bytes_uploaded: i64,
    pub files_uploaded: i64,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
