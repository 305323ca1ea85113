use std::fmt::{Display, Formatter};
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use time::macros::format_description;
use time::{Date, OffsetDateTime};

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskCategory {
    Revenue,
    Tax,
    #[default]
    Other,
}

impl TaskCategory {
    pub const ALL: [TaskCategory; 3] = [Self::Revenue, Self::Tax, Self::Other];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Revenue => "revenue",
            Self::Tax => "tax",
            Self::Other => "other",
        }
    }
}

impl std::str::FromStr for TaskCategory {
    type Err = ();

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "revenue" => Ok(Self::Revenue),
            "tax" => Ok(Self::Tax),
            "other" => Ok(Self::Other),
            _ => Err(()),
        }
    }
}

impl Display for TaskCategory {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Criticality {
    Critical,
    High,
    #[default]
    Medium,
}

impl Criticality {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Medium => "medium",
        }
    }
}

impl std::str::FromStr for Criticality {
    type Err = ();

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "critical" => Ok(Self::Critical),
            "high" => Ok(Self::High),
            "medium" => Ok(Self::Medium),
            _ => Err(()),
        }
    }
}

impl Display for Criticality {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A reconciliation task found under the task root.
///
/// Descriptors are rebuilt on every discovery pass and never mutated in between.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct TaskDescriptor {
    pub name: String,
    pub category: TaskCategory,
    pub criticality: Criticality,
    pub entry_point: PathBuf,
    pub working_dir: PathBuf,
    pub timeout_override: Option<Duration>,
}

/// Business date a run is scoped to, rendered as `YYYY-MM-DD`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct ReferenceDate(Date);

impl ReferenceDate {
    pub fn new(date: Date) -> Self {
        Self(date)
    }

    pub fn today() -> Self {
        Self(OffsetDateTime::now_utc().date())
    }

    pub fn date(self) -> Date {
        self.0
    }
}

impl std::str::FromStr for ReferenceDate {
    type Err = time::error::Parse;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Date::parse(value.trim(), format_description!("[year]-[month]-[day]")).map(Self)
    }
}

impl Display for ReferenceDate {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:04}-{:02}-{:02}",
            self.0.year(),
            u8::from(self.0.month()),
            self.0.day()
        )
    }
}

impl Serialize for ReferenceDate {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ReferenceDate {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}
