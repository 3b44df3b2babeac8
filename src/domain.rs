use std::fmt;
use std::str::FromStr;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::error::ObisError;

/// Dataset code / perm id as issued by OpenBIS, e.g. `20250807085639331-1331542`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DatasetCode(String);

impl DatasetCode {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DatasetCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for DatasetCode {
    type Err = ObisError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_uppercase();
        let is_valid = !normalized.is_empty()
            && normalized
                .chars()
                .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.'));
        if !is_valid {
            return Err(ObisError::InvalidDatasetCode(value.to_string()));
        }
        Ok(Self(normalized))
    }
}

/// Experiment-level container path, `/SPACE/PROJECT/COLLECTION`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CollectionPath(String);

impl CollectionPath {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn space(&self) -> &str {
        self.0.trim_start_matches('/').split('/').next().unwrap_or("")
    }
}

impl fmt::Display for CollectionPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for CollectionPath {
    type Err = ObisError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_uppercase();
        let segments = normalized
            .strip_prefix('/')
            .map(|rest| rest.split('/').collect::<Vec<_>>())
            .unwrap_or_default();
        let is_valid = segments.len() == 3
            && segments.iter().all(|segment| {
                !segment.is_empty()
                    && segment
                        .chars()
                        .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.'))
            });
        if !is_valid {
            return Err(ObisError::InvalidCollectionPath(value.to_string()));
        }
        Ok(Self(normalized))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelationKind {
    Children,
    Parents,
}

impl RelationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelationKind::Children => "children",
            RelationKind::Parents => "parents",
        }
    }
}

impl fmt::Display for RelationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RelationKind {
    type Err = ObisError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "children" => Ok(RelationKind::Children),
            "parents" => Ok(RelationKind::Parents),
            _ => Err(ObisError::InvalidRelationKind(value.to_string())),
        }
    }
}

/// One related dataset, normalized at the client boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationshipRecord {
    pub code: String,
    #[serde(rename = "type")]
    pub dataset_type: String,
    pub name: Option<String>,
    pub registration_date: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchTarget {
    Experiments,
    Samples,
    Datasets,
    All,
}

impl SearchTarget {
    pub fn includes(&self, other: SearchTarget) -> bool {
        *self == SearchTarget::All || *self == other
    }
}
