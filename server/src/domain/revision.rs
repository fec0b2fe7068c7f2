//! Revision history model

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::container::{ContainerId, ContainerRef};

/// Position of a revision in an environment's history, starting at 1
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Version(pub u64);

impl Version {
    pub fn next(self) -> Self {
        Version(self.0 + 1)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One committed point in an environment's history
#[derive(Debug, Clone, Serialize)]
pub struct Revision {
    pub version: Version,
    pub name: String,
    pub explanation: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub output: String,
    pub created_at: DateTime<Utc>,
    /// Durable identifier of the committed container state
    pub state: ContainerId,

    #[serde(skip)]
    pub container: ContainerRef,
}

/// Persisted form of a revision, without a live container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevisionRecord {
    pub version: Version,
    pub name: String,
    pub explanation: String,
    #[serde(default)]
    pub output: String,
    pub created_at: DateTime<Utc>,
    pub state: ContainerId,
}

impl From<&Revision> for RevisionRecord {
    fn from(revision: &Revision) -> Self {
        Self {
            version: revision.version,
            name: revision.name.clone(),
            explanation: revision.explanation.clone(),
            output: revision.output.clone(),
            created_at: revision.created_at,
            state: revision.state.clone(),
        }
    }
}

impl From<RevisionRecord> for Revision {
    /// Restored revisions only hold a reference until something resolves them
    fn from(record: RevisionRecord) -> Self {
        Self {
            version: record.version,
            name: record.name,
            explanation: record.explanation,
            output: record.output,
            created_at: record.created_at,
            container: ContainerRef::Reference(record.state.clone()),
            state: record.state,
        }
    }
}

/// Append-only, strictly ordered list of revisions
#[derive(Debug, Clone, Default)]
pub struct History {
    revisions: Vec<Revision>,
}

impl History {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a history from persisted records, ordered by version
    ///
    /// Records must form a contiguous run starting at 1; anything else is
    /// rejected so the version invariant holds for every later append.
    pub fn restore(mut records: Vec<RevisionRecord>) -> Result<Self, String> {
        records.sort_by_key(|r| r.version);
        for (i, record) in records.iter().enumerate() {
            let expected = Version(i as u64 + 1);
            if record.version != expected {
                return Err(format!(
                    "persisted history is not contiguous: expected version {expected}, found {}",
                    record.version
                ));
            }
        }
        Ok(Self {
            revisions: records.into_iter().map(Revision::from).collect(),
        })
    }

    pub fn latest(&self) -> Option<&Revision> {
        self.revisions.last()
    }

    /// Version of the latest revision, 0 when empty
    pub fn latest_version(&self) -> Version {
        self.latest().map(|r| r.version).unwrap_or(Version(0))
    }

    pub fn get(&self, version: Version) -> Option<&Revision> {
        self.revisions.iter().find(|r| r.version == version)
    }

    pub fn len(&self) -> usize {
        self.revisions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.revisions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Revision> {
        self.revisions.iter()
    }

    /// Append the next revision; its version must be exactly latest + 1
    pub(crate) fn push(&mut self, revision: Revision) {
        debug_assert_eq!(revision.version, self.latest_version().next());
        self.revisions.push(revision);
    }
}
