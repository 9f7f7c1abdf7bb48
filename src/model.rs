use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    Created,
    Deleted,
    Moved,
    DataChanged,
    TitleChanged,
    ProtectionChanged,
}

impl ChangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeType::Created => "created",
            ChangeType::Deleted => "deleted",
            ChangeType::Moved => "moved",
            ChangeType::DataChanged => "data_changed",
            ChangeType::TitleChanged => "title_changed",
            ChangeType::ProtectionChanged => "protection_changed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "created" => Some(ChangeType::Created),
            "deleted" => Some(ChangeType::Deleted),
            "moved" => Some(ChangeType::Moved),
            "data_changed" => Some(ChangeType::DataChanged),
            "title_changed" => Some(ChangeType::TitleChanged),
            "protection_changed" => Some(ChangeType::ProtectionChanged),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum EntryType {
    Category,
    Event,
    Contribution,
    Subcontribution,
    Session,
}

impl EntryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryType::Category => "category",
            EntryType::Event => "event",
            EntryType::Contribution => "contribution",
            EntryType::Subcontribution => "subcontribution",
            EntryType::Session => "session",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "category" => Some(EntryType::Category),
            "event" => Some(EntryType::Event),
            "contribution" => Some(EntryType::Contribution),
            "subcontribution" => Some(EntryType::Subcontribution),
            "session" => Some(EntryType::Session),
            _ => None,
        }
    }

    /// MARC collection name used in datafield 980.
    pub fn collection(&self) -> &'static str {
        match self {
            EntryType::Category => "CATEGORIES",
            EntryType::Event => "EVENTS",
            EntryType::Contribution => "CONTRIBUTIONS",
            EntryType::Subcontribution => "SUBCONTRIBUTIONS",
            EntryType::Session => "SESSIONS",
        }
    }
}

/// Reference to a catalog object. Each variant carries exactly the ids needed
/// to locate the object.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ObjectRef {
    Category {
        category_id: i64,
    },
    Event {
        event_id: i64,
    },
    Contribution {
        event_id: i64,
        contrib_id: i64,
    },
    Subcontribution {
        event_id: i64,
        contrib_id: i64,
        subcontrib_id: i64,
    },
    Session {
        event_id: i64,
        session_id: i64,
    },
}

/// Flat id columns as stored in `queue_entries` and `objects`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefColumns {
    pub category_id: Option<i64>,
    pub event_id: Option<i64>,
    pub contrib_id: Option<i64>,
    pub subcontrib_id: Option<i64>,
    pub session_id: Option<i64>,
}

impl ObjectRef {
    pub fn entry_type(&self) -> EntryType {
        match self {
            ObjectRef::Category { .. } => EntryType::Category,
            ObjectRef::Event { .. } => EntryType::Event,
            ObjectRef::Contribution { .. } => EntryType::Contribution,
            ObjectRef::Subcontribution { .. } => EntryType::Subcontribution,
            ObjectRef::Session { .. } => EntryType::Session,
        }
    }

    /// Build a reference from a type and the flat id columns. Returns `None`
    /// when an id required by the type is missing.
    pub fn from_parts(kind: EntryType, cols: RefColumns) -> Option<Self> {
        Some(match kind {
            EntryType::Category => ObjectRef::Category {
                category_id: cols.category_id?,
            },
            EntryType::Event => ObjectRef::Event {
                event_id: cols.event_id?,
            },
            EntryType::Contribution => ObjectRef::Contribution {
                event_id: cols.event_id?,
                contrib_id: cols.contrib_id?,
            },
            EntryType::Subcontribution => ObjectRef::Subcontribution {
                event_id: cols.event_id?,
                contrib_id: cols.contrib_id?,
                subcontrib_id: cols.subcontrib_id?,
            },
            EntryType::Session => ObjectRef::Session {
                event_id: cols.event_id?,
                session_id: cols.session_id?,
            },
        })
    }

    /// Build a reference from a type and positional ids, as typed on the CLI
    /// (`event 4`, `contribution 4 2`).
    pub fn from_ids(kind: EntryType, ids: &[i64]) -> Option<Self> {
        let cols = match (kind, ids) {
            (EntryType::Category, [c]) => RefColumns {
                category_id: Some(*c),
                ..Default::default()
            },
            (EntryType::Event, [e]) => RefColumns {
                event_id: Some(*e),
                ..Default::default()
            },
            (EntryType::Contribution, [e, c]) => RefColumns {
                event_id: Some(*e),
                contrib_id: Some(*c),
                ..Default::default()
            },
            (EntryType::Subcontribution, [e, c, sc]) => RefColumns {
                event_id: Some(*e),
                contrib_id: Some(*c),
                subcontrib_id: Some(*sc),
                ..Default::default()
            },
            (EntryType::Session, [e, s]) => RefColumns {
                event_id: Some(*e),
                session_id: Some(*s),
                ..Default::default()
            },
            _ => return None,
        };
        Self::from_parts(kind, cols)
    }

    pub fn columns(&self) -> RefColumns {
        let mut cols = RefColumns::default();
        match *self {
            ObjectRef::Category { category_id } => cols.category_id = Some(category_id),
            ObjectRef::Event { event_id } => cols.event_id = Some(event_id),
            ObjectRef::Contribution {
                event_id,
                contrib_id,
            } => {
                cols.event_id = Some(event_id);
                cols.contrib_id = Some(contrib_id);
            }
            ObjectRef::Subcontribution {
                event_id,
                contrib_id,
                subcontrib_id,
            } => {
                cols.event_id = Some(event_id);
                cols.contrib_id = Some(contrib_id);
                cols.subcontrib_id = Some(subcontrib_id);
            }
            ObjectRef::Session {
                event_id,
                session_id,
            } => {
                cols.event_id = Some(event_id);
                cols.session_id = Some(session_id);
            }
        }
        cols
    }

    /// Stable catalog key, e.g. `contribution:4:2`.
    pub fn key(&self) -> String {
        match *self {
            ObjectRef::Category { category_id } => format!("category:{}", category_id),
            ObjectRef::Event { event_id } => format!("event:{}", event_id),
            ObjectRef::Contribution {
                event_id,
                contrib_id,
            } => format!("contribution:{}:{}", event_id, contrib_id),
            ObjectRef::Subcontribution {
                event_id,
                contrib_id,
                subcontrib_id,
            } => format!(
                "subcontribution:{}:{}:{}",
                event_id, contrib_id, subcontrib_id
            ),
            ObjectRef::Session {
                event_id,
                session_id,
            } => format!("session:{}:{}", event_id, session_id),
        }
    }

    /// Identifier the record repository knows the object by.
    pub fn repository_id(&self) -> String {
        match *self {
            ObjectRef::Category { category_id } => format!("INDICO.c{}", category_id),
            ObjectRef::Event { event_id } => format!("INDICO.{}", event_id),
            ObjectRef::Contribution {
                event_id,
                contrib_id,
            } => format!("INDICO.{}c{}", event_id, contrib_id),
            ObjectRef::Subcontribution {
                event_id,
                contrib_id,
                subcontrib_id,
            } => format!("INDICO.{}c{}sc{}", event_id, contrib_id, subcontrib_id),
            ObjectRef::Session {
                event_id,
                session_id,
            } => format!("INDICO.{}s{}", event_id, session_id),
        }
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

/// A pending change for one agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueueEntry {
    pub id: i64,
    pub agent_id: i64,
    pub created_at: DateTime<Utc>,
    pub processed: bool,
    pub change: ChangeType,
    pub object_ref: ObjectRef,
}

/// Catalog object as exported to the repository.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LiveObject {
    #[serde(flatten)]
    pub object_ref: ObjectRef,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub start_dt: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_dt: Option<DateTime<Utc>>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Debug,
    Marcxml,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Debug => "debug",
            BackendKind::Marcxml => "marcxml",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "debug" => Some(BackendKind::Debug),
            "marcxml" => Some(BackendKind::Marcxml),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: i64,
    pub name: String,
    pub backend: BackendKind,
    pub initial_data_exported: bool,
    pub last_run_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_ids_requires_all_ids_for_type() {
        assert_eq!(
            ObjectRef::from_ids(EntryType::Contribution, &[4, 2]),
            Some(ObjectRef::Contribution {
                event_id: 4,
                contrib_id: 2
            })
        );
        assert!(ObjectRef::from_ids(EntryType::Contribution, &[4]).is_none());
        assert!(ObjectRef::from_ids(EntryType::Event, &[]).is_none());
    }

    #[test]
    fn columns_round_trip_through_from_parts() {
        let r = ObjectRef::Subcontribution {
            event_id: 1,
            contrib_id: 2,
            subcontrib_id: 3,
        };
        assert_eq!(ObjectRef::from_parts(r.entry_type(), r.columns()), Some(r));
    }

    #[test]
    fn repository_ids() {
        assert_eq!(ObjectRef::Event { event_id: 42 }.repository_id(), "INDICO.42");
        assert_eq!(
            ObjectRef::Session {
                event_id: 42,
                session_id: 3
            }
            .repository_id(),
            "INDICO.42s3"
        );
        assert_eq!(
            ObjectRef::Category { category_id: 7 }.repository_id(),
            "INDICO.c7"
        );
    }

    #[test]
    fn change_type_parse_matches_as_str() {
        for c in [
            ChangeType::Created,
            ChangeType::Deleted,
            ChangeType::Moved,
            ChangeType::DataChanged,
            ChangeType::TitleChanged,
            ChangeType::ProtectionChanged,
        ] {
            assert_eq!(ChangeType::parse(c.as_str()), Some(c));
        }
        assert!(ChangeType::parse("renamed").is_none());
    }
}
