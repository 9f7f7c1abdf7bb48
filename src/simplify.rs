//! Folding of queued changes into one net change per object.
//!
//! The repository only needs to know whether an object appeared, changed or
//! disappeared, so a batch with five edits to the same event is uploaded as a
//! single record.

use std::collections::HashMap;

use crate::model::{ChangeType, ObjectRef, QueueEntry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimpleChange {
    Created,
    Updated,
    Deleted,
}

#[derive(Debug, Default, Clone, Copy)]
struct Flags {
    created: bool,
    updated: bool,
    deleted: bool,
}

impl Flags {
    fn resolve(self) -> Option<SimpleChange> {
        match (self.created, self.deleted) {
            (true, true) => None,
            (_, true) => Some(SimpleChange::Deleted),
            (true, false) => Some(SimpleChange::Created),
            (false, false) if self.updated => Some(SimpleChange::Updated),
            _ => None,
        }
    }
}

/// Fold `entries` into net changes, in order of each object's first appearance.
/// Objects created and deleted within the same set are dropped entirely.
pub fn simplify(entries: &[QueueEntry]) -> Vec<(ObjectRef, SimpleChange)> {
    let mut order: Vec<ObjectRef> = Vec::new();
    let mut flags: HashMap<ObjectRef, Flags> = HashMap::new();

    for entry in entries {
        let f = flags.entry(entry.object_ref).or_insert_with(|| {
            order.push(entry.object_ref);
            Flags::default()
        });
        match entry.change {
            ChangeType::Created => f.created = true,
            ChangeType::Deleted => f.deleted = true,
            ChangeType::Moved
            | ChangeType::DataChanged
            | ChangeType::TitleChanged
            | ChangeType::ProtectionChanged => f.updated = true,
        }
    }

    order
        .into_iter()
        .filter_map(|r| flags[&r].resolve().map(|c| (r, c)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn entry(id: i64, change: ChangeType, event_id: i64) -> QueueEntry {
        QueueEntry {
            id,
            agent_id: 1,
            created_at: Utc::now(),
            processed: false,
            change,
            object_ref: ObjectRef::Event { event_id },
        }
    }

    #[test]
    fn repeated_updates_collapse() {
        let entries = vec![
            entry(1, ChangeType::TitleChanged, 1),
            entry(2, ChangeType::DataChanged, 1),
            entry(3, ChangeType::ProtectionChanged, 1),
        ];
        assert_eq!(
            simplify(&entries),
            vec![(ObjectRef::Event { event_id: 1 }, SimpleChange::Updated)]
        );
    }

    #[test]
    fn created_then_deleted_is_dropped() {
        let entries = vec![
            entry(1, ChangeType::Created, 1),
            entry(2, ChangeType::DataChanged, 1),
            entry(3, ChangeType::Deleted, 1),
            entry(4, ChangeType::Moved, 2),
        ];
        assert_eq!(
            simplify(&entries),
            vec![(ObjectRef::Event { event_id: 2 }, SimpleChange::Updated)]
        );
    }

    #[test]
    fn precedence_and_order() {
        let entries = vec![
            entry(1, ChangeType::Moved, 3),
            entry(2, ChangeType::Created, 1),
            entry(3, ChangeType::DataChanged, 1),
            entry(4, ChangeType::DataChanged, 2),
            entry(5, ChangeType::Deleted, 2),
        ];
        assert_eq!(
            simplify(&entries),
            vec![
                (ObjectRef::Event { event_id: 3 }, SimpleChange::Updated),
                (ObjectRef::Event { event_id: 1 }, SimpleChange::Created),
                (ObjectRef::Event { event_id: 2 }, SimpleChange::Deleted),
            ]
        );
    }

    #[test]
    fn empty_input() {
        assert!(simplify(&[]).is_empty());
    }
}
