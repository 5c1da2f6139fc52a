//! Snapshot diffing.
//!
//! [`diff`] compares a source snapshot against a target snapshot of the same
//! entity kind and classifies every source record as a create, an update
//! (with its modification list) or a no-op. Target records missing from the
//! source are classified as deletes only when deletion is enabled.
//!
//! The engine works on borrowed snapshots and never mutates them; the plan
//! depends only on the two inputs.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::models::{EntityKind, GroupRecord, IdentityRecord};

// ---------------------------------------------------------------------------
// Modifications
// ---------------------------------------------------------------------------

/// One change needed to bring a target entry in line with its source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Modification {
    /// Replace an attribute. `None` clears it.
    Replace {
        attribute: String,
        value: Option<String>,
    },
    /// Add members (join keys), sorted.
    AddMembers(Vec<String>),
    /// Remove members (join keys), sorted.
    RemoveMembers(Vec<String>),
}

impl fmt::Display for Modification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Replace {
                attribute,
                value: Some(v),
            } => write!(f, "replace {attribute}={v}"),
            Self::Replace {
                attribute,
                value: None,
            } => write!(f, "clear {attribute}"),
            Self::AddMembers(m) => write!(f, "add members [{}]", m.join(", ")),
            Self::RemoveMembers(m) => write!(f, "remove members [{}]", m.join(", ")),
        }
    }
}

/// The apply operation a classified record maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Create,
    Update,
    Delete,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create => write!(f, "create"),
            Self::Update => write!(f, "update"),
            Self::Delete => write!(f, "delete"),
        }
    }
}

// ---------------------------------------------------------------------------
// Diffable records
// ---------------------------------------------------------------------------

/// A record that can be correlated and compared across snapshots.
pub trait Diffable {
    const KIND: EntityKind;

    fn join_key(&self) -> &str;

    /// Modifications that turn `target` into `self`. Empty when equal.
    fn modifications_from(&self, target: &Self) -> Vec<Modification>;
}

fn replace_if_changed(
    mods: &mut Vec<Modification>,
    attribute: &str,
    source: &Option<String>,
    target: &Option<String>,
) {
    if source != target {
        mods.push(Modification::Replace {
            attribute: attribute.to_string(),
            value: source.clone(),
        });
    }
}

impl Diffable for IdentityRecord {
    const KIND: EntityKind = EntityKind::User;

    fn join_key(&self) -> &str {
        &self.username
    }

    fn modifications_from(&self, target: &Self) -> Vec<Modification> {
        let mut mods = Vec::new();
        replace_if_changed(&mut mods, "mail", &self.email, &target.email);
        replace_if_changed(&mut mods, "givenName", &self.given_name, &target.given_name);
        replace_if_changed(&mut mods, "sn", &self.family_name, &target.family_name);
        replace_if_changed(
            &mut mods,
            "displayName",
            &self.display_name,
            &target.display_name,
        );
        mods
    }
}

impl Diffable for GroupRecord {
    const KIND: EntityKind = EntityKind::Group;

    fn join_key(&self) -> &str {
        &self.name
    }

    fn modifications_from(&self, target: &Self) -> Vec<Modification> {
        let mut mods = Vec::new();
        replace_if_changed(&mut mods, "cn", &self.display_name, &target.display_name);
        replace_if_changed(
            &mut mods,
            "description",
            &self.description,
            &target.description,
        );
        mods.extend(membership_changes(&self.members, &target.members));
        mods
    }
}

/// Set-based membership comparison. Both operations may be returned.
pub fn membership_changes(source: &BTreeSet<String>, target: &BTreeSet<String>) -> Vec<Modification> {
    let mut mods = Vec::new();
    let to_add: Vec<String> = source.difference(target).cloned().collect();
    let to_remove: Vec<String> = target.difference(source).cloned().collect();
    if !to_add.is_empty() {
        mods.push(Modification::AddMembers(to_add));
    }
    if !to_remove.is_empty() {
        mods.push(Modification::RemoveMembers(to_remove));
    }
    mods
}

// ---------------------------------------------------------------------------
// Plan
// ---------------------------------------------------------------------------

/// Which snapshot a duplicate key was found in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotSide {
    Source,
    Target,
}

impl fmt::Display for SnapshotSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Source => write!(f, "source"),
            Self::Target => write!(f, "target"),
        }
    }
}

/// A record the engine refused to classify because its join key is not
/// unique in one of the snapshots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub key: String,
    pub side: SnapshotSide,
    /// The operation that would have been performed.
    pub action: Action,
}

/// A matched pair whose target needs changes.
#[derive(Debug)]
pub struct PlannedUpdate<'a, R> {
    pub source: &'a R,
    pub target: &'a R,
    pub modifications: Vec<Modification>,
}

/// How one source record is handled.
#[derive(Debug)]
pub enum SourceStep<'a, R> {
    Create(&'a R),
    Update(PlannedUpdate<'a, R>),
    /// Matches a target with no differences.
    Unchanged(&'a R),
    Rejected(Rejection),
}

/// Classification of two snapshots.
#[derive(Debug)]
pub struct DiffPlan<'a, R> {
    /// One step per source record, in source order.
    pub steps: Vec<SourceStep<'a, R>>,
    /// Target records absent from the source. Empty unless deletion is enabled.
    pub deletes: Vec<&'a R>,
    /// Ambiguous target keys that deletion skipped.
    pub rejected_deletes: Vec<Rejection>,
}

impl<'a, R> DiffPlan<'a, R> {
    fn new() -> Self {
        Self {
            steps: Vec::new(),
            deletes: Vec::new(),
            rejected_deletes: Vec::new(),
        }
    }

    /// Number of source records examined.
    pub fn examined(&self) -> usize {
        self.steps.len()
    }

    pub fn creates(&self) -> Vec<&'a R> {
        self.steps
            .iter()
            .filter_map(|step| match step {
                SourceStep::Create(record) => Some(*record),
                _ => None,
            })
            .collect()
    }

    pub fn updates(&self) -> Vec<&PlannedUpdate<'a, R>> {
        self.steps
            .iter()
            .filter_map(|step| match step {
                SourceStep::Update(update) => Some(update),
                _ => None,
            })
            .collect()
    }

    pub fn unchanged(&self) -> Vec<&'a R> {
        self.steps
            .iter()
            .filter_map(|step| match step {
                SourceStep::Unchanged(record) => Some(*record),
                _ => None,
            })
            .collect()
    }

    /// Every rejection: source-side ones in source order, then delete-side.
    pub fn rejected(&self) -> Vec<Rejection> {
        self.steps
            .iter()
            .filter_map(|step| match step {
                SourceStep::Rejected(rejection) => Some(rejection.clone()),
                _ => None,
            })
            .chain(self.rejected_deletes.iter().cloned())
            .collect()
    }

    /// True when nothing needs to be applied or reported.
    pub fn is_empty(&self) -> bool {
        self.deletes.is_empty()
            && self.rejected_deletes.is_empty()
            && self
                .steps
                .iter()
                .all(|step| matches!(step, SourceStep::Unchanged(_)))
    }
}

/// Classify `source` against `target`, one step per source record in source
/// order.
///
/// Join keys must be unique within each snapshot. For a key repeated in the
/// source the first occurrence is classified and later ones are rejected. A
/// key repeated in the target is ambiguous: the matching source record is
/// rejected and the key is never deleted.
pub fn diff<'a, R: Diffable>(
    source: &'a [R],
    target: &'a [R],
    delete_missing: bool,
) -> DiffPlan<'a, R> {
    let mut plan = DiffPlan::new();

    let mut target_by_key: HashMap<&str, &R> = HashMap::with_capacity(target.len());
    let mut ambiguous: HashSet<&str> = HashSet::new();
    for record in target {
        if target_by_key.insert(record.join_key(), record).is_some() {
            ambiguous.insert(record.join_key());
        }
    }

    let mut seen: HashSet<&str> = HashSet::with_capacity(source.len());
    for record in source {
        let key = record.join_key();

        if !seen.insert(key) {
            plan.steps.push(SourceStep::Rejected(Rejection {
                key: key.to_string(),
                side: SnapshotSide::Source,
                action: if target_by_key.contains_key(key) {
                    Action::Update
                } else {
                    Action::Create
                },
            }));
            continue;
        }

        if ambiguous.contains(key) {
            plan.steps.push(SourceStep::Rejected(Rejection {
                key: key.to_string(),
                side: SnapshotSide::Target,
                action: Action::Update,
            }));
            continue;
        }

        let step = match target_by_key.get(key) {
            None => SourceStep::Create(record),
            Some(existing) => {
                let modifications = record.modifications_from(existing);
                if modifications.is_empty() {
                    SourceStep::Unchanged(record)
                } else {
                    SourceStep::Update(PlannedUpdate {
                        source: record,
                        target: *existing,
                        modifications,
                    })
                }
            }
        };
        plan.steps.push(step);
    }

    if delete_missing {
        let mut reported: HashSet<&str> = HashSet::new();
        for record in target {
            let key = record.join_key();
            if seen.contains(key) {
                continue;
            }
            if ambiguous.contains(key) {
                if reported.insert(key) {
                    plan.rejected_deletes.push(Rejection {
                        key: key.to_string(),
                        side: SnapshotSide::Target,
                        action: Action::Delete,
                    });
                }
                continue;
            }
            plan.deletes.push(record);
        }
    }

    plan
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RecordSource;

    fn user(name: &str, email: Option<&str>) -> IdentityRecord {
        let mut u = IdentityRecord::new(name, RecordSource::IdentityProvider);
        u.email = email.map(str::to_string);
        u
    }

    fn ldap_user(name: &str, email: Option<&str>) -> IdentityRecord {
        let mut u = user(name, email);
        u.source = RecordSource::Directory;
        u
    }

    fn group(name: &str, members: &[&str]) -> GroupRecord {
        let mut g = GroupRecord::new(name, RecordSource::IdentityProvider);
        g.display_name = Some(name.to_string());
        g.members = members.iter().map(|m| m.to_string()).collect();
        g
    }

    fn keys<R: Diffable>(records: &[&R]) -> Vec<String> {
        records.iter().map(|r| r.join_key().to_string()).collect()
    }

    #[test]
    fn test_disjoint_snapshots_create_and_delete_everything() {
        let source = vec![user("alice", None), user("bob", None)];
        let target = vec![ldap_user("carol", None), ldap_user("dave", None)];

        let plan = diff(&source, &target, true);
        assert_eq!(keys(&plan.creates()), vec!["alice", "bob"]);
        assert_eq!(keys(&plan.deletes), vec!["carol", "dave"]);
        assert!(plan.updates().is_empty());
        assert_eq!(plan.examined(), 2);

        let plan = diff(&source, &target, false);
        assert_eq!(plan.creates().len(), 2);
        assert!(plan.deletes.is_empty());
    }

    #[test]
    fn test_identical_records_are_no_ops() {
        let source = vec![user("alice", Some("a@x.com"))];
        let target = vec![ldap_user("alice", Some("a@x.com"))];
        let plan = diff(&source, &target, true);
        assert!(plan.is_empty());
        assert_eq!(keys(&plan.unchanged()), vec!["alice"]);
        assert_eq!(plan.examined(), 1);

        let gs = vec![group("eng", &["alice", "bob"])];
        let gt = vec![group("eng", &["bob", "alice"])];
        assert!(diff(&gs, &gt, false).updates().is_empty());
    }

    #[test]
    fn test_changed_and_cleared_fields() {
        let mut src = user("alice", Some("new@x.com"));
        src.display_name = None;
        let mut tgt = ldap_user("alice", Some("old@x.com"));
        tgt.display_name = Some("Alice".into());
        tgt.given_name = None;

        let plan = diff(std::slice::from_ref(&src), std::slice::from_ref(&tgt), false);
        assert_eq!(plan.updates().len(), 1);
        assert_eq!(
            plan.updates()[0].modifications,
            vec![
                Modification::Replace {
                    attribute: "mail".into(),
                    value: Some("new@x.com".into())
                },
                Modification::Replace {
                    attribute: "displayName".into(),
                    value: None
                },
            ]
        );
    }

    #[test]
    fn test_group_membership_add_only() {
        let source = vec![group("eng", &["alice", "bob"])];
        let target = vec![group("eng", &["alice"])];
        let plan = diff(&source, &target, false);
        assert_eq!(plan.updates().len(), 1);
        assert_eq!(
            plan.updates()[0].modifications,
            vec![Modification::AddMembers(vec!["bob".into()])]
        );
    }

    #[test]
    fn test_group_membership_add_and_remove_together() {
        let source = vec![group("eng", &["alice", "carol"])];
        let target = vec![group("eng", &["alice", "bob", "dave"])];
        let plan = diff(&source, &target, false);
        assert_eq!(
            plan.updates()[0].modifications,
            vec![
                Modification::AddMembers(vec!["carol".into()]),
                Modification::RemoveMembers(vec!["bob".into(), "dave".into()]),
            ]
        );
    }

    #[test]
    fn test_source_order_is_preserved() {
        let source = vec![user("zed", None), user("amy", None), user("mo", None)];
        let target: Vec<IdentityRecord> = Vec::new();
        let plan = diff(&source, &target, false);
        assert_eq!(keys(&plan.creates()), vec!["zed", "amy", "mo"]);
    }

    #[test]
    fn test_steps_interleave_kinds_in_source_order() {
        let source = vec![
            user("bob", Some("new@x.com")),
            user("alice", None),
            user("bob", None),
            user("carol", Some("c@x.com")),
        ];
        let target = vec![ldap_user("bob", Some("old@x.com")), ldap_user("carol", Some("c@x.com"))];
        let plan = diff(&source, &target, false);

        let kinds: Vec<&str> = plan
            .steps
            .iter()
            .map(|step| match step {
                SourceStep::Create(_) => "create",
                SourceStep::Update(_) => "update",
                SourceStep::Unchanged(_) => "unchanged",
                SourceStep::Rejected(_) => "rejected",
            })
            .collect();
        assert_eq!(kinds, vec!["update", "create", "rejected", "unchanged"]);
        assert_eq!(plan.examined(), 4);
    }

    #[test]
    fn test_duplicate_source_key_first_wins() {
        let source = vec![
            user("alice", Some("first@x.com")),
            user("alice", Some("second@x.com")),
        ];
        let target: Vec<IdentityRecord> = Vec::new();
        let plan = diff(&source, &target, false);
        assert_eq!(plan.creates().len(), 1);
        assert_eq!(plan.creates()[0].email.as_deref(), Some("first@x.com"));
        assert_eq!(
            plan.rejected(),
            vec![Rejection {
                key: "alice".into(),
                side: SnapshotSide::Source,
                action: Action::Create
            }]
        );
        assert_eq!(plan.examined(), 2);
    }

    #[test]
    fn test_duplicate_target_key_is_ambiguous() {
        let source = vec![user("alice", None)];
        let target = vec![
            ldap_user("alice", None),
            ldap_user("alice", Some("x")),
            ldap_user("ghost", None),
            ldap_user("ghost", None),
        ];
        let plan = diff(&source, &target, true);
        assert!(plan.creates().is_empty());
        assert!(plan.updates().is_empty());
        assert!(plan.deletes.is_empty());
        assert_eq!(plan.rejected().len(), 2);
        assert_eq!(plan.rejected()[0].key, "alice");
        assert_eq!(plan.rejected()[0].side, SnapshotSide::Target);
        assert_eq!(plan.rejected()[1].key, "ghost");
        assert_eq!(plan.rejected()[1].action, Action::Delete);
    }

    #[test]
    fn test_inputs_are_untouched() {
        let source = vec![user("alice", Some("a"))];
        let target = vec![ldap_user("alice", Some("b"))];
        let before = (source.clone(), target.clone());
        let _ = diff(&source, &target, true);
        assert_eq!((source, target), before);
    }
}
