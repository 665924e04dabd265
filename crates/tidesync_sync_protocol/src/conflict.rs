//! Conflict resolution.
//!
//! A conflict arises when the remote holds a version of a record that the
//! pushed change did not build on. Resolution runs in the background sync
//! path with nobody to ask, so every resolver must be total and
//! deterministic: the same pair of records always yields the same
//! [`Decision`].

use crate::error::ResolveError;
use std::cmp::Ordering;
use std::fmt;
use tidesync_core::{Payload, Record};

/// Outcome of resolving a conflict.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Keep the local record and push it again.
    TakeLocal,
    /// Adopt the remote record.
    TakeRemote,
    /// Store and push this combination of both.
    Merge(Record),
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Decision::TakeLocal => f.write_str("take-local"),
            Decision::TakeRemote => f.write_str("take-remote"),
            Decision::Merge(_) => f.write_str("merge"),
        }
    }
}

/// Pluggable conflict policy.
///
/// `resolve` must be pure: no I/O, no clocks, no randomness.
pub trait ConflictResolver: Send + Sync {
    /// Decides between the local snapshot and the remote record.
    fn resolve(&self, local: &Record, remote: &Record) -> Decision;

    /// Fallible variant for resolvers that can give up.
    ///
    /// The default delegates to [`resolve`](Self::resolve).
    fn try_resolve(&self, local: &Record, remote: &Record) -> Result<Decision, ResolveError> {
        Ok(self.resolve(local, remote))
    }

    /// Short name used in logs.
    fn name(&self) -> &'static str {
        "custom"
    }
}

/// Whole-record last-writer-wins.
///
/// The record with the later `updated_at` wins. Ties fall to the
/// lexically greater record ID, then to the higher version. A complete tie
/// keeps the remote record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LastWriterWins;

impl LastWriterWins {
    fn local_wins(local: &Record, remote: &Record) -> bool {
        local
            .updated_at
            .cmp(&remote.updated_at)
            .then_with(|| local.id.cmp(&remote.id))
            .then_with(|| local.version.cmp(&remote.version))
            == Ordering::Greater
    }
}

impl ConflictResolver for LastWriterWins {
    fn resolve(&self, local: &Record, remote: &Record) -> Decision {
        if Self::local_wins(local, remote) {
            Decision::TakeLocal
        } else {
            Decision::TakeRemote
        }
    }

    fn name(&self) -> &'static str {
        "last-writer-wins"
    }
}

/// Field-level merge for map payloads.
///
/// Fields whose values are lists on both sides are unioned: local items in
/// local order, then remote items the local list lacks. Any other field
/// present on both sides takes the value of the [`LastWriterWins`] winner.
/// Fields present on one side only are kept.
///
/// Tombstones and non-map payloads fall back to [`LastWriterWins`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListUnionMerge;

impl ListUnionMerge {
    fn merge_maps(
        local: &[(Payload, Payload)],
        remote: &[(Payload, Payload)],
        local_wins: bool,
    ) -> Vec<(Payload, Payload)> {
        let mut merged = Vec::with_capacity(local.len() + remote.len());

        for (key, local_value) in local {
            let remote_value = remote.iter().find(|(k, _)| k == key).map(|(_, v)| v);
            let value = match (local_value, remote_value) {
                (Payload::Array(mine), Some(Payload::Array(theirs))) => {
                    let mut items = mine.clone();
                    for item in theirs {
                        if !items.contains(item) {
                            items.push(item.clone());
                        }
                    }
                    Payload::Array(items)
                }
                (mine, Some(theirs)) => {
                    if local_wins {
                        mine.clone()
                    } else {
                        theirs.clone()
                    }
                }
                (mine, None) => mine.clone(),
            };
            merged.push((key.clone(), value));
        }

        for (key, value) in remote {
            if !local.iter().any(|(k, _)| k == key) {
                merged.push((key.clone(), value.clone()));
            }
        }

        merged
    }
}

impl ConflictResolver for ListUnionMerge {
    fn resolve(&self, local: &Record, remote: &Record) -> Decision {
        let fallback = LastWriterWins.resolve(local, remote);
        if local.deleted || remote.deleted {
            return fallback;
        }

        let (Payload::Map(mine), Payload::Map(theirs)) = (&local.payload, &remote.payload) else {
            return fallback;
        };

        let payload = Payload::Map(Self::merge_maps(
            mine,
            theirs,
            fallback == Decision::TakeLocal,
        ));
        if payload == remote.payload {
            return Decision::TakeRemote;
        }
        if payload == local.payload {
            return Decision::TakeLocal;
        }

        Decision::Merge(Record {
            id: local.id.clone(),
            version: local.version.max(remote.version),
            payload,
            updated_at: local.updated_at.max(remote.updated_at),
            deleted: false,
        })
    }

    fn name(&self) -> &'static str {
        "list-union-merge"
    }
}

/// Fixed policies for applications that don't need a custom resolver.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConflictPolicy {
    /// Server always wins.
    ServerWins,
    /// Client always wins.
    ClientWins,
    /// Last write wins (by timestamp).
    #[default]
    LastWriterWins,
    /// Union list fields, last write wins for the rest.
    ListUnion,
}

impl ConflictPolicy {
    /// Parses a policy name as used in configuration.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "server-wins" => Some(ConflictPolicy::ServerWins),
            "client-wins" => Some(ConflictPolicy::ClientWins),
            "last-writer-wins" | "lww" => Some(ConflictPolicy::LastWriterWins),
            "list-union" => Some(ConflictPolicy::ListUnion),
            _ => None,
        }
    }
}

impl ConflictResolver for ConflictPolicy {
    fn resolve(&self, local: &Record, remote: &Record) -> Decision {
        match self {
            ConflictPolicy::ServerWins => Decision::TakeRemote,
            ConflictPolicy::ClientWins => Decision::TakeLocal,
            ConflictPolicy::LastWriterWins => LastWriterWins.resolve(local, remote),
            ConflictPolicy::ListUnion => ListUnionMerge.resolve(local, remote),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            ConflictPolicy::ServerWins => "server-wins",
            ConflictPolicy::ClientWins => "client-wins",
            ConflictPolicy::LastWriterWins => LastWriterWins.name(),
            ConflictPolicy::ListUnion => ListUnionMerge.name(),
        }
    }
}

/// Runs `resolver` and checks the decision it returns.
///
/// A `Merge` must describe the conflicted record. When either side is a
/// tombstone, a `Merge` is replaced by the tombstoned side: a deletion is
/// never merged back to life.
pub fn resolve_conflict(
    resolver: &dyn ConflictResolver,
    local: &Record,
    remote: &Record,
) -> Result<Decision, ResolveError> {
    let decision = resolver.try_resolve(local, remote)?;

    let Decision::Merge(merged) = &decision else {
        return Ok(decision);
    };
    if merged.id != remote.id {
        return Err(ResolveError::new(
            remote.id.as_str(),
            format!("{} merged into record {}", resolver.name(), merged.id),
        ));
    }
    if remote.deleted {
        return Ok(Decision::TakeRemote);
    }
    if local.deleted {
        return Ok(Decision::TakeLocal);
    }
    Ok(decision)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tidesync_core::{Timestamp, Version};

    fn record(version: u64, at: u64, payload: Payload) -> Record {
        Record::new("n1", Version::new(version), payload, Timestamp::from_millis(at))
    }

    fn text(s: &str) -> Payload {
        Payload::Text(s.into())
    }

    fn map(fields: Vec<(&str, Payload)>) -> Payload {
        Payload::Map(fields.into_iter().map(|(k, v)| (text(k), v)).collect())
    }

    fn list(items: &[&str]) -> Payload {
        Payload::Array(items.iter().map(|s| text(s)).collect())
    }

    #[test]
    fn lww_later_write_wins() {
        let local = record(2, 100, text("mine"));
        let remote = record(5, 200, text("theirs"));

        assert_eq!(LastWriterWins.resolve(&local, &remote), Decision::TakeRemote);
        assert_eq!(LastWriterWins.resolve(&remote, &local), Decision::TakeLocal);
    }

    #[test]
    fn lww_ties() {
        let local = record(2, 100, text("mine"));
        let remote = record(5, 100, text("theirs"));
        assert_eq!(LastWriterWins.resolve(&local, &remote), Decision::TakeRemote);
        assert_eq!(LastWriterWins.resolve(&remote, &local), Decision::TakeLocal);

        let same = record(2, 100, text("theirs"));
        assert_eq!(LastWriterWins.resolve(&local, &same), Decision::TakeRemote);

        let mut other_id = local.clone();
        other_id.id = "n2".into();
        assert_eq!(LastWriterWins.resolve(&other_id, &local), Decision::TakeLocal);
    }

    #[test]
    fn union_merges_lists_and_lww_scalars() {
        let local = record(
            2,
            300,
            map(vec![("title", text("mine")), ("tags", list(&["a", "b"]))]),
        );
        let remote = record(
            4,
            200,
            map(vec![
                ("title", text("theirs")),
                ("tags", list(&["b", "c"])),
                ("color", text("red")),
            ]),
        );

        let Decision::Merge(merged) = ListUnionMerge.resolve(&local, &remote) else {
            panic!("expected merge");
        };
        assert_eq!(
            merged.payload,
            map(vec![
                ("title", text("mine")),
                ("tags", list(&["a", "b", "c"])),
                ("color", text("red")),
            ])
        );
        assert_eq!(merged.version, Version::new(4));
        assert_eq!(merged.updated_at, Timestamp::from_millis(300));
    }

    #[test]
    fn union_collapses_to_a_side_when_nothing_new() {
        let local = record(2, 100, map(vec![("tags", list(&["a"]))]));
        let remote = record(3, 200, map(vec![("tags", list(&["a", "b"]))]));

        assert_eq!(ListUnionMerge.resolve(&local, &remote), Decision::TakeRemote);
        assert_eq!(ListUnionMerge.resolve(&remote, &local), Decision::TakeLocal);
    }

    #[test]
    fn union_falls_back_to_lww() {
        let local = record(2, 300, text("mine"));
        let remote = record(3, 200, map(vec![("tags", list(&["a"]))]));
        assert_eq!(ListUnionMerge.resolve(&local, &remote), Decision::TakeLocal);

        let tomb = record(2, 100, map(vec![("tags", list(&["x"]))]))
            .tombstone(Timestamp::from_millis(400));
        assert_eq!(ListUnionMerge.resolve(&tomb, &remote), Decision::TakeLocal);
    }

    #[test]
    fn policies() {
        let local = record(1, 100, text("mine"));
        let remote = record(2, 50, text("theirs"));

        assert_eq!(ConflictPolicy::ServerWins.resolve(&local, &remote), Decision::TakeRemote);
        assert_eq!(ConflictPolicy::ClientWins.resolve(&local, &remote), Decision::TakeLocal);
        assert_eq!(ConflictPolicy::default().resolve(&local, &remote), Decision::TakeLocal);
        assert_eq!(ConflictPolicy::from_name("lww"), Some(ConflictPolicy::LastWriterWins));
        assert_eq!(ConflictPolicy::from_name("coin-flip"), None);
        assert_eq!(ConflictPolicy::ListUnion.name(), "list-union-merge");
    }

    struct MergeInto(Record);

    impl ConflictResolver for MergeInto {
        fn resolve(&self, _local: &Record, _remote: &Record) -> Decision {
            Decision::Merge(self.0.clone())
        }
    }

    struct GiveUp;

    impl ConflictResolver for GiveUp {
        fn resolve(&self, _local: &Record, _remote: &Record) -> Decision {
            Decision::TakeRemote
        }

        fn try_resolve(&self, _local: &Record, remote: &Record) -> Result<Decision, ResolveError> {
            Err(ResolveError::new(remote.id.as_str(), "no opinion"))
        }
    }

    #[test]
    fn merge_must_target_the_conflicted_record() {
        let local = record(1, 100, text("mine"));
        let remote = record(2, 200, text("theirs"));
        let mut stray = local.clone();
        stray.id = "other".into();

        let err = resolve_conflict(&MergeInto(stray), &local, &remote).unwrap_err();
        assert_eq!(err.record_id, "n1");

        let ok = resolve_conflict(&MergeInto(local.clone()), &local, &remote).unwrap();
        assert_eq!(ok, Decision::Merge(local));
    }

    #[test]
    fn tombstone_beats_merge() {
        let live = record(1, 100, text("mine"));
        let tomb = record(2, 50, text("theirs")).tombstone(Timestamp::from_millis(60));

        let merged = MergeInto(live.clone());
        assert_eq!(
            resolve_conflict(&merged, &live, &tomb).unwrap(),
            Decision::TakeRemote
        );
        assert_eq!(
            resolve_conflict(&merged, &tomb, &live).unwrap(),
            Decision::TakeLocal
        );
    }

    #[test]
    fn failing_resolver_is_unresolved() {
        let local = record(1, 100, text("mine"));
        let remote = record(2, 200, text("theirs"));
        assert!(resolve_conflict(&GiveUp, &local, &remote).is_err());
    }

    fn arb_payload() -> impl Strategy<Value = Payload> {
        prop::collection::vec(
            (
                prop::sample::select(vec!["title", "tags", "color"]),
                prop_oneof![
                    "[a-z]{0,4}".prop_map(Payload::Text),
                    prop::collection::vec("[a-c]", 0..4).prop_map(|items| {
                        Payload::Array(items.into_iter().map(Payload::Text).collect())
                    }),
                ],
            ),
            0..4,
        )
        .prop_map(|fields| {
            let mut seen = Vec::new();
            let mut pairs = Vec::new();
            for (key, value) in fields {
                if !seen.contains(&key) {
                    seen.push(key);
                    pairs.push((Payload::Text(key.into()), value));
                }
            }
            Payload::Map(pairs)
        })
    }

    fn arb_record() -> impl Strategy<Value = Record> {
        (1..5u64, 0..4u64, arb_payload(), any::<bool>()).prop_map(|(version, at, payload, deleted)| {
            let mut r = record(version, at, payload);
            r.deleted = deleted;
            r
        })
    }

    proptest! {
        #[test]
        fn resolvers_are_deterministic(local in arb_record(), remote in arb_record()) {
            for policy in [ConflictPolicy::LastWriterWins, ConflictPolicy::ListUnion] {
                let first = resolve_conflict(&policy, &local, &remote);
                let second = resolve_conflict(&policy, &local, &remote);
                prop_assert!(first.is_ok());
                prop_assert_eq!(first, second);
            }
        }

        #[test]
        fn lww_is_antisymmetric_unless_tied(local in arb_record(), remote in arb_record()) {
            let forward = LastWriterWins.resolve(&local, &remote);
            let backward = LastWriterWins.resolve(&remote, &local);
            let tied = local.updated_at == remote.updated_at && local.version == remote.version;
            if !tied {
                prop_assert_ne!(forward, backward);
            }
        }
    }
}
