//! Snapshots and deltas: immutable point-in-time projections of a scope's
//! claims and metrics, addressed by content hash, plus the add/remove/change
//! algebra between them.
//!
//! The composition law holds exactly: `diff(a, c) == diff(a, b) ∘ diff(b, c)`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A point-in-time projection: entity id → content hash per collection.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Snapshot {
    pub scope_type: String,
    pub scope_id: String,
    /// Claim id → content hash of the claim row.
    pub claims: BTreeMap<String, String>,
    /// Metric id → content hash of the metric point set.
    pub metrics: BTreeMap<String, String>,
}

impl Snapshot {
    pub fn new(scope_type: &str, scope_id: &str) -> Self {
        Self {
            scope_type: scope_type.into(),
            scope_id: scope_id.into(),
            claims: BTreeMap::new(),
            metrics: BTreeMap::new(),
        }
    }

    /// Deterministic content hash over the sorted id/hash pairs. Hashing the
    /// same snapshot twice yields the same digest; changing any included id
    /// or entity hash changes it.
    pub fn content_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.scope_type.as_bytes());
        hasher.update(b"\x1f");
        hasher.update(self.scope_id.as_bytes());
        for (id, hash) in &self.claims {
            hasher.update(b"\nclaim\x1f");
            hasher.update(id.as_bytes());
            hasher.update(b"\x1f");
            hasher.update(hash.as_bytes());
        }
        for (id, hash) in &self.metrics {
            hasher.update(b"\nmetric\x1f");
            hasher.update(id.as_bytes());
            hasher.update(b"\x1f");
            hasher.update(hash.as_bytes());
        }
        hex_digest(hasher)
    }
}

fn hex_digest(hasher: Sha256) -> String {
    let digest = hasher.finalize();
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// Add/remove/change set over one id→hash collection. Removed and changed
/// entries carry the old hash so deltas compose without the base snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct EntityDelta {
    /// id → new hash
    pub added: BTreeMap<String, String>,
    /// id → old hash
    pub removed: BTreeMap<String, String>,
    /// id → (old hash, new hash)
    pub changed: BTreeMap<String, (String, String)>,
}

impl EntityDelta {
    pub fn diff(from: &BTreeMap<String, String>, to: &BTreeMap<String, String>) -> Self {
        let mut delta = Self::default();
        for (id, new_hash) in to {
            match from.get(id) {
                None => {
                    delta.added.insert(id.clone(), new_hash.clone());
                }
                Some(old_hash) if old_hash != new_hash => {
                    delta
                        .changed
                        .insert(id.clone(), (old_hash.clone(), new_hash.clone()));
                }
                Some(_) => {}
            }
        }
        for (id, old_hash) in from {
            if !to.contains_key(id) {
                delta.removed.insert(id.clone(), old_hash.clone());
            }
        }
        delta
    }

    fn state_before(&self, id: &str) -> Option<Option<&str>> {
        if let Some(_new) = self.added.get(id) {
            return Some(None);
        }
        if let Some(old) = self.removed.get(id) {
            return Some(Some(old));
        }
        if let Some((old, _)) = self.changed.get(id) {
            return Some(Some(old));
        }
        None
    }

    fn state_after(&self, id: &str) -> Option<Option<&str>> {
        if let Some(new) = self.added.get(id) {
            return Some(Some(new));
        }
        if self.removed.contains_key(id) {
            return Some(None);
        }
        if let Some((_, new)) = self.changed.get(id) {
            return Some(Some(new));
        }
        None
    }

    /// Compose `self: a→b` with `next: b→c` into `a→c`.
    pub fn compose(&self, next: &EntityDelta) -> Self {
        let mut ids: Vec<&String> = Vec::new();
        for id in self
            .added
            .keys()
            .chain(self.removed.keys())
            .chain(self.changed.keys())
            .chain(next.added.keys())
            .chain(next.removed.keys())
            .chain(next.changed.keys())
        {
            if !ids.contains(&id) {
                ids.push(id);
            }
        }

        let mut out = Self::default();
        for id in ids {
            // The a-side view comes from the first delta when it mentions the
            // id, otherwise the id was stable across a→b and the second
            // delta's old hash is also the a-side hash.
            let before = self
                .state_before(id)
                .or_else(|| next.state_before(id))
                .unwrap_or(None);
            let after = next
                .state_after(id)
                .or_else(|| self.state_after(id))
                .unwrap_or(None);

            match (before, after) {
                (None, Some(new)) => {
                    out.added.insert(id.clone(), new.to_string());
                }
                (Some(old), None) => {
                    out.removed.insert(id.clone(), old.to_string());
                }
                (Some(old), Some(new)) if old != new => {
                    out.changed
                        .insert(id.clone(), (old.to_string(), new.to_string()));
                }
                _ => {}
            }
        }
        out
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }

    /// Total number of touched entities, used for the delta-magnitude metric.
    pub fn magnitude(&self) -> usize {
        self.added.len() + self.removed.len() + self.changed.len()
    }
}

/// The structured change between two snapshots of one scope.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SnapshotDelta {
    pub claims: EntityDelta,
    pub metrics: EntityDelta,
}

impl SnapshotDelta {
    pub fn diff(from: &Snapshot, to: &Snapshot) -> Self {
        Self {
            claims: EntityDelta::diff(&from.claims, &to.claims),
            metrics: EntityDelta::diff(&from.metrics, &to.metrics),
        }
    }

    pub fn compose(&self, next: &SnapshotDelta) -> Self {
        Self {
            claims: self.claims.compose(&next.claims),
            metrics: self.metrics.compose(&next.metrics),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.claims.is_empty() && self.metrics.is_empty()
    }

    pub fn magnitude(&self) -> usize {
        self.claims.magnitude() + self.metrics.magnitude()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snap(claims: &[(&str, &str)]) -> Snapshot {
        let mut s = Snapshot::new("certification", "az-104");
        for (id, hash) in claims {
            s.claims.insert(id.to_string(), hash.to_string());
        }
        s
    }

    #[test]
    fn hash_is_deterministic() {
        let a = snap(&[("c1", "h1"), ("c2", "h2")]);
        assert_eq!(a.content_hash(), a.content_hash());
    }

    #[test]
    fn hash_changes_with_any_claim() {
        let a = snap(&[("c1", "h1"), ("c2", "h2")]);
        let b = snap(&[("c1", "h1"), ("c2", "h2-rev")]);
        let c = snap(&[("c1", "h1")]);
        assert_ne!(a.content_hash(), b.content_hash());
        assert_ne!(a.content_hash(), c.content_hash());
    }

    #[test]
    fn hash_ignores_insertion_order() {
        let mut a = Snapshot::new("topic", "rust");
        a.claims.insert("c2".into(), "h2".into());
        a.claims.insert("c1".into(), "h1".into());
        let b = snap_with_scope("topic", "rust", &[("c1", "h1"), ("c2", "h2")]);
        assert_eq!(a.content_hash(), b.content_hash());
    }

    fn snap_with_scope(scope_type: &str, scope_id: &str, claims: &[(&str, &str)]) -> Snapshot {
        let mut s = Snapshot::new(scope_type, scope_id);
        for (id, hash) in claims {
            s.claims.insert(id.to_string(), hash.to_string());
        }
        s
    }

    #[test]
    fn diff_classifies_add_remove_change() {
        let a = snap(&[("c1", "h1"), ("c2", "h2"), ("c3", "h3")]);
        let b = snap(&[("c1", "h1"), ("c2", "h2-rev"), ("c4", "h4")]);
        let delta = SnapshotDelta::diff(&a, &b);

        assert_eq!(delta.claims.added.get("c4").map(String::as_str), Some("h4"));
        assert_eq!(
            delta.claims.removed.get("c3").map(String::as_str),
            Some("h3")
        );
        assert_eq!(
            delta.claims.changed.get("c2"),
            Some(&("h2".to_string(), "h2-rev".to_string()))
        );
        assert!(!delta.claims.added.contains_key("c1"));
        assert_eq!(delta.magnitude(), 3);
    }

    #[test]
    fn composition_law_holds() {
        let a = snap(&[("c1", "h1"), ("c2", "h2"), ("c3", "h3")]);
        let b = snap(&[("c1", "h1b"), ("c3", "h3"), ("c4", "h4")]);
        let c = snap(&[("c1", "h1"), ("c4", "h4c"), ("c5", "h5")]);

        let ab = SnapshotDelta::diff(&a, &b);
        let bc = SnapshotDelta::diff(&b, &c);
        let ac = SnapshotDelta::diff(&a, &c);

        assert_eq!(ab.compose(&bc), ac);
    }

    #[test]
    fn compose_cancels_roundtrip_edits() {
        let a = snap(&[("c1", "h1")]);
        let b = snap(&[("c1", "h1-rev")]);

        let there = SnapshotDelta::diff(&a, &b);
        let back = SnapshotDelta::diff(&b, &a);
        let composed = there.compose(&back);
        assert!(composed.is_empty());
    }

    #[test]
    fn identity_diff_is_empty() {
        let a = snap(&[("c1", "h1")]);
        assert!(SnapshotDelta::diff(&a, &a).is_empty());
    }
}
