//! Live permission grants and the effective-decision merge.
//!
//! A grant row records an explicit participant decision on an optional
//! permission. The effective decision set is derived from the bound
//! permissions and the grant rows:
//!
//! ```text
//! effective = required ∪ { explicit true } ∪ { no row ∧ defaultAllow }
//! ```

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

use crate::binding::BoundPermission;
use crate::error::CoreError;
use crate::types::{PermKey, StudyId, UserId};

/// An explicit decision on one optional permission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionGrant {
    pub study_id: StudyId,
    pub user_id: UserId,
    pub perm_key: PermKey,
    pub granted: bool,
    pub updated_at: i64,
}

/// An ordered set of granted permission keys.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DecisionSet(BTreeSet<PermKey>);

impl DecisionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: PermKey) -> bool {
        self.0.insert(key)
    }

    pub fn contains(&self, key: &PermKey) -> bool {
        self.0.contains(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Keys in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = &PermKey> {
        self.0.iter()
    }

    pub fn to_vec(&self) -> Vec<PermKey> {
        self.0.iter().cloned().collect()
    }

    pub fn difference(&self, other: &DecisionSet) -> Vec<PermKey> {
        self.0.difference(&other.0).cloned().collect()
    }

    pub fn intersection(&self, other: &DecisionSet) -> Vec<PermKey> {
        self.0.intersection(&other.0).cloned().collect()
    }
}

impl FromIterator<PermKey> for DecisionSet {
    fn from_iter<I: IntoIterator<Item = PermKey>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<'a> IntoIterator for &'a DecisionSet {
    type Item = &'a PermKey;
    type IntoIter = std::collections::btree_set::Iter<'a, PermKey>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Merge bound permissions with explicit grants.
///
/// Grant rows for required permissions are ignored; required permissions are
/// always granted.
pub fn effective_decisions(bound: &[BoundPermission], grants: &[PermissionGrant]) -> DecisionSet {
    let explicit: HashMap<&PermKey, bool> =
        grants.iter().map(|g| (&g.perm_key, g.granted)).collect();

    bound
        .iter()
        .filter(|p| {
            if p.is_required() {
                return true;
            }
            match explicit.get(p.key()) {
                Some(&granted) => granted,
                None => p.default_allow(),
            }
        })
        .map(|p| p.key().clone())
        .collect()
}

/// Find the bound permission for `key` and check it may be toggled.
pub fn check_settable<'a>(
    bound: &'a [BoundPermission],
    key: &PermKey,
) -> Result<&'a BoundPermission, CoreError> {
    let permission = bound
        .iter()
        .find(|p| p.key() == key)
        .ok_or_else(|| CoreError::PermissionNotFound(key.clone()))?;

    if permission.is_required() {
        return Err(CoreError::PermissionLocked(key.clone()));
    }

    Ok(permission)
}

/// Normalise an explicit selection into a decision set.
///
/// Duplicates collapse, keys are sorted and required permissions are always
/// included. Keys not bound to the study are rejected.
pub fn normalize_selection(
    bound: &[BoundPermission],
    selection: &[PermKey],
) -> Result<DecisionSet, CoreError> {
    let mut set = DecisionSet::new();
    for key in selection {
        if !bound.iter().any(|p| p.key() == key) {
            return Err(CoreError::PermissionNotFound(key.clone()));
        }
        set.insert(key.clone());
    }
    for p in bound.iter().filter(|p| p.is_required()) {
        set.insert(p.key().clone());
    }
    Ok(set)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binding::StudyPermissionBinding;
    use crate::catalog::PermissionTemplate;
    use proptest::prelude::*;

    fn bound(slug: &str, required: bool, default_allow: bool) -> BoundPermission {
        let t = PermissionTemplate::custom(slug, slug);
        let b = StudyPermissionBinding::new("s".into(), t.id)
            .required(required)
            .default_allow(default_allow);
        BoundPermission::new(b, t)
    }

    fn grant(key: &str, granted: bool) -> PermissionGrant {
        PermissionGrant {
            study_id: "s".into(),
            user_id: "u".into(),
            perm_key: key.into(),
            granted,
            updated_at: 0,
        }
    }

    fn keys(set: &DecisionSet) -> Vec<&str> {
        set.iter().map(|k| k.as_str()).collect()
    }

    #[test]
    fn test_required_always_granted() {
        let perms = vec![bound("r", true, false), bound("a", false, false)];
        let set = effective_decisions(&perms, &[grant("r", false)]);
        assert_eq!(keys(&set), vec!["r"]);
    }

    #[test]
    fn test_explicit_overrides_default() {
        let perms = vec![bound("a", false, true), bound("b", false, false)];
        let set = effective_decisions(&perms, &[grant("a", false), grant("b", true)]);
        assert_eq!(keys(&set), vec!["b"]);
    }

    #[test]
    fn test_default_allow_without_row() {
        let perms = vec![bound("a", false, true), bound("b", false, false)];
        let set = effective_decisions(&perms, &[]);
        assert_eq!(keys(&set), vec!["a"]);
    }

    #[test]
    fn test_grants_for_unbound_keys_are_ignored() {
        let perms = vec![bound("a", false, false)];
        let set = effective_decisions(&perms, &[grant("ghost", true)]);
        assert!(set.is_empty());
    }

    #[test]
    fn test_check_settable() {
        let perms = vec![bound("r", true, false), bound("a", false, false)];
        assert!(matches!(
            check_settable(&perms, &"r".into()),
            Err(CoreError::PermissionLocked(_))
        ));
        assert!(matches!(
            check_settable(&perms, &"zzz".into()),
            Err(CoreError::PermissionNotFound(_))
        ));
        assert_eq!(check_settable(&perms, &"a".into()).unwrap().key().as_str(), "a");
    }

    #[test]
    fn test_normalize_selection() {
        let perms = vec![bound("r", true, false), bound("a", false, false), bound("b", false, false)];
        let set = normalize_selection(&perms, &["b".into(), "a".into(), "b".into()]).unwrap();
        assert_eq!(keys(&set), vec!["a", "b", "r"]);
        assert!(matches!(
            normalize_selection(&perms, &["nope".into()]),
            Err(CoreError::PermissionNotFound(_))
        ));
    }

    proptest! {
        #[test]
        fn prop_merge_respects_required_and_bindings(
            flags in prop::collection::vec((any::<bool>(), any::<bool>(), prop::option::of(any::<bool>())), 0..12)
        ) {
            let perms: Vec<_> = flags
                .iter()
                .enumerate()
                .map(|(i, (req, allow, _))| bound(&format!("p{}", i), *req, *allow))
                .collect();
            let grants: Vec<_> = flags
                .iter()
                .enumerate()
                .filter_map(|(i, (_, _, g))| g.map(|granted| grant(&format!("p{}", i), granted)))
                .collect();

            let set = effective_decisions(&perms, &grants);
            for (i, (req, allow, g)) in flags.iter().enumerate() {
                let key = PermKey::new(format!("p{}", i));
                let expected = *req || g.unwrap_or(*allow);
                prop_assert_eq!(set.contains(&key), expected);
            }
            prop_assert!(set.len() <= perms.len());
        }
    }
}
