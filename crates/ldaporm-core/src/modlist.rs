//! Modlist planning
//!
//! Computes the attribute list for a new entry and the minimal set of
//! modifications that turns an existing entry into its new state.
//!
//! An attribute whose new value is empty is always deleted, never replaced
//! with an empty value list. Deletions are emitted before replacements.

use std::collections::BTreeMap;

use crate::error::{DirectoryError, DirectoryResult};
use crate::model::{ModelMeta, OBJECTCLASS_ATTRIBUTE};
use crate::operation::{Attributes, Modification};

/// Result of comparing two attribute maps.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModlistDiff {
    /// Attributes to remove entirely.
    pub deletions: Vec<String>,
    /// Attributes whose values are replaced.
    pub replacements: Vec<(String, Vec<Vec<u8>>)>,
}

impl ModlistDiff {
    pub fn is_empty(&self) -> bool {
        self.deletions.is_empty() && self.replacements.is_empty()
    }

    pub fn len(&self) -> usize {
        self.deletions.len() + self.replacements.len()
    }

    /// Modifications in wire order: every deletion, then every replacement.
    pub fn into_modifications(self) -> Vec<Modification> {
        self.deletions
            .into_iter()
            .map(Modification::Delete)
            .chain(
                self.replacements
                    .into_iter()
                    .map(|(name, values)| Modification::Replace(name, values)),
            )
            .collect()
    }
}

/// A value list counts as empty when it has no values or only empty ones.
pub fn is_empty_value(values: &[Vec<u8>]) -> bool {
    values.iter().all(|v| v.is_empty())
}

fn non_empty(values: &[Vec<u8>]) -> Vec<Vec<u8>> {
    values.iter().filter(|v| !v.is_empty()).cloned().collect()
}

/// Attribute map keyed by lowercased name, remembering the original spelling.
fn fold_case(attrs: &Attributes) -> BTreeMap<String, (&str, &[Vec<u8>])> {
    attrs
        .iter()
        .map(|(name, values)| {
            (
                name.to_ascii_lowercase(),
                (name.as_str(), values.as_slice()),
            )
        })
        .collect()
}

/// Compare two attribute maps attribute by attribute.
///
/// Only attributes accepted by `is_editable` are compared. Attributes missing
/// from either side count as empty.
pub fn diff_attributes<F>(new: &Attributes, old: &Attributes, is_editable: F) -> ModlistDiff
where
    F: Fn(&str) -> bool,
{
    let new = fold_case(new);
    let old = fold_case(old);
    let mut diff = ModlistDiff::default();

    let mut keys: Vec<&String> = new.keys().chain(old.keys()).collect();
    keys.sort();
    keys.dedup();

    for key in keys {
        let (name, new_values) = match (new.get(key), old.get(key)) {
            (Some((name, values)), _) => (*name, *values),
            (None, Some((name, _))) => (*name, &[][..]),
            (None, None) => continue,
        };
        if !is_editable(name) {
            continue;
        }
        let old_values = old.get(key).map(|(_, v)| *v).unwrap_or(&[]);

        let new_clean = non_empty(new_values);
        let old_clean = non_empty(old_values);
        if new_clean == old_clean {
            continue;
        }

        if new_clean.is_empty() {
            diff.deletions.push(name.to_string());
        } else {
            diff.replacements.push((name.to_string(), new_clean));
        }
    }

    diff
}

/// Plan the modifications that turn `old` into `new` for a model entry.
///
/// Undeclared and read-only attributes are ignored. The object class list is
/// only compared when `new` carries one.
pub fn compute_update(meta: &ModelMeta, new: &Attributes, old: &Attributes) -> ModlistDiff {
    let has_objectclass = new
        .keys()
        .any(|k| k.eq_ignore_ascii_case(OBJECTCLASS_ATTRIBUTE));

    diff_attributes(new, old, |attribute| {
        if attribute.eq_ignore_ascii_case(OBJECTCLASS_ATTRIBUTE) {
            has_objectclass
        } else {
            meta.field_for_attribute(attribute)
                .is_some_and(|f| f.editable)
        }
    })
}

/// Build the attribute list for a brand-new entry.
///
/// Empty attributes and read-only or undeclared attributes are dropped. The
/// object class list comes from `attrs` when present, otherwise from the model.
pub fn compute_add(
    meta: &ModelMeta,
    attrs: &Attributes,
) -> DirectoryResult<Vec<(String, Vec<Vec<u8>>)>> {
    let mut objectclasses: Vec<Vec<u8>> = attrs
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(OBJECTCLASS_ATTRIBUTE))
        .map(|(_, v)| non_empty(v))
        .unwrap_or_default();
    if objectclasses.is_empty() {
        objectclasses = meta
            .all_objectclasses()
            .into_iter()
            .map(String::into_bytes)
            .collect();
    }
    if objectclasses.is_empty() {
        return Err(DirectoryError::config(format!(
            "model {} has no objectclass to add entries with",
            meta.name
        )));
    }

    let mut modlist = vec![(OBJECTCLASS_ATTRIBUTE.to_string(), objectclasses)];
    for (name, values) in attrs {
        if name.eq_ignore_ascii_case(OBJECTCLASS_ATTRIBUTE) {
            continue;
        }
        let editable = meta.field_for_attribute(name).is_some_and(|f| f.editable);
        if !editable || is_empty_value(values) {
            continue;
        }
        modlist.push((name.clone(), non_empty(values)));
    }

    Ok(modlist)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::FieldSpec;
    use proptest::prelude::*;

    fn meta() -> ModelMeta {
        ModelMeta::builder("User")
            .basedn("ou=users,dc=example,dc=com")
            .objectclass("posixAccount")
            .extra_objectclasses(["top"])
            .field(FieldSpec::string("uid").primary_key())
            .field(FieldSpec::string("cn"))
            .field(FieldSpec::string("mail"))
            .field(FieldSpec::integer("uidNumber"))
            .field(FieldSpec::string("entryUUID").read_only())
            .build()
            .unwrap()
    }

    fn attrs(pairs: &[(&str, &[&str])]) -> Attributes {
        pairs
            .iter()
            .map(|(k, vs)| {
                (
                    k.to_string(),
                    vs.iter().map(|v| v.as_bytes().to_vec()).collect(),
                )
            })
            .collect()
    }

    #[test]
    fn test_update_no_changes() {
        let old = attrs(&[("uid", &["alice"]), ("cn", &["Alice"])]);
        let diff = compute_update(&meta(), &old.clone(), &old);
        assert!(diff.is_empty());
    }

    #[test]
    fn test_update_replace_and_delete() {
        let old = attrs(&[("uid", &["alice"]), ("cn", &["Alice"]), ("mail", &["a@x"])]);
        let new = attrs(&[("uid", &["alice"]), ("cn", &["Alice Smith"]), ("mail", &[])]);
        let diff = compute_update(&meta(), &new, &old);

        assert_eq!(diff.deletions, vec!["mail".to_string()]);
        assert_eq!(
            diff.replacements,
            vec![("cn".to_string(), vec![b"Alice Smith".to_vec()])]
        );
    }

    #[test]
    fn test_update_deletions_precede_replacements() {
        let old = attrs(&[("cn", &["Alice"]), ("mail", &["a@x"])]);
        let new = attrs(&[("cn", &["Alicia"]), ("mail", &[""])]);
        let mods = compute_update(&meta(), &new, &old).into_modifications();
        assert_eq!(
            mods,
            vec![
                Modification::Delete("mail".to_string()),
                Modification::Replace("cn".to_string(), vec![b"Alicia".to_vec()]),
            ]
        );
    }

    #[test]
    fn test_update_missing_old_is_empty() {
        let new = attrs(&[("mail", &["a@x"])]);
        let diff = compute_update(&meta(), &new, &Attributes::new());
        assert_eq!(diff.replacements.len(), 1);
        assert!(diff.deletions.is_empty());

        let new = attrs(&[("mail", &[])]);
        assert!(compute_update(&meta(), &new, &Attributes::new()).is_empty());
    }

    #[test]
    fn test_update_case_insensitive_names() {
        let old = attrs(&[("UIDNumber", &["1001"])]);
        let new = attrs(&[("uidNumber", &["1001"])]);
        assert!(compute_update(&meta(), &new, &old).is_empty());

        let new = attrs(&[("uidnumber", &["1002"])]);
        let diff = compute_update(&meta(), &new, &old);
        assert_eq!(diff.replacements[0].0, "uidnumber");
    }

    #[test]
    fn test_update_skips_read_only() {
        let old = attrs(&[("entryUUID", &["1"])]);
        let new = attrs(&[("entryUUID", &["2"])]);
        assert!(compute_update(&meta(), &new, &old).is_empty());
    }

    #[test]
    fn test_update_objectclass_only_when_given() {
        let old = attrs(&[("objectClass", &["top", "posixAccount"]), ("cn", &["A"])]);
        let new = attrs(&[("cn", &["A"])]);
        assert!(compute_update(&meta(), &new, &old).is_empty());

        let new = attrs(&[("objectClass", &["top", "posixAccount", "mailUser"]), ("cn", &["A"])]);
        let diff = compute_update(&meta(), &new, &old);
        assert_eq!(diff.replacements[0].0, "objectClass");
    }

    #[test]
    fn test_add_modlist() {
        let new = attrs(&[
            ("uid", &["alice"]),
            ("cn", &["Alice"]),
            ("mail", &[]),
            ("entryUUID", &["x"]),
            ("undeclared", &["y"]),
        ]);
        let modlist = compute_add(&meta(), &new).unwrap();
        assert_eq!(
            modlist[0],
            (
                "objectclass".to_string(),
                vec![b"top".to_vec(), b"posixAccount".to_vec()]
            )
        );
        let names: Vec<&str> = modlist.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["objectclass", "cn", "uid"]);
    }

    #[test]
    fn test_add_requires_objectclass() {
        let meta = ModelMeta::builder("Bare")
            .basedn("dc=example,dc=com")
            .field(FieldSpec::string("cn").primary_key())
            .build()
            .unwrap();
        let err = compute_add(&meta, &attrs(&[("cn", &["x"])])).unwrap_err();
        assert!(err.is_configuration());
    }

    fn value_list() -> impl Strategy<Value = Vec<Vec<u8>>> {
        prop::collection::vec(prop::sample::select(vec!["", "a", "b", "c"]), 0..3)
            .prop_map(|vs| vs.into_iter().map(|v| v.as_bytes().to_vec()).collect())
    }

    fn attr_map() -> impl Strategy<Value = Attributes> {
        prop::collection::btree_map(
            prop::sample::select(vec!["cn", "mail", "sn", "title"]).prop_map(String::from),
            value_list(),
            0..4,
        )
    }

    proptest! {
        #[test]
        fn test_diff_properties(new in attr_map(), old in attr_map()) {
            let diff = diff_attributes(&new, &old, |_| true);
            let empty = Vec::new();

            for key in ["cn", "mail", "sn", "title"] {
                let n = new.get(key).unwrap_or(&empty);
                let o = old.get(key).unwrap_or(&empty);
                let changed = non_empty(n) != non_empty(o);
                let deleted = diff.deletions.iter().filter(|d| d.as_str() == key).count();
                let replaced = diff.replacements.iter().filter(|(r, _)| r.as_str() == key).count();

                if !changed {
                    prop_assert_eq!(deleted + replaced, 0);
                } else if is_empty_value(n) {
                    prop_assert_eq!(deleted, 1);
                    prop_assert_eq!(replaced, 0);
                } else {
                    prop_assert_eq!(deleted, 0);
                    prop_assert_eq!(replaced, 1);
                }
            }

            for (_, values) in &diff.replacements {
                prop_assert!(!is_empty_value(values));
            }
        }
    }
}
