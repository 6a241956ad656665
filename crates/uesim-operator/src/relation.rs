//! Relation Data Codec and relation watch index
//!
//! The gNB peer publishes its radio endpoint data as flat string key/values
//! in a ConfigMap (the relation data bus). [`GnbRelationData::from_map`]
//! turns that map into a typed value, distinguishing keys that have not
//! arrived yet (a normal transient state) from values that are malformed
//! (requires an external fix).
//!
//! [`RelationIndex`] records which units reference which relation ConfigMap
//! so ConfigMap watch events can be mapped back to the affected units. It
//! is rebuilt as units are reconciled; losing it only delays a re-trigger
//! until the next periodic requeue.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::RwLock;

use uesim_common::{Error, Result};

/// Mandatory relation key: gNB RAN address
pub const KEY_ADDRESS: &str = "address";
/// Mandatory relation key: PLMN identifier (MCC+MNC, 5 or 6 digits)
pub const KEY_PLMN_ID: &str = "plmn-id";

/// Typed view of the data published by the gNB peer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GnbRelationData {
    /// gNB address on the RAN network
    pub address: String,
    /// Mobile Country Code (first 3 digits of the PLMN)
    pub mcc: String,
    /// Mobile Network Code (remaining 2 or 3 digits of the PLMN)
    pub mnc: String,
}

impl GnbRelationData {
    /// Decode relation data from a ConfigMap's key/value map.
    ///
    /// Returns `MissingRelationData` listing every absent mandatory key
    /// (so the unit status can name all of them at once), or
    /// `ConfigInvalid` when a present value is malformed.
    pub fn from_map(relation: &str, data: &BTreeMap<String, String>) -> Result<Self> {
        let missing: Vec<&str> = [KEY_ADDRESS, KEY_PLMN_ID]
            .into_iter()
            .filter(|key| data.get(*key).map(String::as_str).unwrap_or("").is_empty())
            .collect();
        if !missing.is_empty() {
            return Err(Error::missing_relation_data(relation, missing));
        }

        let address = data[KEY_ADDRESS].clone();
        let (mcc, mnc) = split_plmn(&data[KEY_PLMN_ID])?;

        Ok(Self { address, mcc, mnc })
    }
}

/// Split a PLMN identifier into MCC and MNC.
///
/// A PLMN ID is 5 or 6 decimal digits: a 3-digit MCC followed by a
/// 2- or 3-digit MNC (e.g. `00101` is MCC 001, MNC 01).
fn split_plmn(plmn: &str) -> Result<(String, String)> {
    let valid_len = plmn.len() == 5 || plmn.len() == 6;
    if !valid_len || !plmn.bytes().all(|b| b.is_ascii_digit()) {
        return Err(Error::config_invalid(
            KEY_PLMN_ID,
            format!("'{}' must be 5 or 6 decimal digits (MCC+MNC)", plmn),
        ));
    }
    Ok((plmn[..3].to_string(), plmn[3..].to_string()))
}

/// Index from relation ConfigMap to the units referencing it.
///
/// Consulted by the ConfigMap watch mapper to decide which units to
/// re-reconcile when relation data changes or disappears.
#[derive(Default)]
pub struct RelationIndex {
    // (namespace, configmap name) -> unit names
    entries: RwLock<HashMap<(String, String), BTreeSet<String>>>,
}

impl RelationIndex {
    /// Create an empty index
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `unit` (in `namespace`) reads relation data from
    /// ConfigMap `relation`. Drops any previous relation entry for the
    /// unit so renamed references do not leave stale mappings.
    pub fn put(&self, namespace: &str, unit: &str, relation: &str) {
        let mut entries = self.entries.write().expect("relation index poisoned");
        entries.retain(|(ns, rel), units| {
            if ns == namespace && rel != relation {
                units.remove(unit);
            }
            !units.is_empty()
        });
        entries
            .entry((namespace.to_string(), relation.to_string()))
            .or_default()
            .insert(unit.to_string());
    }

    /// Remove a unit from the index (unit deleted).
    pub fn remove_unit(&self, namespace: &str, unit: &str) {
        let mut entries = self.entries.write().expect("relation index poisoned");
        entries.retain(|(ns, _), units| {
            if ns == namespace {
                units.remove(unit);
            }
            !units.is_empty()
        });
    }

    /// Units in `namespace` referencing ConfigMap `relation`.
    pub fn units_for(&self, namespace: &str, relation: &str) -> Vec<String> {
        self.entries
            .read()
            .expect("relation index poisoned")
            .get(&(namespace.to_string(), relation.to_string()))
            .map(|units| units.iter().cloned().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_map() -> BTreeMap<String, String> {
        BTreeMap::from([
            ("address".to_string(), "10.0.0.5".to_string()),
            ("plmn-id".to_string(), "00101".to_string()),
        ])
    }

    /// Scenario: address=10.0.0.5, plmn-id=00101 decodes into a full
    /// typed view with the PLMN split into MCC/MNC.
    #[test]
    fn decodes_complete_relation_data() {
        let data = GnbRelationData::from_map("gnb-data", &full_map()).unwrap();
        assert_eq!(data.address, "10.0.0.5");
        assert_eq!(data.mcc, "001");
        assert_eq!(data.mnc, "01");
    }

    #[test]
    fn six_digit_plmn_gives_three_digit_mnc() {
        let mut map = full_map();
        map.insert("plmn-id".to_string(), "310170".to_string());
        let data = GnbRelationData::from_map("gnb-data", &map).unwrap();
        assert_eq!(data.mcc, "310");
        assert_eq!(data.mnc, "170");
    }

    /// Absent keys are a normal transient state, reported all at once.
    #[test]
    fn missing_keys_are_all_reported() {
        let err = GnbRelationData::from_map("gnb-data", &BTreeMap::new()).unwrap_err();
        match err {
            Error::MissingRelationData { relation, keys } => {
                assert_eq!(relation, "gnb-data");
                assert_eq!(keys, vec!["address", "plmn-id"]);
            }
            other => panic!("expected MissingRelationData, got {:?}", other),
        }
    }

    /// Empty values count as absent, not malformed.
    #[test]
    fn empty_value_counts_as_missing() {
        let mut map = full_map();
        map.insert("address".to_string(), String::new());
        let err = GnbRelationData::from_map("gnb-data", &map).unwrap_err();
        match err {
            Error::MissingRelationData { ref keys, .. } => assert_eq!(keys, &vec!["address"]),
            other => panic!("expected MissingRelationData, got {:?}", other),
        }
        assert!(err.is_retryable());
    }

    /// A present but malformed PLMN is a validation failure, not a wait.
    #[test]
    fn malformed_plmn_is_config_invalid() {
        let mut map = full_map();
        map.insert("plmn-id".to_string(), "12ab5".to_string());
        let err = GnbRelationData::from_map("gnb-data", &map).unwrap_err();
        match &err {
            Error::ConfigInvalid { field, .. } => assert_eq!(field, "plmn-id"),
            other => panic!("expected ConfigInvalid, got {:?}", other),
        }
        assert!(!err.is_retryable());

        map.insert("plmn-id".to_string(), "0010".to_string());
        assert!(matches!(
            GnbRelationData::from_map("gnb-data", &map),
            Err(Error::ConfigInvalid { .. })
        ));
    }

    #[test]
    fn index_maps_relation_to_units() {
        let index = RelationIndex::new();
        index.put("ran", "ue-0", "gnb-data");
        index.put("ran", "ue-1", "gnb-data");
        index.put("other", "ue-0", "gnb-data");

        assert_eq!(index.units_for("ran", "gnb-data"), vec!["ue-0", "ue-1"]);
        assert_eq!(index.units_for("other", "gnb-data"), vec!["ue-0"]);
        assert!(index.units_for("ran", "unrelated").is_empty());
    }

    #[test]
    fn index_drops_stale_reference_on_rename() {
        let index = RelationIndex::new();
        index.put("ran", "ue-0", "gnb-a");
        index.put("ran", "ue-0", "gnb-b");

        assert!(index.units_for("ran", "gnb-a").is_empty());
        assert_eq!(index.units_for("ran", "gnb-b"), vec!["ue-0"]);
    }

    #[test]
    fn index_removes_deleted_units() {
        let index = RelationIndex::new();
        index.put("ran", "ue-0", "gnb-data");
        index.remove_unit("ran", "ue-0");
        assert!(index.units_for("ran", "gnb-data").is_empty());
    }
}
