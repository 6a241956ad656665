//! Config Renderer
//!
//! Turns a [`DesiredConfig`] snapshot into the exact UERANSIM `ue.yaml`
//! content the workload process requires, plus a SHA-256 fingerprint used
//! for change detection.
//!
//! Rendering is a pure function: no I/O, and identical input produces
//! byte-identical output. All fields are validated up front so the
//! reconciler can turn a malformed value into a Blocked status instead of
//! pushing broken config into the workload.

use sha2::{Digest, Sha256};

use uesim_common::crd::UESimulatorSpec;
use uesim_common::{Error, Result};

use crate::relation::GnbRelationData;

/// The set of values needed to render the workload configuration file.
///
/// Immutable snapshot computed fresh each reconciliation pass from relation
/// data plus the CR spec; never partially applied.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DesiredConfig {
    /// gNB RAN address from the relation
    pub gnb_address: String,
    /// Mobile Country Code (3 digits), from the relation PLMN
    pub mcc: String,
    /// Mobile Network Code (2 or 3 digits), from the relation PLMN
    pub mnc: String,
    /// Subscriber SUPI (`imsi-` + 15 digits)
    pub supi: String,
    /// USIM permanent key K (32 hex chars)
    pub usim_key: String,
    /// USIM operator code OPc (32 hex chars)
    pub usim_opc: String,
    /// Device IMEI (15 digits)
    pub imei: String,
    /// Slice/Service Type for the default session
    pub sst: u8,
    /// Slice Differentiator for the default session (6 hex chars)
    pub sd: String,
    /// Access Point Name for the default session
    pub apn: String,
}

impl DesiredConfig {
    /// Build the desired configuration from relation data and the CR spec.
    pub fn new(relation: &GnbRelationData, spec: &UESimulatorSpec) -> Self {
        Self {
            gnb_address: relation.address.clone(),
            mcc: relation.mcc.clone(),
            mnc: relation.mnc.clone(),
            supi: spec.supi.clone(),
            usim_key: spec.usim_key.clone(),
            usim_opc: spec.usim_opc.clone(),
            imei: spec.imei.clone(),
            sst: spec.sst,
            sd: spec.sd.clone(),
            apn: spec.apn.clone(),
        }
    }
}

/// Rendered configuration: file content plus its content fingerprint.
///
/// Invariant: an identical fingerprint means the workload already carries
/// this exact configuration and no restart is needed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RenderedConfig {
    /// Exact file content to push to the workload
    pub content: String,
    /// SHA-256 hex digest of `content`
    pub fingerprint: String,
}

/// Compute the SHA-256 hex fingerprint of config file content.
///
/// Shared by the renderer and the workload-side config read so both sides
/// hash identically.
pub fn fingerprint(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    hex_encode(&hasher.finalize())
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Render the UE configuration file for the given desired state.
///
/// Fails with `ConfigInvalid` naming the offending field when a value is
/// missing or malformed.
pub fn render(desired: &DesiredConfig) -> Result<RenderedConfig> {
    validate(desired)?;

    let content = format!(
        "# UERANSIM UE configuration. Generated by uesim-operator; do not edit.\n\
         supi: '{supi}'\n\
         mcc: '{mcc}'\n\
         mnc: '{mnc}'\n\
         \n\
         key: '{key}'\n\
         op: '{opc}'\n\
         opType: 'OPC'\n\
         amf: '8000'\n\
         imei: '{imei}'\n\
         \n\
         gnbSearchList:\n\
         \x20 - {gnb_address}\n\
         \n\
         uacAic:\n\
         \x20 mps: false\n\
         \x20 mcs: false\n\
         \n\
         uacAcc:\n\
         \x20 normalClass: 0\n\
         \x20 class11: false\n\
         \x20 class12: false\n\
         \x20 class13: false\n\
         \x20 class14: false\n\
         \x20 class15: false\n\
         \n\
         sessions:\n\
         \x20 - type: 'IPv4'\n\
         \x20   apn: '{apn}'\n\
         \x20   slice:\n\
         \x20     sst: {sst}\n\
         \x20     sd: 0x{sd}\n\
         \n\
         configured-nssai:\n\
         \x20 - sst: {sst}\n\
         \x20   sd: 0x{sd}\n\
         \n\
         default-nssai:\n\
         \x20 - sst: {sst}\n\
         \x20   sd: 0x{sd}\n\
         \n\
         integrity:\n\
         \x20 IA1: true\n\
         \x20 IA2: true\n\
         \x20 IA3: true\n\
         \n\
         ciphering:\n\
         \x20 EA1: true\n\
         \x20 EA2: true\n\
         \x20 EA3: true\n\
         \n\
         integrityMaxRate:\n\
         \x20 uplink: 'full'\n\
         \x20 downlink: 'full'\n",
        supi = desired.supi,
        mcc = desired.mcc,
        mnc = desired.mnc,
        key = desired.usim_key,
        opc = desired.usim_opc,
        imei = desired.imei,
        gnb_address = desired.gnb_address,
        apn = desired.apn,
        sst = desired.sst,
        sd = desired.sd,
    );

    let fingerprint = fingerprint(&content);
    Ok(RenderedConfig {
        content,
        fingerprint,
    })
}

fn validate(desired: &DesiredConfig) -> Result<()> {
    if desired.gnb_address.parse::<std::net::IpAddr>().is_err() {
        return Err(Error::config_invalid(
            "address",
            format!("'{}' is not a valid IP address", desired.gnb_address),
        ));
    }
    if !is_digits(&desired.mcc, 3) {
        return Err(Error::config_invalid(
            "mcc",
            format!("'{}' must be exactly 3 digits", desired.mcc),
        ));
    }
    if !is_digits(&desired.mnc, 2) && !is_digits(&desired.mnc, 3) {
        return Err(Error::config_invalid(
            "mnc",
            format!("'{}' must be 2 or 3 digits", desired.mnc),
        ));
    }
    match desired.supi.strip_prefix("imsi-") {
        Some(digits) if is_digits(digits, 15) => {}
        _ => {
            return Err(Error::config_invalid(
                "supi",
                format!("'{}' must match imsi-<15 digits>", desired.supi),
            ))
        }
    }
    if !is_hex(&desired.usim_key, 32) {
        return Err(Error::config_invalid(
            "usim-key",
            "must be 32 hexadecimal characters",
        ));
    }
    if !is_hex(&desired.usim_opc, 32) {
        return Err(Error::config_invalid(
            "usim-opc",
            "must be 32 hexadecimal characters",
        ));
    }
    if !is_digits(&desired.imei, 15) {
        return Err(Error::config_invalid(
            "imei",
            format!("'{}' must be exactly 15 digits", desired.imei),
        ));
    }
    if !is_hex(&desired.sd, 6) {
        return Err(Error::config_invalid(
            "sd",
            format!("'{}' must be 6 hexadecimal characters", desired.sd),
        ));
    }
    if desired.apn.is_empty() {
        return Err(Error::config_invalid("apn", "must not be empty"));
    }
    Ok(())
}

fn is_digits(s: &str, len: usize) -> bool {
    s.len() == len && s.bytes().all(|b| b.is_ascii_digit())
}

fn is_hex(s: &str, len: usize) -> bool {
    s.len() == len && s.bytes().all(|b| b.is_ascii_hexdigit())
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn sample_desired() -> DesiredConfig {
        DesiredConfig {
            gnb_address: "10.0.0.5".to_string(),
            mcc: "001".to_string(),
            mnc: "01".to_string(),
            supi: "imsi-001010000000001".to_string(),
            usim_key: "465B5CE8B199B49FAA5F0A2EE238A6BC".to_string(),
            usim_opc: "E8ED289DEBA952E4283B54E88E6183CA".to_string(),
            imei: "356938035643803".to_string(),
            sst: 1,
            sd: "010203".to_string(),
            apn: "internet".to_string(),
        }
    }

    /// Determinism: identical input produces byte-identical output and the
    /// same fingerprint.
    #[test]
    fn render_is_deterministic() {
        let desired = sample_desired();
        let a = render(&desired).unwrap();
        let b = render(&desired).unwrap();
        assert_eq!(a.content, b.content);
        assert_eq!(a.fingerprint, b.fingerprint);
    }

    /// Scenario: relation provides address and PLMN, the rendered file
    /// carries both.
    #[test]
    fn render_contains_relation_values() {
        let rendered = render(&sample_desired()).unwrap();
        assert!(rendered.content.contains("- 10.0.0.5"));
        assert!(rendered.content.contains("mcc: '001'"));
        assert!(rendered.content.contains("mnc: '01'"));
        assert!(rendered.content.contains("supi: 'imsi-001010000000001'"));
        assert!(rendered.content.contains("sd: 0x010203"));
    }

    /// A changed gNB address yields a different fingerprint.
    #[test]
    fn address_change_changes_fingerprint() {
        let f1 = render(&sample_desired()).unwrap().fingerprint;
        let mut changed = sample_desired();
        changed.gnb_address = "10.0.0.6".to_string();
        let f2 = render(&changed).unwrap().fingerprint;
        assert_ne!(f1, f2);
    }

    #[test]
    fn fingerprint_is_sha256_hex() {
        let fp = fingerprint("hello");
        assert_eq!(fp.len(), 64);
        assert_eq!(
            fp,
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn invalid_address_names_the_field() {
        let mut desired = sample_desired();
        desired.gnb_address = "not-an-ip".to_string();
        match render(&desired) {
            Err(Error::ConfigInvalid { field, .. }) => assert_eq!(field, "address"),
            other => panic!("expected ConfigInvalid, got {:?}", other),
        }
    }

    #[test]
    fn invalid_supi_names_the_field() {
        let mut desired = sample_desired();
        desired.supi = "001010000000001".to_string();
        match render(&desired) {
            Err(Error::ConfigInvalid { field, .. }) => assert_eq!(field, "supi"),
            other => panic!("expected ConfigInvalid, got {:?}", other),
        }
    }

    #[test]
    fn invalid_usim_key_rejected() {
        let mut desired = sample_desired();
        desired.usim_key = "too-short".to_string();
        assert!(matches!(
            render(&desired),
            Err(Error::ConfigInvalid { .. })
        ));
    }

    #[test]
    fn three_digit_mnc_accepted() {
        let mut desired = sample_desired();
        desired.mnc = "011".to_string();
        assert!(render(&desired).is_ok());
    }

    #[test]
    fn rendered_content_is_valid_yaml() {
        let rendered = render(&sample_desired()).unwrap();
        let value: serde_yaml::Value = serde_yaml::from_str(&rendered.content).unwrap();
        assert_eq!(
            value.get("supi").and_then(|v| v.as_str()),
            Some("imsi-001010000000001")
        );
        assert!(value.get("gnbSearchList").is_some());
    }
}
