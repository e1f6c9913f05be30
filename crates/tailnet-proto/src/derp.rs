//! DERP relay topology types
//!
//! The same types are carried on the wire (bincode) and loaded from the JSON
//! file the daemon watches, so they use Tailscale-style PascalCase names.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::{Ipv4Addr, Ipv6Addr};

/// Versioned snapshot of the relay topology
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct DerpMap {
    /// Assigned by the coordinator on every update; ignored when loading
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    pub home_params: HomeParams,
    #[serde(default)]
    pub regions: BTreeMap<u16, DerpRegion>,
    /// Clients should not try the built-in default regions
    #[serde(default)]
    pub omit_default_regions: bool,
}

impl DerpMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_region(&self, id: u16) -> Option<&DerpRegion> {
        self.regions.get(&id)
    }

    pub fn region_ids(&self) -> Vec<u16> {
        self.regions.keys().copied().collect()
    }

    /// Compare topology, ignoring the version stamp
    pub fn same_topology(&self, other: &DerpMap) -> bool {
        self.home_params == other.home_params
            && self.regions == other.regions
            && self.omit_default_regions == other.omit_default_regions
    }
}

/// Tuning for home region selection
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct HomeParams {
    /// Per-region multiplier applied to measured latency
    #[serde(default)]
    pub region_score: BTreeMap<u16, f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct DerpRegion {
    #[serde(rename = "RegionID")]
    pub region_id: u16,
    pub region_code: String,
    pub region_name: String,
    #[serde(default)]
    pub embedded_relay: bool,
    #[serde(default)]
    pub avoid: bool,
    #[serde(default)]
    pub nodes: Vec<DerpNode>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct DerpNode {
    pub name: String,
    #[serde(rename = "RegionID")]
    pub region_id: u16,
    pub host_name: String,
    #[serde(default, rename = "IPv4")]
    pub ipv4: Option<Ipv4Addr>,
    #[serde(default, rename = "IPv6")]
    pub ipv6: Option<Ipv6Addr>,
    #[serde(default, rename = "DERPPort")]
    pub derp_port: u16,
    #[serde(default, rename = "STUNPort")]
    pub stun_port: u16,
    #[serde(default)]
    pub stun_only: bool,
    #[serde(default)]
    pub can_port80: bool,
    #[serde(default)]
    pub force_http: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_region(id: u16, code: &str) -> DerpRegion {
        DerpRegion {
            region_id: id,
            region_code: code.to_string(),
            region_name: code.to_uppercase(),
            embedded_relay: false,
            avoid: false,
            nodes: vec![DerpNode {
                name: format!("{}a", id),
                region_id: id,
                host_name: format!("derp-{}.example.com", code),
                ipv4: Some("192.0.2.10".parse().unwrap()),
                ipv6: None,
                derp_port: 443,
                stun_port: 3478,
                stun_only: false,
                can_port80: true,
                force_http: false,
            }],
        }
    }

    #[test]
    fn test_parse_json_file_format() {
        let json = r#"{
            "Regions": {
                "1": {
                    "RegionID": 1,
                    "RegionCode": "nyc",
                    "RegionName": "New York",
                    "Nodes": [
                        {"Name": "1a", "RegionID": 1, "HostName": "derp1.example.com", "DERPPort": 443}
                    ]
                }
            }
        }"#;

        let map: DerpMap = serde_json::from_str(json).unwrap();
        assert_eq!(map.version, 0);
        assert_eq!(map.region_ids(), vec![1]);
        let region = map.get_region(1).unwrap();
        assert_eq!(region.region_code, "nyc");
        assert_eq!(region.nodes[0].derp_port, 443);
        assert!(region.nodes[0].ipv4.is_none());
    }

    #[test]
    fn test_same_topology_ignores_version() {
        let mut a = DerpMap::new();
        a.regions.insert(1, sample_region(1, "nyc"));
        let mut b = a.clone();
        b.version = 9;
        assert!(a.same_topology(&b));

        b.regions.insert(2, sample_region(2, "sfo"));
        assert!(!a.same_topology(&b));
    }

    #[test]
    fn test_bincode_roundtrip_keeps_addresses() {
        let mut map = DerpMap::new();
        map.version = 3;
        map.regions.insert(7, sample_region(7, "fra"));

        let bytes = bincode::serialize(&map).unwrap();
        let decoded: DerpMap = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded, map);
    }
}
