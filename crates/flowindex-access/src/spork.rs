//! Spork labels and their root heights.
//!
//! Node hostnames usually embed the spork they belong to
//! (`access-001.mainnet28.nodes.onflow.org`). The root height of that spork
//! is the lowest height the node can serve.

use std::collections::HashMap;

/// Mainnet spork number → root block height.
pub const MAINNET_SPORK_ROOTS: &[(u32, u64)] = &[
    (1, 7_601_063),
    (2, 8_742_959),
    (3, 9_737_133),
    (4, 9_992_020),
    (5, 12_020_337),
    (6, 12_609_237),
    (7, 13_404_174),
    (8, 13_950_742),
    (9, 14_892_104),
    (10, 15_791_891),
    (11, 16_755_602),
    (12, 17_544_523),
    (13, 18_587_478),
    (14, 19_050_753),
    (15, 21_291_692),
    (16, 23_830_813),
    (17, 27_341_470),
    (18, 31_735_955),
    (19, 35_858_811),
    (20, 40_171_634),
    (21, 44_950_207),
    (22, 47_169_687),
    (23, 55_114_467),
    (24, 65_264_619),
    (25, 85_981_135),
    (26, 88_226_267),
    (27, 130_290_659),
    (28, 137_390_146),
];

/// Pre-mainnet candidate spork number → root block height.
pub const CANDIDATE_SPORK_ROOTS: &[(u32, u64)] = &[
    (4, 1_065_711),
    (5, 2_033_592),
    (6, 3_187_931),
    (7, 4_132_133),
    (8, 4_972_987),
    (9, 6_483_246),
];

/// Extract the spork label (`mainnet28`, `candidate7`) embedded in a node address.
///
/// Returns `None` for generic endpoints such as `access.mainnet.nodes.onflow.org`.
pub fn spork_label(address: &str) -> Option<String> {
    let host = address
        .split_once("://")
        .map_or(address, |(_, rest)| rest);
    host.split(|c: char| c == '.' || c == ':' || c == '/')
        .find(|part| {
            ["mainnet", "candidate"].iter().any(|prefix| {
                part.strip_prefix(prefix)
                    .is_some_and(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()))
            })
        })
        .map(str::to_string)
}

/// Label → floor lookup, built from the compiled tables plus overrides.
#[derive(Debug, Clone)]
pub struct SporkTable {
    floors: HashMap<String, u64>,
}

impl Default for SporkTable {
    fn default() -> Self {
        Self::builtin()
    }
}

impl SporkTable {
    /// The compiled mainnet and candidate tables.
    pub fn builtin() -> Self {
        let floors = MAINNET_SPORK_ROOTS
            .iter()
            .map(|(n, h)| (format!("mainnet{n}"), *h))
            .chain(
                CANDIDATE_SPORK_ROOTS
                    .iter()
                    .map(|(n, h)| (format!("candidate{n}"), *h)),
            )
            .collect();
        Self { floors }
    }

    /// Add or replace entries (e.g. a spork newer than this build).
    pub fn with_overrides<I, K>(mut self, overrides: I) -> Self
    where
        I: IntoIterator<Item = (K, u64)>,
        K: Into<String>,
    {
        for (label, height) in overrides {
            self.floors.insert(label.into(), height);
        }
        self
    }

    pub fn floor_for_label(&self, label: &str) -> Option<u64> {
        self.floors.get(label).copied()
    }

    /// Floor of the node at `address`; 0 when unlabeled or unknown.
    pub fn floor_for_address(&self, address: &str) -> u64 {
        spork_label(address)
            .and_then(|label| self.floor_for_label(&label))
            .unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.floors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.floors.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_labels() {
        let cases = [
            ("access-001.mainnet28.nodes.onflow.org:9000", Some("mainnet28")),
            ("access-001.candidate9.nodes.onflow.org:9000", Some("candidate9")),
            ("https://access-003.mainnet23.nodes.onflow.org", Some("mainnet23")),
            ("access.mainnet.nodes.onflow.org:9000", None),
            ("archive.mainnet.nodes.onflow.org:9000", None),
            ("localhost:9000", None),
        ];
        for (addr, want) in cases {
            assert_eq!(spork_label(addr).as_deref(), want, "address {addr}");
        }
    }

    #[test]
    fn floors_for_candidate_and_mainnet() {
        let table = SporkTable::builtin();
        assert_eq!(table.floor_for_address("access-001.candidate7.nodes.onflow.org:9000"), 4_132_133);
        assert_eq!(table.floor_for_address("access-001.candidate8.nodes.onflow.org:9000"), 4_972_987);
        assert_eq!(table.floor_for_address("access-001.mainnet24.nodes.onflow.org:9000"), 65_264_619);
        assert_eq!(table.floor_for_address("access.mainnet.nodes.onflow.org:9000"), 0);
    }

    #[test]
    fn unknown_label_is_floor_zero_until_overridden() {
        let addr = "access-001.mainnet29.nodes.onflow.org:9000";
        assert_eq!(SporkTable::builtin().floor_for_address(addr), 0);
        let table = SporkTable::builtin().with_overrides([("mainnet29", 140_000_000)]);
        assert_eq!(table.floor_for_address(addr), 140_000_000);
    }
}
