// afc-server: Ruleset ID / region string relations
//
// Each base regulatory domain carries TEST_ and DEMO_ derived variants
// whose configs are dispatched with the base region substituted, plus a
// non-listable DEFAULT alias for the first base domain.

use std::collections::HashMap;
use std::sync::OnceLock;

const DERIVED_PREFIXES: &[&str] = &["TEST_", "DEMO_"];

/// Base (region, ruleset) pairs; the first entry backs the DEFAULT alias
const BASE_DOMAINS: &[(&str, &str)] = &[
    ("US", "US_47_CFR_PART_15_SUBPART_E"),
    ("CA", "CA_RES_DBS-06"),
    ("BR", "BRAZIL_RULESETID"),
    ("GB", "UNITEDKINGDOM_RULESETID"),
];

#[derive(Debug, Clone)]
struct DomainDsc {
    region: String,
    ruleset: String,
    is_listable: bool,
    /// Region string to substitute into configs dispatched to the engine
    overwrite_region: Option<String>,
}

struct RegionTable {
    by_ruleset: HashMap<String, DomainDsc>,
    by_region: HashMap<String, DomainDsc>,
}

fn table() -> &'static RegionTable {
    static TABLE: OnceLock<RegionTable> = OnceLock::new();
    TABLE.get_or_init(|| {
        let mut by_ruleset = HashMap::new();
        let mut by_region = HashMap::new();
        for (idx, (region, ruleset)) in BASE_DOMAINS.iter().enumerate() {
            let base = DomainDsc {
                region: (*region).to_string(),
                ruleset: (*ruleset).to_string(),
                is_listable: true,
                overwrite_region: None,
            };
            by_ruleset.insert((*ruleset).to_string(), base.clone());
            by_region.insert((*region).to_string(), base);
            for prefix in DERIVED_PREFIXES {
                let derived = DomainDsc {
                    region: format!("{prefix}{region}"),
                    ruleset: format!("{prefix}{region}"),
                    is_listable: true,
                    overwrite_region: Some((*region).to_string()),
                };
                by_ruleset.insert(format!("{prefix}{ruleset}"), derived.clone());
                by_region.insert(format!("{prefix}{region}"), derived);
            }
            if idx == 0 {
                by_region.insert(
                    "DEFAULT".to_string(),
                    DomainDsc {
                        region: "DEFAULT".to_string(),
                        ruleset: (*ruleset).to_string(),
                        is_listable: false,
                        overwrite_region: None,
                    },
                );
            }
        }
        RegionTable {
            by_ruleset,
            by_region,
        }
    })
}

/// Region string of the config associated with a ruleset
pub fn ruleset_to_region(ruleset: &str) -> Option<String> {
    table()
        .by_ruleset
        .get(ruleset)
        .map(|dsc| dsc.region.clone())
}

/// Ruleset associated with a config region string
pub fn region_to_ruleset(region: &str) -> Option<String> {
    table().by_region.get(region).map(|dsc| dsc.ruleset.clone())
}

/// Base region to substitute when dispatching a derived region's config;
/// `None` for base/unknown regions (no rewrite)
pub fn overwrite_region(region: &str) -> Option<String> {
    table()
        .by_region
        .get(region)
        .and_then(|dsc| dsc.overwrite_region.clone())
}

/// All listable ruleset IDs
pub fn ruleset_list() -> Vec<String> {
    let mut rulesets: Vec<String> = table()
        .by_ruleset
        .iter()
        .filter(|(_, dsc)| dsc.is_listable)
        .map(|(ruleset, _)| ruleset.clone())
        .collect();
    rulesets.sort();
    rulesets
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_regions_not_rewritten() {
        assert_eq!(overwrite_region("US"), None);
        assert_eq!(overwrite_region("CA"), None);
    }

    #[test]
    fn test_derived_regions_rewritten_to_base() {
        assert_eq!(overwrite_region("TEST_US"), Some("US".to_string()));
        assert_eq!(overwrite_region("DEMO_GB"), Some("GB".to_string()));
    }

    #[test]
    fn test_unknown_region_not_rewritten() {
        assert_eq!(overwrite_region("XX"), None);
    }

    #[test]
    fn test_ruleset_region_round_trip() {
        assert_eq!(
            ruleset_to_region("US_47_CFR_PART_15_SUBPART_E"),
            Some("US".to_string())
        );
        assert_eq!(
            region_to_ruleset("US"),
            Some("US_47_CFR_PART_15_SUBPART_E".to_string())
        );
        // Derived domains key by the prefixed base ruleset
        assert_eq!(
            ruleset_to_region("TEST_US_47_CFR_PART_15_SUBPART_E"),
            Some("TEST_US".to_string())
        );
    }

    #[test]
    fn test_default_alias() {
        assert_eq!(
            region_to_ruleset("DEFAULT"),
            Some("US_47_CFR_PART_15_SUBPART_E".to_string())
        );
        assert!(!ruleset_list().contains(&"DEFAULT".to_string()));
    }
}
