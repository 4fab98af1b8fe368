//! Rule statistics for the `/stats` endpoint, derived from the rule store only

use serde::Serialize;
use std::collections::BTreeMap;

use crate::rule::{RuleRecord, Table};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TableStats {
    pub total: usize,
    pub enabled: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleStats {
    pub total_configs: usize,
    pub enabled_configs: usize,
    pub disabled_configs: usize,
    /// Keyed by table name; all four tables are always present
    pub by_table: BTreeMap<String, TableStats>,
}

/// Count rules, optionally only those of one server
pub fn compute(rules: &[RuleRecord], server_id: Option<&str>) -> RuleStats {
    let mut stats = RuleStats {
        by_table: Table::ALL
            .iter()
            .map(|t| (t.as_str().to_string(), TableStats::default()))
            .collect(),
        ..RuleStats::default()
    };

    for rule in rules
        .iter()
        .filter(|r| server_id.map_or(true, |s| r.server_id == s))
    {
        stats.total_configs += 1;
        if rule.is_enabled {
            stats.enabled_configs += 1;
        } else {
            stats.disabled_configs += 1;
        }

        // Unparseable tables are still counted under their raw name
        let table = rule
            .table
            .parse::<Table>()
            .map(|t| t.as_str().to_string())
            .unwrap_or_else(|_| rule.table.trim().to_string());
        let entry = stats.by_table.entry(table).or_default();
        entry.total += 1;
        if rule.is_enabled {
            entry.enabled += 1;
        }
    }

    stats
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules() -> Vec<RuleRecord> {
        let mut disabled = RuleRecord::new(3, "S1", "INPUT", "DROP");
        disabled.is_enabled = false;
        let mut nat = RuleRecord::new(4, "S2", "POSTROUTING", "MASQUERADE");
        nat.table = "nat".into();
        vec![
            RuleRecord::new(1, "S1", "INPUT", "ACCEPT"),
            RuleRecord::new(2, "S1", "OUTPUT", "ACCEPT"),
            disabled,
            nat,
        ]
    }

    #[test]
    fn test_global_stats() {
        let stats = compute(&rules(), None);
        assert_eq!(stats.total_configs, 4);
        assert_eq!(stats.enabled_configs, 3);
        assert_eq!(stats.disabled_configs, 1);
        assert_eq!(stats.by_table["filter"], TableStats { total: 3, enabled: 2 });
        assert_eq!(stats.by_table["nat"], TableStats { total: 1, enabled: 1 });
        assert_eq!(stats.by_table["raw"], TableStats::default());
    }

    #[test]
    fn test_per_server_stats() {
        let stats = compute(&rules(), Some("S2"));
        assert_eq!(stats.total_configs, 1);
        assert_eq!(stats.by_table["filter"].total, 0);
        assert_eq!(stats.by_table["nat"].total, 1);
    }

    #[test]
    fn test_serialized_keys() {
        let json = serde_json::to_value(compute(&[], None)).unwrap();
        assert_eq!(json["totalConfigs"], 0);
        assert!(json["byTable"]["mangle"].is_object());
    }
}
