//! Rule Store collaborator: where rule records and known servers come from
//!
//! Rule CRUD lives outside this service; the orchestrator only reads.
//! `InMemoryRuleStore` is the built-in implementation, loadable from a
//! TOML inventory of `[[rules]]` tables.

use dashmap::DashMap;
use serde::Deserialize;
use std::path::Path;
use tracing::{info, warn};

use crate::assembler::sort_rules;
use crate::error::{EntityKind, OrchestratorError, Result};
use crate::rule::{RuleId, RuleRecord};

pub trait RuleStore: Send + Sync {
    /// Known server ids, sorted
    fn servers(&self) -> Vec<String>;

    fn server_exists(&self, server_id: &str) -> bool;

    /// A server's rules in script order; `NotFound` for unknown servers
    fn rules_for_server(&self, server_id: &str) -> Result<Vec<RuleRecord>>;

    /// Every rule across all servers
    fn all_rules(&self) -> Vec<RuleRecord>;
}

#[derive(Debug, Deserialize)]
struct RulesFile {
    #[serde(default)]
    rules: Vec<RuleRecord>,
}

/// Rules grouped by server id
#[derive(Debug, Default)]
pub struct InMemoryRuleStore {
    servers: DashMap<String, Vec<RuleRecord>>,
}

impl InMemoryRuleStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a TOML rules inventory
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let file: RulesFile = toml::from_str(contents)
            .map_err(|e| OrchestratorError::Config(format!("invalid rules file: {e}")))?;

        let store = Self::new();
        for rule in file.rules {
            store.upsert(rule);
        }
        Ok(store)
    }

    /// Load the rules file at `path`; a missing file yields an empty store
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            warn!("Rules file not found: {}", path.display());
            return Ok(Self::new());
        }

        let contents = std::fs::read_to_string(path)?;
        let store = Self::from_toml_str(&contents)?;
        info!(
            "Loaded {} rules for {} servers from {}",
            store.all_rules().len(),
            store.servers.len(),
            path.display()
        );
        Ok(store)
    }

    /// Make a server known even if it has no rules yet
    pub fn register_server(&self, server_id: &str) {
        self.servers.entry(server_id.to_string()).or_default();
    }

    /// Insert or replace a rule (matched by server and id)
    pub fn upsert(&self, rule: RuleRecord) {
        let mut rules = self.servers.entry(rule.server_id.clone()).or_default();
        match rules.iter().position(|r| r.id == rule.id) {
            Some(pos) => rules[pos] = rule,
            None => rules.push(rule),
        }
    }

    pub fn remove(&self, server_id: &str, rule_id: &RuleId) -> Result<RuleRecord> {
        let mut rules = self
            .servers
            .get_mut(server_id)
            .ok_or_else(|| OrchestratorError::not_found(EntityKind::Server, server_id))?;
        let pos = rules
            .iter()
            .position(|r| &r.id == rule_id)
            .ok_or_else(|| OrchestratorError::not_found(EntityKind::Rule, rule_id.to_string()))?;
        Ok(rules.remove(pos))
    }
}

impl RuleStore for InMemoryRuleStore {
    fn servers(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.servers.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    fn server_exists(&self, server_id: &str) -> bool {
        self.servers.contains_key(server_id)
    }

    fn rules_for_server(&self, server_id: &str) -> Result<Vec<RuleRecord>> {
        let mut rules = self
            .servers
            .get(server_id)
            .map(|r| r.value().clone())
            .ok_or_else(|| OrchestratorError::not_found(EntityKind::Server, server_id))?;
        sort_rules(&mut rules);
        Ok(rules)
    }

    fn all_rules(&self) -> Vec<RuleRecord> {
        let mut rules: Vec<RuleRecord> = Vec::new();
        for server in self.servers() {
            if let Some(entry) = self.servers.get(&server) {
                let mut server_rules = entry.value().clone();
                sort_rules(&mut server_rules);
                rules.extend(server_rules);
            }
        }
        rules
    }
}
