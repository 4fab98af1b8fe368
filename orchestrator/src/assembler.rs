//! Script Assembler: renders the ordered rule script for one server
//!
//! Layout: optional shebang, comment banner, table flushes, then one
//! compiled command per rule in `(priority, id)` order.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::str::FromStr;

use crate::compiler::compile;
use crate::error::{OrchestratorError, Result};
use crate::rule::{RuleId, RuleRecord};

/// Flushes every table before the rules are re-added
pub const FLUSH_COMMANDS: [&str; 4] = [
    "iptables -F",
    "iptables -t nat -F",
    "iptables -t mangle -F",
    "iptables -t raw -F",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScriptFormat {
    #[default]
    Plain,
    Bash,
}

impl FromStr for ScriptFormat {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "plain" => Ok(Self::Plain),
            "bash" => Ok(Self::Bash),
            other => Err(OrchestratorError::validation(
                "format",
                format!("unknown script format '{other}'"),
            )),
        }
    }
}

/// One compiled rule in script order
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptLine {
    pub rule_id: RuleId,
    pub priority: i64,
    pub enabled: bool,
    pub command: String,
}

/// The rendered script plus the pieces the executor needs
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssembledScript {
    pub server_id: String,
    pub format: ScriptFormat,
    pub preamble: Vec<String>,
    pub lines: Vec<ScriptLine>,
    /// SHA-256 over the rule commands, used to detect unchanged rule sets
    pub fingerprint: String,
    pub text: String,
}

impl AssembledScript {
    pub fn rule_count(&self) -> usize {
        self.lines.len()
    }

    pub fn commands(&self) -> Vec<String> {
        self.lines.iter().map(|l| l.command.clone()).collect()
    }
}

/// Sort key for script order: priority ascending, ties broken by id ascending
pub fn sort_rules(rules: &mut [RuleRecord]) {
    rules.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.id.cmp(&b.id)));
}

/// Assemble the script for `server_id`.
///
/// `only_enabled` drops disabled rules (rebuilds); preview/export passes
/// `false`. Any rule that fails to compile fails the whole assembly.
pub fn assemble(
    server_id: &str,
    rules: &[RuleRecord],
    only_enabled: bool,
    format: ScriptFormat,
) -> Result<AssembledScript> {
    if let Some(foreign) = rules.iter().find(|r| r.server_id != server_id) {
        return Err(OrchestratorError::validation(
            "serverId",
            format!(
                "rule {} belongs to server '{}', not '{server_id}'",
                foreign.id, foreign.server_id
            ),
        ));
    }

    let mut selected: Vec<RuleRecord> = rules
        .iter()
        .filter(|r| !only_enabled || r.is_enabled)
        .cloned()
        .collect();
    sort_rules(&mut selected);

    let mut lines = Vec::with_capacity(selected.len());
    for rule in &selected {
        let command = compile(rule).map_err(|e| match e {
            OrchestratorError::Validation { field, message } => OrchestratorError::Validation {
                field,
                message: format!("rule {}: {message}", rule.id),
            },
            other => other,
        })?;
        lines.push(ScriptLine {
            rule_id: rule.id.clone(),
            priority: rule.priority,
            enabled: rule.is_enabled,
            command,
        });
    }

    let mut hasher = Sha256::new();
    for line in &lines {
        hasher.update(line.command.as_bytes());
        hasher.update(b"\n");
    }
    let fingerprint = format!("{:x}", hasher.finalize());

    let mut text = String::new();
    if format == ScriptFormat::Bash {
        text.push_str("#!/bin/bash\n");
    }
    text.push_str(&format!("# iptables rules for server {server_id}\n"));
    text.push_str(&format!(
        "# {} rule(s), {}\n",
        lines.len(),
        if only_enabled {
            "enabled only"
        } else {
            "including disabled"
        }
    ));
    text.push('\n');
    for cmd in FLUSH_COMMANDS {
        text.push_str(cmd);
        text.push('\n');
    }
    if !lines.is_empty() {
        text.push('\n');
    }
    for line in &lines {
        text.push_str(&line.command);
        text.push('\n');
    }

    Ok(AssembledScript {
        server_id: server_id.to_string(),
        format,
        preamble: FLUSH_COMMANDS.iter().map(|c| c.to_string()).collect(),
        lines,
        fingerprint,
        text,
    })
}
