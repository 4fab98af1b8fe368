//! Rule Model: the shape of a firewall rule record as it comes from the rule store
//!
//! Records keep their match fields as plain strings, the way the store hands
//! them over. The compiler parses `table`, `chain`, `action` and `protocol`
//! into the enums below and rejects anything it does not recognise.

use serde::{Deserialize, Deserializer, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use crate::error::{OrchestratorError, Result};

/// Rule identifier: numeric or textual, depending on the store
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RuleId {
    Num(i64),
    Text(String),
}

impl Ord for RuleId {
    /// Numeric ids sort numerically and before textual ids
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::Num(a), Self::Num(b)) => a.cmp(b),
            (Self::Num(_), Self::Text(_)) => Ordering::Less,
            (Self::Text(_), Self::Num(_)) => Ordering::Greater,
            (Self::Text(a), Self::Text(b)) => a.cmp(b),
        }
    }
}

impl PartialOrd for RuleId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for RuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Num(n) => write!(f, "{n}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

impl From<i64> for RuleId {
    fn from(n: i64) -> Self {
        Self::Num(n)
    }
}

impl From<&str> for RuleId {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

/// A packet-filtering rule record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleRecord {
    pub id: RuleId,
    #[serde(alias = "server_id")]
    pub server_id: String,
    #[serde(default = "default_table")]
    pub table: String,
    pub chain: String,
    pub action: String,
    #[serde(default, alias = "source_ip", skip_serializing_if = "Option::is_none")]
    pub source_ip: Option<String>,
    #[serde(
        default,
        alias = "source_port",
        deserialize_with = "port_field",
        skip_serializing_if = "Option::is_none"
    )]
    pub source_port: Option<String>,
    #[serde(default, alias = "dest_ip", skip_serializing_if = "Option::is_none")]
    pub dest_ip: Option<String>,
    #[serde(
        default,
        alias = "dest_port",
        deserialize_with = "port_field",
        skip_serializing_if = "Option::is_none"
    )]
    pub dest_port: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface: Option<String>,
    #[serde(default)]
    pub priority: i64,
    #[serde(default = "default_enabled", alias = "is_enabled")]
    pub is_enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default, alias = "dest_server_id", skip_serializing_if = "Option::is_none")]
    pub dest_server_id: Option<String>,
    #[serde(default, alias = "dest_egress_id", skip_serializing_if = "Option::is_none")]
    pub dest_egress_id: Option<String>,
    #[serde(default, alias = "created_at")]
    pub created_at: i64,
    #[serde(default, alias = "updated_at")]
    pub updated_at: i64,
}

fn default_table() -> String {
    "filter".to_string()
}

fn default_enabled() -> bool {
    true
}

/// Ports arrive as integers from TOML/JSON stores and as strings for ranges
fn port_field<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Port {
        Num(u32),
        Text(String),
    }

    Ok(Option::<Port>::deserialize(deserializer)?.map(|p| match p {
        Port::Num(n) => n.to_string(),
        Port::Text(s) => s,
    }))
}

impl RuleRecord {
    /// Minimal enabled rule in the filter table
    pub fn new(
        id: impl Into<RuleId>,
        server_id: &str,
        chain: &str,
        action: &str,
    ) -> Self {
        Self {
            id: id.into(),
            server_id: server_id.to_string(),
            table: default_table(),
            chain: chain.to_string(),
            action: action.to_string(),
            source_ip: None,
            source_port: None,
            dest_ip: None,
            dest_port: None,
            protocol: None,
            interface: None,
            priority: 0,
            is_enabled: true,
            comment: None,
            dest_server_id: None,
            dest_egress_id: None,
            created_at: 0,
            updated_at: 0,
        }
    }
}

/// Returns the field value unless it is absent or blank
pub(crate) fn present(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Table {
    Filter,
    Nat,
    Mangle,
    Raw,
}

impl Table {
    pub const ALL: [Table; 4] = [Table::Filter, Table::Nat, Table::Mangle, Table::Raw];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Filter => "filter",
            Self::Nat => "nat",
            Self::Mangle => "mangle",
            Self::Raw => "raw",
        }
    }
}

impl FromStr for Table {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "filter" => Ok(Self::Filter),
            "nat" => Ok(Self::Nat),
            "mangle" => Ok(Self::Mangle),
            "raw" => Ok(Self::Raw),
            other => Err(OrchestratorError::validation(
                "table",
                format!("unknown table '{other}'"),
            )),
        }
    }
}

/// Maximum length iptables accepts for a chain name
const MAX_CHAIN_NAME: usize = 28;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Chain {
    Prerouting,
    Input,
    Forward,
    Output,
    Postrouting,
    Custom(String),
}

impl Chain {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Prerouting => "PREROUTING",
            Self::Input => "INPUT",
            Self::Forward => "FORWARD",
            Self::Output => "OUTPUT",
            Self::Postrouting => "POSTROUTING",
            Self::Custom(name) => name,
        }
    }

    /// Interface flag for this chain: `-i` on ingress chains, `-o` on egress chains
    pub fn interface_flag(&self) -> Option<&'static str> {
        match self {
            Self::Input | Self::Forward => Some("-i"),
            Self::Output | Self::Postrouting => Some("-o"),
            Self::Prerouting | Self::Custom(_) => None,
        }
    }
}

impl FromStr for Chain {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self> {
        let name = s.trim();
        match name {
            "PREROUTING" => return Ok(Self::Prerouting),
            "INPUT" => return Ok(Self::Input),
            "FORWARD" => return Ok(Self::Forward),
            "OUTPUT" => return Ok(Self::Output),
            "POSTROUTING" => return Ok(Self::Postrouting),
            _ => {}
        }

        let valid = !name.is_empty()
            && name.len() <= MAX_CHAIN_NAME
            && !name.starts_with('-')
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if valid {
            Ok(Self::Custom(name.to_string()))
        } else {
            Err(OrchestratorError::validation(
                "chain",
                format!("invalid chain name '{name}'"),
            ))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Accept,
    Drop,
    Reject,
    Return,
    Log,
    Dnat,
    Snat,
    Masquerade,
    Redirect,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Accept => "ACCEPT",
            Self::Drop => "DROP",
            Self::Reject => "REJECT",
            Self::Return => "RETURN",
            Self::Log => "LOG",
            Self::Dnat => "DNAT",
            Self::Snat => "SNAT",
            Self::Masquerade => "MASQUERADE",
            Self::Redirect => "REDIRECT",
        }
    }

    /// Source NAT targets never match on a destination address
    pub fn is_source_nat(&self) -> bool {
        matches!(self, Self::Snat | Self::Masquerade)
    }
}

impl FromStr for Action {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ACCEPT" => Ok(Self::Accept),
            "DROP" => Ok(Self::Drop),
            "REJECT" => Ok(Self::Reject),
            "RETURN" => Ok(Self::Return),
            "LOG" => Ok(Self::Log),
            "DNAT" => Ok(Self::Dnat),
            "SNAT" => Ok(Self::Snat),
            "MASQUERADE" => Ok(Self::Masquerade),
            "REDIRECT" => Ok(Self::Redirect),
            _ => Err(OrchestratorError::validation(
                "action",
                format!("unknown action '{}'", s.trim()),
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Udp,
    Icmp,
    All,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
            Self::Icmp => "icmp",
            Self::All => "all",
        }
    }
}

impl FromStr for Protocol {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tcp" => Ok(Self::Tcp),
            "udp" => Ok(Self::Udp),
            "icmp" => Ok(Self::Icmp),
            "" | "all" => Ok(Self::All),
            other => Err(OrchestratorError::validation(
                "protocol",
                format!("unknown protocol '{other}'"),
            )),
        }
    }
}
