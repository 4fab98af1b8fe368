//! Rule Compiler: turns a rule record into a single `iptables` command
//!
//! Flags are always emitted in the same order:
//! table, chain, protocol, source, destination, interface, target, NAT target.

use crate::error::{OrchestratorError, Result};
use crate::rule::{present, Action, Chain, Protocol, RuleRecord, Table};

/// Destination ports that DNAT never appends to `--to-destination`
const IMPLICIT_DNAT_PORTS: [&str; 2] = ["80", "443"];

/// Compile a rule into an `iptables` command line.
///
/// Pure and deterministic; fails with a validation error on unknown
/// table/chain/action/protocol values or unsafe field contents.
pub fn compile(rule: &RuleRecord) -> Result<String> {
    let table: Table = rule.table.parse()?;
    let chain: Chain = rule.chain.parse()?;
    let action: Action = rule.action.parse()?;
    let protocol = match present(&rule.protocol) {
        Some(p) => p.parse::<Protocol>()?,
        None => Protocol::All,
    };

    let source_ip = checked_token("sourceIp", present(&rule.source_ip))?;
    let source_port = checked_port("sourcePort", present(&rule.source_port))?;
    let dest_ip = checked_token("destIp", present(&rule.dest_ip))?;
    let dest_port = checked_port("destPort", present(&rule.dest_port))?;
    let interface = checked_token("interface", present(&rule.interface))?;

    if action.is_source_nat() && dest_ip.is_some() {
        return Err(OrchestratorError::validation(
            "destIp",
            format!("{} does not take a destination address", action.as_str()),
        ));
    }

    let mut parts = vec!["iptables".to_string()];

    if table != Table::Filter {
        parts.push(format!("-t {}", table.as_str()));
    }

    parts.push(format!("-A {}", chain.as_str()));

    if protocol != Protocol::All {
        parts.push(format!("-p {}", protocol.as_str()));
    }

    if let Some(src) = source_ip {
        parts.push(format!("-s {src}"));
    }
    if let Some(sport) = &source_port {
        parts.push(format!("--sport {sport}"));
    }

    if let Some(dst) = dest_ip {
        parts.push(format!("-d {dst}"));
    }
    if let Some(dport) = &dest_port {
        parts.push(format!("--dport {dport}"));
    }

    if let (Some(iface), Some(flag)) = (interface, chain.interface_flag()) {
        parts.push(format!("{flag} {iface}"));
    }

    parts.push(format!("-j {}", action.as_str()));

    if action == Action::Dnat {
        if let Some(dst) = dest_ip {
            parts.push(format!("--to-destination {}", nat_target(dst, dest_port.as_deref())));
        }
    }

    Ok(parts.join(" "))
}

/// `ip[:port]` for DNAT; ranges use iptables' `a-b` form in NAT targets
fn nat_target(dest_ip: &str, dest_port: Option<&str>) -> String {
    match dest_port {
        Some(port) if !IMPLICIT_DNAT_PORTS.contains(&port) => {
            format!("{dest_ip}:{}", port.replace(':', "-"))
        }
        _ => dest_ip.to_string(),
    }
}

/// Reject anything a shell would interpret when the command is run remotely
fn checked_token<'a>(field: &str, value: Option<&'a str>) -> Result<Option<&'a str>> {
    let allowed =
        |c: char| c.is_ascii_alphanumeric() || matches!(c, '.' | ':' | '/' | '_' | '+' | '-');
    match value {
        Some(v) if !v.chars().all(allowed) => Err(OrchestratorError::validation(
            field,
            format!("'{v}' contains characters not allowed in an iptables argument"),
        )),
        other => Ok(other),
    }
}

/// A single port: ASCII digits only, 1..=65535
fn parse_port(s: &str) -> Option<u16> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse::<u16>().ok().filter(|p| *p > 0)
}

/// Ports are `N` or `N:M` with 1 <= N <= M <= 65535, returned in canonical
/// decimal form (`080` becomes `80`)
fn checked_port(field: &str, value: Option<&str>) -> Result<Option<String>> {
    let Some(port) = value else {
        return Ok(None);
    };

    let canonical = match port.split_once(':') {
        Some((lo, hi)) => match (parse_port(lo), parse_port(hi)) {
            (Some(lo), Some(hi)) if lo <= hi => Some(format!("{lo}:{hi}")),
            _ => None,
        },
        None => parse_port(port).map(|p| p.to_string()),
    };

    canonical.map(Some).ok_or_else(|| {
        OrchestratorError::validation(field, format!("invalid port or port range '{port}'"))
    })
}
