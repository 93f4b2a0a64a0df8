//! Rewrites an env-style address table with the addresses of a deployment record.
//!
//! Each contract maps to a `<PREFIX><NAME>_ADDRESS=0x...` line, where `NAME` is the contract
//! name in SCREAMING_SNAKE_CASE. Existing keys are replaced in place, missing keys are
//! appended, and every other line is left untouched.

use std::{
    collections::{BTreeMap, BTreeSet},
    path::Path,
};

use anyhow::{Context, Result};

use crate::DeploymentRecord;

/// `PriceFeed` -> `PRICE_FEED`, `ERC20Token` -> `ERC20_TOKEN`.
pub fn screaming_snake(name: &str) -> String {
    let chars: Vec<char> = name.chars().collect();
    let mut out = String::with_capacity(name.len() + 4);

    for (i, &c) in chars.iter().enumerate() {
        if !c.is_ascii_alphanumeric() {
            if !out.is_empty() && !out.ends_with('_') {
                out.push('_');
            }
            continue;
        }

        if c.is_ascii_uppercase() && i > 0 && !out.ends_with('_') {
            let prev = chars[i - 1];
            let next_is_lower = chars.get(i + 1).is_some_and(|n| n.is_ascii_lowercase());
            if prev.is_ascii_lowercase()
                || prev.is_ascii_digit()
                || (prev.is_ascii_uppercase() && next_is_lower)
            {
                out.push('_');
            }
        }
        out.push(c.to_ascii_uppercase());
    }

    out
}

/// The address table key of a contract.
pub fn address_key(prefix: &str, contract: &str) -> String {
    format!("{prefix}{}_ADDRESS", screaming_snake(contract))
}

/// Key of an assignment line, with an optional `export ` stripped.
fn line_key(line: &str) -> Option<&str> {
    let trimmed = line.trim_start();
    if trimmed.starts_with('#') {
        return None;
    }
    let assignment = trimmed.strip_prefix("export ").unwrap_or(trimmed);
    let (key, _) = assignment.split_once('=')?;
    Some(key.trim())
}

/// Render `existing` with every recorded address written in. A key assigned on several lines
/// is rewritten on each of them.
pub fn render(existing: &str, record: &DeploymentRecord, prefix: &str) -> String {
    let values: BTreeMap<String, String> = record
        .contracts
        .iter()
        .map(|(name, entry)| (address_key(prefix, name), format!("{:#x}", entry.address)))
        .collect();
    let mut pending: BTreeSet<&str> = values.keys().map(String::as_str).collect();

    let mut lines = Vec::new();
    for line in existing.lines() {
        match line_key(line).and_then(|key| values.get_key_value(key)) {
            Some((key, value)) => {
                pending.remove(key.as_str());
                let export = if line.trim_start().starts_with("export ") {
                    "export "
                } else {
                    ""
                };
                lines.push(format!("{export}{key}={value}"));
            }
            None => lines.push(line.to_string()),
        }
    }

    lines.extend(pending.into_iter().map(|key| format!("{key}={}", values[key])));

    let mut rendered = lines.join("\n");
    rendered.push('\n');
    rendered
}

/// Rewrite the address table at `path`, creating it if needed. Returns the number of addresses
/// written.
pub fn update(path: &Path, record: &DeploymentRecord, prefix: &str) -> Result<usize> {
    let existing = if path.exists() {
        std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read address table {}", path.display()))?
    } else {
        String::new()
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory {}", parent.display()))?;
    }

    crate::fs::write_atomic(path, render(&existing, record, prefix).as_bytes())
        .with_context(|| format!("Failed to write address table {}", path.display()))?;

    tracing::info!(
        path = %path.display(),
        addresses = record.contracts.len(),
        "Address table updated"
    );
    Ok(record.contracts.len())
}
