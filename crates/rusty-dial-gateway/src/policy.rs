//! Outbound destination policy.

use regex::Regex;

use rusty_dial_core::config::CallsConfig;
use rusty_dial_core::error::{Result, RustyDialError};

/// Decides which numbers may be dialed.
///
/// Blocked prefixes always reject. When allow patterns are configured, the
/// destination must match at least one of them.
#[derive(Debug, Clone, Default)]
pub struct DestinationPolicy {
    blocked_prefixes: Vec<String>,
    allowed: Vec<Regex>,
}

impl DestinationPolicy {
    pub fn from_config(calls: &CallsConfig) -> Result<Self> {
        let allowed = calls
            .allowed_destinations
            .iter()
            .map(|glob| {
                Regex::new(&glob_to_regex(glob))
                    .map_err(|e| RustyDialError::Config(format!("Invalid destination pattern '{glob}': {e}")))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            blocked_prefixes: calls.blocked_prefixes.clone(),
            allowed,
        })
    }

    pub fn is_allowed(&self, to: &str) -> bool {
        if self.blocked_prefixes.iter().any(|p| to.starts_with(p.as_str())) {
            return false;
        }
        self.allowed.is_empty() || self.allowed.iter().any(|re| re.is_match(to))
    }

    pub fn check(&self, to: &str) -> Result<()> {
        if self.is_allowed(to) {
            Ok(())
        } else {
            Err(RustyDialError::InvalidDestination(format!(
                "Calls to {} are not allowed",
                redact(to)
            )))
        }
    }
}

/// Translate a shell-style glob (`*`, `?`) into an anchored regex.
pub fn glob_to_regex(glob: &str) -> String {
    let mut pattern = String::with_capacity(glob.len() + 8);
    pattern.push('^');
    for ch in glob.chars() {
        match ch {
            '*' => pattern.push_str(".*"),
            '?' => pattern.push('.'),
            other => pattern.push_str(&regex::escape(other.encode_utf8(&mut [0; 4]))),
        }
    }
    pattern.push('$');
    pattern
}

/// Partially hide a phone number for logs and listings.
pub fn redact(number: &str) -> String {
    let head: String = number.chars().take(7).collect();
    format!("{head}****")
}
