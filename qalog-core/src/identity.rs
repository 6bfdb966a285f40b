//! Identity resolution: raw hook identifiers to logical user ids.
//!
//! Backend hooks identify themselves by `device_name` or by the address the
//! request arrived from; frontend hooks carry the session-bound user id of the
//! signed-in analyst. Resolution is a pure in-memory table lookup and always
//! yields a string: unmatched backend callers become `unknown_user`, frontend
//! callers without a user id become `guest_user`.

use std::collections::HashMap;
use std::net::IpAddr;

use crate::config::IdentityConfig;

/// Identifier as received from a hook, before resolution.
#[derive(Debug, Clone, Copy)]
pub enum RawIdentity<'a> {
    Frontend {
        user_id: Option<&'a str>,
    },
    Backend {
        device_name: Option<&'a str>,
        peer: Option<&'a str>,
    },
}

#[derive(Debug, Clone)]
pub struct IdentityResolver {
    by_key: HashMap<String, String>,
    unknown_user: String,
    guest_user: String,
}

impl IdentityResolver {
    pub fn from_config(config: &IdentityConfig) -> Self {
        let mut by_key = HashMap::new();
        for (name, addresses) in &config.devices {
            by_key.insert(normalize(name), name.clone());
            for address in addresses {
                by_key.insert(normalize(address), name.clone());
            }
        }
        Self {
            by_key,
            unknown_user: config.unknown_user.clone(),
            guest_user: config.guest_user.clone(),
        }
    }

    pub fn resolve(&self, raw: &RawIdentity<'_>) -> String {
        match raw {
            RawIdentity::Frontend { user_id } => match user_id.map(str::trim) {
                Some(id) if !id.is_empty() => id.to_string(),
                _ => self.guest_user.clone(),
            },
            RawIdentity::Backend { device_name, peer } => [*device_name, *peer]
                .into_iter()
                .flatten()
                .find_map(|key| self.lookup(key))
                .unwrap_or_else(|| self.unknown_user.clone()),
        }
    }

    /// True for the frontend fallback, which is not an authorized principal.
    pub fn is_guest(&self, user_id: &str) -> bool {
        user_id == self.guest_user
    }

    fn lookup(&self, key: &str) -> Option<String> {
        self.by_key.get(&normalize(key)).cloned()
    }
}

/// Lower-case, trimmed, with IPv4-mapped IPv6 addresses folded to IPv4.
fn normalize(raw: &str) -> String {
    let trimmed = raw.trim();
    match trimmed.parse::<IpAddr>() {
        Ok(IpAddr::V6(v6)) => match v6.to_ipv4_mapped() {
            Some(v4) => v4.to_string(),
            None => v6.to_string(),
        },
        Ok(ip) => ip.to_string(),
        Err(_) => trimmed.to_ascii_lowercase(),
    }
}
