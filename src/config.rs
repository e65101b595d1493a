use std::collections::{HashMap, HashSet};
use std::fs;

use crate::identity::bootstrap::BootstrapNode;
use crate::identity::user_id::UserId;

#[derive(Debug)]
pub struct Config {
    pub globals: HashMap<String, String>,
    pub sections: HashMap<String, HashMap<String, String>>,
    /// Repeated top-level keys (`bootstrap =`, `service =`, `user =`) keep
    /// every occurrence here, in file order, since the flat `globals` map
    /// only keeps the last one.
    pub globals_multi: HashMap<String, Vec<String>>,
}

/// A `service = name:host:port` line: a named TCP backend the port-forwarding
/// service can dial into or listen on behalf of.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceBinding {
    pub name: String,
    pub host: String,
    pub port: u16,
}

impl Config {
    pub fn load(path: &str) -> Result<Self, String> {
        let content =
            fs::read_to_string(path).map_err(|e| format!("Error reading file {path}: {e}"))?;

        let mut globals = HashMap::new();
        let mut globals_multi: HashMap<String, Vec<String>> = HashMap::new();
        let mut sections: HashMap<String, HashMap<String, String>> = HashMap::new();
        let mut current_section: Option<String> = None;

        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            if line.starts_with('[') && line.ends_with(']') {
                let name = &line[1..line.len() - 1];
                current_section = Some(name.to_string());
                continue;
            }

            if let Some(pos) = line.find('=') {
                let key = line[..pos].trim().to_string();
                let value = line[pos + 1..].trim().trim_matches('"').to_string();

                match &current_section {
                    None => {
                        globals_multi
                            .entry(key.clone())
                            .or_default()
                            .push(value.clone());
                        globals.insert(key, value);
                    }
                    Some(sec) => {
                        sections.entry(sec.clone()).or_default().insert(key, value);
                    }
                }
            }
        }
        Ok(Config {
            globals,
            sections,
            globals_multi,
        })
    }

    pub fn empty() -> Self {
        Self {
            globals: HashMap::new(),
            sections: HashMap::new(),
            globals_multi: HashMap::new(),
        }
    }

    #[must_use]
    pub fn get(&self, section: &str, key: &str) -> Option<&str> {
        self.sections
            .get(section)
            .and_then(|sec| sec.get(key))
            .map(|s| s.as_str())
    }

    #[must_use]
    pub fn get_non_empty(&self, section: &str, key: &str) -> Option<&str> {
        self.get(section, key).filter(|s| !s.is_empty())
    }

    #[must_use]
    pub fn get_global(&self, key: &str) -> Option<&str> {
        self.globals.get(key).map(|s| s.as_str())
    }

    #[must_use]
    pub fn get_or_default<'a>(&'a self, section: &str, key: &str, default: &'a str) -> &'a str {
        self.get(section, key)
            .or_else(|| self.get_global(key))
            .unwrap_or(default)
    }

    #[must_use]
    pub fn get_non_empty_or_default<'a>(
        &'a self,
        section: &str,
        key: &str,
        default: &'a str,
    ) -> &'a str {
        self.get_non_empty(section, key)
            .or_else(|| self.get_global(key).filter(|s| !s.is_empty()))
            .unwrap_or(default)
    }

    /// Parses every `bootstrap = host:port:pubkey` line. Malformed lines are
    /// skipped rather than failing the whole config load.
    #[must_use]
    pub fn bootstrap_nodes(&self) -> Vec<BootstrapNode> {
        let Some(lines) = self.globals_multi.get("bootstrap") else {
            return Vec::new();
        };
        lines
            .iter()
            .filter_map(|line| {
                let mut parts = line.splitn(3, ':');
                let host = parts.next()?;
                let port = parts.next()?.parse::<u16>().ok()?;
                let pubkey = parts.next()?;
                let host = host.parse().ok()?;
                let public_key = UserId::from_base58(pubkey).ok()?;
                Some(BootstrapNode::new(host, port, public_key))
            })
            .collect()
    }

    /// Parses every `service = name:host:port` line.
    #[must_use]
    pub fn services(&self) -> Vec<ServiceBinding> {
        let Some(lines) = self.globals_multi.get("service") else {
            return Vec::new();
        };
        lines
            .iter()
            .filter_map(|line| {
                let mut parts = line.splitn(3, ':');
                let name = parts.next()?.to_string();
                let host = parts.next()?.to_string();
                let port = parts.next()?.parse::<u16>().ok()?;
                Some(ServiceBinding { name, host, port })
            })
            .collect()
    }

    /// Parses every `user = userid:service,service,...` line into a map of
    /// which port-forwarding services each remote user is allowed to reach.
    #[must_use]
    pub fn allowed_users(&self) -> HashMap<UserId, HashSet<String>> {
        let Some(lines) = self.globals_multi.get("user") else {
            return HashMap::new();
        };
        let mut out = HashMap::new();
        for line in lines {
            let Some((userid, services)) = line.split_once(':') else {
                continue;
            };
            let Ok(userid) = UserId::from_base58(userid) else {
                continue;
            };
            let services: HashSet<String> = services
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
            out.insert(userid, services);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    fn parse(text: &str) -> Config {
        let mut globals = HashMap::new();
        let mut globals_multi: HashMap<String, Vec<String>> = HashMap::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some(pos) = line.find('=') {
                let key = line[..pos].trim().to_string();
                let value = line[pos + 1..].trim().to_string();
                globals_multi.entry(key.clone()).or_default().push(value.clone());
                globals.insert(key, value);
            }
        }
        Config {
            globals,
            sections: HashMap::new(),
            globals_multi,
        }
    }

    #[test]
    fn skips_malformed_bootstrap_lines() {
        let cfg = parse("bootstrap = not-even-close-to-valid\n");
        assert!(cfg.bootstrap_nodes().is_empty());
    }

    #[test]
    fn parses_repeated_bootstrap_lines() {
        let id_a = UserId::from_bytes([9u8; 32]).to_base58();
        let id_b = UserId::from_bytes([4u8; 32]).to_base58();
        let cfg = parse(&format!(
            "bootstrap = 10.0.0.1:33445:{id_a}\nbootstrap = 10.0.0.2:33446:{id_b}\n"
        ));
        let nodes = cfg.bootstrap_nodes();
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[0].port, 33445);
        assert_eq!(nodes[1].port, 33446);
    }

    #[test]
    fn parses_services() {
        let cfg = parse("service = ssh:127.0.0.1:22\nservice = web:127.0.0.1:8080\n");
        let services = cfg.services();
        assert_eq!(services.len(), 2);
        assert_eq!(services[0].name, "ssh");
        assert_eq!(services[1].port, 8080);
    }

    #[test]
    fn parses_allowed_users() {
        let id = UserId::from_bytes([5u8; 32]).to_base58();
        let cfg = parse(&format!("user = {id}:ssh,web\n"));
        let allowed = cfg.allowed_users();
        assert_eq!(allowed.len(), 1);
        let services = allowed.values().next().unwrap();
        assert!(services.contains("ssh"));
        assert!(services.contains("web"));
    }
}
