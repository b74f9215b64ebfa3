use std::cmp::Ordering;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

/// One builder machine. Identity is the `id` alone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resource {
    pub id: String,
    pub host: String,
    pub port: String,
}

impl Resource {
    pub fn new(id: impl Into<String>, host: impl Into<String>, port: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            host: host.into(),
            port: port.into(),
        }
    }

    /// `host:port`, suitable for connecting.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Parse the `id:host:port` form used on the command line.
    pub fn parse(entry: &str) -> Option<Self> {
        let parts: Vec<&str> = entry.trim().split(':').collect();
        match parts.as_slice() {
            [id, host, port] if !id.is_empty() && !host.is_empty() && !port.is_empty() => {
                Some(Self::new(*id, *host, *port))
            }
            _ => None,
        }
    }
}

impl PartialEq for Resource {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Resource {}

impl Hash for Resource {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl PartialOrd for Resource {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Resource {
    fn cmp(&self, other: &Self) -> Ordering {
        self.id.cmp(&other.id)
    }
}

impl std::fmt::Display for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}:{}", self.id, self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equality_ignores_address() {
        let a = Resource::new("vm-1", "10.0.0.1", "8080");
        let b = Resource::new("vm-1", "10.0.0.2", "9090");
        assert_eq!(a, b);
        assert_ne!(a, Resource::new("vm-2", "10.0.0.1", "8080"));
    }

    #[test]
    fn ordering_is_by_id() {
        let mut resources = vec![
            Resource::new("c", "h", "1"),
            Resource::new("a", "h", "1"),
            Resource::new("b", "h", "1"),
        ];
        resources.sort();
        let ids: Vec<&str> = resources.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[test]
    fn parse_accepts_id_host_port() {
        let r = Resource::parse("local:127.0.0.1:8080").unwrap();
        assert_eq!(r.id, "local");
        assert_eq!(r.address(), "127.0.0.1:8080");
        assert!(Resource::parse("missing-port:127.0.0.1").is_none());
        assert!(Resource::parse("::").is_none());
    }

    #[test]
    fn json_shape_matches_provisioning_output() {
        let r: Resource =
            serde_json::from_str(r#"{"id":"vm-7","host":"10.1.2.3","port":"8080"}"#).unwrap();
        assert_eq!(r.id, "vm-7");
        assert_eq!(r.host, "10.1.2.3");
        assert_eq!(r.port, "8080");
    }
}
