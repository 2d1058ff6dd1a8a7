//! Façade over the server/probe configuration owned by the CRUD layer.
//!
//! The core never owns server records: it reads them through the `Registry`
//! trait on each use. Sessions hold a server id only, so a record deleted
//! from the configuration is gone on the next lookup.

use serde::{Deserialize, Serialize};

/// One monitored host as registered in the configuration document.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Default)]
pub struct ServerRecord {
    /// Opaque identifier, referenced everywhere. Immutable once created.
    pub id: String,
    /// Shared secret presented by the agent during the auth handshake.
    pub token: String,
    #[serde(default)]
    pub name: String,
    /// Free-form operator metadata (location, tags, notes).
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// One ping-probe target pushed to every agent.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Default)]
pub struct PingTarget {
    pub name: String,
    pub host: String,
}

/// Dashboard-wide settings forwarded verbatim to browsers.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Default)]
pub struct SiteSettings {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub extra: serde_json::Value,
}

/// Read interface over the configuration document.
///
/// Implementations live outside the core (the server binary backs it with a
/// JSON file). All methods are snapshot reads; the core never caches records
/// across uses.
pub trait Registry: Send + Sync {
    fn list_servers(&self) -> Vec<ServerRecord>;

    fn find_server(&self, id: &str) -> Option<ServerRecord>;

    /// Token check for the auth handshake. An unknown server id is an
    /// authentication failure, never an error.
    fn verify_token(&self, id: &str, token: &str) -> bool {
        self.find_server(id).is_some_and(|rec| rec.token == token)
    }

    fn ping_targets(&self) -> Vec<PingTarget>;

    fn site_settings(&self) -> SiteSettings;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedRegistry(Vec<ServerRecord>);

    impl Registry for FixedRegistry {
        fn list_servers(&self) -> Vec<ServerRecord> {
            self.0.clone()
        }
        fn find_server(&self, id: &str) -> Option<ServerRecord> {
            self.0.iter().find(|r| r.id == id).cloned()
        }
        fn ping_targets(&self) -> Vec<PingTarget> {
            Vec::new()
        }
        fn site_settings(&self) -> SiteSettings {
            SiteSettings::default()
        }
    }

    #[test]
    fn verify_token_matches_exactly() {
        let reg = FixedRegistry(vec![ServerRecord {
            id: "a".into(),
            token: "secret".into(),
            ..ServerRecord::default()
        }]);
        assert!(reg.verify_token("a", "secret"));
        assert!(!reg.verify_token("a", "wrong"));
        assert!(!reg.verify_token("unknown", "secret"));
    }
}
