//! JSON-file-backed registry.
//!
//! The CRUD layer owns `config.json`; this side only reads it. A poll task
//! re-reads the file on a short timer and diffs the parsed document, so
//! operator edits propagate without any notification plumbing from the
//! owner.

use std::path::{Path, PathBuf};
use std::sync::RwLock;

use serde::Deserialize;
use tracing::{info, warn};

use hostwatch_core::registry::{PingTarget, Registry, ServerRecord, SiteSettings};

#[derive(Deserialize, Default, Clone, PartialEq)]
struct ConfigDoc {
    #[serde(default)]
    servers: Vec<ServerRecord>,
    #[serde(default)]
    ping_targets: Vec<PingTarget>,
    #[serde(default)]
    site_settings: SiteSettings,
}

/// What changed in a reload; drives the §config/site-settings broadcasts.
#[derive(Default, Clone, Copy, Debug, PartialEq)]
pub(crate) struct ConfigChanges {
    pub(crate) probe_targets: bool,
    pub(crate) site_settings: bool,
}

pub(crate) struct JsonRegistry {
    path: PathBuf,
    doc: RwLock<ConfigDoc>,
}

impl JsonRegistry {
    /// Loads the configuration document. A missing or unreadable file is an
    /// empty registry: agents connecting before their record exists fail
    /// authentication, they do not crash the server.
    pub(crate) fn load(path: &Path) -> Self {
        let doc = match Self::read_doc(path) {
            Ok(doc) => {
                info!(path = %path.display(), servers = doc.servers.len(), "registry loaded");
                doc
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "no registry config, starting empty");
                ConfigDoc::default()
            }
        };
        Self {
            path: path.to_path_buf(),
            doc: RwLock::new(doc),
        }
    }

    fn read_doc(path: &Path) -> Result<ConfigDoc, String> {
        let data = std::fs::read_to_string(path).map_err(|e| e.to_string())?;
        serde_json::from_str(&data).map_err(|e| e.to_string())
    }

    /// Re-reads the file and swaps the document when it parsed and differs.
    /// A vanished or corrupt file keeps the last good document.
    pub(crate) fn reload_if_changed(&self) -> ConfigChanges {
        let new_doc = match Self::read_doc(&self.path) {
            Ok(doc) => doc,
            Err(_) => return ConfigChanges::default(),
        };
        let mut doc = self.doc.write().unwrap();
        if *doc == new_doc {
            return ConfigChanges::default();
        }
        let changes = ConfigChanges {
            probe_targets: doc.ping_targets != new_doc.ping_targets,
            site_settings: doc.site_settings != new_doc.site_settings,
        };
        info!(
            servers = new_doc.servers.len(),
            targets = new_doc.ping_targets.len(),
            "registry config changed"
        );
        *doc = new_doc;
        changes
    }
}

impl Registry for JsonRegistry {
    fn list_servers(&self) -> Vec<ServerRecord> {
        self.doc.read().unwrap().servers.clone()
    }

    fn find_server(&self, id: &str) -> Option<ServerRecord> {
        self.doc
            .read()
            .unwrap()
            .servers
            .iter()
            .find(|s| s.id == id)
            .cloned()
    }

    fn ping_targets(&self) -> Vec<PingTarget> {
        self.doc.read().unwrap().ping_targets.clone()
    }

    fn site_settings(&self) -> SiteSettings {
        self.doc.read().unwrap().site_settings.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write_config(path: &Path, json: &str) {
        std::fs::write(path, json).unwrap();
    }

    #[test]
    fn missing_file_is_an_empty_registry() {
        let dir = tempdir().unwrap();
        let registry = JsonRegistry::load(&dir.path().join("absent.json"));
        assert!(registry.list_servers().is_empty());
        assert!(!registry.verify_token("a", "t"));
    }

    #[test]
    fn loads_servers_and_targets() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        write_config(
            &path,
            r#"{
                "servers": [{"id":"srv-1","token":"secret","name":"web-1"}],
                "ping_targets": [{"name":"CF","host":"1.1.1.1"}],
                "site_settings": {"title":"ops"}
            }"#,
        );
        let registry = JsonRegistry::load(&path);
        assert!(registry.verify_token("srv-1", "secret"));
        assert!(!registry.verify_token("srv-1", "nope"));
        assert_eq!(registry.ping_targets().len(), 1);
        assert_eq!(registry.site_settings().title, "ops");
    }

    #[test]
    fn reload_reports_what_changed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        write_config(&path, r#"{"ping_targets":[{"name":"CF","host":"1.1.1.1"}]}"#);
        let registry = JsonRegistry::load(&path);

        // Unchanged file: no change reported.
        assert_eq!(registry.reload_if_changed(), ConfigChanges::default());

        write_config(
            &path,
            r#"{"ping_targets":[{"name":"CF","host":"1.0.0.1"}],"site_settings":{"title":"x"}}"#,
        );
        let changes = registry.reload_if_changed();
        assert!(changes.probe_targets);
        assert!(changes.site_settings);
        assert_eq!(registry.ping_targets()[0].host, "1.0.0.1");

        // Corrupt file keeps the last good document.
        write_config(&path, "{ not json");
        assert_eq!(registry.reload_if_changed(), ConfigChanges::default());
        assert_eq!(registry.ping_targets().len(), 1);
    }
}
