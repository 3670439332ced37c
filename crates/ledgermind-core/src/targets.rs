//! Target registry - normalization of semantic subject keys.
//!
//! Targets are persisted in `targets.json` under the repository root.
//! Normalization resolves exact names, then aliases, then
//! case-insensitive matches; unknown names pass through and novel targets
//! register themselves on first use. A corrupted registry file loads as
//! empty rather than failing the engine.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Minimum similarity for fuzzy target suggestions
const SUGGEST_THRESHOLD: f64 = 0.6;

/// Metadata about one registered target
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetInfo {
    /// Free-text description
    #[serde(default)]
    pub description: String,
    /// When the target was first registered
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryFile {
    #[serde(default)]
    targets: BTreeMap<String, TargetInfo>,
    #[serde(default)]
    aliases: BTreeMap<String, String>,
}

/// Process-scoped registry of known targets
pub struct TargetRegistry {
    storage_path: PathBuf,
    targets: BTreeMap<String, TargetInfo>,
    aliases: BTreeMap<String, String>,
}

impl TargetRegistry {
    /// Load the registry from `<storage_path>/targets.json`
    pub fn open(storage_path: impl AsRef<Path>) -> Self {
        let storage_path = storage_path.as_ref().to_path_buf();
        let file_path = storage_path.join("targets.json");
        let mut registry = Self {
            storage_path,
            targets: BTreeMap::new(),
            aliases: BTreeMap::new(),
        };
        if file_path.exists() {
            match std::fs::read_to_string(&file_path)
                .map_err(|e| e.to_string())
                .and_then(|raw| serde_json::from_str::<RegistryFile>(&raw).map_err(|e| e.to_string()))
            {
                Ok(file) => {
                    registry.targets = file.targets;
                    registry.aliases = file.aliases;
                }
                Err(e) => {
                    tracing::error!("corrupted target registry, starting empty: {e}");
                }
            }
        }
        registry
    }

    /// Registered target names
    pub fn targets(&self) -> impl Iterator<Item = &str> {
        self.targets.keys().map(String::as_str)
    }

    /// Whether a target is registered under exactly this name
    pub fn contains(&self, name: &str) -> bool {
        self.targets.contains_key(name)
    }

    /// Alias map (alias -> canonical name)
    pub fn aliases(&self) -> &BTreeMap<String, String> {
        &self.aliases
    }

    fn persist(&self) -> Result<()> {
        std::fs::create_dir_all(&self.storage_path)?;
        let file = RegistryFile {
            targets: self.targets.clone(),
            aliases: self.aliases.clone(),
        };
        let raw = serde_json::to_string_pretty(&file)?;
        std::fs::write(self.storage_path.join("targets.json"), raw)?;
        Ok(())
    }

    /// Register a target (idempotent) with optional aliases, writing
    /// through to disk.
    pub fn register(&mut self, name: &str, description: &str, aliases: &[&str]) -> Result<()> {
        let name = name.trim();
        if name.is_empty() {
            return Ok(());
        }
        self.targets.entry(name.to_string()).or_insert_with(|| TargetInfo {
            description: description.to_string(),
            created_at: Utc::now(),
        });
        for alias in aliases {
            self.aliases.insert(alias.to_string(), name.to_string());
        }
        self.persist()
    }

    /// Resolve a name: exact match, then alias, then case-insensitive
    /// against targets and aliases. Unknown names pass through; empty
    /// input normalizes to `"unknown"`.
    pub fn normalize(&self, name: &str) -> String {
        let name = name.trim();
        if name.is_empty() {
            return "unknown".to_string();
        }
        if self.targets.contains_key(name) {
            return name.to_string();
        }
        if let Some(canonical) = self.aliases.get(name) {
            return canonical.clone();
        }
        let lowered = name.to_lowercase();
        for target in self.targets.keys() {
            if target.to_lowercase() == lowered {
                return target.clone();
            }
        }
        for (alias, canonical) in &self.aliases {
            if alias.to_lowercase() == lowered {
                return canonical.clone();
            }
        }
        name.to_string()
    }

    /// Fuzzy suggestions for a possibly-misspelled target
    pub fn suggest(&self, name: &str, limit: usize) -> Vec<String> {
        let lowered = name.to_lowercase();
        let mut scored: Vec<(f64, &String)> = self
            .targets
            .keys()
            .filter_map(|t| {
                let score = strsim::jaro_winkler(&lowered, &t.to_lowercase());
                (score >= SUGGEST_THRESHOLD).then_some((score, t))
            })
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        scored.into_iter().take(limit).map(|(_, t)| t.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_register_and_reload() {
        let dir = TempDir::new().unwrap();
        {
            let mut registry = TargetRegistry::open(dir.path());
            registry
                .register("TestTarget", "Description", &["tt", "test"])
                .unwrap();
            assert!(registry.contains("TestTarget"));
            assert_eq!(registry.aliases()["tt"], "TestTarget");
        }
        // Reload from disk (simulating restart)
        let registry = TargetRegistry::open(dir.path());
        assert!(registry.contains("TestTarget"));
        assert_eq!(registry.aliases()["test"], "TestTarget");
        assert_eq!(registry.targets["TestTarget"].description, "Description");
    }

    #[test]
    fn test_normalization_paths() {
        let dir = TempDir::new().unwrap();
        let mut registry = TargetRegistry::open(dir.path());
        registry.register("PrimaryTarget", "", &["pt", "alias1"]).unwrap();
        registry.register("AnotherTarget", "", &[]).unwrap();

        assert_eq!(registry.normalize("PrimaryTarget"), "PrimaryTarget");
        assert_eq!(registry.normalize("pt"), "PrimaryTarget");
        assert_eq!(registry.normalize("alias1"), "PrimaryTarget");
        assert_eq!(registry.normalize("primarytarget"), "PrimaryTarget");
        assert_eq!(registry.normalize("PRIMARYTARGET"), "PrimaryTarget");
        assert_eq!(registry.normalize("PT"), "PrimaryTarget");
        assert_eq!(registry.normalize("Alias1"), "PrimaryTarget");
        assert_eq!(registry.normalize("UnknownTarget"), "UnknownTarget");
        assert_eq!(registry.normalize(""), "unknown");
        assert_eq!(registry.normalize("   "), "unknown");
    }

    #[test]
    fn test_suggestions() {
        let dir = TempDir::new().unwrap();
        let mut registry = TargetRegistry::open(dir.path());
        for t in ["apple", "application", "apply", "banana"] {
            registry.register(t, "", &[]).unwrap();
        }

        let suggestions = registry.suggest("app", 3);
        assert!(suggestions.iter().any(|s| s.starts_with("app")));
        assert!(!suggestions.contains(&"banana".to_string()));

        let exact = registry.suggest("apple", 5);
        assert!(exact.contains(&"apple".to_string()));
    }

    #[test]
    fn test_corrupted_file_loads_empty() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("targets.json"), "{invalid_json").unwrap();

        let mut registry = TargetRegistry::open(dir.path());
        assert_eq!(registry.targets().count(), 0);

        // Registration overwrites the corrupted file
        registry.register("NewTarget", "", &[]).unwrap();
        let reloaded = TargetRegistry::open(dir.path());
        assert!(reloaded.contains("NewTarget"));
    }

    #[test]
    fn test_register_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let mut registry = TargetRegistry::open(dir.path());
        registry.register("Target1", "first", &[]).unwrap();
        registry.register("Target1", "second", &[]).unwrap();
        // First description wins
        assert_eq!(registry.targets["Target1"].description, "first");
    }
}
