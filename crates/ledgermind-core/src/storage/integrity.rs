//! Integrity checker - invariants I1-I5 over the semantic repository.
//!
//! A `(path, mtime_ns)` state hash makes repeat validation of an unchanged
//! repository a no-op, and a per-file mtime cache means incremental scans
//! only re-parse files that actually changed.

use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::{MemoryError, Result};
use crate::storage::frontmatter::{self, ArtifactDocument};

/// Directories never scanned for artifacts
const SKIPPED_DIRS: [&str; 3] = [".git", ".tx_backup", "vector_index"];

/// Validator for the semantic store's architectural invariants
pub struct IntegrityChecker {
    state_cache: Mutex<HashMap<PathBuf, u64>>,
    file_cache: Mutex<HashMap<PathBuf, (i64, ArtifactDocument)>>,
}

impl Default for IntegrityChecker {
    fn default() -> Self {
        Self::new()
    }
}

impl IntegrityChecker {
    /// Create a checker with empty caches
    pub fn new() -> Self {
        Self {
            state_cache: Mutex::new(HashMap::new()),
            file_cache: Mutex::new(HashMap::new()),
        }
    }

    /// Collect artifact files (relative paths) under the repository root
    pub fn walk_artifacts(repo_path: &Path) -> Vec<String> {
        let mut files = Vec::new();
        let mut stack = vec![repo_path.to_path_buf()];
        while let Some(dir) = stack.pop() {
            let Ok(entries) = std::fs::read_dir(&dir) else {
                continue;
            };
            for entry in entries.flatten() {
                let path = entry.path();
                let name = entry.file_name();
                let name = name.to_string_lossy();
                if path.is_dir() {
                    if !SKIPPED_DIRS.contains(&name.as_ref()) && !name.starts_with('.') {
                        stack.push(path);
                    }
                } else if name.ends_with(".md") || name.ends_with(".yaml") {
                    if let Ok(rel) = path.strip_prefix(repo_path) {
                        files.push(rel.to_string_lossy().into_owned());
                    }
                }
            }
        }
        files.sort();
        files
    }

    fn mtime_ns(path: &Path) -> Option<i64> {
        let meta = std::fs::metadata(path).ok()?;
        let mtime = meta.modified().ok()?;
        let dur = mtime.duration_since(std::time::UNIX_EPOCH).ok()?;
        Some(dur.as_nanos() as i64)
    }

    fn state_hash(repo_path: &Path, files: &[String]) -> u64 {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        for f in files {
            f.hash(&mut hasher);
            Self::mtime_ns(&repo_path.join(f)).unwrap_or(0).hash(&mut hasher);
        }
        hasher.finish()
    }

    /// Forget cached parses for one repository
    pub fn invalidate(&self, repo_path: &Path) {
        self.state_cache
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(repo_path);
        self.file_cache
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .retain(|k, _| !k.starts_with(repo_path));
    }

    /// Scan the repository and enforce I1-I5.
    ///
    /// When `force` is false and the state hash matches the last successful
    /// validation, the call is a no-op.
    pub fn validate(&self, repo_path: &Path, force: bool) -> Result<()> {
        let files = Self::walk_artifacts(repo_path);
        let current_hash = Self::state_hash(repo_path, &files);

        if !force {
            let cache = self.state_cache.lock().unwrap_or_else(|p| p.into_inner());
            if cache.get(repo_path) == Some(&current_hash) {
                return Ok(());
            }
        }

        if force {
            self.file_cache
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .retain(|k, _| !k.starts_with(repo_path));
        }

        let mut documents: HashMap<String, ArtifactDocument> = HashMap::new();
        for rel in &files {
            let full_path = repo_path.join(rel);
            let Some(mtime) = Self::mtime_ns(&full_path) else {
                continue;
            };

            let cached = {
                let cache = self.file_cache.lock().unwrap_or_else(|p| p.into_inner());
                cache.get(&full_path).and_then(|(cached_mtime, doc)| {
                    (*cached_mtime == mtime).then(|| doc.clone())
                })
            };

            let doc = match cached {
                Some(doc) => doc,
                None => {
                    let content = std::fs::read_to_string(&full_path)?;
                    let (parsed, _body) = frontmatter::parse(&content);
                    let Some(doc) = parsed else {
                        tracing::error!(fid = rel, "corrupted or empty frontmatter");
                        return Err(MemoryError::integrity(rel, "I1 Violation: Corrupted or empty frontmatter"));
                    };
                    self.file_cache
                        .lock()
                        .unwrap_or_else(|p| p.into_inner())
                        .insert(full_path.clone(), (mtime, doc.clone()));
                    doc
                }
            };
            documents.insert(rel.clone(), doc);
        }

        Self::check_invariants(&documents)?;

        self.state_cache
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(repo_path.to_path_buf(), current_hash);
        Ok(())
    }

    fn check_invariants(documents: &HashMap<String, ArtifactDocument>) -> Result<()> {
        // I4: single active decision per (target, namespace)
        let mut active_targets: HashMap<(String, String), String> = HashMap::new();

        for (fid, doc) in documents {
            if !doc.context.is_object() {
                continue;
            }
            // Legacy artifacts with no kind default to decision
            let kind = if doc.kind.is_empty() { "decision" } else { &doc.kind };
            let target = doc.context_str("target");
            let status = doc.context_str("status");

            // Directory name wins over an absent context namespace
            let rel_dir = Path::new(fid)
                .parent()
                .map(|p| p.to_string_lossy().into_owned())
                .filter(|p| !p.is_empty());
            let namespace = doc
                .context_str("namespace")
                .map(String::from)
                .or(rel_dir)
                .unwrap_or_else(|| "default".to_string());

            if kind == "decision" && status == Some("active") {
                if let Some(target) = target {
                    let key = (target.to_string(), namespace.clone());
                    if let Some(existing) = active_targets.get(&key) {
                        return Err(MemoryError::integrity(
                            fid,
                            format!(
                                "I4 Violation: Multiple active decisions for target '{target}' in namespace '{namespace}' (conflicts with {existing})"
                            ),
                        ));
                    }
                    active_targets.insert(key, fid.clone());
                }
            }

            // I3: bidirectional supersede
            if let Some(successor) = doc.context_str("superseded_by") {
                let Some(remote) = documents.get(successor) else {
                    return Err(MemoryError::integrity(
                        fid,
                        format!("I3 Violation: Dangling reference. Superseded by non-existent file {successor}"),
                    ));
                };
                if !remote.context_list("supersedes").iter().any(|s| s == fid) {
                    return Err(MemoryError::integrity(
                        fid,
                        format!("I3 Violation: Broken backlink. {successor} does not acknowledge via 'supersedes'"),
                    ));
                }
            }

            // All supersedes targets must exist
            for old_fid in doc.context_list("supersedes") {
                if !documents.contains_key(&old_fid) {
                    return Err(MemoryError::integrity(
                        fid,
                        format!("Reference Violation: Claims to supersede non-existent file {old_fid}"),
                    ));
                }
            }
        }

        Self::check_cycles(documents)
    }

    /// I5: the superseded_by relation must be acyclic
    fn check_cycles(documents: &HashMap<String, ArtifactDocument>) -> Result<()> {
        let mut visited: HashSet<&str> = HashSet::new();

        for start in documents.keys() {
            if visited.contains(start.as_str()) {
                continue;
            }
            // Iterative DFS with an on-stack set
            let mut stack_set: HashSet<&str> = HashSet::new();
            let mut path: Vec<&str> = vec![start.as_str()];
            while let Some(&current) = path.last() {
                if !stack_set.insert(current) {
                    // Returning to an on-stack node closes the walk
                    path.pop();
                    stack_set.remove(current);
                    visited.insert(current);
                    continue;
                }
                let successor = documents
                    .get(current)
                    .and_then(|d| d.context_str("superseded_by"));
                match successor {
                    Some(next) if stack_set.contains(next) => {
                        return Err(MemoryError::integrity(
                            current,
                            "I5 Violation: Cycle detected in knowledge evolution",
                        ));
                    }
                    Some(next) if !visited.contains(next) && documents.contains_key(next) => {
                        path.push(next);
                    }
                    _ => {
                        path.pop();
                        stack_set.remove(current);
                        visited.insert(current);
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn write_artifact(dir: &Path, name: &str, context: serde_json::Value) {
        let doc = ArtifactDocument {
            kind: "decision".into(),
            source: "agent".into(),
            content: name.into(),
            timestamp: Some(chrono::Utc::now().to_rfc3339()),
            schema_version: 1,
            context,
        };
        let blob = frontmatter::stringify(&doc, "body").unwrap();
        let path = dir.join(name);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, blob).unwrap();
    }

    #[test]
    fn test_clean_repo_validates() {
        let dir = TempDir::new().unwrap();
        write_artifact(
            dir.path(),
            "decision_a.md",
            json!({"target": "style", "status": "active"}),
        );
        let checker = IntegrityChecker::new();
        checker.validate(dir.path(), false).unwrap();
        // Second validation hits the state cache
        checker.validate(dir.path(), false).unwrap();
    }

    #[test]
    fn test_i4_two_active_same_target() {
        let dir = TempDir::new().unwrap();
        write_artifact(dir.path(), "a.md", json!({"target": "style", "status": "active"}));
        write_artifact(dir.path(), "b.md", json!({"target": "style", "status": "active"}));
        let checker = IntegrityChecker::new();
        let err = checker.validate(dir.path(), false).unwrap_err();
        assert!(err.to_string().contains("I4"));
    }

    #[test]
    fn test_i4_namespaces_are_isolated() {
        let dir = TempDir::new().unwrap();
        write_artifact(dir.path(), "a.md", json!({"target": "style", "status": "active"}));
        write_artifact(
            dir.path(),
            "prod/b.md",
            json!({"target": "style", "status": "active", "namespace": "prod"}),
        );
        IntegrityChecker::new().validate(dir.path(), false).unwrap();
    }

    #[test]
    fn test_directory_name_provides_namespace() {
        let dir = TempDir::new().unwrap();
        // No namespace key in context; the parent directory supplies it
        write_artifact(dir.path(), "a.md", json!({"target": "style", "status": "active"}));
        write_artifact(dir.path(), "prod/b.md", json!({"target": "style", "status": "active"}));
        IntegrityChecker::new().validate(dir.path(), false).unwrap();
    }

    #[test]
    fn test_i3_dangling_successor() {
        let dir = TempDir::new().unwrap();
        write_artifact(
            dir.path(),
            "a.md",
            json!({"target": "style", "status": "superseded", "superseded_by": "missing.md"}),
        );
        let err = IntegrityChecker::new().validate(dir.path(), false).unwrap_err();
        assert!(err.to_string().contains("I3"));
    }

    #[test]
    fn test_i3_broken_backlink() {
        let dir = TempDir::new().unwrap();
        write_artifact(
            dir.path(),
            "a.md",
            json!({"target": "style", "status": "superseded", "superseded_by": "b.md"}),
        );
        // b.md exists but does not list a.md in supersedes
        write_artifact(dir.path(), "b.md", json!({"target": "style", "status": "active"}));
        let err = IntegrityChecker::new().validate(dir.path(), false).unwrap_err();
        assert!(err.to_string().contains("backlink"));
    }

    #[test]
    fn test_i3_valid_pair() {
        let dir = TempDir::new().unwrap();
        write_artifact(
            dir.path(),
            "a.md",
            json!({"target": "style", "status": "superseded", "superseded_by": "b.md"}),
        );
        write_artifact(
            dir.path(),
            "b.md",
            json!({"target": "style", "status": "active", "supersedes": ["a.md"]}),
        );
        IntegrityChecker::new().validate(dir.path(), false).unwrap();
    }

    #[test]
    fn test_i5_cycle_detected() {
        let dir = TempDir::new().unwrap();
        write_artifact(
            dir.path(),
            "a.md",
            json!({"target": "t1", "status": "superseded", "superseded_by": "b.md", "supersedes": ["b.md"]}),
        );
        write_artifact(
            dir.path(),
            "b.md",
            json!({"target": "t2", "status": "superseded", "superseded_by": "a.md", "supersedes": ["a.md"]}),
        );
        let err = IntegrityChecker::new().validate(dir.path(), false).unwrap_err();
        assert!(err.to_string().contains("I5"));
    }

    #[test]
    fn test_i1_corrupted_frontmatter() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("bad.md"), "---\n{not yaml: [\n---\nbody").unwrap();
        let err = IntegrityChecker::new().validate(dir.path(), false).unwrap_err();
        assert!(err.to_string().contains("I1"));
    }

    #[test]
    fn test_force_revalidates_after_cache() {
        let dir = TempDir::new().unwrap();
        write_artifact(dir.path(), "a.md", json!({"target": "style", "status": "active"}));
        let checker = IntegrityChecker::new();
        checker.validate(dir.path(), false).unwrap();
        checker.validate(dir.path(), true).unwrap();
    }
}
