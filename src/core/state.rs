//! RS-009: Lock file management. Load, save (atomic), path derivation.

use super::synth::{CloudAssembly, MANIFEST_FILE};
use super::types::{AssemblyLock, ResourceLock, StackLock};
use crate::tripwire::hasher;
use indexmap::IndexMap;
use std::path::{Path, PathBuf};

/// Lock file name inside an assembly directory.
pub const LOCK_FILE: &str = "railstack.lock.yaml";

/// Derive the lock file path for an assembly directory.
pub fn lock_file_path(out_dir: &Path) -> PathBuf {
    out_dir.join(LOCK_FILE)
}

/// Load the assembly lock. Returns None if the file doesn't exist.
pub fn load_lock(out_dir: &Path) -> Result<Option<AssemblyLock>, String> {
    let path = lock_file_path(out_dir);
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(&path)
        .map_err(|e| format!("cannot read {}: {}", path.display(), e))?;
    let lock: AssemblyLock = serde_yaml_ng::from_str(&content)
        .map_err(|e| format!("invalid lock file {}: {}", path.display(), e))?;
    Ok(Some(lock))
}

/// Write a file atomically (write to temp, then rename).
pub fn write_atomic(path: &Path, content: &str) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| format!("cannot create dir {}: {}", parent.display(), e))?;
    }
    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp_path = PathBuf::from(tmp_name);
    std::fs::write(&tmp_path, content)
        .map_err(|e| format!("cannot write {}: {}", tmp_path.display(), e))?;
    std::fs::rename(&tmp_path, path).map_err(|e| {
        format!(
            "cannot rename {} → {}: {}",
            tmp_path.display(),
            path.display(),
            e
        )
    })
}

/// Save the assembly lock atomically.
pub fn save_lock(out_dir: &Path, lock: &AssemblyLock) -> Result<(), String> {
    let yaml =
        serde_yaml_ng::to_string(lock).map_err(|e| format!("serialize error: {}", e))?;
    write_atomic(&lock_file_path(out_dir), &yaml)
}

/// Create a new empty lock for an app.
pub fn new_lock(app: &str) -> AssemblyLock {
    use crate::tripwire::eventlog::now_iso8601;
    AssemblyLock {
        schema: "1.0".to_string(),
        app: app.to_string(),
        generated_at: now_iso8601(),
        generator: format!("railstack {}", env!("CARGO_PKG_VERSION")),
        blake3_version: "1.8".to_string(),
        assembly_hash: String::new(),
        manifest_hash: None,
        stacks: IndexMap::new(),
    }
}

/// Record the hashes of a synthesized assembly.
pub fn lock_from_assembly(assembly: &CloudAssembly) -> AssemblyLock {
    let mut lock = new_lock(&assembly.app);
    for (name, stack) in &assembly.stacks {
        let resources = stack
            .template
            .get("Resources")
            .and_then(|r| r.as_object())
            .map(|map| {
                map.iter()
                    .map(|(id, entry)| {
                        let resource_type = entry
                            .get("Type")
                            .and_then(|t| t.as_str())
                            .unwrap_or_default()
                            .to_string();
                        (
                            id.clone(),
                            ResourceLock {
                                resource_type,
                                hash: hasher::hash_json(entry),
                            },
                        )
                    })
                    .collect()
            })
            .unwrap_or_default();
        lock.stacks.insert(
            name.clone(),
            StackLock {
                template: stack.template_file.clone(),
                environment: stack.environment.clone(),
                hash: stack.hash.clone(),
                dependencies: stack.dependencies.clone(),
                resources,
            },
        );
    }
    let stack_hashes: Vec<&str> = assembly.stacks.values().map(|s| s.hash.as_str()).collect();
    lock.assembly_hash = hasher::composite_hash(&stack_hashes);
    lock
}

/// Record the hash of the manifest written into an assembly directory.
pub fn record_manifest(out_dir: &Path, lock: &mut AssemblyLock) -> Result<(), String> {
    lock.manifest_hash = Some(hasher::hash_file(&out_dir.join(MANIFEST_FILE))?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_lock() -> AssemblyLock {
        let mut resources = IndexMap::new();
        resources.insert(
            "EcsRailsSampleVPC1A2B3C4D".to_string(),
            ResourceLock {
                resource_type: "AWS::EC2::VPC".to_string(),
                hash: "blake3:abc123".to_string(),
            },
        );
        let mut stacks = IndexMap::new();
        stacks.insert(
            "Net".to_string(),
            StackLock {
                template: "Net.template.json".to_string(),
                environment: "aws://unknown-account/unknown-region".to_string(),
                hash: "blake3:def456".to_string(),
                dependencies: vec![],
                resources,
            },
        );
        AssemblyLock {
            schema: "1.0".to_string(),
            app: "sample".to_string(),
            generated_at: "2026-02-16T14:00:00Z".to_string(),
            generator: "railstack 0.3.0".to_string(),
            blake3_version: "1.8".to_string(),
            assembly_hash: "blake3:0123".to_string(),
            manifest_hash: None,
            stacks,
        }
    }

    #[test]
    fn test_rs009_lock_file_path() {
        let p = lock_file_path(Path::new("cdk.out"));
        assert_eq!(p, PathBuf::from("cdk.out/railstack.lock.yaml"));
    }

    #[test]
    fn test_rs009_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        save_lock(dir.path(), &make_lock()).unwrap();

        let loaded = load_lock(dir.path()).unwrap().unwrap();
        assert_eq!(loaded.app, "sample");
        assert_eq!(loaded.stacks["Net"].resources.len(), 1);
        assert_eq!(
            loaded.stacks["Net"].resources["EcsRailsSampleVPC1A2B3C4D"].resource_type,
            "AWS::EC2::VPC"
        );
    }

    #[test]
    fn test_rs009_load_nonexistent() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_lock(dir.path()).unwrap().is_none());
    }

    #[test]
    fn test_rs009_load_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(lock_file_path(dir.path()), "stacks: [unclosed").unwrap();
        assert!(load_lock(dir.path()).unwrap_err().contains("invalid lock file"));
    }

    #[test]
    fn test_rs009_atomic_write() {
        let dir = tempfile::tempdir().unwrap();
        save_lock(dir.path(), &make_lock()).unwrap();

        // Verify temp file is cleaned up
        assert!(!dir.path().join("railstack.lock.yaml.tmp").exists());
        assert!(lock_file_path(dir.path()).exists());
    }

    #[test]
    fn test_rs009_new_lock() {
        let lock = new_lock("sample");
        assert_eq!(lock.app, "sample");
        assert!(lock.generator.starts_with("railstack "));
        assert!(lock.generated_at.contains('T'));
        assert!(lock.stacks.is_empty());
    }

    #[test]
    fn test_rs009_lock_from_assembly_hashes() {
        use crate::core::stack::{App, CfnResource, Stack};
        use serde_json::json;

        let mut s = Stack::new("Net");
        s.add("Vpc", CfnResource::new("AWS::EC2::VPC", json!({"CidrBlock": "10.0.0.0/16"})))
            .unwrap();
        let mut app = App::new("sample");
        app.add_stack(s).unwrap();
        let assembly = crate::core::synth::synthesize(&app).unwrap();

        let mut lock = lock_from_assembly(&assembly);
        assert_eq!(
            lock.assembly_hash,
            hasher::composite_hash(&[assembly.stacks["Net"].hash.as_str()])
        );
        let net = &lock.stacks["Net"];
        assert_eq!(net.template, "Net.template.json");
        assert_eq!(net.resources.values().next().unwrap().resource_type, "AWS::EC2::VPC");

        let dir = tempfile::tempdir().unwrap();
        assert!(record_manifest(dir.path(), &mut lock).is_err());
        crate::core::synth::write_assembly(dir.path(), &assembly).unwrap();
        record_manifest(dir.path(), &mut lock).unwrap();
        assert!(lock.manifest_hash.unwrap().starts_with("blake3:"));
    }

    #[test]
    fn test_rs009_roundtrip_preserves_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut lock = make_lock();
        let mut extra = lock.stacks["Net"].clone();
        extra.template = "Api.template.json".to_string();
        lock.stacks.insert("Api".to_string(), extra);
        save_lock(dir.path(), &lock).unwrap();
        let loaded = load_lock(dir.path()).unwrap().unwrap();
        let keys: Vec<_> = loaded.stacks.keys().collect();
        assert_eq!(keys, vec!["Net", "Api"]);
    }
}
