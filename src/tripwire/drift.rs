//! RS-022: Drift detection. Compare the templates on disk to lock hashes.

use crate::core::synth::{read_template, MANIFEST_FILE};
use crate::core::types::{AssemblyLock, StackLock};
use crate::tripwire::hasher;
use serde_json::Value;
use std::path::Path;

/// A single drift finding.
#[derive(Debug, Clone)]
pub struct DriftFinding {
    pub stack: String,
    /// Logical ID when the drift is narrowed to one resource
    pub resource: Option<String>,
    pub expected_hash: String,
    pub actual_hash: String,
    pub detail: String,
}

/// Check one stack's template for drift.
///
/// A stack whose template hash matches yields nothing. Otherwise each edited,
/// added or removed resource gets its own finding; a template changed only
/// outside `Resources` yields one stack-level finding.
pub fn check_stack_drift(out_dir: &Path, name: &str, locked: &StackLock) -> Vec<DriftFinding> {
    let path = out_dir.join(&locked.template);
    if !path.exists() {
        return vec![DriftFinding {
            stack: name.to_string(),
            resource: None,
            expected_hash: locked.hash.clone(),
            actual_hash: "MISSING".to_string(),
            detail: format!("{} does not exist", path.display()),
        }];
    }

    let template = match read_template(out_dir, &locked.template) {
        Ok(t) => t,
        Err(e) => {
            return vec![DriftFinding {
                stack: name.to_string(),
                resource: None,
                expected_hash: locked.hash.clone(),
                actual_hash: "ERROR".to_string(),
                detail: e,
            }]
        }
    };

    let actual = hasher::hash_json(&template);
    if actual == locked.hash {
        return Vec::new();
    }

    let mut findings = Vec::new();
    let resources = template.get("Resources").and_then(Value::as_object);
    for (id, rl) in &locked.resources {
        let finding = match resources.and_then(|r| r.get(id)) {
            None => Some(("MISSING".to_string(), format!("{} removed from template", id))),
            Some(entry) => {
                let h = hasher::hash_json(entry);
                (h != rl.hash).then(|| (h, format!("{} ({}) edited", id, rl.resource_type)))
            }
        };
        if let Some((actual_hash, detail)) = finding {
            findings.push(DriftFinding {
                stack: name.to_string(),
                resource: Some(id.clone()),
                expected_hash: rl.hash.clone(),
                actual_hash,
                detail,
            });
        }
    }
    for (id, entry) in resources.into_iter().flatten() {
        if !locked.resources.contains_key(id) {
            findings.push(DriftFinding {
                stack: name.to_string(),
                resource: Some(id.clone()),
                expected_hash: "ABSENT".to_string(),
                actual_hash: hasher::hash_json(entry),
                detail: format!("{} added outside synth", id),
            });
        }
    }

    if findings.is_empty() {
        findings.push(DriftFinding {
            stack: name.to_string(),
            resource: None,
            expected_hash: locked.hash.clone(),
            actual_hash: actual,
            detail: format!("{} content changed", path.display()),
        });
    }
    findings
}

/// Check the assembly manifest against its recorded file hash.
pub fn check_manifest_drift(out_dir: &Path, expected_hash: &str) -> Option<DriftFinding> {
    let path = out_dir.join(MANIFEST_FILE);
    let finding = |actual_hash: String, detail: String| DriftFinding {
        stack: MANIFEST_FILE.to_string(),
        resource: None,
        expected_hash: expected_hash.to_string(),
        actual_hash,
        detail,
    };
    if !path.exists() {
        return Some(finding("MISSING".to_string(), format!("{} does not exist", path.display())));
    }
    let actual = hasher::hash_file(&path).unwrap_or_else(|e| format!("ERROR:{}", e));
    (actual != expected_hash).then(|| finding(actual, format!("{} content changed", path.display())))
}

/// Check every stack recorded in a lock, and the manifest, for drift.
pub fn detect_drift(out_dir: &Path, lock: &AssemblyLock) -> Vec<DriftFinding> {
    let mut findings: Vec<DriftFinding> = lock
        .stacks
        .iter()
        .flat_map(|(name, locked)| check_stack_drift(out_dir, name, locked))
        .collect();
    if let Some(expected) = &lock.manifest_hash {
        findings.extend(check_manifest_drift(out_dir, expected));
    }
    tracing::debug!(stacks = lock.stacks.len(), findings = findings.len(), "drift check");
    findings
}
