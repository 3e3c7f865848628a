//! RS-015: Plan generation. Diff a synthesized assembly against the lock
//! of the previous synth.

use super::synth::CloudAssembly;
use super::types::*;
use crate::tripwire::hasher;
use serde_json::Value;
use std::collections::HashMap;

/// Changed paths listed in an UPDATE description before eliding the rest.
const MAX_LISTED_PATHS: usize = 4;

/// Generate an execution plan by comparing an assembly to the previous lock.
///
/// `previous` maps stack names to the templates last written, when still on
/// disk; they only enrich UPDATE descriptions with the changed paths.
pub fn plan(
    assembly: &CloudAssembly,
    lock: Option<&AssemblyLock>,
    previous: &HashMap<String, Value>,
) -> ExecutionPlan {
    let mut changes = Vec::new();

    for name in &assembly.order {
        let Some(stack) = assembly.stacks.get(name) else {
            continue;
        };
        let locked = lock.and_then(|l| l.stacks.get(name));
        let resources = stack
            .template
            .get("Resources")
            .and_then(Value::as_object);

        for (id, entry) in resources.into_iter().flatten() {
            let resource_type = entry
                .get("Type")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let action = determine_action(id, entry, locked);
            let description = match action {
                PlanAction::Update => {
                    let old = previous
                        .get(name)
                        .and_then(|t| t.get("Resources"))
                        .and_then(|r| r.get(id));
                    describe_update(id, old, entry)
                }
                _ => describe_action(id, &resource_type, &action),
            };
            changes.push(PlannedChange {
                stack: name.clone(),
                logical_id: id.clone(),
                resource_type,
                action,
                description,
            });
        }

        // Resources dropped from a surviving stack
        if let Some(locked) = locked {
            for (id, rl) in &locked.resources {
                let still_declared = resources.is_some_and(|r| r.contains_key(id));
                if !still_declared {
                    changes.push(destroy(name, id, &rl.resource_type));
                }
            }
        }
    }

    // Stacks dropped from the app, torn down last
    if let Some(lock) = lock {
        for (name, locked) in lock.stacks.iter().rev() {
            if assembly.stacks.contains_key(name) {
                continue;
            }
            for (id, rl) in &locked.resources {
                changes.push(destroy(name, id, &rl.resource_type));
            }
        }
    }

    let count = |a: PlanAction| {
        u32::try_from(changes.iter().filter(|c| c.action == a).count()).unwrap_or(u32::MAX)
    };
    ExecutionPlan {
        name: assembly.app.clone(),
        to_create: count(PlanAction::Create),
        to_update: count(PlanAction::Update),
        to_destroy: count(PlanAction::Destroy),
        unchanged: count(PlanAction::NoOp),
        execution_order: assembly.order.clone(),
        changes,
    }
}

fn destroy(stack: &str, id: &str, resource_type: &str) -> PlannedChange {
    PlannedChange {
        stack: stack.to_string(),
        logical_id: id.to_string(),
        resource_type: resource_type.to_string(),
        action: PlanAction::Destroy,
        description: describe_action(id, resource_type, &PlanAction::Destroy),
    }
}

/// Determine what the engine will do with a declared resource.
fn determine_action(id: &str, entry: &Value, locked: Option<&StackLock>) -> PlanAction {
    match locked.and_then(|l| l.resources.get(id)) {
        None => PlanAction::Create,
        Some(rl) if rl.hash == hasher::hash_json(entry) => PlanAction::NoOp,
        Some(_) => PlanAction::Update,
    }
}

/// Generate a human-readable description of a planned action.
fn describe_action(id: &str, resource_type: &str, action: &PlanAction) -> String {
    match action {
        PlanAction::Create => format!("{}: create {}", id, resource_type),
        PlanAction::Update => format!("{}: update (declaration changed)", id),
        PlanAction::Destroy => format!("{}: destroy {}", id, resource_type),
        PlanAction::NoOp => format!("{}: no changes", id),
    }
}

fn describe_update(id: &str, old: Option<&Value>, new: &Value) -> String {
    let Some(old) = old else {
        return describe_action(id, "", &PlanAction::Update);
    };
    let paths = diff_values(old, new);
    if paths.is_empty() {
        return describe_action(id, "", &PlanAction::Update);
    }
    let mut listed: Vec<&str> = paths.iter().take(MAX_LISTED_PATHS).map(String::as_str).collect();
    let extra = paths.len().saturating_sub(MAX_LISTED_PATHS);
    let more = format!("+{} more", extra);
    if extra > 0 {
        listed.push(&more);
    }
    format!("{}: update {}", id, listed.join(", "))
}

/// Paths at which two JSON values differ, in document order.
///
/// Object keys are joined with `.`, array indices as `[i]`. A key present on
/// one side only, or an array whose length changed, is reported at its own
/// path without descending.
pub fn diff_values(old: &Value, new: &Value) -> Vec<String> {
    let mut out = Vec::new();
    diff_into("", old, new, &mut out);
    out
}

fn join_key(path: &str, key: &str) -> String {
    if path.is_empty() {
        key.to_string()
    } else {
        format!("{}.{}", path, key)
    }
}

fn diff_into(path: &str, old: &Value, new: &Value, out: &mut Vec<String>) {
    match (old, new) {
        (Value::Object(a), Value::Object(b)) => {
            for (key, av) in a {
                match b.get(key) {
                    Some(bv) => diff_into(&join_key(path, key), av, bv, out),
                    None => out.push(join_key(path, key)),
                }
            }
            for key in b.keys().filter(|k| !a.contains_key(*k)) {
                out.push(join_key(path, key));
            }
        }
        (Value::Array(a), Value::Array(b)) if a.len() == b.len() => {
            for (i, (av, bv)) in a.iter().zip(b).enumerate() {
                diff_into(&format!("{}[{}]", path, i), av, bv, out);
            }
        }
        (a, b) if a == b => {}
        _ => out.push(if path.is_empty() { "$".to_string() } else { path.to_string() }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::stack::{App, CfnResource, Stack};
    use crate::core::state::lock_from_assembly;
    use crate::core::synth::synthesize;
    use serde_json::json;

    fn app(port: u16, with_topic: bool) -> App {
        let mut s = Stack::new("Net");
        s.add(
            "Listener",
            CfnResource::new("AWS::ElasticLoadBalancingV2::Listener", json!({"Port": port, "Protocol": "HTTP"})),
        )
        .unwrap();
        if with_topic {
            s.add("Topic", CfnResource::new("AWS::SNS::Topic", json!({}))).unwrap();
        }
        let mut app = App::new("sample");
        app.add_stack(s).unwrap();
        app
    }

    fn previous(assembly: &CloudAssembly) -> HashMap<String, Value> {
        assembly
            .stacks
            .iter()
            .map(|(n, s)| (n.clone(), s.template.clone()))
            .collect()
    }

    #[test]
    fn test_rs015_plan_all_create() {
        let assembly = synthesize(&app(80, true)).unwrap();
        let plan = plan(&assembly, None, &HashMap::new());
        assert_eq!(plan.to_create, 2);
        assert_eq!(plan.to_update, 0);
        assert_eq!(plan.unchanged, 0);
        assert!(plan.changes.iter().all(|c| c.action == PlanAction::Create));
        assert!(plan.changes[0].description.contains("create AWS::ElasticLoadBalancingV2::Listener"));
        assert_eq!(plan.execution_order, vec!["Net"]);
    }

    #[test]
    fn test_rs015_plan_all_unchanged() {
        let assembly = synthesize(&app(80, true)).unwrap();
        let lock = lock_from_assembly(&assembly);
        let plan = plan(&assembly, Some(&lock), &previous(&assembly));
        assert_eq!(plan.unchanged, 2);
        assert_eq!(plan.to_create, 0);
    }

    #[test]
    fn test_rs015_plan_update_lists_paths() {
        let before = synthesize(&app(80, true)).unwrap();
        let lock = lock_from_assembly(&before);
        let after = synthesize(&app(8080, true)).unwrap();
        let plan = plan(&after, Some(&lock), &previous(&before));
        assert_eq!(plan.to_update, 1);
        assert_eq!(plan.unchanged, 1);
        let update = plan
            .changes
            .iter()
            .find(|c| c.action == PlanAction::Update)
            .unwrap();
        assert!(update.description.ends_with("update Properties.Port"), "{}", update.description);
    }

    #[test]
    fn test_rs015_plan_update_without_previous_template() {
        let before = synthesize(&app(80, false)).unwrap();
        let lock = lock_from_assembly(&before);
        let after = synthesize(&app(81, false)).unwrap();
        let plan = plan(&after, Some(&lock), &HashMap::new());
        assert!(plan.changes[0].description.contains("declaration changed"));
    }

    #[test]
    fn test_rs015_plan_destroy_removed_resource() {
        let before = synthesize(&app(80, true)).unwrap();
        let lock = lock_from_assembly(&before);
        let after = synthesize(&app(80, false)).unwrap();
        let plan = plan(&after, Some(&lock), &HashMap::new());
        assert_eq!(plan.to_destroy, 1);
        assert_eq!(plan.unchanged, 1);
        let gone = plan.changes.last().unwrap();
        assert_eq!(gone.resource_type, "AWS::SNS::Topic");
    }

    #[test]
    fn test_rs015_plan_destroy_removed_stack() {
        let before = synthesize(&app(80, true)).unwrap();
        let mut lock = lock_from_assembly(&before);
        let mut old = lock.stacks["Net"].clone();
        old.template = "Old.template.json".to_string();
        lock.stacks.insert("Old".to_string(), old);
        let plan = plan(&before, Some(&lock), &HashMap::new());
        assert_eq!(plan.to_destroy, 2);
        assert!(plan
            .changes
            .iter()
            .filter(|c| c.action == PlanAction::Destroy)
            .all(|c| c.stack == "Old"));
    }

    #[test]
    fn test_rs015_diff_values_paths() {
        let a = json!({"A": 1, "B": {"C": [1, 2], "D": "x"}, "Gone": true});
        let b = json!({"A": 1, "B": {"C": [1, 3], "D": "y"}, "New": null});
        assert_eq!(diff_values(&a, &b), vec!["B.C[1]", "B.D", "Gone", "New"]);
        assert!(diff_values(&a, &a).is_empty());
        assert_eq!(diff_values(&json!([1]), &json!([1, 2])), vec!["$"]);
    }

    #[test]
    fn test_rs015_describe_update_elides() {
        let old = json!({"a": 1, "b": 1, "c": 1, "d": 1, "e": 1, "f": 1});
        let new = json!({"a": 2, "b": 2, "c": 2, "d": 2, "e": 2, "f": 2});
        let d = describe_update("X", Some(&old), &new);
        assert_eq!(d, "X: update a, b, c, d, +2 more");
    }
}
