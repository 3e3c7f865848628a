//! RS-006: Stack dependency DAG construction.
//!
//! Builds a DAG from explicit stack `depends_on` edges plus every
//! `Fn::ImportValue`, resolved to the stack that exports the value.
//! Computes topological order using Kahn's algorithm with deterministic
//! (alphabetical) tie-breaking, and groups stacks into deployment waves.

use super::stack::App;
use indexmap::IndexMap;
use std::collections::{HashMap, HashSet, VecDeque};

/// Map every export name in the app to the stack that publishes it.
pub fn export_index(app: &App) -> Result<HashMap<String, String>, String> {
    let mut index: HashMap<String, String> = HashMap::new();
    for (name, stack) in &app.stacks {
        for export in stack.exports() {
            if let Some(other) = index.insert(export.clone(), name.clone()) {
                return Err(format!(
                    "export '{}' is published by both '{}' and '{}'",
                    export, other, name
                ));
            }
        }
    }
    Ok(index)
}

/// Direct dependencies of every stack, in declaration order.
pub fn stack_dependencies(app: &App) -> Result<IndexMap<String, Vec<String>>, String> {
    let exports = export_index(app)?;
    let mut deps: IndexMap<String, Vec<String>> = IndexMap::new();

    for (name, stack) in &app.stacks {
        let mut direct: Vec<String> = Vec::new();

        for dep in &stack.depends_on {
            if dep == name {
                return Err(format!("stack '{}' depends on itself", name));
            }
            if !app.stacks.contains_key(dep) {
                return Err(format!("stack '{}' depends on unknown stack '{}'", name, dep));
            }
            if !direct.contains(dep) {
                direct.push(dep.clone());
            }
        }

        for import in stack.imports() {
            let producer = exports.get(&import).ok_or_else(|| {
                format!("stack '{}' imports unknown export '{}'", name, import)
            })?;
            if producer == name {
                return Err(format!(
                    "stack '{}' imports its own export '{}'",
                    name, import
                ));
            }
            if !direct.contains(producer) {
                direct.push(producer.clone());
            }
        }

        deps.insert(name.clone(), direct);
    }

    Ok(deps)
}

/// Build a topological deployment order from stack dependencies.
/// Uses Kahn's algorithm with alphabetical tie-breaking for determinism.
pub fn build_stack_order(app: &App) -> Result<Vec<String>, String> {
    let deps = stack_dependencies(app)?;
    let mut in_degree: HashMap<&str, usize> = HashMap::new();
    let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();

    for name in deps.keys() {
        in_degree.insert(name, 0);
        adjacency.insert(name, Vec::new());
    }
    for (name, direct) in &deps {
        for dep in direct {
            adjacency.entry(dep.as_str()).or_default().push(name);
            *in_degree.entry(name.as_str()).or_default() += 1;
        }
    }

    // Kahn's algorithm with sorted tie-breaking
    let mut zero_degree: Vec<&str> = in_degree
        .iter()
        .filter(|(_, &d)| d == 0)
        .map(|(name, _)| *name)
        .collect();
    zero_degree.sort_unstable();
    let mut queue: VecDeque<&str> = zero_degree.into_iter().collect();

    let mut order: Vec<String> = Vec::new();
    while let Some(current) = queue.pop_front() {
        order.push(current.to_string());

        let mut next_ready: Vec<&str> = Vec::new();
        if let Some(neighbors) = adjacency.get(current) {
            for neighbor in neighbors {
                if let Some(degree) = in_degree.get_mut(neighbor) {
                    *degree -= 1;
                    if *degree == 0 {
                        next_ready.push(neighbor);
                    }
                }
            }
        }
        next_ready.sort_unstable();
        queue.extend(next_ready);
    }

    if order.len() != deps.len() {
        let ordered: HashSet<&str> = order.iter().map(String::as_str).collect();
        let mut cycle_members: Vec<&str> = deps
            .keys()
            .map(String::as_str)
            .filter(|n| !ordered.contains(n))
            .collect();
        cycle_members.sort_unstable();
        return Err(format!(
            "dependency cycle detected involving: {}",
            cycle_members.join(", ")
        ));
    }

    tracing::debug!(order = ?order, "stack order resolved");
    Ok(order)
}

/// Group stacks into waves: every stack's dependencies sit in earlier waves.
/// Stacks within a wave are sorted alphabetically.
pub fn deployment_waves(app: &App) -> Result<Vec<Vec<String>>, String> {
    let order = build_stack_order(app)?;
    let deps = stack_dependencies(app)?;
    let mut level: HashMap<&str, usize> = HashMap::new();

    // Order guarantees every dependency already has a level
    for name in &order {
        let depth = deps
            .get(name)
            .map(|direct| {
                direct
                    .iter()
                    .filter_map(|d| level.get(d.as_str()))
                    .map(|l| l + 1)
                    .max()
                    .unwrap_or(0)
            })
            .unwrap_or(0);
        level.insert(name, depth);
    }

    let count = level.values().max().map_or(0, |m| m + 1);
    let mut waves: Vec<Vec<String>> = vec![Vec::new(); count];
    for name in &order {
        if let Some(&l) = level.get(name.as_str()) {
            waves[l].push(name.clone());
        }
    }
    for wave in &mut waves {
        wave.sort();
    }
    Ok(waves)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::stack::{CfnResource, Stack};
    use serde_json::json;

    fn producer(name: &str, export: &str) -> Stack {
        let mut s = Stack::new(name);
        s.export(export, json!("value"), None);
        s
    }

    fn consumer(name: &str, import: &str) -> Stack {
        let mut s = Stack::new(name);
        s.add(
            "Thing",
            CfnResource::new("AWS::SSM::Parameter", json!({ "Value": { "Fn::ImportValue": import } })),
        )
        .unwrap();
        s
    }

    #[test]
    fn test_rs006_linear() {
        let mut app = App::new("t");
        app.add_stack(consumer("c", "b:Out")).unwrap();
        let mut b = consumer("b", "a:Out");
        b.export("Out", json!("x"), None);
        app.add_stack(b).unwrap();
        app.add_stack(producer("a", "Out")).unwrap();
        assert_eq!(build_stack_order(&app).unwrap(), vec!["a", "b", "c"]);
        assert_eq!(
            deployment_waves(&app).unwrap(),
            vec![vec!["a"], vec!["b"], vec!["c"]]
        );
    }

    #[test]
    fn test_rs006_parallel_alphabetical() {
        let mut app = App::new("t");
        app.add_stack(Stack::new("beta")).unwrap();
        app.add_stack(Stack::new("alpha")).unwrap();
        assert_eq!(build_stack_order(&app).unwrap(), vec!["alpha", "beta"]);
        assert_eq!(deployment_waves(&app).unwrap(), vec![vec!["alpha", "beta"]]);
    }

    #[test]
    fn test_rs006_explicit_dependency() {
        let mut app = App::new("t");
        let mut late = Stack::new("a-late");
        late.add_dependency("z-early");
        app.add_stack(late).unwrap();
        app.add_stack(Stack::new("z-early")).unwrap();
        assert_eq!(build_stack_order(&app).unwrap(), vec!["z-early", "a-late"]);
    }

    #[test]
    fn test_rs006_import_and_explicit_deduplicated() {
        let mut app = App::new("t");
        app.add_stack(producer("net", "Vpc")).unwrap();
        let mut db = consumer("db", "net:Vpc");
        db.add_dependency("net");
        app.add_stack(db).unwrap();
        let deps = stack_dependencies(&app).unwrap();
        assert_eq!(deps["db"], vec!["net"]);
        assert!(deps["net"].is_empty());
    }

    #[test]
    fn test_rs006_unknown_import() {
        let mut app = App::new("t");
        app.add_stack(consumer("db", "net:Missing")).unwrap();
        let err = build_stack_order(&app).unwrap_err();
        assert!(err.contains("unknown export"));
    }

    #[test]
    fn test_rs006_unknown_explicit_dependency() {
        let mut app = App::new("t");
        let mut s = Stack::new("a");
        s.add_dependency("ghost");
        app.add_stack(s).unwrap();
        assert!(stack_dependencies(&app).unwrap_err().contains("unknown stack"));
    }

    #[test]
    fn test_rs006_self_import_rejected() {
        let mut app = App::new("t");
        let mut s = consumer("a", "a:Out");
        s.export("Out", json!("x"), None);
        app.add_stack(s).unwrap();
        assert!(stack_dependencies(&app).unwrap_err().contains("its own export"));
    }

    #[test]
    fn test_rs006_cycle() {
        let mut app = App::new("t");
        let mut a = consumer("a", "b:Out");
        a.export("Out", json!("x"), None);
        let mut b = consumer("b", "a:Out");
        b.export("Out", json!("y"), None);
        app.add_stack(a).unwrap();
        app.add_stack(b).unwrap();
        let err = build_stack_order(&app).unwrap_err();
        assert!(err.contains("cycle"));
        assert!(err.contains("a, b"));
    }

    #[test]
    fn test_rs006_duplicate_export_name() {
        let mut app = App::new("t");
        let mut a = Stack::new("a");
        a.outputs.insert(
            "X".to_string(),
            crate::core::stack::CfnOutput {
                value: json!(1),
                description: None,
                export_name: Some("shared".to_string()),
            },
        );
        let mut b = a.clone();
        b.name = "b".to_string();
        app.add_stack(a).unwrap();
        app.add_stack(b).unwrap();
        assert!(export_index(&app).unwrap_err().contains("published by both"));
    }

    #[test]
    fn test_rs006_diamond() {
        let mut app = App::new("t");
        app.add_stack(producer("top", "Out")).unwrap();
        let mut left = consumer("left", "top:Out");
        left.export("L", json!(1), None);
        let mut right = consumer("right", "top:Out");
        right.export("R", json!(1), None);
        let mut bottom = consumer("bottom", "left:L");
        bottom.add_dependency("right");
        app.add_stack(bottom).unwrap();
        app.add_stack(left).unwrap();
        app.add_stack(right).unwrap();
        let order = build_stack_order(&app).unwrap();
        assert_eq!(order, vec!["top", "left", "right", "bottom"]);
        assert_eq!(
            deployment_waves(&app).unwrap(),
            vec![vec!["top"], vec!["left", "right"], vec!["bottom"]]
        );
    }
}
