//! RS-007: Synthesis. Render stacks to CloudFormation JSON and write the
//! cloud assembly.
//!
//! An assembly directory holds one `<Stack>.template.json` per stack plus a
//! `manifest.json` recording each stack's environment, template file and
//! dependencies. Templates are checked for internal consistency before
//! anything is written.

use super::intrinsics::{collect_references, Reference};
use super::parser::{is_match, Pattern, ValidationError};
use super::resolver;
use super::stack::{App, Stack};
use super::state::write_atomic;
use super::types::{AssemblyManifest, ManifestArtifact};
use crate::tripwire::hasher;
use indexmap::IndexMap;
use regex::Regex;
use serde_json::{json, Map, Value};
use std::path::Path;
use std::sync::LazyLock;

/// Template format version emitted in every template.
pub const TEMPLATE_FORMAT_VERSION: &str = "2010-09-09";

/// Manifest file name inside an assembly directory.
pub const MANIFEST_FILE: &str = "manifest.json";

/// Manifest schema version.
pub const MANIFEST_VERSION: &str = "railstack/1";

static LOGICAL_ID: Pattern = LazyLock::new(|| Regex::new(r"^[A-Za-z0-9]{1,255}$").ok());
static EXPORT_NAME: Pattern = LazyLock::new(|| Regex::new(r"^[A-Za-z0-9:-]{1,255}$").ok());

/// One rendered stack.
#[derive(Debug, Clone)]
pub struct SynthesizedStack {
    pub name: String,
    pub template: Value,
    pub template_file: String,
    pub environment: String,
    pub dependencies: Vec<String>,
    pub hash: String,
}

impl SynthesizedStack {
    pub fn resource_count(&self) -> usize {
        self.template
            .get("Resources")
            .and_then(Value::as_object)
            .map_or(0, Map::len)
    }
}

/// Every stack of an app, rendered, in deployment order.
#[derive(Debug, Clone)]
pub struct CloudAssembly {
    pub app: String,
    pub order: Vec<String>,
    pub waves: Vec<Vec<String>>,
    pub stacks: IndexMap<String, SynthesizedStack>,
}

impl CloudAssembly {
    pub fn manifest(&self) -> AssemblyManifest {
        AssemblyManifest {
            version: MANIFEST_VERSION.to_string(),
            artifacts: self
                .stacks
                .iter()
                .map(|(name, s)| {
                    (
                        name.clone(),
                        ManifestArtifact {
                            artifact_type: "aws:cloudformation:stack".to_string(),
                            environment: s.environment.clone(),
                            template_file: s.template_file.clone(),
                            dependencies: s.dependencies.clone(),
                        },
                    )
                })
                .collect(),
        }
    }
}

/// Template file name of a stack.
pub fn template_file_name(stack: &str) -> String {
    format!("{}.template.json", stack)
}

/// Render a stack as a CloudFormation template.
pub fn render_template(stack: &Stack) -> Value {
    let mut template = Map::new();
    template.insert(
        "AWSTemplateFormatVersion".to_string(),
        json!(TEMPLATE_FORMAT_VERSION),
    );
    if let Some(ref description) = stack.description {
        template.insert("Description".to_string(), json!(description));
    }
    let resources: Map<String, Value> = stack
        .resources
        .iter()
        .map(|(id, r)| (id.clone(), r.to_json()))
        .collect();
    template.insert("Resources".to_string(), Value::Object(resources));
    if !stack.outputs.is_empty() {
        let outputs: Map<String, Value> = stack
            .outputs
            .iter()
            .map(|(id, o)| (id.clone(), o.to_json()))
            .collect();
        template.insert("Outputs".to_string(), Value::Object(outputs));
    }
    Value::Object(template)
}

fn check_target(
    stack: &Stack,
    context: &str,
    reference: &Reference,
    errors: &mut Vec<ValidationError>,
) {
    match reference {
        Reference::Ref(id) if id.starts_with("AWS::") => {}
        Reference::Ref(id) | Reference::GetAtt(id, _) => {
            if !stack.resources.contains_key(id) {
                errors.push(ValidationError::new(format!(
                    "{}: {} references undeclared resource '{}'",
                    stack.name, context, id
                )));
            }
        }
        Reference::Import(name) => {
            if !is_match(&EXPORT_NAME, name) {
                errors.push(ValidationError::new(format!(
                    "{}: {} imports malformed export name '{}'",
                    stack.name, context, name
                )));
            }
        }
    }
}

/// Check that every reference inside a stack resolves within it.
pub fn check_references(stack: &Stack) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    for (id, resource) in &stack.resources {
        if !is_match(&LOGICAL_ID, id) {
            errors.push(ValidationError::new(format!(
                "{}: logical ID '{}' must be 1-255 alphanumerics",
                stack.name, id
            )));
        }
        let mut refs = Vec::new();
        collect_references(&resource.properties, &mut refs);
        for r in &refs {
            check_target(stack, &format!("resource {}", id), r, &mut errors);
        }
        for dep in &resource.depends_on {
            if dep == id {
                errors.push(ValidationError::new(format!(
                    "{}: resource {} depends on itself",
                    stack.name, id
                )));
            } else if !stack.resources.contains_key(dep) {
                errors.push(ValidationError::new(format!(
                    "{}: resource {} depends on undeclared resource '{}'",
                    stack.name, id, dep
                )));
            }
        }
    }

    for (id, output) in &stack.outputs {
        let mut refs = Vec::new();
        collect_references(&output.value, &mut refs);
        for r in &refs {
            check_target(stack, &format!("output {}", id), r, &mut errors);
        }
        if let Some(ref name) = output.export_name {
            if !is_match(&EXPORT_NAME, name) {
                errors.push(ValidationError::new(format!(
                    "{}: export name '{}' is malformed",
                    stack.name, name
                )));
            }
        }
    }

    errors
}

/// Resolve the stack graph, check every stack and render the templates.
pub fn synthesize(app: &App) -> Result<CloudAssembly, String> {
    let order = resolver::build_stack_order(app)?;
    let waves = resolver::deployment_waves(app)?;
    let deps = resolver::stack_dependencies(app)?;

    let errors: Vec<ValidationError> = app.stacks.values().flat_map(check_references).collect();
    if !errors.is_empty() {
        return Err(errors
            .iter()
            .map(|e| e.message.as_str())
            .collect::<Vec<_>>()
            .join("\n"));
    }

    let mut stacks = IndexMap::new();
    for name in &order {
        let stack = app
            .stack(name)
            .ok_or_else(|| format!("stack '{}' vanished during synthesis", name))?;
        let template = render_template(stack);
        let hash = hasher::hash_json(&template);
        tracing::debug!(stack = %name, resources = stack.resources.len(), %hash, "rendered template");
        stacks.insert(
            name.clone(),
            SynthesizedStack {
                name: name.clone(),
                template,
                template_file: template_file_name(name),
                environment: stack.env.to_string(),
                dependencies: deps.get(name).cloned().unwrap_or_default(),
                hash,
            },
        );
    }

    Ok(CloudAssembly {
        app: app.name.clone(),
        order,
        waves,
        stacks,
    })
}

/// Write templates and `manifest.json` into an assembly directory.
pub fn write_assembly(out_dir: &Path, assembly: &CloudAssembly) -> Result<(), String> {
    std::fs::create_dir_all(out_dir)
        .map_err(|e| format!("cannot create {}: {}", out_dir.display(), e))?;

    for stack in assembly.stacks.values() {
        let body = serde_json::to_string_pretty(&stack.template)
            .map_err(|e| format!("JSON serialize error: {}", e))?;
        write_atomic(&out_dir.join(&stack.template_file), &body)?;
    }

    let manifest = serde_json::to_string_pretty(&assembly.manifest())
        .map_err(|e| format!("JSON serialize error: {}", e))?;
    write_atomic(&out_dir.join(MANIFEST_FILE), &manifest)?;

    tracing::info!(dir = %out_dir.display(), stacks = assembly.stacks.len(), "assembly written");
    Ok(())
}

/// Read a template back from an assembly directory.
pub fn read_template(out_dir: &Path, template_file: &str) -> Result<Value, String> {
    let path = out_dir.join(template_file);
    let content = std::fs::read_to_string(&path)
        .map_err(|e| format!("cannot read {}: {}", path.display(), e))?;
    serde_json::from_str(&content).map_err(|e| format!("invalid template {}: {}", path.display(), e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::intrinsics::{get_att, ref_to};
    use crate::core::stack::CfnResource;

    fn tiny_app() -> App {
        let mut net = Stack::new("Net").with_description("network");
        let vpc = net
            .add("Vpc", CfnResource::new("AWS::EC2::VPC", json!({"CidrBlock": "10.0.0.0/16"})))
            .unwrap();
        net.export("VpcId", ref_to(&vpc), None);

        let mut db = Stack::new("Db");
        db.add(
            "Group",
            CfnResource::new("AWS::EC2::SecurityGroup", json!({"VpcId": {"Fn::ImportValue": "Net:VpcId"}})),
        )
        .unwrap();

        let mut app = App::new("tiny");
        app.add_stack(db).unwrap();
        app.add_stack(net).unwrap();
        app
    }

    #[test]
    fn test_rs007_render_shape() {
        let app = tiny_app();
        let t = render_template(app.stack("Net").unwrap());
        assert_eq!(t["AWSTemplateFormatVersion"], "2010-09-09");
        assert_eq!(t["Description"], "network");
        assert_eq!(t["Resources"].as_object().unwrap().len(), 1);
        assert_eq!(t["Outputs"]["VpcId"]["Export"]["Name"], "Net:VpcId");

        let db = render_template(app.stack("Db").unwrap());
        assert!(db.get("Outputs").is_none());
        assert!(db.get("Description").is_none());
    }

    #[test]
    fn test_rs007_check_references_clean() {
        let app = tiny_app();
        for stack in app.stacks.values() {
            assert!(check_references(stack).is_empty());
        }
    }

    #[test]
    fn test_rs007_dangling_ref_and_depends_on() {
        let mut s = Stack::new("S");
        s.add(
            "A",
            CfnResource::new("AWS::SNS::Topic", json!({"X": ref_to("Ghost"), "Y": get_att("Other", "Arn")}))
                .depends_on("Missing"),
        )
        .unwrap();
        s.output("Out", ref_to("AlsoGhost"), None);
        let errors = check_references(&s);
        assert_eq!(errors.len(), 4, "{:?}", errors);
        assert!(errors.iter().any(|e| e.message.contains("'Ghost'")));
        assert!(errors.iter().any(|e| e.message.contains("depends on undeclared")));
    }

    #[test]
    fn test_rs007_pseudo_parameters_allowed() {
        let mut s = Stack::new("S");
        s.add("A", CfnResource::new("AWS::SNS::Topic", json!({"R": ref_to("AWS::Region")})))
            .unwrap();
        assert!(check_references(&s).is_empty());
    }

    #[test]
    fn test_rs007_synthesize_orders_and_records_deps() {
        let assembly = synthesize(&tiny_app()).unwrap();
        assert_eq!(assembly.order, vec!["Net", "Db"]);
        assert_eq!(assembly.waves, vec![vec!["Net"], vec!["Db"]]);
        let db = &assembly.stacks["Db"];
        assert_eq!(db.dependencies, vec!["Net"]);
        assert_eq!(db.template_file, "Db.template.json");
        assert_eq!(db.environment, "aws://unknown-account/unknown-region");
        assert_eq!(db.resource_count(), 1);
        assert!(db.hash.starts_with("blake3:"));
    }

    #[test]
    fn test_rs007_synthesize_rejects_dangling() {
        let mut app = tiny_app();
        let mut bad = Stack::new("Bad");
        bad.add("A", CfnResource::new("AWS::SNS::Topic", json!({"X": ref_to("Nope")})))
            .unwrap();
        app.add_stack(bad).unwrap();
        assert!(synthesize(&app).unwrap_err().contains("undeclared resource 'Nope'"));
    }

    #[test]
    fn test_rs007_write_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let assembly = synthesize(&tiny_app()).unwrap();
        write_assembly(dir.path(), &assembly).unwrap();

        let t = read_template(dir.path(), "Net.template.json").unwrap();
        assert_eq!(t, assembly.stacks["Net"].template);
        assert_eq!(hasher::hash_json(&t), assembly.stacks["Net"].hash);

        let manifest: AssemblyManifest = serde_json::from_str(
            &std::fs::read_to_string(dir.path().join("manifest.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(manifest.artifacts["Db"].dependencies, vec!["Net"]);
        assert_eq!(manifest.artifacts["Net"].artifact_type, "aws:cloudformation:stack");
        assert!(!dir.path().join("manifest.json.tmp").exists());
    }

    #[test]
    fn test_rs007_synthesis_deterministic() {
        let a = synthesize(&tiny_app()).unwrap();
        let b = synthesize(&tiny_app()).unwrap();
        for (name, s) in &a.stacks {
            assert_eq!(s.hash, b.stacks[name].hash);
        }
    }
}
