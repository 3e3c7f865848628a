//! RS-003: Stack model. Resources, outputs, exports and logical IDs.
//!
//! A [`Stack`] is a named collection of CloudFormation resource declarations.
//! Resources are added under a construct path (`"Vpc/PublicSubnet1"`); the
//! logical ID is the path with non-alphanumerics removed plus an 8-hex BLAKE3
//! suffix of the path, so IDs are stable across runs and unique per path.
//!
//! Cross-stack wiring goes through [`ExportRef`]: the producing stack exports
//! a named output and the consumer embeds `Fn::ImportValue`.

use super::intrinsics::{self, Reference};
use super::types::{Environment, RemovalPolicy};
use indexmap::IndexMap;
use serde_json::{json, Map, Value};

/// Resource types that accept `DeletionPolicy: Snapshot`.
const SNAPSHOT_TYPES: &[&str] = &["AWS::RDS::DBCluster", "AWS::RDS::DBInstance"];

/// Derive the logical ID for a construct path.
pub fn logical_id_for(path: &str) -> String {
    let readable: String = path
        .split('/')
        .flat_map(|part| part.chars().filter(|c| c.is_ascii_alphanumeric()))
        .collect();
    let digest = blake3::hash(path.as_bytes()).to_hex();
    let mut id = readable;
    id.truncate(240);
    id.push_str(&digest[..8].to_ascii_uppercase());
    id
}

/// A single resource declaration.
#[derive(Debug, Clone, PartialEq)]
pub struct CfnResource {
    pub resource_type: String,
    pub properties: Value,
    pub depends_on: Vec<String>,
    pub deletion_policy: Option<String>,
    pub update_replace_policy: Option<String>,
    /// Construct path, set when added to a stack
    pub path: String,
}

impl CfnResource {
    pub fn new(resource_type: &str, properties: Value) -> Self {
        Self {
            resource_type: resource_type.to_string(),
            properties,
            depends_on: Vec::new(),
            deletion_policy: None,
            update_replace_policy: None,
            path: String::new(),
        }
    }

    /// Add an explicit `DependsOn` edge to another resource of the same stack.
    pub fn depends_on(mut self, logical_id: &str) -> Self {
        if !self.depends_on.iter().any(|d| d == logical_id) {
            self.depends_on.push(logical_id.to_string());
        }
        self
    }

    /// Apply a removal policy as `DeletionPolicy` + `UpdateReplacePolicy`.
    pub fn with_removal_policy(mut self, policy: RemovalPolicy) -> Self {
        let supports_snapshot = SNAPSHOT_TYPES.contains(&self.resource_type.as_str());
        let value = policy.deletion_policy(supports_snapshot).to_string();
        self.deletion_policy = Some(value.clone());
        self.update_replace_policy = Some(value);
        self
    }

    /// Property lookup by top-level key.
    pub fn prop(&self, key: &str) -> Option<&Value> {
        self.properties.get(key)
    }

    /// Render as a template `Resources` entry.
    pub fn to_json(&self) -> Value {
        let mut entry = Map::new();
        entry.insert("Type".to_string(), json!(self.resource_type));
        if self.properties.as_object().is_some_and(|p| !p.is_empty()) {
            entry.insert("Properties".to_string(), self.properties.clone());
        }
        if !self.depends_on.is_empty() {
            entry.insert("DependsOn".to_string(), json!(self.depends_on));
        }
        if let Some(ref p) = self.deletion_policy {
            entry.insert("DeletionPolicy".to_string(), json!(p));
        }
        if let Some(ref p) = self.update_replace_policy {
            entry.insert("UpdateReplacePolicy".to_string(), json!(p));
        }
        if !self.path.is_empty() {
            entry.insert(
                "Metadata".to_string(),
                json!({ "railstack:path": self.path }),
            );
        }
        Value::Object(entry)
    }
}

/// A stack output, optionally exported under a global name.
#[derive(Debug, Clone, PartialEq)]
pub struct CfnOutput {
    pub value: Value,
    pub description: Option<String>,
    pub export_name: Option<String>,
}

impl CfnOutput {
    pub fn to_json(&self) -> Value {
        let mut entry = Map::new();
        if let Some(ref d) = self.description {
            entry.insert("Description".to_string(), json!(d));
        }
        entry.insert("Value".to_string(), self.value.clone());
        if let Some(ref name) = self.export_name {
            entry.insert("Export".to_string(), json!({ "Name": name }));
        }
        Value::Object(entry)
    }
}

/// Opaque handle to a value exported by another stack.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExportRef {
    pub stack: String,
    pub name: String,
}

impl ExportRef {
    /// The `Fn::ImportValue` expression a consumer embeds.
    pub fn import(&self) -> Value {
        intrinsics::import_value(&self.name)
    }
}

/// A named, independently deployable collection of resources.
#[derive(Debug, Clone)]
pub struct Stack {
    pub name: String,
    pub description: Option<String>,
    pub env: Environment,
    pub resources: IndexMap<String, CfnResource>,
    pub outputs: IndexMap<String, CfnOutput>,
    /// Explicit stack-level dependencies (in addition to imports)
    pub depends_on: Vec<String>,
}

impl Stack {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            description: None,
            env: Environment::default(),
            resources: IndexMap::new(),
            outputs: IndexMap::new(),
            depends_on: Vec::new(),
        }
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = Some(description.to_string());
        self
    }

    pub fn with_env(mut self, env: Environment) -> Self {
        self.env = env;
        self
    }

    /// Add a resource under a construct path and return its logical ID.
    pub fn add(&mut self, path: &str, mut resource: CfnResource) -> Result<String, String> {
        let id = logical_id_for(path);
        if self.resources.contains_key(&id) {
            return Err(format!(
                "stack '{}': duplicate construct path '{}'",
                self.name, path
            ));
        }
        resource.path = path.to_string();
        tracing::trace!(stack = %self.name, %path, logical_id = %id, "declared resource");
        self.resources.insert(id.clone(), resource);
        Ok(id)
    }

    /// Logical ID of a declared construct path.
    pub fn logical_id(&self, path: &str) -> Option<String> {
        let id = logical_id_for(path);
        self.resources.contains_key(&id).then_some(id)
    }

    /// Resource declared under a construct path.
    pub fn resource(&self, path: &str) -> Option<&CfnResource> {
        self.resources.get(&logical_id_for(path))
    }

    /// All resources of a CloudFormation type, in declaration order.
    pub fn resources_of_type<'a>(
        &'a self,
        resource_type: &'a str,
    ) -> impl Iterator<Item = (&'a String, &'a CfnResource)> + 'a {
        self.resources
            .iter()
            .filter(move |(_, r)| r.resource_type == resource_type)
    }

    /// Declare a plain output.
    pub fn output(&mut self, id: &str, value: Value, description: Option<&str>) {
        self.outputs.insert(
            id.to_string(),
            CfnOutput {
                value,
                description: description.map(str::to_string),
                export_name: None,
            },
        );
    }

    /// Declare an exported output and return the handle consumers import.
    pub fn export(&mut self, id: &str, value: Value, description: Option<&str>) -> ExportRef {
        let name = format!("{}:{}", self.name, id);
        self.outputs.insert(
            id.to_string(),
            CfnOutput {
                value,
                description: description.map(str::to_string),
                export_name: Some(name.clone()),
            },
        );
        ExportRef {
            stack: self.name.clone(),
            name,
        }
    }

    /// Add an explicit stack-level dependency.
    pub fn add_dependency(&mut self, stack: &str) {
        if !self.depends_on.iter().any(|d| d == stack) {
            self.depends_on.push(stack.to_string());
        }
    }

    /// Export names this stack publishes.
    pub fn exports(&self) -> Vec<String> {
        self.outputs
            .values()
            .filter_map(|o| o.export_name.clone())
            .collect()
    }

    /// Export names this stack imports (deduplicated, first-seen order).
    pub fn imports(&self) -> Vec<String> {
        let mut refs = Vec::new();
        for r in self.resources.values() {
            intrinsics::collect_references(&r.properties, &mut refs);
        }
        for o in self.outputs.values() {
            intrinsics::collect_references(&o.value, &mut refs);
        }
        let mut names: Vec<String> = Vec::new();
        for r in refs {
            if let Reference::Import(name) = r {
                if !names.contains(&name) {
                    names.push(name);
                }
            }
        }
        names
    }
}

/// The composed set of stacks.
#[derive(Debug, Clone)]
pub struct App {
    pub name: String,
    pub stacks: IndexMap<String, Stack>,
}

impl App {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            stacks: IndexMap::new(),
        }
    }

    pub fn add_stack(&mut self, stack: Stack) -> Result<(), String> {
        if self.stacks.contains_key(&stack.name) {
            return Err(format!("duplicate stack name '{}'", stack.name));
        }
        self.stacks.insert(stack.name.clone(), stack);
        Ok(())
    }

    pub fn stack(&self, name: &str) -> Option<&Stack> {
        self.stacks.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rs003_logical_id_stable() {
        let a = logical_id_for("EcsRailsSampleVPC/PublicSubnet1");
        let b = logical_id_for("EcsRailsSampleVPC/PublicSubnet1");
        assert_eq!(a, b);
        assert!(a.starts_with("EcsRailsSampleVPCPublicSubnet1"));
        assert_eq!(a.len(), "EcsRailsSampleVPCPublicSubnet1".len() + 8);
    }

    #[test]
    fn test_rs003_logical_id_distinguishes_separator() {
        // Same readable part, different paths
        assert_ne!(logical_id_for("A/BC"), logical_id_for("AB/C"));
    }

    #[test]
    fn test_rs003_logical_id_strips_symbols() {
        let id = logical_id_for("API to DB/Security-Group");
        assert!(id.starts_with("APItoDBSecurityGroup"));
        assert!(id.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn test_rs003_add_and_lookup() {
        let mut stack = Stack::new("Net");
        let id = stack
            .add("Vpc", CfnResource::new("AWS::EC2::VPC", json!({"CidrBlock": "10.0.0.0/16"})))
            .unwrap();
        assert_eq!(stack.logical_id("Vpc"), Some(id.clone()));
        assert_eq!(stack.resource("Vpc").unwrap().path, "Vpc");
        assert!(stack.logical_id("Missing").is_none());
        assert_eq!(stack.resources_of_type("AWS::EC2::VPC").count(), 1);
    }

    #[test]
    fn test_rs003_duplicate_path_rejected() {
        let mut stack = Stack::new("Net");
        stack.add("Vpc", CfnResource::new("AWS::EC2::VPC", json!({}))).unwrap();
        let err = stack
            .add("Vpc", CfnResource::new("AWS::EC2::VPC", json!({})))
            .unwrap_err();
        assert!(err.contains("duplicate construct path"));
    }

    #[test]
    fn test_rs003_export_and_import() {
        let mut producer = Stack::new("Net");
        let handle = producer.export("VpcId", json!({"Ref": "Vpc"}), None);
        assert_eq!(handle.name, "Net:VpcId");
        assert_eq!(producer.exports(), vec!["Net:VpcId"]);

        let mut consumer = Stack::new("Db");
        consumer
            .add(
                "SubnetGroup",
                CfnResource::new("AWS::RDS::DBSubnetGroup", json!({"VpcId": handle.import()})),
            )
            .unwrap();
        consumer.output("Again", handle.import(), None);
        assert_eq!(consumer.imports(), vec!["Net:VpcId"]);
    }

    #[test]
    fn test_rs003_resource_json_shape() {
        let r = CfnResource::new("AWS::RDS::DBCluster", json!({"Engine": "aurora-mysql"}))
            .depends_on("Secret")
            .depends_on("Secret")
            .with_removal_policy(RemovalPolicy::Snapshot);
        let v = r.to_json();
        assert_eq!(v["Type"], "AWS::RDS::DBCluster");
        assert_eq!(v["DependsOn"], json!(["Secret"]));
        assert_eq!(v["DeletionPolicy"], "Snapshot");
        assert_eq!(v["UpdateReplacePolicy"], "Snapshot");
        assert!(v.get("Metadata").is_none());
    }

    #[test]
    fn test_rs003_snapshot_falls_back_for_log_groups() {
        let r = CfnResource::new("AWS::Logs::LogGroup", json!({}))
            .with_removal_policy(RemovalPolicy::Snapshot);
        assert_eq!(r.deletion_policy.as_deref(), Some("Retain"));
        assert!(r.to_json().get("Properties").is_none());
    }

    #[test]
    fn test_rs003_app_duplicate_stack() {
        let mut app = App::new("sample");
        app.add_stack(Stack::new("Net")).unwrap();
        assert!(app.add_stack(Stack::new("Net")).is_err());
        assert!(app.stack("Net").is_some());
    }
}
