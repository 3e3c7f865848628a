//! RS-002: CloudFormation intrinsic functions and reference scanning.

use serde_json::{json, Value};

/// `{"Ref": id}`
pub fn ref_to(id: &str) -> Value {
    json!({ "Ref": id })
}

/// `{"Fn::GetAtt": [id, attr]}`
pub fn get_att(id: &str, attr: &str) -> Value {
    json!({ "Fn::GetAtt": [id, attr] })
}

/// `{"Fn::ImportValue": name}`
pub fn import_value(name: &str) -> Value {
    json!({ "Fn::ImportValue": name })
}

/// `{"Fn::Join": [sep, parts]}`
pub fn join(sep: &str, parts: Vec<Value>) -> Value {
    json!({ "Fn::Join": [sep, parts] })
}

/// `{"Fn::Select": [index, list]}`
pub fn select(index: usize, list: Value) -> Value {
    json!({ "Fn::Select": [index, list] })
}

/// Availability zones of the deployment region.
pub fn get_azs() -> Value {
    json!({ "Fn::GetAZs": "" })
}

pub fn account_id() -> Value {
    ref_to("AWS::AccountId")
}

pub fn region() -> Value {
    ref_to("AWS::Region")
}

pub fn partition() -> Value {
    ref_to("AWS::Partition")
}

pub fn url_suffix() -> Value {
    ref_to("AWS::URLSuffix")
}

/// ARN of an AWS managed IAM policy, e.g. `service-role/AmazonECSTaskExecutionRolePolicy`.
pub fn managed_policy_arn(name: &str) -> Value {
    join(
        "",
        vec![
            json!("arn:"),
            partition(),
            json!(format!(":iam::aws:policy/{}", name)),
        ],
    )
}

/// Dynamic reference to a Secrets Manager value, resolved by the engine at deploy time.
pub fn secret_value(secret_id: &str, json_field: Option<&str>) -> String {
    match json_field {
        Some(field) => format!(
            "{{{{resolve:secretsmanager:{}:SecretString:{}::}}}}",
            secret_id, field
        ),
        None => format!("{{{{resolve:secretsmanager:{}:SecretString:::}}}}", secret_id),
    }
}

/// A reference found inside a template fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reference {
    Ref(String),
    GetAtt(String, String),
    Import(String),
}

/// Collect every `Ref`, `Fn::GetAtt` and `Fn::ImportValue` in a value.
pub fn collect_references(value: &Value, out: &mut Vec<Reference>) {
    match value {
        Value::Object(map) => {
            if map.len() == 1 {
                if let Some(Value::String(id)) = map.get("Ref") {
                    out.push(Reference::Ref(id.clone()));
                    return;
                }
                if let Some(Value::Array(args)) = map.get("Fn::GetAtt") {
                    if let [Value::String(id), Value::String(attr)] = args.as_slice() {
                        out.push(Reference::GetAtt(id.clone(), attr.clone()));
                        return;
                    }
                }
                if let Some(Value::String(name)) = map.get("Fn::ImportValue") {
                    out.push(Reference::Import(name.clone()));
                    return;
                }
            }
            for v in map.values() {
                collect_references(v, out);
            }
        }
        Value::Array(items) => {
            for v in items {
                collect_references(v, out);
            }
        }
        _ => {}
    }
}
