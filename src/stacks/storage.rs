//! RS-011: Storage stack. Aurora MySQL cluster in the isolated tier.

use super::network::{NetworkOutputs, SubnetKind};
use crate::core::intrinsics::{get_att, join, ref_to};
use crate::core::parser::{is_match, Pattern, ValidationError};
use crate::core::stack::{CfnResource, Stack};
use crate::core::types::{Environment, RemovalPolicy, StorageSettings};
use indexmap::IndexMap;
use regex::Regex;
use serde_json::{json, Value};
use std::sync::LazyLock;

const CLUSTER_PATH: &str = "EcsRailsSampleAurora";
const PARAMETER_GROUP_PATH: &str = "EcsRailsSampleAuroraParameter";
static MASTER_USERNAME: Pattern = LazyLock::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9_]{0,15}$").ok());
static DATABASE_NAME: Pattern = LazyLock::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9_]{0,63}$").ok());

/// Characters kept out of generated passwords.
pub const EXCLUDED_PASSWORD_CHARS: &str = " %+~`#$&*()|[]{}:;<>?!'/@\"\\";

/// Engine tuning fixed at deploy time.
pub fn default_parameters() -> IndexMap<String, String> {
    [
        ("character_set_client", "utf8mb4"),
        ("character_set_server", "utf8mb4"),
        ("collation_connection", "utf8mb4_bin"),
        ("collation_server", "utf8mb4_bin"),
        ("time_zone", "UTC"),
        ("max_connections", "2000"),
        ("wait_timeout", "5"),
        // Keep below the API request timeout
        ("innodb_lock_wait_timeout", "5"),
        ("query_cache_type", "0"),
        ("slow_query_log", "1"),
        ("long_query_time", "0.5"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

/// Everything the storage stack declares.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageDescriptor {
    pub engine: String,
    pub engine_version: String,
    pub parameter_group_family: String,
    pub instances: u32,
    pub instance_class: String,
    pub master_username: String,
    pub database_name: String,
    pub password_length: u32,
    pub performance_insights: bool,
    pub delete_automated_backups: bool,
    pub parameters: IndexMap<String, String>,
    pub removal_policy: RemovalPolicy,
}

impl Default for StorageDescriptor {
    fn default() -> Self {
        Self::from_settings(&StorageSettings::default(), RemovalPolicy::default())
    }
}

impl StorageDescriptor {
    pub fn from_settings(settings: &StorageSettings, removal_policy: RemovalPolicy) -> Self {
        let mut parameters = default_parameters();
        for (k, v) in &settings.parameters {
            parameters.insert(k.clone(), v.clone());
        }
        Self {
            engine: "aurora-mysql".to_string(),
            engine_version: settings.engine_version.clone(),
            parameter_group_family: settings.parameter_group_family.clone(),
            instances: settings.instances,
            instance_class: settings.instance_class.clone(),
            master_username: settings.master_username.clone(),
            database_name: settings.database_name.clone(),
            password_length: 30,
            performance_insights: settings.performance_insights,
            delete_automated_backups: true,
            parameters,
            removal_policy,
        }
    }
}

/// Validate a storage descriptor.
pub fn validate(desc: &StorageDescriptor) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if desc.instances == 0 {
        errors.push(ValidationError::new("storage: instances must be at least 1"));
    }
    if !desc.instance_class.starts_with("db.") {
        errors.push(ValidationError::new(format!(
            "storage: instance class '{}' must start with 'db.'",
            desc.instance_class
        )));
    }
    if desc.engine_version.trim().is_empty() {
        errors.push(ValidationError::new("storage: engine_version must not be empty"));
    }

    if !is_match(&MASTER_USERNAME, &desc.master_username) {
        errors.push(ValidationError::new(format!(
            "storage: master username '{}' must be 1-16 alphanumerics starting with a letter",
            desc.master_username
        )));
    }
    if !is_match(&DATABASE_NAME, &desc.database_name) {
        errors.push(ValidationError::new(format!(
            "storage: database name '{}' must be 1-64 alphanumerics starting with a letter",
            desc.database_name
        )));
    }

    for (key, value) in &desc.parameters {
        if value.trim().is_empty() {
            errors.push(ValidationError::new(format!(
                "storage: parameter '{}' has an empty value",
                key
            )));
        }
    }

    errors
}

/// Declare the storage stack.
pub fn build(
    name: &str,
    env: &Environment,
    desc: &StorageDescriptor,
    network: &NetworkOutputs,
) -> Result<Stack, String> {
    let isolated = network.subnets(SubnetKind::Isolated);
    if isolated.is_empty() {
        return Err("storage: network exposes no isolated subnets".to_string());
    }

    let mut stack = Stack::new(name)
        .with_description("Aurora MySQL cluster in the isolated subnet tier")
        .with_env(env.clone());
    stack.add_dependency(&network.vpc.stack);

    let subnet_group = stack.add(
        &format!("{}/Subnets", CLUSTER_PATH),
        CfnResource::new(
            "AWS::RDS::DBSubnetGroup",
            json!({
                "DBSubnetGroupDescription": format!("Subnets for {} database", CLUSTER_PATH),
                "SubnetIds": isolated.iter().map(|s| s.import()).collect::<Vec<_>>(),
            }),
        )
        .with_removal_policy(desc.removal_policy),
    )?;

    let parameters: serde_json::Map<String, Value> = desc
        .parameters
        .iter()
        .map(|(k, v)| (k.clone(), json!(v)))
        .collect();
    let parameter_group = stack.add(
        PARAMETER_GROUP_PATH,
        CfnResource::new(
            "AWS::RDS::DBClusterParameterGroup",
            json!({
                "Description": format!("Cluster parameter group for {}", desc.parameter_group_family),
                "Family": desc.parameter_group_family,
                "Parameters": parameters,
            }),
        ),
    )?;

    let secret = stack.add(
        &format!("{}/Secret", CLUSTER_PATH),
        CfnResource::new(
            "AWS::SecretsManager::Secret",
            json!({
                "Description": format!("Generated by railstack for stack: {}", name),
                "GenerateSecretString": {
                    "ExcludeCharacters": EXCLUDED_PASSWORD_CHARS,
                    "GenerateStringKey": "password",
                    "PasswordLength": desc.password_length,
                    "SecretStringTemplate": json!({ "username": desc.master_username }).to_string(),
                },
            }),
        )
        .with_removal_policy(desc.removal_policy),
    )?;

    let secret_field = |field: &str| {
        join(
            "",
            vec![
                json!("{{resolve:secretsmanager:"),
                ref_to(&secret),
                json!(format!(":SecretString:{}::}}}}", field)),
            ],
        )
    };

    let cluster = stack.add(
        CLUSTER_PATH,
        CfnResource::new(
            "AWS::RDS::DBCluster",
            json!({
                "Engine": desc.engine,
                "EngineVersion": desc.engine_version,
                "DBClusterParameterGroupName": ref_to(&parameter_group),
                "DBSubnetGroupName": ref_to(&subnet_group),
                "DatabaseName": desc.database_name,
                "MasterUsername": secret_field("username"),
                "MasterUserPassword": secret_field("password"),
                "VpcSecurityGroupIds": [network.db_sg.import()],
                "CopyTagsToSnapshot": true,
            }),
        )
        .with_removal_policy(desc.removal_policy),
    )?;

    stack.add(
        &format!("{}/Secret/Attachment", CLUSTER_PATH),
        CfnResource::new(
            "AWS::SecretsManager::SecretTargetAttachment",
            json!({
                "SecretId": ref_to(&secret),
                "TargetId": ref_to(&cluster),
                "TargetType": "AWS::RDS::DBCluster",
            }),
        ),
    )?;

    for n in 1..=desc.instances {
        stack.add(
            &format!("{}/Instance{}", CLUSTER_PATH, n),
            CfnResource::new(
                "AWS::RDS::DBInstance",
                json!({
                    "DBInstanceClass": desc.instance_class,
                    "DBClusterIdentifier": ref_to(&cluster),
                    "DBSubnetGroupName": ref_to(&subnet_group),
                    "Engine": desc.engine,
                    "PubliclyAccessible": false,
                    "EnablePerformanceInsights": desc.performance_insights,
                    "DeleteAutomatedBackups": desc.delete_automated_backups,
                }),
            )
            .with_removal_policy(desc.removal_policy),
        )?;
    }

    stack.output(
        "ClusterEndpoint",
        get_att(&cluster, "Endpoint.Address"),
        Some("Writer endpoint of the database cluster"),
    );
    stack.output(
        "SecretArn",
        ref_to(&secret),
        Some("Secret holding the generated master credentials"),
    );

    tracing::debug!(stack = %name, instances = desc.instances, "storage stack declared");
    Ok(stack)
}
