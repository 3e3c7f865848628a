//! RS-001: Config, assembly lock, plan and provenance types.
//!
//! Defines the YAML schema of `railstack.yaml` (context values, per-stack
//! settings, removal policy), the lock written next to a synthesized assembly,
//! and the plan/event records derived from it. Config types derive
//! `JsonSchema` so `railstack schema` can publish them.

use indexmap::IndexMap;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Context key carrying the application image tag.
pub const APP_TAG_KEY: &str = "AppTag";

/// Context key carrying the complete ARN of the application secret.
pub const SECRET_ARN_KEY: &str = "EcsRailsSampleSecretArn";

/// Image tag used when no `AppTag` context value is supplied.
pub const DEFAULT_APP_TAG: &str = "latest";

// ============================================================================
// Top-level railstack.yaml
// ============================================================================

/// Root configuration: the declared deployment topology.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RailstackConfig {
    /// Schema version (must be "1.0")
    pub version: String,

    /// Application name
    pub name: String,

    /// Optional description
    #[serde(default)]
    pub description: Option<String>,

    /// Deployment-time context values (`AppTag`, `EcsRailsSampleSecretArn`)
    #[serde(default)]
    pub context: IndexMap<String, String>,

    /// Target account/region; environment-agnostic when absent
    #[serde(default)]
    pub env: Option<Environment>,

    /// Stack names
    #[serde(default)]
    pub stacks: StackNames,

    /// Lifecycle policy applied to stateful resources
    #[serde(default)]
    pub policy: Policy,

    #[serde(default)]
    pub network: NetworkSettings,

    #[serde(default)]
    pub storage: StorageSettings,

    #[serde(default)]
    pub api: ApiSettings,

    #[serde(default)]
    pub ci: CiSettings,
}

impl RailstackConfig {
    /// Look up a context value, treating empty strings as absent.
    pub fn context_value(&self, key: &str) -> Option<&str> {
        self.context
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.trim().is_empty())
    }

    /// The image tag deployed by both API services.
    pub fn app_tag(&self) -> &str {
        self.context_value(APP_TAG_KEY).unwrap_or(DEFAULT_APP_TAG)
    }
}

/// Deployment environment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Environment {
    #[serde(default)]
    pub account: Option<String>,

    #[serde(default)]
    pub region: Option<String>,
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "aws://{}/{}",
            self.account.as_deref().unwrap_or("unknown-account"),
            self.region.as_deref().unwrap_or("unknown-region")
        )
    }
}

/// Names of the four stacks.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct StackNames {
    pub network: String,
    pub storage: String,
    pub api: String,
    pub ci: String,
}

impl Default for StackNames {
    fn default() -> Self {
        Self {
            network: "EcsRailsSampleNetwork".to_string(),
            storage: "EcsRailsSampleStorage".to_string(),
            api: "EcsRailsSampleAPI".to_string(),
            ci: "EcsRailsSampleCdkStack".to_string(),
        }
    }
}

// ============================================================================
// Policy
// ============================================================================

/// Lifecycle policy.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct Policy {
    /// What happens to stateful resources when they leave the template
    #[serde(default)]
    pub removal: RemovalPolicy,
}

/// Removal policy for stateful resources.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum RemovalPolicy {
    #[default]
    Destroy,
    Retain,
    Snapshot,
}

impl RemovalPolicy {
    /// CloudFormation `DeletionPolicy` value. Resources that cannot be
    /// snapshotted fall back to `Retain`.
    pub fn deletion_policy(self, supports_snapshot: bool) -> &'static str {
        match self {
            Self::Destroy => "Delete",
            Self::Retain => "Retain",
            Self::Snapshot if supports_snapshot => "Snapshot",
            Self::Snapshot => "Retain",
        }
    }
}

impl fmt::Display for RemovalPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Destroy => write!(f, "destroy"),
            Self::Retain => write!(f, "retain"),
            Self::Snapshot => write!(f, "snapshot"),
        }
    }
}

// ============================================================================
// Per-stack settings
// ============================================================================

/// Network stack settings.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct NetworkSettings {
    /// VPC CIDR block
    pub cidr: String,

    /// Availability zones to spread each subnet tier over
    pub max_azs: u8,

    /// Public listener port
    pub listener_port: u16,

    /// Load balancer deletion protection
    pub deletion_protection: bool,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            cidr: "10.0.0.0/16".to_string(),
            max_azs: 2,
            listener_port: 80,
            deletion_protection: true,
        }
    }
}

/// Storage stack settings.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct StorageSettings {
    pub engine_version: String,
    pub parameter_group_family: String,
    pub instances: u32,
    pub instance_class: String,
    pub database_name: String,
    pub master_username: String,
    pub performance_insights: bool,

    /// Engine parameters merged over the built-in tuning values
    pub parameters: IndexMap<String, String>,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            engine_version: "5.7.mysql_aurora.2.09.2".to_string(),
            parameter_group_family: "aurora-mysql5.7".to_string(),
            instances: 1,
            instance_class: "db.r6g.large".to_string(),
            database_name: "ecs_rails_sample_production".to_string(),
            master_username: "ecs_rails_sample".to_string(),
            performance_insights: true,
            parameters: IndexMap::new(),
        }
    }
}

/// API stack settings.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct ApiSettings {
    pub cluster_name: String,
    pub cpu: u32,
    pub memory_mib: u32,
    pub container_port: u16,
    pub desired_count: u32,
    pub min_healthy_percent: u32,
    pub max_healthy_percent: u32,
    pub health_check_grace_period_secs: u32,
    pub spot_weight: u32,
    pub on_demand_weight: u32,
    pub circuit_breaker: bool,
    pub app_stage: String,
    pub rails_env: String,
    pub health_check: HealthCheckSettings,
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            cluster_name: "EcsRailsSample".to_string(),
            cpu: 4096,
            memory_mib: 8192,
            container_port: 3000,
            desired_count: 4,
            min_healthy_percent: 50,
            max_healthy_percent: 200,
            health_check_grace_period_secs: 30,
            spot_weight: 1,
            on_demand_weight: 1,
            circuit_breaker: true,
            app_stage: "live_production1".to_string(),
            rails_env: "production".to_string(),
            health_check: HealthCheckSettings::default(),
        }
    }
}

/// Load balancer target health check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct HealthCheckSettings {
    pub path: String,
    pub interval_secs: u32,
    pub timeout_secs: u32,
    pub healthy_threshold: u32,
    pub unhealthy_threshold: u32,
    pub healthy_http_codes: String,
}

impl Default for HealthCheckSettings {
    fn default() -> Self {
        Self {
            path: "/healthz".to_string(),
            interval_secs: 10,
            timeout_secs: 4,
            healthy_threshold: 2,
            unhealthy_threshold: 3,
            healthy_http_codes: "200".to_string(),
        }
    }
}

/// CI stack settings.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct CiSettings {
    /// ECR repository the pipeline pushes to and the API pulls from
    pub repository_name: String,
    pub owner: String,
    pub repo: String,
    pub branch: String,
    pub github_token_secret: String,
    pub slack_secret: String,
    pub pipeline_name: String,
    pub build_image: String,
}

impl Default for CiSettings {
    fn default() -> Self {
        Self {
            repository_name: "ecs-rails-sample".to_string(),
            owner: "SpringMT".to_string(),
            repo: "ecs-rails-sample".to_string(),
            branch: "main".to_string(),
            github_token_secret: "GitHubToken".to_string(),
            slack_secret: "SlackSettings".to_string(),
            pipeline_name: "ECSRailsSampleECRCodePipelineCI".to_string(),
            build_image: "aws/codebuild/amazonlinux2-x86_64-standard:3.0".to_string(),
        }
    }
}

// ============================================================================
// Assembly manifest
// ============================================================================

/// `manifest.json` written at the root of a cloud assembly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssemblyManifest {
    pub version: String,
    pub artifacts: IndexMap<String, ManifestArtifact>,
}

/// One deployable artifact (a stack template).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestArtifact {
    #[serde(rename = "type")]
    pub artifact_type: String,
    pub environment: String,
    pub template_file: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
}

// ============================================================================
// Lock file
// ============================================================================

/// Lock written next to a synthesized assembly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssemblyLock {
    pub schema: String,
    pub app: String,
    pub generated_at: String,
    pub generator: String,
    pub blake3_version: String,

    /// Composite of every stack hash, in deployment order
    #[serde(default)]
    pub assembly_hash: String,

    /// BLAKE3 of `manifest.json` as written
    #[serde(default)]
    pub manifest_hash: Option<String>,

    pub stacks: IndexMap<String, StackLock>,
}

/// Per-stack lock entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StackLock {
    /// Template file name relative to the assembly directory
    pub template: String,

    pub environment: String,

    /// BLAKE3 of the canonical template JSON
    pub hash: String,

    #[serde(default)]
    pub dependencies: Vec<String>,

    pub resources: IndexMap<String, ResourceLock>,
}

/// Per-resource lock entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLock {
    #[serde(rename = "type")]
    pub resource_type: String,
    pub hash: String,
}

// ============================================================================
// Plan
// ============================================================================

/// Action the provisioning engine will take on a resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanAction {
    Create,
    Update,
    Destroy,
    NoOp,
}

impl fmt::Display for PlanAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create => write!(f, "CREATE"),
            Self::Update => write!(f, "UPDATE"),
            Self::Destroy => write!(f, "DESTROY"),
            Self::NoOp => write!(f, "NO-OP"),
        }
    }
}

/// A single planned change.
#[derive(Debug, Clone)]
pub struct PlannedChange {
    pub stack: String,
    pub logical_id: String,
    pub resource_type: String,
    pub action: PlanAction,
    pub description: String,
}

/// Full change preview for an app.
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    pub name: String,

    /// Changes grouped by stack, in deployment order
    pub changes: Vec<PlannedChange>,

    /// Stack deployment order
    pub execution_order: Vec<String>,

    pub to_create: u32,
    pub to_update: u32,
    pub to_destroy: u32,
    pub unchanged: u32,
}

// ============================================================================
// Provenance events
// ============================================================================

/// Provenance event for the JSONL event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProvenanceEvent {
    SynthStarted {
        app: String,
        run_id: String,
        railstack_version: String,
    },
    StackSynthesized {
        app: String,
        stack: String,
        resources: u32,
        hash: String,
    },
    SynthCompleted {
        app: String,
        run_id: String,
        stacks: u32,
        total_seconds: f64,
    },
    SynthFailed {
        app: String,
        run_id: String,
        error: String,
    },
}

/// Timestamped event wrapper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimestampedEvent {
    pub ts: String,
    #[serde(flatten)]
    pub event: ProvenanceEvent,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rs001_config_defaults() {
        let yaml = r#"
version: "1.0"
name: sample
"#;
        let config: RailstackConfig = serde_yaml_ng::from_str(yaml).unwrap();
        assert_eq!(config.stacks.network, "EcsRailsSampleNetwork");
        assert_eq!(config.stacks.ci, "EcsRailsSampleCdkStack");
        assert_eq!(config.policy.removal, RemovalPolicy::Destroy);
        assert_eq!(config.network.cidr, "10.0.0.0/16");
        assert_eq!(config.api.desired_count, 4);
        assert_eq!(config.api.health_check.path, "/healthz");
        assert_eq!(config.ci.branch, "main");
        assert!(config.env.is_none());
    }

    #[test]
    fn test_rs001_partial_section_keeps_defaults() {
        let yaml = r#"
version: "1.0"
name: sample
api:
  desired_count: 2
  health_check:
    path: /up
"#;
        let config: RailstackConfig = serde_yaml_ng::from_str(yaml).unwrap();
        assert_eq!(config.api.desired_count, 2);
        assert_eq!(config.api.max_healthy_percent, 200);
        assert_eq!(config.api.health_check.path, "/up");
        assert_eq!(config.api.health_check.interval_secs, 10);
    }

    #[test]
    fn test_rs001_context_lookup() {
        let yaml = r#"
version: "1.0"
name: sample
context:
  AppTag: "abc123"
  EcsRailsSampleSecretArn: ""
"#;
        let config: RailstackConfig = serde_yaml_ng::from_str(yaml).unwrap();
        assert_eq!(config.app_tag(), "abc123");
        assert_eq!(config.context_value(SECRET_ARN_KEY), None);
    }

    #[test]
    fn test_rs001_app_tag_fallback() {
        let config: RailstackConfig =
            serde_yaml_ng::from_str("version: \"1.0\"\nname: x\n").unwrap();
        assert_eq!(config.app_tag(), DEFAULT_APP_TAG);
    }

    #[test]
    fn test_rs001_environment_display() {
        let env = Environment::default();
        assert_eq!(env.to_string(), "aws://unknown-account/unknown-region");
        let env = Environment {
            account: Some("123456789012".to_string()),
            region: Some("ap-northeast-1".to_string()),
        };
        assert_eq!(env.to_string(), "aws://123456789012/ap-northeast-1");
    }

    #[test]
    fn test_rs001_removal_policy_mapping() {
        assert_eq!(RemovalPolicy::Destroy.deletion_policy(true), "Delete");
        assert_eq!(RemovalPolicy::Retain.deletion_policy(false), "Retain");
        assert_eq!(RemovalPolicy::Snapshot.deletion_policy(true), "Snapshot");
        assert_eq!(RemovalPolicy::Snapshot.deletion_policy(false), "Retain");
    }

    #[test]
    fn test_rs001_removal_policy_parse() {
        let p: Policy = serde_yaml_ng::from_str("removal: snapshot").unwrap();
        assert_eq!(p.removal, RemovalPolicy::Snapshot);
        assert_eq!(p.removal.to_string(), "snapshot");
    }

    #[test]
    fn test_rs001_plan_action_display() {
        assert_eq!(PlanAction::Create.to_string(), "CREATE");
        assert_eq!(PlanAction::NoOp.to_string(), "NO-OP");
    }

    #[test]
    fn test_rs001_provenance_event_serde() {
        let event = ProvenanceEvent::SynthStarted {
            app: "sample".to_string(),
            run_id: "r-abc".to_string(),
            railstack_version: "0.3.0".to_string(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"event\":\"synth_started\""));
        assert!(json.contains("\"run_id\":\"r-abc\""));
    }

    #[test]
    fn test_rs001_manifest_field_names() {
        let artifact = ManifestArtifact {
            artifact_type: "aws:cloudformation:stack".to_string(),
            environment: Environment::default().to_string(),
            template_file: "Net.template.json".to_string(),
            dependencies: vec![],
        };
        let json = serde_json::to_string(&artifact).unwrap();
        assert!(json.contains("\"type\":\"aws:cloudformation:stack\""));
        assert!(json.contains("\"templateFile\""));
    }
}
