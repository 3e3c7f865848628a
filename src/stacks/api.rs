//! RS-012: API stack. ECS cluster, task definitions and Fargate services.
//!
//! Two services share one execution role: the primary API service behind the
//! network stack's listener, and a single-replica `db-exec` service kept for
//! schema changes over ECS Exec. Each has its own task role.

use super::network::{NetworkOutputs, SubnetKind};
use crate::core::intrinsics::{account_id, get_att, join, managed_policy_arn, ref_to, region, url_suffix};
use crate::core::parser::{is_match, Pattern, ValidationError};
use crate::core::stack::{CfnResource, Stack};
use crate::core::types::{
    Environment, HealthCheckSettings, RailstackConfig, RemovalPolicy, SECRET_ARN_KEY,
};
use indexmap::IndexMap;
use regex::Regex;
use serde_json::{json, Value};
use std::sync::LazyLock;

/// Memory reserved for the X-Ray daemon sidecar.
pub const XRAY_RESERVATION_MIB: u32 = 256;

/// Memory reserved for the CloudWatch agent sidecar.
pub const CW_AGENT_RESERVATION_MIB: u32 = 50;

/// Name of the application container behind the load balancer.
pub const API_CONTAINER: &str = "API";

/// Name of the application container in the admin task.
pub const DB_EXEC_CONTAINER: &str = "DB";

const CLUSTER_PATH: &str = "EcsRailsSampleECSCLuster";
const TARGET_PATH: &str = "EcsRailsSampleTarget";
const FARGATE_CPU_UNITS: &[u32] = &[256, 512, 1024, 2048, 4096, 8192, 16384];
const CAPACITY_PROVIDERS: &[&str] = &["FARGATE", "FARGATE_SPOT"];
static HTTP_CODES: Pattern = LazyLock::new(|| Regex::new(r"^\d{3}(-\d{3})?(,\d{3}(-\d{3})?)*$").ok());

/// Where a container image comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageRef {
    /// Private registry of the deploying account
    Ecr { repository: String, tag: String },
    /// Fully-qualified public image
    Registry(String),
}

impl ImageRef {
    pub fn to_json(&self) -> Value {
        match self {
            Self::Ecr { repository, tag } => join(
                "",
                vec![
                    account_id(),
                    json!(".dkr.ecr."),
                    region(),
                    json!("."),
                    url_suffix(),
                    json!(format!("/{}:{}", repository, tag)),
                ],
            ),
            Self::Registry(image) => json!(image),
        }
    }
}

/// A secret injected from a JSON key of a Secrets Manager secret.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretRef {
    pub arn: String,
    pub field: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerHealthCheck {
    pub command: Vec<String>,
    pub start_period_secs: u32,
    pub interval_secs: u32,
    pub timeout_secs: u32,
    pub retries: u32,
}

/// One container of a task definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: ImageRef,
    pub essential: bool,
    pub cpu: Option<u32>,
    pub memory_limit_mib: Option<u32>,
    pub memory_reservation_mib: Option<u32>,
    pub port: Option<u16>,
    pub environment: IndexMap<String, String>,
    pub secrets: IndexMap<String, SecretRef>,
    pub user: Option<String>,
    pub health_check: Option<ContainerHealthCheck>,
    /// Construct path of the container's log group
    pub log_group_path: String,
    pub log_group_name: String,
    pub stream_prefix: String,
}

impl ContainerSpec {
    fn app(name: &str, image: ImageRef, log: (&str, &str, &str)) -> Self {
        Self {
            name: name.to_string(),
            image,
            essential: true,
            cpu: None,
            memory_limit_mib: None,
            memory_reservation_mib: None,
            port: None,
            environment: IndexMap::new(),
            secrets: IndexMap::new(),
            user: None,
            health_check: None,
            log_group_path: log.0.to_string(),
            log_group_name: log.1.to_string(),
            stream_prefix: log.2.to_string(),
        }
    }

    /// Memory the scheduler sets aside for this container.
    pub fn reserved_mib(&self) -> u32 {
        self.memory_reservation_mib
            .or(self.memory_limit_mib)
            .unwrap_or(0)
    }
}

/// IAM role assumed by ECS tasks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleSpec {
    pub path: String,
    pub role_name: String,
    pub managed_policies: Vec<String>,
    /// Actions granted on `*` through an inline policy
    pub inline_actions: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskSpec {
    pub path: String,
    pub family: String,
    pub cpu: u32,
    pub memory_mib: u32,
    pub task_role: RoleSpec,
    pub containers: Vec<ContainerSpec>,
}

/// Load balancer registration of a service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetSpec {
    pub container: String,
    pub port: u16,
    pub priority: u32,
    pub health_check: HealthCheckSettings,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceSpec {
    pub path: String,
    pub service_name: String,
    pub task: TaskSpec,
    pub desired_count: u32,
    pub min_healthy_percent: u32,
    pub max_healthy_percent: u32,
    pub health_check_grace_period_secs: Option<u32>,
    /// `(capacity provider, weight)`
    pub capacity: Vec<(String, u32)>,
    pub circuit_breaker: bool,
    pub enable_execute_command: bool,
    pub target: Option<TargetSpec>,
}

/// Everything the API stack declares.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComputeDescriptor {
    pub cluster_name: String,
    pub container_insights: bool,
    pub execution_role: RoleSpec,
    pub secret_arn: String,
    pub primary: ServiceSpec,
    pub admin: ServiceSpec,
}

fn cloudwatch_agent_config() -> String {
    json!({
        "logs": { "metrics_collected": { "emf": {} } },
        "metrics": { "metrics_collected": { "statsd": {} } },
    })
    .to_string()
}

fn env_map(pairs: &[(&str, &str)]) -> IndexMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

impl ComputeDescriptor {
    /// Build the descriptor from config settings and context values.
    ///
    /// The image repository is the CI stack's repository; the tag is the
    /// `AppTag` context value. A missing secret ARN is left empty and
    /// reported by [`validate`].
    pub fn from_config(config: &RailstackConfig) -> Self {
        let api = &config.api;
        let secret_arn = config
            .context_value(SECRET_ARN_KEY)
            .unwrap_or_default()
            .to_string();
        let image = ImageRef::Ecr {
            repository: config.ci.repository_name.clone(),
            tag: config.app_tag().to_string(),
        };
        let master_key = || {
            let mut s = IndexMap::new();
            s.insert(
                "RAILS_MASTER_KEY".to_string(),
                SecretRef {
                    arn: secret_arn.clone(),
                    field: "RAILS_MASTER_KEY".to_string(),
                },
            );
            s
        };

        let app_memory = api
            .memory_mib
            .saturating_sub(XRAY_RESERVATION_MIB + CW_AGENT_RESERVATION_MIB);
        let mut app = ContainerSpec::app(
            API_CONTAINER,
            image.clone(),
            ("EcsRailsSampleLogGroup", "/ecs/ecs-rails-sample-api", "EcsRailsSample"),
        );
        app.memory_limit_mib = Some(app_memory);
        app.memory_reservation_mib = Some(app_memory);
        app.port = Some(api.container_port);
        app.environment = env_map(&[
            ("APP_STAGE", &api.app_stage),
            ("RAILS_ENV", &api.rails_env),
            ("AWS_XRAY_LOCATION", "localhost:2000"),
        ]);
        app.secrets = master_key();

        let mut xray = ContainerSpec::app(
            "xray",
            ImageRef::Registry("public.ecr.aws/xray/aws-xray-daemon:latest".to_string()),
            ("EcsRailsSampleXRayLogGroup", "/ecs/ecs-rails-sample-xray", "xray"),
        );
        xray.essential = false;
        xray.memory_reservation_mib = Some(XRAY_RESERVATION_MIB);
        xray.user = Some("1337".to_string());
        xray.health_check = Some(ContainerHealthCheck {
            command: vec![
                "CMD-SHELL".to_string(),
                "curl -s http://localhost:2000".to_string(),
            ],
            start_period_secs: 10,
            interval_secs: 5,
            timeout_secs: 2,
            retries: 3,
        });

        let mut agent = ContainerSpec::app(
            "cloudwatch-agent",
            ImageRef::Registry(
                "public.ecr.aws/cloudwatch-agent/cloudwatch-agent:latest".to_string(),
            ),
            (
                "EcsRailsSampleCloudWatchLogGroup",
                "/ecs/ecs-rails-sample-cloudwatch",
                "cloudwatch-agent",
            ),
        );
        agent.essential = false;
        agent.memory_reservation_mib = Some(CW_AGENT_RESERVATION_MIB);
        // Keeps agent traffic off the proxy
        agent.user = Some("0:1338".to_string());
        agent.environment = env_map(&[("CW_CONFIG_CONTENT", &cloudwatch_agent_config())]);

        let mut db = ContainerSpec::app(
            DB_EXEC_CONTAINER,
            image,
            ("EcsRailsSampleDbExecLogGroup", "/ecs/ecs-rails-sample-db-exec", "EcsRailsSampleDbExec"),
        );
        db.cpu = Some(api.cpu);
        db.memory_limit_mib = Some(api.memory_mib);
        db.memory_reservation_mib = Some(api.memory_mib);
        db.environment = env_map(&[("APP_STAGE", &api.app_stage), ("RAILS_ENV", &api.rails_env)]);
        db.secrets = master_key();

        let primary = ServiceSpec {
            path: "EcsRailsSampleService".to_string(),
            service_name: "EcsRailsSampleAPI".to_string(),
            task: TaskSpec {
                path: "EcsRailsSampleTaskDefinition".to_string(),
                family: "ecs-rails-sample-api".to_string(),
                cpu: api.cpu,
                memory_mib: api.memory_mib,
                task_role: RoleSpec {
                    path: "EcsRailsSampleECSServiceTaskRole".to_string(),
                    role_name: "ecs-rails-sample-service-task-role".to_string(),
                    managed_policies: vec![
                        "AWSXRayDaemonWriteAccess".to_string(),
                        "CloudWatchAgentServerPolicy".to_string(),
                    ],
                    inline_actions: Vec::new(),
                },
                containers: vec![app, xray, agent],
            },
            desired_count: api.desired_count,
            min_healthy_percent: api.min_healthy_percent,
            max_healthy_percent: api.max_healthy_percent,
            health_check_grace_period_secs: Some(api.health_check_grace_period_secs),
            capacity: vec![
                ("FARGATE_SPOT".to_string(), api.spot_weight),
                ("FARGATE".to_string(), api.on_demand_weight),
            ],
            circuit_breaker: api.circuit_breaker,
            enable_execute_command: false,
            target: Some(TargetSpec {
                container: API_CONTAINER.to_string(),
                port: api.container_port,
                priority: 1,
                health_check: api.health_check.clone(),
            }),
        };

        let admin = ServiceSpec {
            path: "EcsRailsSampleDbExecService".to_string(),
            service_name: "EcsRailsSampleDB".to_string(),
            task: TaskSpec {
                path: "EcsRailsSampleDbExecTaskDefinition".to_string(),
                family: "ecs-rails-sample-db".to_string(),
                cpu: api.cpu,
                memory_mib: api.memory_mib,
                task_role: RoleSpec {
                    path: "EcsRailsSampleDbExecServiceTaskRole".to_string(),
                    role_name: "ecs-rails-sample-db-exec-task-role".to_string(),
                    managed_policies: Vec::new(),
                    inline_actions: vec![
                        "ssmmessages:CreateControlChannel".to_string(),
                        "ssmmessages:CreateDataChannel".to_string(),
                        "ssmmessages:OpenControlChannel".to_string(),
                        "ssmmessages:OpenDataChannel".to_string(),
                    ],
                },
                containers: vec![db],
            },
            desired_count: 1,
            min_healthy_percent: 50,
            max_healthy_percent: 200,
            health_check_grace_period_secs: None,
            capacity: vec![("FARGATE_SPOT".to_string(), 1)],
            circuit_breaker: false,
            enable_execute_command: true,
            target: None,
        };

        Self {
            cluster_name: api.cluster_name.clone(),
            container_insights: true,
            execution_role: RoleSpec {
                path: "EcsRailsSampleECSExecutionRole".to_string(),
                role_name: "ecs-rails-sample-execution-role".to_string(),
                managed_policies: vec![
                    "CloudWatchAgentServerPolicy".to_string(),
                    "service-role/AmazonECSTaskExecutionRolePolicy".to_string(),
                ],
                inline_actions: Vec::new(),
            },
            secret_arn,
            primary,
            admin,
        }
    }
}

fn validate_task(service: &ServiceSpec, errors: &mut Vec<ValidationError>) {
    let task = &service.task;
    let who = &service.service_name;

    if !FARGATE_CPU_UNITS.contains(&task.cpu) {
        errors.push(ValidationError::new(format!(
            "api: {}: cpu {} is not a Fargate size",
            who, task.cpu
        )));
    }
    if task.containers.is_empty() {
        errors.push(ValidationError::new(format!("api: {}: task has no containers", who)));
    }
    if !task.containers.iter().any(|c| c.essential) {
        errors.push(ValidationError::new(format!(
            "api: {}: task has no essential container",
            who
        )));
    }

    let reserved: u32 = task.containers.iter().map(ContainerSpec::reserved_mib).sum();
    if reserved > task.memory_mib {
        errors.push(ValidationError::new(format!(
            "api: {}: container reservations ({} MiB) exceed task memory ({} MiB)",
            who, reserved, task.memory_mib
        )));
    }
    let cpu: u32 = task.containers.iter().filter_map(|c| c.cpu).sum();
    if cpu > task.cpu {
        errors.push(ValidationError::new(format!(
            "api: {}: container cpu ({}) exceeds task cpu ({})",
            who, cpu, task.cpu
        )));
    }
    for c in &task.containers {
        if c.memory_limit_mib.is_some_and(|m| m == 0 || m > task.memory_mib) {
            errors.push(ValidationError::new(format!(
                "api: {}: container '{}' memory limit must be within the task memory",
                who, c.name
            )));
        }
        if c.secrets.values().any(|s| s.arn.is_empty()) {
            errors.push(ValidationError::new(format!(
                "api: {}: container '{}' references a secret without an ARN ({})",
                who, c.name, SECRET_ARN_KEY
            )));
        }
    }

    if service.capacity.is_empty() || service.capacity.iter().all(|(_, w)| *w == 0) {
        errors.push(ValidationError::new(format!(
            "api: {}: capacity strategy needs a provider with non-zero weight",
            who
        )));
    }
    for (provider, _) in &service.capacity {
        if !CAPACITY_PROVIDERS.contains(&provider.as_str()) {
            errors.push(ValidationError::new(format!(
                "api: {}: unknown capacity provider '{}'",
                who, provider
            )));
        }
    }
}

fn validate_target(service: &ServiceSpec, target: &TargetSpec, errors: &mut Vec<ValidationError>) {
    let who = &service.service_name;
    match service.task.containers.iter().find(|c| c.name == target.container) {
        None => errors.push(ValidationError::new(format!(
            "api: {}: load balancer targets unknown container '{}'",
            who, target.container
        ))),
        Some(c) if c.port != Some(target.port) => errors.push(ValidationError::new(format!(
            "api: {}: container '{}' does not expose port {}",
            who, c.name, target.port
        ))),
        Some(_) => {}
    }

    let hc = &target.health_check;
    if !hc.path.starts_with('/') {
        errors.push(ValidationError::new(format!(
            "api: health check path '{}' must start with '/'",
            hc.path
        )));
    }
    if hc.timeout_secs >= hc.interval_secs {
        errors.push(ValidationError::new(format!(
            "api: health check timeout ({}s) must be shorter than its interval ({}s)",
            hc.timeout_secs, hc.interval_secs
        )));
    }
    if !is_match(&HTTP_CODES, &hc.healthy_http_codes) {
        errors.push(ValidationError::new(format!(
            "api: healthy_http_codes '{}' is not a code list",
            hc.healthy_http_codes
        )));
    }
    if !(2..=10).contains(&hc.healthy_threshold) || !(2..=10).contains(&hc.unhealthy_threshold) {
        errors.push(ValidationError::new(
            "api: health check thresholds must be between 2 and 10",
        ));
    }
}

/// Validate a compute descriptor.
pub fn validate(desc: &ComputeDescriptor) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    let primary = &desc.primary;
    let admin = &desc.admin;

    if desc.cluster_name.is_empty() {
        errors.push(ValidationError::new("api: cluster name must not be empty"));
    }

    if !(primary.min_healthy_percent < 100 && 100 <= primary.max_healthy_percent) {
        errors.push(ValidationError::new(format!(
            "api: {}: min_healthy_percent ({}) must be below 100 and max_healthy_percent ({}) at least 100",
            primary.service_name, primary.min_healthy_percent, primary.max_healthy_percent
        )));
    }
    if primary.desired_count == 0 {
        errors.push(ValidationError::new(format!(
            "api: {}: desired_count must be at least 1",
            primary.service_name
        )));
    }
    if admin.desired_count != 1 {
        errors.push(ValidationError::new(format!(
            "api: {}: administrative service must run exactly one replica, got {}",
            admin.service_name, admin.desired_count
        )));
    }
    if admin.target.is_some() {
        errors.push(ValidationError::new(format!(
            "api: {}: administrative service must not join the load balancer",
            admin.service_name
        )));
    }

    let exec = &desc.execution_role.role_name;
    if primary.task.task_role.role_name == admin.task.task_role.role_name {
        errors.push(ValidationError::new(format!(
            "api: services must use distinct task roles, both use '{}'",
            admin.task.task_role.role_name
        )));
    }
    for service in [primary, admin] {
        if &service.task.task_role.role_name == exec {
            errors.push(ValidationError::new(format!(
                "api: {}: task role must differ from the execution role",
                service.service_name
            )));
        }
        validate_task(service, &mut errors);
    }

    match &primary.target {
        Some(target) => validate_target(primary, target, &mut errors),
        None => errors.push(ValidationError::new(format!(
            "api: {}: primary service needs a load balancer target",
            primary.service_name
        ))),
    }

    errors
}

fn assume_role_policy() -> Value {
    json!({
        "Statement": [{
            "Action": "sts:AssumeRole",
            "Effect": "Allow",
            "Principal": { "Service": "ecs-tasks.amazonaws.com" },
        }],
        "Version": "2012-10-17",
    })
}

fn add_role(stack: &mut Stack, role: &RoleSpec) -> Result<String, String> {
    let mut props = json!({
        "AssumeRolePolicyDocument": assume_role_policy(),
        "RoleName": role.role_name,
    });
    if !role.managed_policies.is_empty() {
        props["ManagedPolicyArns"] = role
            .managed_policies
            .iter()
            .map(|p| managed_policy_arn(p))
            .collect();
    }
    let id = stack.add(&role.path, CfnResource::new("AWS::IAM::Role", props))?;

    if !role.inline_actions.is_empty() {
        add_policy(
            stack,
            &role.path,
            &id,
            json!([{ "Action": role.inline_actions, "Effect": "Allow", "Resource": "*" }]),
        )?;
    }
    Ok(id)
}

fn add_policy(stack: &mut Stack, role_path: &str, role_id: &str, statements: Value) -> Result<String, String> {
    let policy_path = format!("{}/DefaultPolicy", role_path);
    let policy_name = crate::core::stack::logical_id_for(&policy_path);
    stack.add(
        &policy_path,
        CfnResource::new(
            "AWS::IAM::Policy",
            json!({
                "PolicyDocument": { "Statement": statements, "Version": "2012-10-17" },
                "PolicyName": policy_name,
                "Roles": [ref_to(role_id)],
            }),
        ),
    )
}

fn container_json(c: &ContainerSpec, log_group: &str) -> Value {
    let mut def = json!({
        "Name": c.name,
        "Image": c.image.to_json(),
        "Essential": c.essential,
        "LogConfiguration": {
            "LogDriver": "awslogs",
            "Options": {
                "awslogs-group": ref_to(log_group),
                "awslogs-stream-prefix": c.stream_prefix,
                "awslogs-region": region(),
            },
        },
    });
    if let Some(cpu) = c.cpu {
        def["Cpu"] = json!(cpu);
    }
    if let Some(m) = c.memory_limit_mib {
        def["Memory"] = json!(m);
    }
    if let Some(m) = c.memory_reservation_mib {
        def["MemoryReservation"] = json!(m);
    }
    if let Some(port) = c.port {
        def["PortMappings"] = json!([{ "ContainerPort": port, "Protocol": "tcp" }]);
    }
    if !c.environment.is_empty() {
        def["Environment"] = c
            .environment
            .iter()
            .map(|(k, v)| json!({ "Name": k, "Value": v }))
            .collect();
    }
    if !c.secrets.is_empty() {
        def["Secrets"] = c
            .secrets
            .iter()
            .map(|(k, s)| json!({ "Name": k, "ValueFrom": format!("{}:{}::", s.arn, s.field) }))
            .collect();
    }
    if let Some(ref user) = c.user {
        def["User"] = json!(user);
    }
    if let Some(ref hc) = c.health_check {
        def["HealthCheck"] = json!({
            "Command": hc.command,
            "Interval": hc.interval_secs,
            "Retries": hc.retries,
            "StartPeriod": hc.start_period_secs,
            "Timeout": hc.timeout_secs,
        });
    }
    def
}

fn add_task(stack: &mut Stack, task: &TaskSpec, execution_role: &str) -> Result<String, String> {
    let task_role = add_role(stack, &task.task_role)?;

    let mut containers = Vec::new();
    for c in &task.containers {
        let log_group = stack.add(
            &c.log_group_path,
            CfnResource::new(
                "AWS::Logs::LogGroup",
                json!({ "LogGroupName": c.log_group_name }),
            )
            .with_removal_policy(RemovalPolicy::Destroy),
        )?;
        containers.push(container_json(c, &log_group));
    }

    stack.add(
        &task.path,
        CfnResource::new(
            "AWS::ECS::TaskDefinition",
            json!({
                "ContainerDefinitions": containers,
                "Cpu": task.cpu.to_string(),
                "ExecutionRoleArn": get_att(execution_role, "Arn"),
                "Family": task.family,
                "Memory": task.memory_mib.to_string(),
                "NetworkMode": "awsvpc",
                "RequiresCompatibilities": ["FARGATE"],
                "TaskRoleArn": get_att(&task_role, "Arn"),
            }),
        ),
    )
}

struct ServiceContext<'a> {
    cluster: &'a str,
    capacity_association: &'a str,
    execution_role: &'a str,
    network: &'a NetworkOutputs,
}

fn add_service(stack: &mut Stack, service: &ServiceSpec, ctx: &ServiceContext<'_>) -> Result<String, String> {
    let task = add_task(stack, &service.task, ctx.execution_role)?;
    let subnets: Vec<Value> = ctx
        .network
        .subnets(SubnetKind::PrivateWithEgress)
        .iter()
        .map(|s| s.import())
        .collect();

    let mut props = json!({
        "CapacityProviderStrategy": service
            .capacity
            .iter()
            .map(|(p, w)| json!({ "CapacityProvider": p, "Weight": w }))
            .collect::<Vec<_>>(),
        "Cluster": ref_to(ctx.cluster),
        "DeploymentConfiguration": {
            "MaximumPercent": service.max_healthy_percent,
            "MinimumHealthyPercent": service.min_healthy_percent,
        },
        "DesiredCount": service.desired_count,
        "EnableECSManagedTags": false,
        "EnableExecuteCommand": service.enable_execute_command,
        "NetworkConfiguration": {
            "AwsvpcConfiguration": {
                "AssignPublicIp": "DISABLED",
                "SecurityGroups": [ctx.network.api_to_db_sg.import()],
                "Subnets": subnets,
            },
        },
        "ServiceName": service.service_name,
        "TaskDefinition": ref_to(&task),
    });
    if service.circuit_breaker {
        props["DeploymentConfiguration"]["DeploymentCircuitBreaker"] =
            json!({ "Enable": true, "Rollback": true });
    }
    let mut resource_deps = vec![ctx.capacity_association.to_string()];

    if let Some(ref target) = service.target {
        let hc = &target.health_check;
        let target_group = stack.add(
            TARGET_PATH,
            CfnResource::new(
                "AWS::ElasticLoadBalancingV2::TargetGroup",
                json!({
                    "HealthCheckIntervalSeconds": hc.interval_secs,
                    "HealthCheckPath": hc.path,
                    "HealthCheckProtocol": "HTTP",
                    "HealthCheckTimeoutSeconds": hc.timeout_secs,
                    "HealthyThresholdCount": hc.healthy_threshold,
                    "Matcher": { "HttpCode": hc.healthy_http_codes },
                    "Port": target.port,
                    "Protocol": "HTTP",
                    "TargetType": "ip",
                    "UnhealthyThresholdCount": hc.unhealthy_threshold,
                    "VpcId": ctx.network.vpc.import(),
                }),
            ),
        )?;
        let rule = stack.add(
            &format!("{}/Rule", TARGET_PATH),
            CfnResource::new(
                "AWS::ElasticLoadBalancingV2::ListenerRule",
                json!({
                    "Actions": [{ "TargetGroupArn": ref_to(&target_group), "Type": "forward" }],
                    "Conditions": [{ "Field": "path-pattern", "PathPatternConfig": { "Values": ["/*"] } }],
                    "ListenerArn": ctx.network.listener.import(),
                    "Priority": target.priority,
                }),
            ),
        )?;
        stack.add(
            &format!("{}/LoadBalancerIngress", service.path),
            CfnResource::new(
                "AWS::EC2::SecurityGroupIngress",
                json!({
                    "Description": "Load balancer to target",
                    "FromPort": target.port,
                    "GroupId": ctx.network.api_to_db_sg.import(),
                    "IpProtocol": "tcp",
                    "SourceSecurityGroupId": ctx.network.alb_sg.import(),
                    "ToPort": target.port,
                }),
            ),
        )?;

        props["LoadBalancers"] = json!([{
            "ContainerName": target.container,
            "ContainerPort": target.port,
            "TargetGroupArn": ref_to(&target_group),
        }]);
        if let Some(grace) = service.health_check_grace_period_secs {
            props["HealthCheckGracePeriodSeconds"] = json!(grace);
        }
        // The target group must be attached to the listener first
        resource_deps.push(rule);
    }

    let resource = resource_deps
        .iter()
        .fold(CfnResource::new("AWS::ECS::Service", props), |r, d| r.depends_on(d));
    stack.add(&service.path, resource)
}

/// Declare the API stack.
pub fn build(
    name: &str,
    env: &Environment,
    desc: &ComputeDescriptor,
    network: &NetworkOutputs,
) -> Result<Stack, String> {
    if desc.secret_arn.is_empty() {
        return Err(format!(
            "api: context value '{}' is required to declare the API stack",
            SECRET_ARN_KEY
        ));
    }
    if network.subnets(SubnetKind::PrivateWithEgress).is_empty() {
        return Err("api: network exposes no application subnets".to_string());
    }

    let mut stack = Stack::new(name)
        .with_description("ECS cluster and Fargate services for the Rails API")
        .with_env(env.clone());
    stack.add_dependency(&network.vpc.stack);

    let insights = if desc.container_insights { "enabled" } else { "disabled" };
    let cluster = stack.add(
        CLUSTER_PATH,
        CfnResource::new(
            "AWS::ECS::Cluster",
            json!({
                "ClusterName": desc.cluster_name,
                "ClusterSettings": [{
                    "Name": "containerInsights",
                    "Value": insights,
                }],
            }),
        ),
    )?;
    let capacity_association = stack.add(
        &format!("{}/CapacityProviders", CLUSTER_PATH),
        CfnResource::new(
            "AWS::ECS::ClusterCapacityProviderAssociations",
            json!({
                "CapacityProviders": CAPACITY_PROVIDERS,
                "Cluster": ref_to(&cluster),
                "DefaultCapacityProviderStrategy": [],
            }),
        ),
    )?;

    let execution_role = add_role(&mut stack, &desc.execution_role)?;
    add_policy(
        &mut stack,
        &desc.execution_role.path,
        &execution_role,
        json!([{
            "Action": ["secretsmanager:GetSecretValue", "secretsmanager:DescribeSecret"],
            "Effect": "Allow",
            "Resource": desc.secret_arn,
        }]),
    )?;

    let ctx = ServiceContext {
        cluster: &cluster,
        capacity_association: &capacity_association,
        execution_role: &execution_role,
        network,
    };
    let service = add_service(&mut stack, &desc.primary, &ctx)?;
    add_service(&mut stack, &desc.admin, &ctx)?;

    stack.output("ClusterName", ref_to(&cluster), None);
    stack.output(
        "ServiceName",
        get_att(&service, "Name"),
        Some("Primary API service"),
    );

    tracing::debug!(
        stack = %name,
        desired = desc.primary.desired_count,
        "api stack declared"
    );
    Ok(stack)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::APP_TAG_KEY;
    use crate::stacks::network::{self, NetworkDescriptor};

    const ARN: &str = "arn:aws:secretsmanager:ap-northeast-1:123456789012:secret:rails-AbCdEf";

    fn config() -> RailstackConfig {
        let mut c: RailstackConfig =
            serde_yaml_ng::from_str("version: \"1.0\"\nname: sample\n").unwrap();
        c.context.insert(SECRET_ARN_KEY.to_string(), ARN.to_string());
        c.context.insert(APP_TAG_KEY.to_string(), "abc123".to_string());
        c
    }

    fn built(desc: &ComputeDescriptor) -> (Stack, NetworkOutputs) {
        let (_, net) =
            network::build("Net", &Environment::default(), &NetworkDescriptor::default()).unwrap();
        let stack = build("Api", &Environment::default(), desc, &net).unwrap();
        (stack, net)
    }

    fn container<'a>(stack: &'a Stack, task_path: &str, name: &str) -> &'a Value {
        let defs = stack
            .resource(task_path)
            .unwrap()
            .prop("ContainerDefinitions")
            .unwrap()
            .as_array()
            .unwrap();
        defs.iter().find(|c| c["Name"] == name).unwrap()
    }

    #[test]
    fn test_rs012_default_descriptor_valid() {
        let desc = ComputeDescriptor::from_config(&config());
        let errors = validate(&desc);
        assert!(errors.is_empty(), "{:?}", errors);
    }

    #[test]
    fn test_rs012_memory_split() {
        let desc = ComputeDescriptor::from_config(&config());
        let app = &desc.primary.task.containers[0];
        assert_eq!(app.memory_limit_mib, Some(8192 - 256 - 50));
        let total: u32 = desc.primary.task.containers.iter().map(ContainerSpec::reserved_mib).sum();
        assert_eq!(total, 8192);
    }

    #[test]
    fn test_rs012_healthy_percent_bounds() {
        let mut desc = ComputeDescriptor::from_config(&config());
        desc.primary.min_healthy_percent = 100;
        assert!(validate(&desc).iter().any(|e| e.message.contains("min_healthy_percent")));
        desc.primary.min_healthy_percent = 50;
        desc.primary.max_healthy_percent = 99;
        assert!(validate(&desc).iter().any(|e| e.message.contains("max_healthy_percent")));
    }

    #[test]
    fn test_rs012_admin_single_replica() {
        let mut c = config();
        c.api.desired_count = 9;
        let mut desc = ComputeDescriptor::from_config(&c);
        assert_eq!(desc.admin.desired_count, 1);
        desc.admin.desired_count = 2;
        assert!(validate(&desc).iter().any(|e| e.message.contains("exactly one replica")));
    }

    #[test]
    fn test_rs012_task_roles_distinct() {
        let mut desc = ComputeDescriptor::from_config(&config());
        desc.admin.task.task_role.role_name = desc.primary.task.task_role.role_name.clone();
        assert!(validate(&desc).iter().any(|e| e.message.contains("distinct task roles")));
    }

    #[test]
    fn test_rs012_reservations_must_fit() {
        let mut desc = ComputeDescriptor::from_config(&config());
        desc.primary.task.containers[1].memory_reservation_mib = Some(1024);
        assert!(validate(&desc).iter().any(|e| e.message.contains("exceed task memory")));
    }

    #[test]
    fn test_rs012_target_container_must_expose_port() {
        let mut desc = ComputeDescriptor::from_config(&config());
        desc.primary.task.containers[0].port = Some(8080);
        assert!(validate(&desc).iter().any(|e| e.message.contains("does not expose port")));
    }

    #[test]
    fn test_rs012_missing_secret_reported() {
        let mut c = config();
        c.context.shift_remove(SECRET_ARN_KEY);
        let desc = ComputeDescriptor::from_config(&c);
        assert!(validate(&desc).iter().any(|e| e.message.contains("without an ARN")));
        let (_, net) =
            network::build("Net", &Environment::default(), &NetworkDescriptor::default()).unwrap();
        assert!(build("Api", &Environment::default(), &desc, &net).is_err());
    }

    #[test]
    fn test_rs012_services_share_execution_role() {
        let desc = ComputeDescriptor::from_config(&config());
        let (stack, _) = built(&desc);
        let primary = stack.resource("EcsRailsSampleTaskDefinition").unwrap();
        let admin = stack.resource("EcsRailsSampleDbExecTaskDefinition").unwrap();
        assert_eq!(primary.prop("ExecutionRoleArn"), admin.prop("ExecutionRoleArn"));
        assert_ne!(primary.prop("TaskRoleArn"), admin.prop("TaskRoleArn"));
        assert_eq!(stack.resources_of_type("AWS::IAM::Role").count(), 3);
    }

    #[test]
    fn test_rs012_services_use_api_group_and_app_subnets() {
        let desc = ComputeDescriptor::from_config(&config());
        let (stack, net) = built(&desc);
        let app_subnets: Vec<Value> = net
            .subnets(SubnetKind::PrivateWithEgress)
            .iter()
            .map(|s| s.import())
            .collect();
        for (_, svc) in stack.resources_of_type("AWS::ECS::Service") {
            let vpc = &svc.prop("NetworkConfiguration").unwrap()["AwsvpcConfiguration"];
            assert_eq!(vpc["SecurityGroups"], json!([net.api_to_db_sg.import()]));
            assert_eq!(vpc["Subnets"], json!(app_subnets));
        }
    }

    #[test]
    fn test_rs012_primary_service_shape() {
        let desc = ComputeDescriptor::from_config(&config());
        let (stack, _) = built(&desc);
        let svc = stack.resource("EcsRailsSampleService").unwrap();
        assert_eq!(svc.prop("DesiredCount").unwrap(), 4);
        assert_eq!(svc.prop("HealthCheckGracePeriodSeconds").unwrap(), 30);
        let dc = svc.prop("DeploymentConfiguration").unwrap();
        assert_eq!(dc["MinimumHealthyPercent"], 50);
        assert_eq!(dc["MaximumPercent"], 200);
        assert_eq!(dc["DeploymentCircuitBreaker"]["Rollback"], true);
        assert_eq!(
            svc.prop("CapacityProviderStrategy").unwrap(),
            &json!([
                { "CapacityProvider": "FARGATE_SPOT", "Weight": 1 },
                { "CapacityProvider": "FARGATE", "Weight": 1 },
            ])
        );
        let rule = stack.logical_id("EcsRailsSampleTarget/Rule").unwrap();
        assert!(svc.depends_on.contains(&rule));
    }

    #[test]
    fn test_rs012_admin_service_shape() {
        let desc = ComputeDescriptor::from_config(&config());
        let (stack, _) = built(&desc);
        let svc = stack.resource("EcsRailsSampleDbExecService").unwrap();
        assert_eq!(svc.prop("DesiredCount").unwrap(), 1);
        assert_eq!(svc.prop("EnableExecuteCommand").unwrap(), true);
        assert!(svc.prop("LoadBalancers").is_none());
        assert_eq!(
            svc.prop("CapacityProviderStrategy").unwrap(),
            &json!([{ "CapacityProvider": "FARGATE_SPOT", "Weight": 1 }])
        );
    }

    #[test]
    fn test_rs012_container_definitions() {
        let desc = ComputeDescriptor::from_config(&config());
        let (stack, _) = built(&desc);
        let api = container(&stack, "EcsRailsSampleTaskDefinition", "API");
        assert_eq!(api["PortMappings"][0]["ContainerPort"], 3000);
        assert_eq!(api["Secrets"][0]["ValueFrom"], format!("{}:RAILS_MASTER_KEY::", ARN));
        assert_eq!(api["Environment"][2], json!({ "Name": "AWS_XRAY_LOCATION", "Value": "localhost:2000" }));
        let tag = api["Image"]["Fn::Join"][1][5].as_str().unwrap();
        assert_eq!(tag, "/ecs-rails-sample:abc123");

        let xray = container(&stack, "EcsRailsSampleTaskDefinition", "xray");
        assert_eq!(xray["Essential"], false);
        assert_eq!(xray["User"], "1337");
        assert_eq!(xray["HealthCheck"]["Retries"], 3);

        let agent = container(&stack, "EcsRailsSampleTaskDefinition", "cloudwatch-agent");
        assert_eq!(agent["User"], "0:1338");
        let cfg: Value =
            serde_json::from_str(agent["Environment"][0]["Value"].as_str().unwrap()).unwrap();
        assert!(cfg["logs"]["metrics_collected"].get("emf").is_some());

        let db = container(&stack, "EcsRailsSampleDbExecTaskDefinition", "DB");
        assert_eq!(db["Cpu"], 4096);
        assert_eq!(db["Memory"], 8192);
    }

    #[test]
    fn test_rs012_load_balancer_wiring() {
        let desc = ComputeDescriptor::from_config(&config());
        let (stack, net) = built(&desc);
        let tg = stack.resource("EcsRailsSampleTarget").unwrap();
        assert_eq!(*tg.prop("HealthCheckPath").unwrap(), "/healthz");
        assert_eq!(*tg.prop("TargetType").unwrap(), "ip");
        assert_eq!(tg.prop("Port").unwrap(), 3000);
        let rule = stack.resource("EcsRailsSampleTarget/Rule").unwrap();
        assert_eq!(rule.prop("ListenerArn").unwrap(), &net.listener.import());
        let ingress = stack
            .resource("EcsRailsSampleService/LoadBalancerIngress")
            .unwrap();
        assert_eq!(ingress.prop("SourceSecurityGroupId").unwrap(), &net.alb_sg.import());
        assert_eq!(ingress.prop("FromPort").unwrap(), 3000);
    }

    #[test]
    fn test_rs012_log_groups_per_container() {
        let desc = ComputeDescriptor::from_config(&config());
        let (stack, _) = built(&desc);
        let names: Vec<&str> = stack
            .resources_of_type("AWS::Logs::LogGroup")
            .filter_map(|(_, r)| r.prop("LogGroupName").and_then(Value::as_str))
            .collect();
        assert_eq!(
            names,
            vec![
                "/ecs/ecs-rails-sample-api",
                "/ecs/ecs-rails-sample-xray",
                "/ecs/ecs-rails-sample-cloudwatch",
                "/ecs/ecs-rails-sample-db-exec",
            ]
        );
    }
}
