//! RS-013: CI stack. Image repository, build project and pipeline.
//!
//! Independent of the other stacks. The API stack only names the repository
//! and a tag; nothing here is exported.

use crate::core::intrinsics::{
    account_id, get_att, join, partition, ref_to, region, secret_value, url_suffix,
};
use crate::core::parser::{is_match, Pattern, ValidationError};
use crate::core::stack::{CfnResource, Stack};
use crate::core::types::{CiSettings, Environment, RemovalPolicy};
use regex::Regex;
use serde_json::{json, Value};
use std::sync::LazyLock;

const REPOSITORY_PATH: &str = "ECSRailsSampleECR";
const PROJECT_PATH: &str = "ECSRailsSampleECRCodeBuildProject";
const PIPELINE_PATH: &str = "ECSRailsSampleECRCodePipeline";
const SOURCE_ACTION: &str = "GitHubSourceAction";
const SOURCE_ARTIFACT: &str = "Artifact_Source_GitHubSourceAction";
static ECR_NAME: Pattern = LazyLock::new(|| Regex::new(r"^[a-z0-9]+(?:[._-][a-z0-9]+)*(?:/[a-z0-9]+(?:[._-][a-z0-9]+)*)*$").ok());
static PIPELINE_NAME: Pattern = LazyLock::new(|| Regex::new(r"^[A-Za-z0-9.@_-]{1,100}$").ok());

/// Longest name a notification rule accepts, in bytes.
const RULE_NAME_MAX: usize = 64;

/// Build events forwarded to the notification targets.
pub const NOTIFIED_EVENTS: &[&str] = &[
    "codebuild-project-build-state-succeeded",
    "codebuild-project-build-state-failed",
];

/// Everything the CI stack declares.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineDescriptor {
    pub repository_name: String,
    pub owner: String,
    pub repo: String,
    pub branch: String,
    pub github_token_secret: String,
    pub slack_secret: String,
    pub pipeline_name: String,
    pub build_image: String,
    pub privileged: bool,
    pub source_stage: String,
    pub build_stage: String,
    pub repository_removal: RemovalPolicy,
}

impl Default for PipelineDescriptor {
    fn default() -> Self {
        Self::from_settings(&CiSettings::default(), RemovalPolicy::default())
    }
}

impl PipelineDescriptor {
    pub fn from_settings(settings: &CiSettings, repository_removal: RemovalPolicy) -> Self {
        Self {
            repository_name: settings.repository_name.clone(),
            owner: settings.owner.clone(),
            repo: settings.repo.clone(),
            branch: settings.branch.clone(),
            github_token_secret: settings.github_token_secret.clone(),
            slack_secret: settings.slack_secret.clone(),
            pipeline_name: settings.pipeline_name.clone(),
            build_image: settings.build_image.clone(),
            // Docker-in-Docker builds need the daemon
            privileged: true,
            source_stage: "GitHubSourceAction-stage".to_string(),
            build_stage: "Docker-image-BuildAndPush".to_string(),
            repository_removal,
        }
    }
}

/// Validate a pipeline descriptor.
pub fn validate(desc: &PipelineDescriptor) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if !is_match(&ECR_NAME, &desc.repository_name) {
        errors.push(ValidationError::new(format!(
            "ci: repository name '{}' is not a valid ECR name",
            desc.repository_name
        )));
    }
    if !is_match(&PIPELINE_NAME, &desc.pipeline_name) {
        errors.push(ValidationError::new(format!(
            "ci: pipeline name '{}' is invalid",
            desc.pipeline_name
        )));
    }
    for (field, value) in [
        ("owner", &desc.owner),
        ("repo", &desc.repo),
        ("github_token_secret", &desc.github_token_secret),
        ("slack_secret", &desc.slack_secret),
        ("build_image", &desc.build_image),
    ] {
        if value.trim().is_empty() {
            errors.push(ValidationError::new(format!("ci: {} must not be empty", field)));
        }
    }
    if desc.branch.is_empty() || desc.branch.contains(char::is_whitespace) {
        errors.push(ValidationError::new(format!(
            "ci: branch '{}' is not a valid ref name",
            desc.branch
        )));
    }

    errors
}

fn service_role(principal: &str) -> Value {
    json!({
        "AssumeRolePolicyDocument": {
            "Statement": [{
                "Action": "sts:AssumeRole",
                "Effect": "Allow",
                "Principal": { "Service": principal },
            }],
            "Version": "2012-10-17",
        },
    })
}

fn role_policy(stack: &mut Stack, role_path: &str, role: &str, statements: Value) -> Result<String, String> {
    let path = format!("{}/DefaultPolicy", role_path);
    let policy_name = crate::core::stack::logical_id_for(&path);
    stack.add(
        &path,
        CfnResource::new(
            "AWS::IAM::Policy",
            json!({
                "PolicyDocument": { "Statement": statements, "Version": "2012-10-17" },
                "PolicyName": policy_name,
                "Roles": [ref_to(role)],
            }),
        ),
    )
}

fn bucket_statements(bucket: &str) -> Value {
    json!({
        "Action": ["s3:GetObject*", "s3:GetBucket*", "s3:List*", "s3:DeleteObject*", "s3:PutObject*", "s3:Abort*"],
        "Effect": "Allow",
        "Resource": [
            get_att(bucket, "Arn"),
            join("", vec![get_att(bucket, "Arn"), json!("/*")]),
        ],
    })
}

/// Declare the CI stack.
pub fn build(name: &str, env: &Environment, desc: &PipelineDescriptor) -> Result<Stack, String> {
    let mut stack = Stack::new(name)
        .with_description("Image repository, Docker build project and delivery pipeline")
        .with_env(env.clone());

    let repository = stack.add(
        REPOSITORY_PATH,
        CfnResource::new(
            "AWS::ECR::Repository",
            json!({
                "ImageScanningConfiguration": { "ScanOnPush": true },
                "ImageTagMutability": "IMMUTABLE",
                "RepositoryName": desc.repository_name,
            }),
        )
        .with_removal_policy(desc.repository_removal),
    )?;

    let bucket = stack.add(
        &format!("{}/ArtifactsBucket", PIPELINE_PATH),
        CfnResource::new(
            "AWS::S3::Bucket",
            json!({
                "BucketEncryption": {
                    "ServerSideEncryptionConfiguration": [{
                        "ServerSideEncryptionByDefault": { "SSEAlgorithm": "AES256" },
                    }],
                },
                "PublicAccessBlockConfiguration": {
                    "BlockPublicAcls": true,
                    "BlockPublicPolicy": true,
                    "IgnorePublicAcls": true,
                    "RestrictPublicBuckets": true,
                },
            }),
        )
        // Holds pipeline artifacts; never deleted with the stack
        .with_removal_policy(RemovalPolicy::Retain),
    )?;

    let project_role_path = format!("{}/Role", PROJECT_PATH);
    let project_role = stack.add(
        &project_role_path,
        CfnResource::new("AWS::IAM::Role", service_role("codebuild.amazonaws.com")),
    )?;

    let project = stack.add(
        PROJECT_PATH,
        CfnResource::new(
            "AWS::CodeBuild::Project",
            json!({
                "Artifacts": { "Type": "CODEPIPELINE" },
                "Cache": {
                    "Modes": ["LOCAL_DOCKER_LAYER_CACHE", "LOCAL_CUSTOM_CACHE"],
                    "Type": "LOCAL",
                },
                "Environment": {
                    "ComputeType": "BUILD_GENERAL1_SMALL",
                    "Image": desc.build_image,
                    "ImagePullCredentialsType": "CODEBUILD",
                    "PrivilegedMode": desc.privileged,
                    "Type": "LINUX_CONTAINER",
                },
                "ServiceRole": get_att(&project_role, "Arn"),
                "Source": { "Type": "CODEPIPELINE" },
            }),
        ),
    )?;

    let project_log_arn = join(
        "",
        vec![
            json!("arn:"),
            partition(),
            json!(":logs:"),
            region(),
            json!(":"),
            account_id(),
            json!(":log-group:/aws/codebuild/"),
            ref_to(&project),
            json!(":*"),
        ],
    );
    let project_policy = role_policy(
        &mut stack,
        &project_role_path,
        &project_role,
        json!([
            {
                "Action": ["logs:CreateLogGroup", "logs:CreateLogStream", "logs:PutLogEvents"],
                "Effect": "Allow",
                "Resource": project_log_arn,
            },
            {
                "Action": [
                    "ecr:BatchCheckLayerAvailability",
                    "ecr:GetDownloadUrlForLayer",
                    "ecr:BatchGetImage",
                    "ecr:PutImage",
                    "ecr:InitiateLayerUpload",
                    "ecr:UploadLayerPart",
                    "ecr:CompleteLayerUpload",
                ],
                "Effect": "Allow",
                "Resource": get_att(&repository, "Arn"),
            },
            { "Action": "ecr:GetAuthorizationToken", "Effect": "Allow", "Resource": "*" },
            bucket_statements(&bucket),
        ]),
    )?;
    if let Some(p) = stack.resources.get_mut(&project) {
        *p = p.clone().depends_on(&project_policy);
    }

    let pipeline_role_path = format!("{}/Role", PIPELINE_PATH);
    let pipeline_role = stack.add(
        &pipeline_role_path,
        CfnResource::new("AWS::IAM::Role", service_role("codepipeline.amazonaws.com")),
    )?;
    let pipeline_policy = role_policy(
        &mut stack,
        &pipeline_role_path,
        &pipeline_role,
        json!([
            bucket_statements(&bucket),
            {
                "Action": ["codebuild:BatchGetBuilds", "codebuild:StartBuild", "codebuild:StopBuild"],
                "Effect": "Allow",
                "Resource": get_att(&project, "Arn"),
            },
        ]),
    )?;

    let repository_uri = vec![
        account_id(),
        json!(".dkr.ecr."),
        region(),
        json!("."),
        url_suffix(),
        json!("/"),
        ref_to(&repository),
    ];
    let mut build_env = vec![json!("[{\"name\":\"REPOSITORY_URI\",\"type\":\"PLAINTEXT\",\"value\":\"")];
    build_env.extend(repository_uri);
    build_env.push(json!("\"}]"));

    let github_token = secret_value(&desc.github_token_secret, None);
    let pipeline = stack.add(
        PIPELINE_PATH,
        CfnResource::new(
            "AWS::CodePipeline::Pipeline",
            json!({
                "ArtifactStore": { "Location": ref_to(&bucket), "Type": "S3" },
                "Name": desc.pipeline_name,
                "RoleArn": get_att(&pipeline_role, "Arn"),
                "Stages": [
                    {
                        "Actions": [{
                            "ActionTypeId": {
                                "Category": "Source",
                                "Owner": "ThirdParty",
                                "Provider": "GitHub",
                                "Version": "1",
                            },
                            "Configuration": {
                                "Branch": desc.branch,
                                "OAuthToken": github_token,
                                "Owner": desc.owner,
                                "PollForSourceChanges": false,
                                "Repo": desc.repo,
                            },
                            "Name": SOURCE_ACTION,
                            "OutputArtifacts": [{ "Name": SOURCE_ARTIFACT }],
                            "RunOrder": 1,
                        }],
                        "Name": desc.source_stage,
                    },
                    {
                        "Actions": [{
                            "ActionTypeId": {
                                "Category": "Build",
                                "Owner": "AWS",
                                "Provider": "CodeBuild",
                                "Version": "1",
                            },
                            "Configuration": {
                                "EnvironmentVariables": join("", build_env),
                                "ProjectName": ref_to(&project),
                            },
                            "InputArtifacts": [{ "Name": SOURCE_ARTIFACT }],
                            "Name": desc.build_stage,
                            "RunOrder": 2,
                        }],
                        "Name": desc.build_stage,
                    },
                ],
            }),
        )
        .depends_on(&pipeline_policy)
        .depends_on(&pipeline_role),
    )?;

    stack.add(
        &format!("{}/{}/WebhookResource", PIPELINE_PATH, SOURCE_ACTION),
        CfnResource::new(
            "AWS::CodePipeline::Webhook",
            json!({
                "Authentication": "GITHUB_HMAC",
                "AuthenticationConfiguration": { "SecretToken": github_token },
                "Filters": [{ "JsonPath": "$.ref", "MatchEquals": "refs/heads/{Branch}" }],
                "RegisterWithThirdParty": true,
                "TargetAction": SOURCE_ACTION,
                "TargetPipeline": ref_to(&pipeline),
                "TargetPipelineVersion": 1,
            }),
        ),
    )?;

    let topic = stack.add(
        "SlackNotification",
        CfnResource::new("AWS::SNS::Topic", json!({})),
    )?;
    stack.add(
        "SlackNotification/Policy",
        CfnResource::new(
            "AWS::SNS::TopicPolicy",
            json!({
                "PolicyDocument": {
                    "Statement": [{
                        "Action": "sns:Publish",
                        "Effect": "Allow",
                        "Principal": { "Service": "codestar-notifications.amazonaws.com" },
                        "Resource": ref_to(&topic),
                    }],
                    "Version": "2012-10-17",
                },
                "Topics": [ref_to(&topic)],
            }),
        ),
    )?;

    let chatbot_role = stack.add(
        "SlackChannel/ConfigurationRole",
        CfnResource::new("AWS::IAM::Role", service_role("chatbot.amazonaws.com")),
    )?;
    let slack = stack.add(
        "SlackChannel",
        CfnResource::new(
            "AWS::Chatbot::SlackChannelConfiguration",
            json!({
                "ConfigurationName": secret_value(&desc.slack_secret, Some("channel_configuration_name")),
                "IamRoleArn": get_att(&chatbot_role, "Arn"),
                "SlackChannelId": secret_value(&desc.slack_secret, Some("channel_id")),
                "SlackWorkspaceId": secret_value(&desc.slack_secret, Some("workspace_id")),
            }),
        ),
    )?;

    stack.add(
        "NotificationRule",
        CfnResource::new(
            "AWS::CodeStarNotifications::NotificationRule",
            json!({
                "DetailType": "FULL",
                "EventTypeIds": NOTIFIED_EVENTS,
                "Name": notification_rule_name(name),
                "Resource": get_att(&project, "Arn"),
                "Targets": [
                    { "TargetAddress": ref_to(&topic), "TargetType": "SNS" },
                    { "TargetAddress": ref_to(&slack), "TargetType": "AWSChatbotSlack" },
                ],
            }),
        ),
    )?;

    stack.output("RepositoryName", ref_to(&repository), None);
    stack.output("PipelineName", ref_to(&pipeline), None);

    tracing::debug!(stack = %name, repository = %desc.repository_name, "ci stack declared");
    Ok(stack)
}

/// `<Stack>NotificationRule`, cut to the rule-name limit without splitting
/// a character.
fn notification_rule_name(stack: &str) -> String {
    let mut name = format!("{}NotificationRule", stack);
    if name.len() > RULE_NAME_MAX {
        let mut end = RULE_NAME_MAX;
        while !name.is_char_boundary(end) {
            end -= 1;
        }
        name.truncate(end);
    }
    name
}
