//! RS-010: Network stack. VPC, subnet tiers, load balancer, security groups.
//!
//! Leaf of the stack graph. Everything other stacks need leaves through
//! [`NetworkOutputs`] as exported handles; no consumer rebuilds topology.

use crate::core::cidr::{Cidr, CidrAllocator, MIN_VPC_PREFIX};
use crate::core::intrinsics::{get_att, get_azs, ref_to, select};
use crate::core::parser::ValidationError;
use crate::core::stack::{CfnResource, ExportRef, Stack};
use crate::core::types::{Environment, NetworkSettings};
use indexmap::IndexMap;
use serde_json::{json, Value};

/// MySQL wire port.
pub const DB_PORT: u16 = 3306;

/// Construct name of the group attached to API tasks.
pub const API_TO_DB_GROUP: &str = "API to DB";

/// Construct name of the group attached to the database.
pub const DB_GROUP: &str = "DB";

const VPC_PATH: &str = "EcsRailsSampleVPC";
const ALB_PATH: &str = "EcsRailsSampleALB";
const LISTENER_PATH: &str = "EcsRailsSampleALB/EcsRailsSampleALBPublicListener";

/// Subnet visibility class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubnetKind {
    Public,
    PrivateWithEgress,
    Isolated,
}

impl SubnetKind {
    fn tag(self) -> &'static str {
        match self {
            Self::Public => "Public",
            Self::PrivateWithEgress => "Private",
            Self::Isolated => "Isolated",
        }
    }
}

/// One subnet tier, replicated in every availability zone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubnetTier {
    pub name: String,
    pub cidr_mask: u8,
    pub kind: SubnetKind,
}

/// Source of an ingress rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Peer {
    /// The group the rule belongs to
    SelfGroup,
    /// Another group of this descriptor, by construct name
    Group(String),
    AnyIpv4,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngressRule {
    pub peer: Peer,
    pub port: u16,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityGroupSpec {
    pub name: String,
    pub ingress: Vec<IngressRule>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerSpec {
    pub port: u16,
    /// Open to 0.0.0.0/0
    pub open: bool,
}

/// Everything the network stack declares.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkDescriptor {
    pub cidr: String,
    pub max_azs: u8,
    pub tiers: Vec<SubnetTier>,
    pub listener: ListenerSpec,
    pub deletion_protection: bool,
    pub security_groups: Vec<SecurityGroupSpec>,
}

impl Default for NetworkDescriptor {
    fn default() -> Self {
        Self::from_settings(&NetworkSettings::default())
    }
}

impl NetworkDescriptor {
    pub fn from_settings(settings: &NetworkSettings) -> Self {
        Self {
            cidr: settings.cidr.clone(),
            max_azs: settings.max_azs,
            tiers: vec![
                SubnetTier {
                    name: "public".to_string(),
                    cidr_mask: 24,
                    kind: SubnetKind::Public,
                },
                SubnetTier {
                    name: "application".to_string(),
                    cidr_mask: 24,
                    kind: SubnetKind::PrivateWithEgress,
                },
                SubnetTier {
                    name: "rds".to_string(),
                    cidr_mask: 28,
                    kind: SubnetKind::Isolated,
                },
            ],
            listener: ListenerSpec {
                port: settings.listener_port,
                open: true,
            },
            deletion_protection: settings.deletion_protection,
            security_groups: vec![
                SecurityGroupSpec {
                    name: API_TO_DB_GROUP.to_string(),
                    ingress: vec![],
                },
                SecurityGroupSpec {
                    name: DB_GROUP.to_string(),
                    ingress: vec![
                        IngressRule {
                            peer: Peer::SelfGroup,
                            port: DB_PORT,
                            description: "allow db connection".to_string(),
                        },
                        IngressRule {
                            peer: Peer::Group(API_TO_DB_GROUP.to_string()),
                            port: DB_PORT,
                            description: "allow ec2 connection".to_string(),
                        },
                    ],
                },
            ],
        }
    }

    fn group(&self, name: &str) -> Option<&SecurityGroupSpec> {
        self.security_groups.iter().find(|g| g.name == name)
    }

    /// Allocate every subnet CIDR, tier by tier, AZ by AZ.
    pub fn allocate_subnets(&self) -> Result<Vec<(usize, u8, Cidr)>, String> {
        let vpc: Cidr = self.cidr.parse()?;
        let mut alloc = CidrAllocator::new(vpc);
        let mut out = Vec::new();
        for (tier_idx, tier) in self.tiers.iter().enumerate() {
            for az in 0..self.max_azs {
                out.push((tier_idx, az, alloc.allocate(tier.cidr_mask)?));
            }
        }
        Ok(out)
    }
}

/// Validate a network descriptor.
pub fn validate(desc: &NetworkDescriptor) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    match desc.cidr.parse::<Cidr>() {
        Ok(c) if c.prefix() < MIN_VPC_PREFIX => errors.push(ValidationError::new(format!(
            "network: VPC CIDR {} is larger than /{}",
            c, MIN_VPC_PREFIX
        ))),
        Ok(_) => {
            if let Err(e) = desc.allocate_subnets() {
                errors.push(ValidationError::new(format!("network: {}", e)));
            }
        }
        Err(e) => errors.push(ValidationError::new(format!("network: {}", e))),
    }

    if !(2..=6).contains(&desc.max_azs) {
        errors.push(ValidationError::new(format!(
            "network: max_azs must be between 2 and 6 (load balancer needs two zones), got {}",
            desc.max_azs
        )));
    }

    for kind in [SubnetKind::Public, SubnetKind::PrivateWithEgress, SubnetKind::Isolated] {
        let count = desc.tiers.iter().filter(|t| t.kind == kind).count();
        if count != 1 {
            errors.push(ValidationError::new(format!(
                "network: expected exactly one {:?} subnet tier, found {}",
                kind, count
            )));
        }
    }

    if desc.listener.port == 0 {
        errors.push(ValidationError::new("network: listener port must be non-zero"));
    }

    for group in &desc.security_groups {
        if desc.security_groups.iter().filter(|g| g.name == group.name).count() > 1 {
            errors.push(ValidationError::new(format!(
                "network: duplicate security group '{}'",
                group.name
            )));
        }
        for rule in &group.ingress {
            if rule.port == 0 {
                errors.push(ValidationError::new(format!(
                    "network: ingress rule on '{}' has port 0",
                    group.name
                )));
            }
            if let Peer::Group(ref peer) = rule.peer {
                if desc.group(peer).is_none() {
                    errors.push(ValidationError::new(format!(
                        "network: ingress rule on '{}' references unknown group '{}'",
                        group.name, peer
                    )));
                }
            }
        }
    }

    match desc.group(DB_GROUP) {
        Some(db) => {
            let grants_api = db.ingress.iter().any(|r| {
                r.port == DB_PORT && r.peer == Peer::Group(API_TO_DB_GROUP.to_string())
            });
            if !grants_api {
                errors.push(ValidationError::new(format!(
                    "network: group '{}' must admit '{}' on port {}",
                    DB_GROUP, API_TO_DB_GROUP, DB_PORT
                )));
            }
        }
        None => errors.push(ValidationError::new(format!(
            "network: missing security group '{}'",
            DB_GROUP
        ))),
    }
    if desc.group(API_TO_DB_GROUP).is_none() {
        errors.push(ValidationError::new(format!(
            "network: missing security group '{}'",
            API_TO_DB_GROUP
        )));
    }

    errors
}

/// Handles the network stack hands to its consumers.
#[derive(Debug, Clone)]
pub struct NetworkOutputs {
    pub vpc: ExportRef,
    pub subnets: IndexMap<SubnetKind, Vec<ExportRef>>,
    pub api_to_db_sg: ExportRef,
    pub db_sg: ExportRef,
    pub alb_sg: ExportRef,
    pub listener: ExportRef,
}

impl NetworkOutputs {
    pub fn subnets(&self, kind: SubnetKind) -> &[ExportRef] {
        self.subnets.get(&kind).map(Vec::as_slice).unwrap_or(&[])
    }
}

fn name_tag(value: &str) -> Value {
    json!([{ "Key": "Name", "Value": value }])
}

fn allow_all_egress() -> Value {
    json!([{ "CidrIp": "0.0.0.0/0", "Description": "Allow all outbound traffic by default", "IpProtocol": "-1" }])
}

/// Declare the network stack.
pub fn build(
    name: &str,
    env: &Environment,
    desc: &NetworkDescriptor,
) -> Result<(Stack, NetworkOutputs), String> {
    let mut stack = Stack::new(name)
        .with_description("VPC, public load balancer and security groups")
        .with_env(env.clone());

    let vpc = stack.add(
        VPC_PATH,
        CfnResource::new(
            "AWS::EC2::VPC",
            json!({
                "CidrBlock": desc.cidr,
                "EnableDnsHostnames": true,
                "EnableDnsSupport": true,
                "InstanceTenancy": "default",
                "Tags": name_tag(&format!("{}/{}", name, VPC_PATH)),
            }),
        ),
    )?;

    let igw = stack.add(
        &format!("{}/IGW", VPC_PATH),
        CfnResource::new(
            "AWS::EC2::InternetGateway",
            json!({ "Tags": name_tag(&format!("{}/{}", name, VPC_PATH)) }),
        ),
    )?;
    let attachment = stack.add(
        &format!("{}/VPCGW", VPC_PATH),
        CfnResource::new(
            "AWS::EC2::VPCGatewayAttachment",
            json!({ "VpcId": ref_to(&vpc), "InternetGatewayId": ref_to(&igw) }),
        ),
    )?;

    // Subnets with their route tables; NAT gateways live in the public tier.
    let mut subnet_ids: IndexMap<SubnetKind, Vec<String>> = IndexMap::new();
    let mut route_tables: IndexMap<SubnetKind, Vec<String>> = IndexMap::new();
    let mut public_routes: Vec<String> = Vec::new();
    let mut nat_gateways: Vec<String> = Vec::new();

    for (tier_idx, az, cidr) in desc.allocate_subnets()? {
        let tier = &desc.tiers[tier_idx];
        let base = format!("{}/{}Subnet{}", VPC_PATH, tier.name, az + 1);
        let subnet = stack.add(
            &base,
            CfnResource::new(
                "AWS::EC2::Subnet",
                json!({
                    "VpcId": ref_to(&vpc),
                    "AvailabilityZone": select(usize::from(az), get_azs()),
                    "CidrBlock": cidr.to_string(),
                    "MapPublicIpOnLaunch": tier.kind == SubnetKind::Public,
                    "Tags": [
                        { "Key": "Name", "Value": format!("{}/{}", name, base) },
                        { "Key": "railstack:subnet-name", "Value": tier.name },
                        { "Key": "railstack:subnet-type", "Value": tier.kind.tag() },
                    ],
                }),
            ),
        )?;
        let table = stack.add(
            &format!("{}/RouteTable", base),
            CfnResource::new(
                "AWS::EC2::RouteTable",
                json!({ "VpcId": ref_to(&vpc), "Tags": name_tag(&format!("{}/{}", name, base)) }),
            ),
        )?;
        stack.add(
            &format!("{}/RouteTableAssociation", base),
            CfnResource::new(
                "AWS::EC2::SubnetRouteTableAssociation",
                json!({ "RouteTableId": ref_to(&table), "SubnetId": ref_to(&subnet) }),
            ),
        )?;

        if tier.kind == SubnetKind::Public {
            let route = stack.add(
                &format!("{}/DefaultRoute", base),
                CfnResource::new(
                    "AWS::EC2::Route",
                    json!({
                        "RouteTableId": ref_to(&table),
                        "DestinationCidrBlock": "0.0.0.0/0",
                        "GatewayId": ref_to(&igw),
                    }),
                )
                .depends_on(&attachment),
            )?;
            let eip = stack.add(
                &format!("{}/EIP", base),
                CfnResource::new("AWS::EC2::EIP", json!({ "Domain": "vpc" })),
            )?;
            let nat = stack.add(
                &format!("{}/NATGateway", base),
                CfnResource::new(
                    "AWS::EC2::NatGateway",
                    json!({
                        "SubnetId": ref_to(&subnet),
                        "AllocationId": get_att(&eip, "AllocationId"),
                        "Tags": name_tag(&format!("{}/{}", name, base)),
                    }),
                )
                .depends_on(&route),
            )?;
            public_routes.push(route);
            nat_gateways.push(nat);
        }

        subnet_ids.entry(tier.kind).or_default().push(subnet);
        route_tables.entry(tier.kind).or_default().push(table);
    }

    // Private-with-egress tables route through the NAT gateway of the same zone.
    if let Some(tables) = route_tables.get(&SubnetKind::PrivateWithEgress) {
        for (az, table) in tables.iter().enumerate() {
            let nat = nat_gateways
                .get(az)
                .or_else(|| nat_gateways.first())
                .ok_or_else(|| "private subnets need a public tier for NAT".to_string())?;
            let path = stack.resources[table].path.replace("/RouteTable", "/DefaultRoute");
            stack.add(
                &path,
                CfnResource::new(
                    "AWS::EC2::Route",
                    json!({
                        "RouteTableId": ref_to(table),
                        "DestinationCidrBlock": "0.0.0.0/0",
                        "NatGatewayId": ref_to(nat),
                    }),
                ),
            )?;
        }
    }

    // Load balancer
    let mut alb_ingress = Vec::new();
    if desc.listener.open {
        alb_ingress.push(json!({
            "CidrIp": "0.0.0.0/0",
            "Description": format!("Allow from anyone on port {}", desc.listener.port),
            "FromPort": desc.listener.port,
            "ToPort": desc.listener.port,
            "IpProtocol": "tcp",
        }));
    }
    let alb_sg = stack.add(
        &format!("{}/SecurityGroup", ALB_PATH),
        CfnResource::new(
            "AWS::EC2::SecurityGroup",
            json!({
                "GroupDescription": format!("Automatically created Security Group for ELB {}{}", name, ALB_PATH),
                "SecurityGroupIngress": alb_ingress,
                "SecurityGroupEgress": allow_all_egress(),
                "VpcId": ref_to(&vpc),
            }),
        ),
    )?;

    let public_subnets: Vec<Value> = subnet_ids
        .get(&SubnetKind::Public)
        .map(|ids| ids.iter().map(|id| ref_to(id)).collect())
        .unwrap_or_default();
    let mut alb_resource = CfnResource::new(
        "AWS::ElasticLoadBalancingV2::LoadBalancer",
        json!({
            "Type": "application",
            "Scheme": "internet-facing",
            "Subnets": public_subnets,
            "SecurityGroups": [get_att(&alb_sg, "GroupId")],
            "LoadBalancerAttributes": [
                { "Key": "deletion_protection.enabled", "Value": desc.deletion_protection.to_string() },
            ],
        }),
    );
    for route in &public_routes {
        alb_resource = alb_resource.depends_on(route);
    }
    let alb = stack.add(ALB_PATH, alb_resource)?;

    let listener = stack.add(
        LISTENER_PATH,
        CfnResource::new(
            "AWS::ElasticLoadBalancingV2::Listener",
            json!({
                "LoadBalancerArn": ref_to(&alb),
                "Port": desc.listener.port,
                "Protocol": "HTTP",
                "DefaultActions": [{
                    "Type": "fixed-response",
                    "FixedResponseConfig": {
                        "StatusCode": "404",
                        "ContentType": "text/plain",
                        "MessageBody": "no route",
                    },
                }],
            }),
        ),
    )?;

    // Security groups, then ingress rules as standalone resources so that
    // self and cross-group references never form a cycle.
    let mut groups: IndexMap<String, String> = IndexMap::new();
    for group in &desc.security_groups {
        let id = stack.add(
            &group.name,
            CfnResource::new(
                "AWS::EC2::SecurityGroup",
                json!({
                    "GroupDescription": format!("{}/{}", name, group.name),
                    "SecurityGroupEgress": allow_all_egress(),
                    "VpcId": ref_to(&vpc),
                }),
            ),
        )?;
        groups.insert(group.name.clone(), id);
    }
    for group in &desc.security_groups {
        let group_id = &groups[&group.name];
        for rule in &group.ingress {
            let (source_key, source, label) = match rule.peer {
                Peer::SelfGroup => (
                    "SourceSecurityGroupId",
                    get_att(group_id, "GroupId"),
                    group.name.clone(),
                ),
                Peer::Group(ref peer) => {
                    let peer_id = groups
                        .get(peer)
                        .ok_or_else(|| format!("ingress on '{}' references unknown group '{}'", group.name, peer))?;
                    ("SourceSecurityGroupId", get_att(peer_id, "GroupId"), peer.clone())
                }
                Peer::AnyIpv4 => ("CidrIp", json!("0.0.0.0/0"), "any".to_string()),
            };
            let mut props = json!({
                "IpProtocol": "tcp",
                "Description": rule.description,
                "FromPort": rule.port,
                "ToPort": rule.port,
                "GroupId": get_att(group_id, "GroupId"),
            });
            props[source_key] = source;
            stack.add(
                &format!("{}/from {}:{}", group.name, label, rule.port),
                CfnResource::new("AWS::EC2::SecurityGroupIngress", props),
            )?;
        }
    }

    stack.output(
        "LoadBalancerDNS",
        get_att(&alb, "DNSName"),
        Some("Public DNS name of the load balancer"),
    );

    let vpc_ref = stack.export("VpcId", ref_to(&vpc), None);
    let mut subnets: IndexMap<SubnetKind, Vec<ExportRef>> = IndexMap::new();
    for (kind, ids) in &subnet_ids {
        for (az, id) in ids.iter().enumerate() {
            let export_id = format!("{}Subnet{}Id", kind.tag(), az + 1);
            let handle = stack.export(&export_id, ref_to(id), None);
            subnets.entry(*kind).or_default().push(handle);
        }
    }
    let group_export = |stack: &mut Stack, group: &str, export_id: &str| -> Result<ExportRef, String> {
        let id = groups
            .get(group)
            .ok_or_else(|| format!("missing security group '{}'", group))?;
        Ok(stack.export(export_id, get_att(id, "GroupId"), None))
    };
    let api_to_db_sg = group_export(&mut stack, API_TO_DB_GROUP, "ApiToDbSecurityGroupId")?;
    let db_sg = group_export(&mut stack, DB_GROUP, "DbSecurityGroupId")?;
    let alb_sg_ref = stack.export("AlbSecurityGroupId", get_att(&alb_sg, "GroupId"), None);
    let listener_ref = stack.export("ListenerArn", ref_to(&listener), None);

    tracing::debug!(stack = %name, resources = stack.resources.len(), "network stack declared");

    Ok((
        stack,
        NetworkOutputs {
            vpc: vpc_ref,
            subnets,
            api_to_db_sg,
            db_sg,
            alb_sg: alb_sg_ref,
            listener: listener_ref,
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_default() -> (Stack, NetworkOutputs) {
        build("Net", &Environment::default(), &NetworkDescriptor::default()).unwrap()
    }

    #[test]
    fn test_rs010_default_descriptor_valid() {
        let errors = validate(&NetworkDescriptor::default());
        assert!(errors.is_empty(), "{:?}", errors);
    }

    #[test]
    fn test_rs010_subnet_counts() {
        let (stack, outputs) = build_default();
        assert_eq!(stack.resources_of_type("AWS::EC2::Subnet").count(), 6);
        assert_eq!(stack.resources_of_type("AWS::EC2::NatGateway").count(), 2);
        assert_eq!(outputs.subnets(SubnetKind::Isolated).len(), 2);
        assert_eq!(outputs.subnets(SubnetKind::PrivateWithEgress).len(), 2);
    }

    #[test]
    fn test_rs010_isolated_subnets_have_no_default_route() {
        let (stack, _) = build_default();
        let routes: Vec<_> = stack
            .resources_of_type("AWS::EC2::Route")
            .map(|(_, r)| r.path.clone())
            .collect();
        assert_eq!(routes.len(), 4);
        assert!(routes.iter().all(|p| !p.contains("rdsSubnet")));
    }

    #[test]
    fn test_rs010_subnet_cidrs() {
        let (stack, _) = build_default();
        let rds = stack.resource("EcsRailsSampleVPC/rdsSubnet2").unwrap();
        assert_eq!(rds.prop("CidrBlock").and_then(Value::as_str), Some("10.0.4.16/28"));
        let public = stack.resource("EcsRailsSampleVPC/publicSubnet1").unwrap();
        assert_eq!(public.prop("MapPublicIpOnLaunch").unwrap(), true);
    }

    #[test]
    fn test_rs010_db_group_has_exactly_two_rules() {
        let (stack, _) = build_default();
        let db = stack.logical_id(DB_GROUP).unwrap();
        let api = stack.logical_id(API_TO_DB_GROUP).unwrap();
        let rules: Vec<&CfnResource> = stack
            .resources_of_type("AWS::EC2::SecurityGroupIngress")
            .map(|(_, r)| r)
            .filter(|r| r.prop("GroupId") == Some(&get_att(&db, "GroupId")))
            .collect();
        assert_eq!(rules.len(), 2);
        assert!(rules.iter().all(|r| r.prop("FromPort").unwrap() == 3306));
        let sources: Vec<&Value> = rules
            .iter()
            .map(|r| r.prop("SourceSecurityGroupId").unwrap())
            .collect();
        assert!(sources.contains(&&get_att(&db, "GroupId")));
        assert!(sources.contains(&&get_att(&api, "GroupId")));
    }

    #[test]
    fn test_rs010_listener_and_dns_output() {
        let (stack, outputs) = build_default();
        let listener = stack
            .resources_of_type("AWS::ElasticLoadBalancingV2::Listener")
            .next()
            .unwrap()
            .1;
        assert_eq!(listener.prop("Port").unwrap(), 80);
        assert!(stack.outputs.contains_key("LoadBalancerDNS"));
        assert!(stack.outputs["LoadBalancerDNS"].export_name.is_none());
        assert_eq!(outputs.listener.name, "Net:ListenerArn");
    }

    #[test]
    fn test_rs010_deletion_protection_attribute() {
        let (stack, _) = build_default();
        let alb = stack.resource(ALB_PATH).unwrap();
        assert_eq!(
            alb.prop("LoadBalancerAttributes").unwrap()[0]["Value"],
            "true"
        );
        assert!(!alb.depends_on.is_empty());
    }

    #[test]
    fn test_rs010_unknown_peer_rejected() {
        let mut desc = NetworkDescriptor::default();
        desc.security_groups[1].ingress.push(IngressRule {
            peer: Peer::Group("ghost".to_string()),
            port: 3306,
            description: "x".to_string(),
        });
        let errors = validate(&desc);
        assert!(errors.iter().any(|e| e.message.contains("unknown group 'ghost'")));
        assert!(build("Net", &Environment::default(), &desc).is_err());
    }

    #[test]
    fn test_rs010_db_group_must_admit_api_group() {
        let mut desc = NetworkDescriptor::default();
        desc.security_groups[1].ingress.retain(|r| r.peer == Peer::SelfGroup);
        let errors = validate(&desc);
        assert!(errors.iter().any(|e| e.message.contains("must admit")));
    }

    #[test]
    fn test_rs010_bad_cidr_and_azs() {
        let desc = NetworkDescriptor {
            cidr: "10.0.0.0/8".to_string(),
            max_azs: 1,
            ..NetworkDescriptor::default()
        };
        let errors = validate(&desc);
        assert!(errors.iter().any(|e| e.message.contains("larger than")));
        assert!(errors.iter().any(|e| e.message.contains("max_azs")));
    }

    #[test]
    fn test_rs010_exhausted_vpc() {
        let desc = NetworkDescriptor {
            cidr: "10.0.0.0/23".to_string(),
            ..NetworkDescriptor::default()
        };
        let errors = validate(&desc);
        assert!(errors.iter().any(|e| e.message.contains("no room")));
    }
}
