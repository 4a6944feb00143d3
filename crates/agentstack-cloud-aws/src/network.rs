//! EC2 networking: VPCs, subnets, gateways, route tables, security groups
//! and interface endpoints
//!
//! Unnamed EC2 objects are found by their `Name` tag.

use crate::cli::{AwsCli, items, name_tag_spec, tag_map, text};
use crate::error::{AwsError, Result};
use agentstack_cloud::{
    IngressRule, NetworkSnapshot, ResourceDescriptor, ResourceKind, ResourceStatus, RouteInfo,
    RouteTableInfo, RouteTarget, SubnetInfo, attr,
};
use serde_json::{Value, json};
use std::collections::BTreeSet;

/// `--filters` value
pub fn filters(pairs: &[(&str, &[&str])]) -> String {
    Value::Array(
        pairs
            .iter()
            .map(|(name, values)| json!({ "Name": name, "Values": values }))
            .collect(),
    )
    .to_string()
}

fn wildcard(pattern: &str) -> String {
    format!("*{}*", pattern)
}

async fn describe(
    cli: &AwsCli,
    command: &str,
    list: &str,
    filter_flag: &str,
    pairs: &[(&str, &[&str])],
) -> Result<Vec<Value>> {
    let filter = filters(pairs);
    let output = cli.run("ec2", &[command, filter_flag, &filter]).await?;
    Ok(items(&output, list).to_vec())
}

fn named(kind: ResourceKind, value: &Value, id: &str) -> ResourceDescriptor {
    let tags = tag_map(items(value, "/Tags"));
    let name = tags.get("Name").cloned().unwrap_or_else(|| id.to_string());
    let mut desc = ResourceDescriptor::new(kind, name).with_id(id);
    desc.tags = tags;
    desc
}

fn with_state(mut desc: ResourceDescriptor, state: Option<String>) -> ResourceDescriptor {
    if let Some(state) = state {
        desc.status = ResourceStatus::parse(&state);
        desc.set_attribute(attr::STATE, json!(state));
    }
    desc
}

// Descriptors

fn vpc_descriptor(vpc: &Value) -> Option<ResourceDescriptor> {
    let id = text(vpc, "/VpcId")?;
    let mut desc = with_state(named(ResourceKind::Vpc, vpc, &id), text(vpc, "/State"));
    if let Some(cidr) = text(vpc, "/CidrBlock") {
        desc.set_attribute(attr::CIDR, json!(cidr));
    }
    let is_default = vpc.get("IsDefault").and_then(Value::as_bool).unwrap_or(false);
    desc.set_attribute(attr::IS_DEFAULT, json!(is_default));
    Some(desc)
}

fn subnet_descriptor(subnet: &Value) -> Option<ResourceDescriptor> {
    let id = text(subnet, "/SubnetId")?;
    let mut desc = with_state(named(ResourceKind::Subnet, subnet, &id), text(subnet, "/State"));
    for (key, pointer) in [
        (attr::CIDR, "/CidrBlock"),
        (attr::VPC_ID, "/VpcId"),
        (attr::AVAILABILITY_ZONE, "/AvailabilityZone"),
    ] {
        if let Some(value) = text(subnet, pointer) {
            desc.set_attribute(key, json!(value));
        }
    }
    Some(desc)
}

fn igw_descriptor(igw: &Value) -> Option<ResourceDescriptor> {
    let id = text(igw, "/InternetGatewayId")?;
    let mut desc = named(ResourceKind::InternetGateway, igw, &id);
    let attachment = items(igw, "/Attachments").first();
    match attachment.and_then(|a| text(a, "/VpcId")) {
        Some(vpc_id) => {
            desc.set_attribute(attr::VPC_ID, json!(vpc_id));
            desc = with_state(desc, attachment.and_then(|a| text(a, "/State")));
        }
        None => desc.status = ResourceStatus::Available,
    }
    Some(desc)
}

fn nat_descriptor(nat: &Value) -> Option<ResourceDescriptor> {
    let id = text(nat, "/NatGatewayId")?;
    let mut desc = with_state(named(ResourceKind::NatGateway, nat, &id), text(nat, "/State"));
    if let Some(subnet) = text(nat, "/SubnetId") {
        desc.set_attribute(attr::SUBNET_ID, json!(subnet));
    }
    if let Some(vpc) = text(nat, "/VpcId") {
        desc.set_attribute(attr::VPC_ID, json!(vpc));
    }
    Some(desc)
}

fn is_main(route_table: &Value) -> bool {
    items(route_table, "/Associations")
        .iter()
        .any(|a| a.get("Main").and_then(Value::as_bool).unwrap_or(false))
}

fn route_table_descriptor(rt: &Value) -> Option<ResourceDescriptor> {
    let id = text(rt, "/RouteTableId")?;
    let mut desc = named(ResourceKind::RouteTable, rt, &id).with_status(ResourceStatus::Available);
    if let Some(vpc) = text(rt, "/VpcId") {
        desc.set_attribute(attr::VPC_ID, json!(vpc));
    }
    desc.set_attribute(attr::IS_DEFAULT, json!(is_main(rt)));
    Some(desc)
}

fn security_group_descriptor(sg: &Value) -> Option<ResourceDescriptor> {
    let id = text(sg, "/GroupId")?;
    let name = text(sg, "/GroupName").unwrap_or_else(|| id.clone());
    let mut desc = ResourceDescriptor::new(ResourceKind::SecurityGroup, name)
        .with_id(id)
        .with_status(ResourceStatus::Available);
    desc.tags = tag_map(items(sg, "/Tags"));
    if let Some(vpc) = text(sg, "/VpcId") {
        desc.set_attribute(attr::VPC_ID, json!(vpc));
    }
    desc.set_attribute(
        attr::INGRESS,
        Value::Array(items(sg, "/IpPermissions").to_vec()),
    );
    Some(desc)
}

fn endpoint_descriptor(endpoint: &Value) -> Option<ResourceDescriptor> {
    let id = text(endpoint, "/VpcEndpointId")?;
    let mut desc = with_state(
        named(ResourceKind::VpcEndpoint, endpoint, &id),
        text(endpoint, "/State"),
    );
    if let Some(vpc) = text(endpoint, "/VpcId") {
        desc.set_attribute(attr::VPC_ID, json!(vpc));
    }
    Some(desc)
}

fn first_or_unexpected(
    output: &Value,
    pointer: &str,
    build: fn(&Value) -> Option<ResourceDescriptor>,
) -> Result<ResourceDescriptor> {
    output
        .pointer(pointer)
        .and_then(build)
        .ok_or_else(|| AwsError::UnexpectedResponse(format!("{}: {}", pointer, output)))
}

// Lookups

pub async fn find(
    cli: &AwsCli,
    kind: ResourceKind,
    name: &str,
) -> Result<Option<ResourceDescriptor>> {
    let by_name: &[(&str, &[&str])] = &[("tag:Name", &[name])];
    let found = match kind {
        ResourceKind::Vpc => describe(cli, "describe-vpcs", "/Vpcs", "--filters", by_name)
            .await?
            .iter()
            .find_map(vpc_descriptor),
        ResourceKind::Subnet => describe(cli, "describe-subnets", "/Subnets", "--filters", by_name)
            .await?
            .iter()
            .find_map(subnet_descriptor),
        ResourceKind::InternetGateway => describe(
            cli,
            "describe-internet-gateways",
            "/InternetGateways",
            "--filters",
            by_name,
        )
        .await?
        .iter()
        .find_map(igw_descriptor),
        ResourceKind::NatGateway => describe(
            cli,
            "describe-nat-gateways",
            "/NatGateways",
            "--filter",
            &[("tag:Name", &[name]), ("state", &["pending", "available"])],
        )
        .await?
        .iter()
        .find_map(nat_descriptor),
        ResourceKind::RouteTable => describe(
            cli,
            "describe-route-tables",
            "/RouteTables",
            "--filters",
            by_name,
        )
        .await?
        .iter()
        .find_map(route_table_descriptor),
        ResourceKind::SecurityGroup => describe(
            cli,
            "describe-security-groups",
            "/SecurityGroups",
            "--filters",
            &[("group-name", &[name])],
        )
        .await?
        .iter()
        .find_map(security_group_descriptor),
        ResourceKind::VpcEndpoint => describe(
            cli,
            "describe-vpc-endpoints",
            "/VpcEndpoints",
            "--filters",
            &[
                ("tag:Name", &[name]),
                ("vpc-endpoint-state", &["pendingAcceptance", "pending", "available"]),
            ],
        )
        .await?
        .iter()
        .find_map(endpoint_descriptor),
        other => return Err(AwsError::Unsupported(format!("network find for {}", other))),
    };
    Ok(found)
}

pub async fn existing_cidrs(cli: &AwsCli) -> Result<Vec<String>> {
    let output = cli.run("ec2", &["describe-vpcs"]).await?;
    let mut cidrs = BTreeSet::new();
    for vpc in items(&output, "/Vpcs") {
        if let Some(cidr) = text(vpc, "/CidrBlock") {
            cidrs.insert(cidr);
        }
        for assoc in items(vpc, "/CidrBlockAssociationSet") {
            if let Some(cidr) = text(assoc, "/CidrBlock") {
                cidrs.insert(cidr);
            }
        }
    }
    Ok(cidrs.into_iter().collect())
}

pub async fn availability_zones(cli: &AwsCli) -> Result<Vec<String>> {
    let zones = describe(
        cli,
        "describe-availability-zones",
        "/AvailabilityZones",
        "--filters",
        &[("state", &["available"])],
    )
    .await?;
    Ok(zones.iter().filter_map(|z| text(z, "/ZoneName")).collect())
}

fn route_table_info(rt: &Value) -> Option<RouteTableInfo> {
    Some(RouteTableInfo {
        id: text(rt, "/RouteTableId")?,
        main: is_main(rt),
        subnet_ids: items(rt, "/Associations")
            .iter()
            .filter_map(|a| text(a, "/SubnetId"))
            .collect(),
        routes: items(rt, "/Routes")
            .iter()
            .map(|r| RouteInfo {
                destination: text(r, "/DestinationCidrBlock").unwrap_or_default(),
                gateway_id: text(r, "/GatewayId"),
                nat_gateway_id: text(r, "/NatGatewayId"),
            })
            .collect(),
    })
}

fn subnet_info(subnet: &Value) -> Option<SubnetInfo> {
    let tags = tag_map(items(subnet, "/Tags"));
    Some(SubnetInfo {
        id: text(subnet, "/SubnetId")?,
        name: tags.get("Name").cloned().unwrap_or_default(),
        cidr: text(subnet, "/CidrBlock").unwrap_or_default(),
        availability_zone: text(subnet, "/AvailabilityZone").unwrap_or_default(),
        state: text(subnet, "/State").unwrap_or_default(),
        map_public_ip: subnet
            .get("MapPublicIpOnLaunch")
            .and_then(Value::as_bool)
            .unwrap_or(false),
        tags,
    })
}

pub async fn snapshot(cli: &AwsCli, vpc_id: &str) -> Result<NetworkSnapshot> {
    let in_vpc: &[(&str, &[&str])] = &[("vpc-id", &[vpc_id])];
    let subnets = describe(cli, "describe-subnets", "/Subnets", "--filters", in_vpc).await?;
    let tables = describe(cli, "describe-route-tables", "/RouteTables", "--filters", in_vpc).await?;
    Ok(NetworkSnapshot {
        subnets: subnets.iter().filter_map(subnet_info).collect(),
        route_tables: tables.iter().filter_map(route_table_info).collect(),
    })
}

pub async fn status(cli: &AwsCli, kind: ResourceKind, id: &str) -> Result<String> {
    let (command, id_flag, list) = match kind {
        ResourceKind::Vpc => ("describe-vpcs", "--vpc-ids", "/Vpcs"),
        ResourceKind::Subnet => ("describe-subnets", "--subnet-ids", "/Subnets"),
        ResourceKind::NatGateway => ("describe-nat-gateways", "--nat-gateway-ids", "/NatGateways"),
        ResourceKind::VpcEndpoint => (
            "describe-vpc-endpoints",
            "--vpc-endpoint-ids",
            "/VpcEndpoints",
        ),
        other => return Err(AwsError::Unsupported(format!("status of {}", other))),
    };
    let output = cli.run("ec2", &[command, id_flag, id]).await?;
    items(&output, list)
        .first()
        .and_then(|v| text(v, "/State"))
        .ok_or_else(|| AwsError::Api {
            code: "InvalidResource.NotFound".to_string(),
            message: format!("{} {} not found", kind, id),
        })
}

// Creation

pub async fn create_vpc(cli: &AwsCli, name: &str, cidr: &str) -> Result<ResourceDescriptor> {
    let tags = name_tag_spec("vpc", name);
    let output = cli
        .run(
            "ec2",
            &["create-vpc", "--cidr-block", cidr, "--tag-specifications", &tags],
        )
        .await?;
    first_or_unexpected(&output, "/Vpc", vpc_descriptor)
}

pub async fn create_subnet(
    cli: &AwsCli,
    name: &str,
    vpc_id: &str,
    cidr: &str,
    availability_zone: &str,
) -> Result<ResourceDescriptor> {
    let tags = name_tag_spec("subnet", name);
    let output = cli
        .run(
            "ec2",
            &[
                "create-subnet",
                "--vpc-id",
                vpc_id,
                "--cidr-block",
                cidr,
                "--availability-zone",
                availability_zone,
                "--tag-specifications",
                &tags,
            ],
        )
        .await?;
    first_or_unexpected(&output, "/Subnet", subnet_descriptor)
}

pub async fn create_internet_gateway(
    cli: &AwsCli,
    name: &str,
    vpc_id: &str,
) -> Result<ResourceDescriptor> {
    let tags = name_tag_spec("internet-gateway", name);
    let output = cli
        .run(
            "ec2",
            &["create-internet-gateway", "--tag-specifications", &tags],
        )
        .await?;
    let mut desc = first_or_unexpected(&output, "/InternetGateway", igw_descriptor)?;
    cli.run(
        "ec2",
        &[
            "attach-internet-gateway",
            "--internet-gateway-id",
            desc.id_or_name(),
            "--vpc-id",
            vpc_id,
        ],
    )
    .await?;
    desc.set_attribute(attr::VPC_ID, json!(vpc_id));
    desc.status = ResourceStatus::Available;
    Ok(desc)
}

/// Allocates an Elastic IP tagged with the gateway name, then the gateway
pub async fn create_nat_gateway(
    cli: &AwsCli,
    name: &str,
    subnet_id: &str,
) -> Result<ResourceDescriptor> {
    let eip_tags = name_tag_spec("elastic-ip", name);
    let eip = cli
        .run(
            "ec2",
            &[
                "allocate-address",
                "--domain",
                "vpc",
                "--tag-specifications",
                &eip_tags,
            ],
        )
        .await?;
    let allocation_id = text(&eip, "/AllocationId")
        .ok_or_else(|| AwsError::UnexpectedResponse(format!("allocate-address: {}", eip)))?;

    let tags = name_tag_spec("natgateway", name);
    let output = cli
        .run(
            "ec2",
            &[
                "create-nat-gateway",
                "--subnet-id",
                subnet_id,
                "--allocation-id",
                &allocation_id,
                "--tag-specifications",
                &tags,
            ],
        )
        .await?;
    first_or_unexpected(&output, "/NatGateway", nat_descriptor)
}

pub async fn create_route_table(
    cli: &AwsCli,
    name: &str,
    vpc_id: &str,
) -> Result<ResourceDescriptor> {
    let tags = name_tag_spec("route-table", name);
    let output = cli
        .run(
            "ec2",
            &[
                "create-route-table",
                "--vpc-id",
                vpc_id,
                "--tag-specifications",
                &tags,
            ],
        )
        .await?;
    first_or_unexpected(&output, "/RouteTable", route_table_descriptor)
}

/// EC2 `IpPermissions` entry for an ingress rule
pub fn ip_permission(rule: &IngressRule) -> Value {
    let mut permission = json!({
        "IpProtocol": rule.protocol,
        "FromPort": rule.port,
        "ToPort": rule.port,
    });
    if let Some(cidr) = &rule.cidr {
        permission["IpRanges"] = json!([{ "CidrIp": cidr, "Description": rule.description }]);
    }
    if let Some(group) = &rule.source_group {
        permission["UserIdGroupPairs"] =
            json!([{ "GroupId": group, "Description": rule.description }]);
    }
    permission
}

pub async fn create_security_group(
    cli: &AwsCli,
    name: &str,
    vpc_id: &str,
    description: &str,
    ingress: &[IngressRule],
) -> Result<ResourceDescriptor> {
    let tags = name_tag_spec("security-group", name);
    let output = cli
        .run(
            "ec2",
            &[
                "create-security-group",
                "--group-name",
                name,
                "--description",
                description,
                "--vpc-id",
                vpc_id,
                "--tag-specifications",
                &tags,
            ],
        )
        .await?;
    let group_id = text(&output, "/GroupId")
        .ok_or_else(|| AwsError::UnexpectedResponse(format!("create-security-group: {}", output)))?;

    if !ingress.is_empty() {
        let permissions =
            Value::Array(ingress.iter().map(ip_permission).collect()).to_string();
        match cli
            .run(
                "ec2",
                &[
                    "authorize-security-group-ingress",
                    "--group-id",
                    &group_id,
                    "--ip-permissions",
                    &permissions,
                ],
            )
            .await
        {
            Ok(_) => {}
            Err(e) if e.code() == Some("InvalidPermission.Duplicate") => {}
            Err(e) => tracing::warn!("Could not add ingress rules to {}: {}", group_id, e),
        }
    }

    Ok(ResourceDescriptor::new(ResourceKind::SecurityGroup, name)
        .with_id(group_id)
        .with_status(ResourceStatus::Available)
        .with_tag("Name", name)
        .with_attribute(attr::VPC_ID, json!(vpc_id))
        .with_attribute(
            attr::INGRESS,
            Value::Array(ingress.iter().map(ip_permission).collect()),
        ))
}

pub async fn create_vpc_endpoint(
    cli: &AwsCli,
    name: &str,
    vpc_id: &str,
    service_name: &str,
    subnet_ids: &[String],
    security_group_ids: &[String],
) -> Result<ResourceDescriptor> {
    let tags = name_tag_spec("vpc-endpoint", name);
    let mut args: Vec<&str> = vec![
        "create-vpc-endpoint",
        "--vpc-id",
        vpc_id,
        "--service-name",
        service_name,
        "--vpc-endpoint-type",
        "Interface",
        "--private-dns-enabled",
        "--tag-specifications",
        tags.as_str(),
        "--subnet-ids",
    ];
    args.extend(subnet_ids.iter().map(String::as_str));
    args.push("--security-group-ids");
    args.extend(security_group_ids.iter().map(String::as_str));

    let output = cli.run("ec2", &args).await?;
    first_or_unexpected(&output, "/VpcEndpoint", endpoint_descriptor)
}

// Settings

pub async fn enable_dns(cli: &AwsCli, vpc_id: &str) -> Result<()> {
    for flag in ["--enable-dns-support", "--enable-dns-hostnames"] {
        cli.run(
            "ec2",
            &["modify-vpc-attribute", "--vpc-id", vpc_id, flag, "{\"Value\":true}"],
        )
        .await?;
    }
    Ok(())
}

pub async fn map_public_ip(cli: &AwsCli, subnet_id: &str) -> Result<()> {
    cli.run(
        "ec2",
        &[
            "modify-subnet-attribute",
            "--subnet-id",
            subnet_id,
            "--map-public-ip-on-launch",
        ],
    )
    .await?;
    Ok(())
}

pub async fn create_route(
    cli: &AwsCli,
    route_table_id: &str,
    destination: &str,
    target: &RouteTarget,
) -> Result<()> {
    let target_flag = match target {
        RouteTarget::InternetGateway(_) => "--gateway-id",
        RouteTarget::NatGateway(_) => "--nat-gateway-id",
    };
    match cli
        .run(
            "ec2",
            &[
                "create-route",
                "--route-table-id",
                route_table_id,
                "--destination-cidr-block",
                destination,
                target_flag,
                target.id(),
            ],
        )
        .await
    {
        Ok(_) => Ok(()),
        Err(e) if e.code() == Some("RouteAlreadyExists") => {
            tracing::debug!("Route {} already exists in {}", destination, route_table_id);
            Ok(())
        }
        Err(e) => Err(e),
    }
}

pub async fn associate_route_table(
    cli: &AwsCli,
    route_table_id: &str,
    subnet_id: &str,
) -> Result<()> {
    let current = describe(
        cli,
        "describe-route-tables",
        "/RouteTables",
        "--filters",
        &[("association.subnet-id", &[subnet_id])],
    )
    .await?;

    for rt in &current {
        for assoc in items(rt, "/Associations") {
            if text(assoc, "/SubnetId").as_deref() != Some(subnet_id) {
                continue;
            }
            if text(rt, "/RouteTableId").as_deref() == Some(route_table_id) {
                return Ok(());
            }
            // Associated elsewhere: move it
            if let Some(association_id) = text(assoc, "/RouteTableAssociationId") {
                cli.run(
                    "ec2",
                    &[
                        "replace-route-table-association",
                        "--association-id",
                        &association_id,
                        "--route-table-id",
                        route_table_id,
                    ],
                )
                .await?;
                return Ok(());
            }
        }
    }

    cli.run(
        "ec2",
        &[
            "associate-route-table",
            "--route-table-id",
            route_table_id,
            "--subnet-id",
            subnet_id,
        ],
    )
    .await?;
    Ok(())
}

// Discovery

async fn vpcs_by_id(cli: &AwsCli, ids: &[String]) -> Result<Vec<ResourceDescriptor>> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let mut args = vec!["describe-vpcs", "--vpc-ids"];
    args.extend(ids.iter().map(String::as_str));
    let output = cli.run("ec2", &args).await?;
    Ok(items(&output, "/Vpcs").iter().filter_map(vpc_descriptor).collect())
}

/// Project VPCs: tagged by name, or holding subnets, groups or NAT gateways
/// whose names contain the pattern
async fn discover_vpcs(cli: &AwsCli, pattern: &str) -> Result<Vec<ResourceDescriptor>> {
    let like = wildcard(pattern);
    let mut found: Vec<ResourceDescriptor> = describe(
        cli,
        "describe-vpcs",
        "/Vpcs",
        "--filters",
        &[("tag:Name", &[like.as_str()])],
    )
    .await?
    .iter()
    .filter_map(vpc_descriptor)
    .collect();

    let mut extra = BTreeSet::new();
    for desc in discover_subnets(cli, pattern).await? {
        extra.extend(desc.attr_str(attr::VPC_ID).map(str::to_string));
    }
    for desc in discover_security_groups(cli, pattern).await? {
        extra.extend(desc.attr_str(attr::VPC_ID).map(str::to_string));
    }
    for desc in discover_nat_gateways(cli, pattern).await? {
        extra.extend(desc.attr_str(attr::VPC_ID).map(str::to_string));
    }
    let missing: Vec<String> = extra
        .into_iter()
        .filter(|id| !found.iter().any(|d| d.id.as_deref() == Some(id)))
        .collect();
    found.extend(vpcs_by_id(cli, &missing).await?);

    Ok(found
        .into_iter()
        .filter(|d| d.attribute::<bool>(attr::IS_DEFAULT) != Some(true))
        .collect())
}

async fn discover_subnets(cli: &AwsCli, pattern: &str) -> Result<Vec<ResourceDescriptor>> {
    let like = wildcard(pattern);
    Ok(describe(
        cli,
        "describe-subnets",
        "/Subnets",
        "--filters",
        &[("tag:Name", &[like.as_str()])],
    )
    .await?
    .iter()
    .filter_map(subnet_descriptor)
    .collect())
}

async fn discover_security_groups(cli: &AwsCli, pattern: &str) -> Result<Vec<ResourceDescriptor>> {
    let output = cli.run("ec2", &["describe-security-groups"]).await?;
    Ok(items(&output, "/SecurityGroups")
        .iter()
        .filter_map(security_group_descriptor)
        .filter(|d| d.name != "default" && d.name.contains(pattern))
        .collect())
}

async fn discover_nat_gateways(cli: &AwsCli, pattern: &str) -> Result<Vec<ResourceDescriptor>> {
    let like = wildcard(pattern);
    Ok(describe(
        cli,
        "describe-nat-gateways",
        "/NatGateways",
        "--filter",
        &[
            ("tag:Name", &[like.as_str()]),
            ("state", &["pending", "available", "failed"]),
        ],
    )
    .await?
    .iter()
    .filter_map(nat_descriptor)
    .collect())
}

pub async fn discover(
    cli: &AwsCli,
    kind: ResourceKind,
    pattern: &str,
) -> Result<Vec<ResourceDescriptor>> {
    let like = wildcard(pattern);
    let tagged: &[(&str, &[&str])] = &[("tag:Name", &[like.as_str()])];
    match kind {
        ResourceKind::Vpc => discover_vpcs(cli, pattern).await,
        ResourceKind::Subnet => discover_subnets(cli, pattern).await,
        ResourceKind::SecurityGroup => discover_security_groups(cli, pattern).await,
        ResourceKind::NatGateway => discover_nat_gateways(cli, pattern).await,
        ResourceKind::InternetGateway => Ok(describe(
            cli,
            "describe-internet-gateways",
            "/InternetGateways",
            "--filters",
            tagged,
        )
        .await?
        .iter()
        .filter_map(igw_descriptor)
        .collect()),
        ResourceKind::RouteTable => Ok(describe(
            cli,
            "describe-route-tables",
            "/RouteTables",
            "--filters",
            tagged,
        )
        .await?
        .iter()
        .filter(|rt| !is_main(rt))
        .filter_map(route_table_descriptor)
        .collect()),
        ResourceKind::VpcEndpoint => {
            let mut found: Vec<ResourceDescriptor> = describe(
                cli,
                "describe-vpc-endpoints",
                "/VpcEndpoints",
                "--filters",
                tagged,
            )
            .await?
            .iter()
            .filter_map(endpoint_descriptor)
            .collect();

            let vpc_ids: Vec<String> = discover_vpcs(cli, pattern)
                .await?
                .iter()
                .filter_map(|v| v.id.clone())
                .collect();
            if !vpc_ids.is_empty() {
                let ids: Vec<&str> = vpc_ids.iter().map(String::as_str).collect();
                for endpoint in describe(
                    cli,
                    "describe-vpc-endpoints",
                    "/VpcEndpoints",
                    "--filters",
                    &[("vpc-id", ids.as_slice())],
                )
                .await?
                .iter()
                .filter_map(endpoint_descriptor)
                {
                    if !found.iter().any(|d| d.id == endpoint.id) {
                        found.push(endpoint);
                    }
                }
            }
            Ok(found
                .into_iter()
                .filter(|d| d.status != ResourceStatus::Deleted)
                .collect())
        }
        other => Err(AwsError::Unsupported(format!("network discover for {}", other))),
    }
}

// Release

/// Delete every route that sends traffic through the NAT gateway
pub async fn release_nat_routes(cli: &AwsCli, nat_id: &str) -> Result<()> {
    let tables = describe(
        cli,
        "describe-route-tables",
        "/RouteTables",
        "--filters",
        &[("route.nat-gateway-id", &[nat_id])],
    )
    .await?;
    for rt in &tables {
        let Some(rt_id) = text(rt, "/RouteTableId") else {
            continue;
        };
        for route in items(rt, "/Routes") {
            if text(route, "/NatGatewayId").as_deref() != Some(nat_id) {
                continue;
            }
            let Some(destination) = text(route, "/DestinationCidrBlock") else {
                continue;
            };
            match cli
                .run(
                    "ec2",
                    &[
                        "delete-route",
                        "--route-table-id",
                        &rt_id,
                        "--destination-cidr-block",
                        &destination,
                    ],
                )
                .await
            {
                Ok(_) => {
                    tracing::info!("Removed route {} -> {} from {}", destination, nat_id, rt_id)
                }
                Err(e) if e.is_not_found() => {}
                Err(e) => tracing::warn!("Could not remove route from {}: {}", rt_id, e),
            }
        }
    }
    Ok(())
}

pub async fn disassociate_route_table(cli: &AwsCli, route_table_id: &str) -> Result<()> {
    let output = cli
        .run(
            "ec2",
            &["describe-route-tables", "--route-table-ids", route_table_id],
        )
        .await?;
    for rt in items(&output, "/RouteTables") {
        for assoc in items(rt, "/Associations") {
            if assoc.get("Main").and_then(Value::as_bool).unwrap_or(false) {
                continue;
            }
            if let Some(association_id) = text(assoc, "/RouteTableAssociationId") {
                cli.run(
                    "ec2",
                    &["disassociate-route-table", "--association-id", &association_id],
                )
                .await?;
            }
        }
    }
    Ok(())
}

fn is_default_egress(permission: &Value) -> bool {
    text(permission, "/IpProtocol").as_deref() == Some("-1")
        && items(permission, "/IpRanges")
            .iter()
            .any(|r| text(r, "/CidrIp").as_deref() == Some("0.0.0.0/0"))
}

/// Revoke a group's own ingress rules and its non-default egress rules
pub async fn release_security_group(cli: &AwsCli, group_id: &str) -> Result<()> {
    let output = cli
        .run("ec2", &["describe-security-groups", "--group-ids", group_id])
        .await?;
    let Some(group) = items(&output, "/SecurityGroups").first() else {
        return Ok(());
    };

    let ingress = items(group, "/IpPermissions");
    if !ingress.is_empty() {
        let permissions = Value::Array(ingress.to_vec()).to_string();
        cli.run(
            "ec2",
            &[
                "revoke-security-group-ingress",
                "--group-id",
                group_id,
                "--ip-permissions",
                &permissions,
            ],
        )
        .await?;
    }

    let egress: Vec<Value> = items(group, "/IpPermissionsEgress")
        .iter()
        .filter(|p| !is_default_egress(p))
        .cloned()
        .collect();
    if !egress.is_empty() {
        let permissions = Value::Array(egress).to_string();
        cli.run(
            "ec2",
            &[
                "revoke-security-group-egress",
                "--group-id",
                group_id,
                "--ip-permissions",
                &permissions,
            ],
        )
        .await?;
    }
    Ok(())
}

/// Keep only the group pairs of a permission that reference `targets`
fn referencing(permission: &Value, targets: &BTreeSet<String>) -> Option<Value> {
    let pairs: Vec<Value> = items(permission, "/UserIdGroupPairs")
        .iter()
        .filter(|pair| {
            text(pair, "/GroupId").is_some_and(|g| targets.contains(&g))
        })
        .map(|pair| json!({ "GroupId": pair["GroupId"] }))
        .collect();
    if pairs.is_empty() {
        return None;
    }
    let mut stripped = json!({ "IpProtocol": permission["IpProtocol"], "UserIdGroupPairs": pairs });
    for key in ["FromPort", "ToPort"] {
        if let Some(port) = permission.get(key) {
            stripped[key] = port.clone();
        }
    }
    Some(stripped)
}

/// Remove rules in other groups that reference any of `groups`
pub async fn detach_references(cli: &AwsCli, groups: &[ResourceDescriptor]) -> Result<usize> {
    let targets: BTreeSet<String> = groups.iter().filter_map(|g| g.id.clone()).collect();
    if targets.is_empty() {
        return Ok(0);
    }

    let output = cli.run("ec2", &["describe-security-groups"]).await?;
    let mut removed = 0;
    for group in items(&output, "/SecurityGroups") {
        let Some(group_id) = text(group, "/GroupId") else {
            continue;
        };
        for (list, command) in [
            ("/IpPermissions", "revoke-security-group-ingress"),
            ("/IpPermissionsEgress", "revoke-security-group-egress"),
        ] {
            let rules: Vec<Value> = items(group, list)
                .iter()
                .filter_map(|p| referencing(p, &targets))
                .collect();
            if rules.is_empty() {
                continue;
            }
            let permissions = Value::Array(rules.clone()).to_string();
            match cli
                .run(
                    "ec2",
                    &[command, "--group-id", &group_id, "--ip-permissions", &permissions],
                )
                .await
            {
                Ok(_) => {
                    removed += rules.len();
                    tracing::debug!(
                        "Revoked {} referencing rule(s) from {}",
                        rules.len(),
                        group_id
                    );
                }
                Err(e) if e.is_not_found() => {}
                Err(e) => tracing::warn!("Could not revoke rules in {}: {}", group_id, e),
            }
        }
    }
    Ok(removed)
}

async fn detach_internet_gateways(cli: &AwsCli, vpc_id: &str, delete: bool) -> Result<()> {
    let gateways = describe(
        cli,
        "describe-internet-gateways",
        "/InternetGateways",
        "--filters",
        &[("attachment.vpc-id", &[vpc_id])],
    )
    .await?;
    for igw in &gateways {
        let Some(igw_id) = text(igw, "/InternetGatewayId") else {
            continue;
        };
        cli.run(
            "ec2",
            &[
                "detach-internet-gateway",
                "--internet-gateway-id",
                &igw_id,
                "--vpc-id",
                vpc_id,
            ],
        )
        .await?;
        if delete {
            cli.run(
                "ec2",
                &["delete-internet-gateway", "--internet-gateway-id", &igw_id],
            )
            .await?;
            tracing::info!("Deleted internet gateway: {}", igw_id);
        }
    }
    Ok(())
}

/// Log and continue: one stuck dependant should not hide the others
fn soft<T>(what: &str, result: Result<T>) {
    if let Err(e) = result {
        tracing::warn!("Could not {}: {}", what, e);
    }
}

/// Clear everything inside a VPC that blocks its deletion
///
/// `project` selects which unattached Elastic IPs are released.
pub async fn release_vpc(cli: &AwsCli, vpc_id: &str, project: &str) -> Result<()> {
    let in_vpc: &[(&str, &[&str])] = &[("vpc-id", &[vpc_id])];

    for eni in describe(
        cli,
        "describe-network-interfaces",
        "/NetworkInterfaces",
        "--filters",
        &[("vpc-id", &[vpc_id]), ("status", &["available"])],
    )
    .await?
    {
        if let Some(eni_id) = text(&eni, "/NetworkInterfaceId") {
            soft(
                "delete network interface",
                cli.run(
                    "ec2",
                    &["delete-network-interface", "--network-interface-id", &eni_id],
                )
                .await,
            );
        }
    }

    for nat in describe(
        cli,
        "describe-nat-gateways",
        "/NatGateways",
        "--filter",
        &[("vpc-id", &[vpc_id]), ("state", &["pending", "available"])],
    )
    .await?
    {
        if let Some(nat_id) = text(&nat, "/NatGatewayId") {
            release_nat_routes(cli, &nat_id).await?;
            soft(
                "delete NAT gateway",
                cli.run("ec2", &["delete-nat-gateway", "--nat-gateway-id", &nat_id])
                    .await,
            );
        }
    }

    let addresses = cli.run("ec2", &["describe-addresses"]).await?;
    for eip in items(&addresses, "/Addresses") {
        let attached = eip.get("AssociationId").is_some_and(|a| !a.is_null());
        let name = tag_map(items(eip, "/Tags")).remove("Name").unwrap_or_default();
        if attached || project.is_empty() || !name.contains(project) {
            continue;
        }
        if let Some(allocation_id) = text(eip, "/AllocationId") {
            soft(
                "release Elastic IP",
                cli.run("ec2", &["release-address", "--allocation-id", &allocation_id])
                    .await,
            );
        }
    }

    for sg in describe(cli, "describe-security-groups", "/SecurityGroups", "--filters", in_vpc)
        .await?
    {
        if text(&sg, "/GroupName").as_deref() == Some("default") {
            continue;
        }
        if let Some(group_id) = text(&sg, "/GroupId") {
            soft("revoke group rules", release_security_group(cli, &group_id).await);
            soft(
                "delete security group",
                cli.run("ec2", &["delete-security-group", "--group-id", &group_id])
                    .await,
            );
        }
    }

    for subnet in describe(cli, "describe-subnets", "/Subnets", "--filters", in_vpc).await? {
        if let Some(subnet_id) = text(&subnet, "/SubnetId") {
            soft(
                "delete subnet",
                cli.run("ec2", &["delete-subnet", "--subnet-id", &subnet_id])
                    .await,
            );
        }
    }

    for rt in describe(cli, "describe-route-tables", "/RouteTables", "--filters", in_vpc).await? {
        if is_main(&rt) {
            continue;
        }
        if let Some(rt_id) = text(&rt, "/RouteTableId") {
            soft("disassociate route table", disassociate_route_table(cli, &rt_id).await);
            soft(
                "delete route table",
                cli.run("ec2", &["delete-route-table", "--route-table-id", &rt_id])
                    .await,
            );
        }
    }

    soft(
        "detach internet gateway",
        detach_internet_gateways(cli, vpc_id, true).await,
    );

    for acl in describe(cli, "describe-network-acls", "/NetworkAcls", "--filters", in_vpc).await? {
        if acl.get("IsDefault").and_then(Value::as_bool).unwrap_or(false) {
            continue;
        }
        if let Some(acl_id) = text(&acl, "/NetworkAclId") {
            soft(
                "delete network ACL",
                cli.run("ec2", &["delete-network-acl", "--network-acl-id", &acl_id])
                    .await,
            );
        }
    }

    for side in ["requester-vpc-info.vpc-id", "accepter-vpc-info.vpc-id"] {
        for peering in describe(
            cli,
            "describe-vpc-peering-connections",
            "/VpcPeeringConnections",
            "--filters",
            &[(side, &[vpc_id])],
        )
        .await?
        {
            let state = text(&peering, "/Status/Code").unwrap_or_default();
            if state == "deleted" || state == "deleting" {
                continue;
            }
            if let Some(peering_id) = text(&peering, "/VpcPeeringConnectionId") {
                soft(
                    "delete peering connection",
                    cli.run(
                        "ec2",
                        &[
                            "delete-vpc-peering-connection",
                            "--vpc-peering-connection-id",
                            &peering_id,
                        ],
                    )
                    .await,
                );
            }
        }
    }
    Ok(())
}

// Deletion

pub async fn delete(cli: &AwsCli, target: &ResourceDescriptor) -> Result<()> {
    let id = target.id_or_name();
    match target.kind {
        ResourceKind::Vpc => {
            cli.run("ec2", &["delete-vpc", "--vpc-id", id]).await?;
        }
        ResourceKind::Subnet => {
            cli.run("ec2", &["delete-subnet", "--subnet-id", id]).await?;
        }
        ResourceKind::InternetGateway => {
            if let Some(vpc_id) = target.attr_str(attr::VPC_ID) {
                detach_internet_gateways(cli, vpc_id, false).await?;
            }
            cli.run("ec2", &["delete-internet-gateway", "--internet-gateway-id", id])
                .await?;
        }
        ResourceKind::NatGateway => {
            cli.run("ec2", &["delete-nat-gateway", "--nat-gateway-id", id])
                .await?;
        }
        ResourceKind::RouteTable => {
            cli.run("ec2", &["delete-route-table", "--route-table-id", id])
                .await?;
        }
        ResourceKind::SecurityGroup => {
            cli.run("ec2", &["delete-security-group", "--group-id", id])
                .await?;
        }
        ResourceKind::VpcEndpoint => {
            let output = cli
                .run("ec2", &["delete-vpc-endpoints", "--vpc-endpoint-ids", id])
                .await?;
            if let Some(failure) = items(&output, "/Unsuccessful").first() {
                return Err(AwsError::Api {
                    code: text(failure, "/Error/Code").unwrap_or_default(),
                    message: text(failure, "/Error/Message").unwrap_or_default(),
                });
            }
        }
        other => return Err(AwsError::Unsupported(format!("network delete for {}", other))),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filters_json() {
        let value: Value =
            serde_json::from_str(&filters(&[("tag:Name", &["vpc-for-demo"])])).unwrap();
        assert_eq!(value[0]["Name"], "tag:Name");
        assert_eq!(value[0]["Values"][0], "vpc-for-demo");
    }

    #[test]
    fn test_ip_permission_from_group() {
        let rule = IngressRule::tcp_from_group(8501, "sg-alb", "from alb");
        let permission = ip_permission(&rule);
        assert_eq!(permission["FromPort"], 8501);
        assert_eq!(permission["UserIdGroupPairs"][0]["GroupId"], "sg-alb");
        assert!(permission.get("IpRanges").is_none());
    }

    #[test]
    fn test_referencing_keeps_only_target_pairs() {
        let permission = json!({
            "IpProtocol": "tcp",
            "FromPort": 8501,
            "ToPort": 8501,
            "IpRanges": [{ "CidrIp": "10.0.0.0/8" }],
            "UserIdGroupPairs": [
                { "GroupId": "sg-target", "UserId": "123" },
                { "GroupId": "sg-other", "UserId": "123" }
            ]
        });
        let targets: BTreeSet<String> = ["sg-target".to_string()].into_iter().collect();

        let stripped = referencing(&permission, &targets).unwrap();
        assert_eq!(stripped["UserIdGroupPairs"].as_array().unwrap().len(), 1);
        assert!(stripped.get("IpRanges").is_none());

        let unrelated: BTreeSet<String> = ["sg-none".to_string()].into_iter().collect();
        assert!(referencing(&permission, &unrelated).is_none());
    }

    #[test]
    fn test_default_egress_detection() {
        let default = json!({ "IpProtocol": "-1", "IpRanges": [{ "CidrIp": "0.0.0.0/0" }] });
        let custom = json!({ "IpProtocol": "tcp", "FromPort": 443, "ToPort": 443,
                             "IpRanges": [{ "CidrIp": "0.0.0.0/0" }] });
        assert!(is_default_egress(&default));
        assert!(!is_default_egress(&custom));
    }

    #[test]
    fn test_route_table_info_main_and_routes() {
        let rt = json!({
            "RouteTableId": "rtb-1",
            "Associations": [{ "Main": true }, { "Main": false, "SubnetId": "subnet-1" }],
            "Routes": [
                { "DestinationCidrBlock": "10.20.0.0/16", "GatewayId": "local" },
                { "DestinationCidrBlock": "0.0.0.0/0", "GatewayId": "igw-1" }
            ]
        });
        let info = route_table_info(&rt).unwrap();
        assert!(info.main);
        assert_eq!(info.subnet_ids, vec!["subnet-1".to_string()]);
        assert!(info.has_default_internet_route());
    }
}
