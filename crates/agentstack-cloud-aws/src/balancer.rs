//! Application load balancers, target groups, listeners and listener rules
//!
//! Listeners and rules have no names of their own. They are addressed as
//! `<load balancer>:<port>` and `<load balancer>:<port>:<priority>`.

use crate::cli::{AwsCli, items, text};
use crate::error::{AwsError, Result};
use agentstack_cloud::{ResourceDescriptor, ResourceKind, ResourceStatus, attr};
use serde_json::{Value, json};

const SERVICE: &str = "elbv2";

fn split_last<'a>(name: &'a str, what: &str) -> Result<(&'a str, &'a str)> {
    name.rsplit_once(':')
        .ok_or_else(|| AwsError::UnexpectedResponse(format!("malformed {} name: {}", what, name)))
}

fn arn_descriptor(kind: ResourceKind, name: &str, arn: String) -> ResourceDescriptor {
    ResourceDescriptor::new(kind, name)
        .with_id(arn.clone())
        .with_arn(arn)
}

fn load_balancer_descriptor(lb: &Value) -> Option<ResourceDescriptor> {
    let name = text(lb, "/LoadBalancerName")?;
    let arn = text(lb, "/LoadBalancerArn")?;
    let mut desc = arn_descriptor(ResourceKind::LoadBalancer, &name, arn);
    if let Some(state) = text(lb, "/State/Code") {
        desc.status = match state.as_str() {
            "provisioning" => ResourceStatus::Pending,
            other => ResourceStatus::parse(other),
        };
        desc.set_attribute(attr::STATE, json!(state));
    }
    if let Some(dns) = text(lb, "/DNSName") {
        desc.set_attribute(attr::DNS_NAME, json!(dns));
    }
    if let Some(vpc) = text(lb, "/VpcId") {
        desc.set_attribute(attr::VPC_ID, json!(vpc));
    }
    Some(desc)
}

fn target_group_descriptor(tg: &Value) -> Option<ResourceDescriptor> {
    let name = text(tg, "/TargetGroupName")?;
    let arn = text(tg, "/TargetGroupArn")?;
    let mut desc = arn_descriptor(ResourceKind::TargetGroup, &name, arn)
        .with_status(ResourceStatus::Available);
    if let Some(vpc) = text(tg, "/VpcId") {
        desc.set_attribute(attr::VPC_ID, json!(vpc));
    }
    Some(desc)
}

fn listener_descriptor(load_balancer: &str, listener: &Value) -> Option<ResourceDescriptor> {
    let arn = text(listener, "/ListenerArn")?;
    let port = listener.get("Port").and_then(Value::as_u64)?;
    Some(
        arn_descriptor(
            ResourceKind::Listener,
            &format!("{}:{}", load_balancer, port),
            arn,
        )
        .with_status(ResourceStatus::Available),
    )
}

// Load balancers

pub async fn find_load_balancer(cli: &AwsCli, name: &str) -> Result<Option<ResourceDescriptor>> {
    let output = cli
        .run_optional(SERVICE, &["describe-load-balancers", "--names", name])
        .await?;
    Ok(output.and_then(|v| items(&v, "/LoadBalancers").iter().find_map(load_balancer_descriptor)))
}

pub async fn create_load_balancer(
    cli: &AwsCli,
    name: &str,
    subnet_ids: &[String],
    security_group_ids: &[String],
) -> Result<ResourceDescriptor> {
    let tag = format!("Key=Name,Value={}", name);
    let mut args = vec!["create-load-balancer", "--name", name, "--subnets"];
    args.extend(subnet_ids.iter().map(String::as_str));
    args.push("--security-groups");
    args.extend(security_group_ids.iter().map(String::as_str));
    args.extend([
        "--scheme",
        "internet-facing",
        "--type",
        "application",
        "--ip-address-type",
        "ipv4",
        "--tags",
        tag.as_str(),
    ]);

    let output = cli.run(SERVICE, &args).await?;
    items(&output, "/LoadBalancers")
        .iter()
        .find_map(load_balancer_descriptor)
        .ok_or_else(|| AwsError::UnexpectedResponse(format!("create-load-balancer: {}", output)))
}

pub async fn load_balancer_status(cli: &AwsCli, arn: &str) -> Result<String> {
    let output = cli
        .run(SERVICE, &["describe-load-balancers", "--load-balancer-arns", arn])
        .await?;
    items(&output, "/LoadBalancers")
        .first()
        .and_then(|lb| text(lb, "/State/Code"))
        .ok_or_else(|| AwsError::UnexpectedResponse(format!("load balancer {} has no state", arn)))
}

pub async fn discover_load_balancers(
    cli: &AwsCli,
    pattern: &str,
) -> Result<Vec<ResourceDescriptor>> {
    let output = cli.run(SERVICE, &["describe-load-balancers"]).await?;
    Ok(items(&output, "/LoadBalancers")
        .iter()
        .filter_map(load_balancer_descriptor)
        .filter(|d| d.name.contains(pattern))
        .collect())
}

/// Delete the listeners so the target groups behind them free up
pub async fn release_load_balancer(cli: &AwsCli, target: &ResourceDescriptor) -> Result<()> {
    for listener in listeners(cli, target).await? {
        delete_listener(cli, listener.id_or_name()).await?;
        tracing::debug!("Deleted listener {}", listener.name);
    }
    Ok(())
}

pub async fn delete_load_balancer(cli: &AwsCli, arn: &str) -> Result<()> {
    cli.run(SERVICE, &["delete-load-balancer", "--load-balancer-arn", arn])
        .await?;
    Ok(())
}

// Target groups

pub async fn find_target_group(cli: &AwsCli, name: &str) -> Result<Option<ResourceDescriptor>> {
    let output = cli
        .run_optional(SERVICE, &["describe-target-groups", "--names", name])
        .await?;
    Ok(output.and_then(|v| items(&v, "/TargetGroups").iter().find_map(target_group_descriptor)))
}

pub async fn create_target_group(
    cli: &AwsCli,
    name: &str,
    vpc_id: &str,
    port: u16,
    health_check_path: &str,
) -> Result<ResourceDescriptor> {
    let port = port.to_string();
    let output = cli
        .run(
            SERVICE,
            &[
                "create-target-group",
                "--name",
                name,
                "--protocol",
                "HTTP",
                "--port",
                &port,
                "--vpc-id",
                vpc_id,
                "--health-check-protocol",
                "HTTP",
                "--health-check-path",
                health_check_path,
                "--health-check-interval-seconds",
                "30",
                "--health-check-timeout-seconds",
                "5",
                "--healthy-threshold-count",
                "2",
                "--unhealthy-threshold-count",
                "3",
                "--target-type",
                "instance",
            ],
        )
        .await?;
    items(&output, "/TargetGroups")
        .iter()
        .find_map(target_group_descriptor)
        .ok_or_else(|| AwsError::UnexpectedResponse(format!("create-target-group: {}", output)))
}

pub async fn discover_target_groups(
    cli: &AwsCli,
    pattern: &str,
) -> Result<Vec<ResourceDescriptor>> {
    let output = cli.run(SERVICE, &["describe-target-groups"]).await?;
    Ok(items(&output, "/TargetGroups")
        .iter()
        .filter_map(target_group_descriptor)
        .filter(|d| d.name.contains(pattern))
        .collect())
}

pub async fn delete_target_group(cli: &AwsCli, arn: &str) -> Result<()> {
    cli.run(SERVICE, &["delete-target-group", "--target-group-arn", arn])
        .await?;
    Ok(())
}

/// Register an instance unless it is already a target
pub async fn register_target(
    cli: &AwsCli,
    target_group_arn: &str,
    instance_id: &str,
    port: u16,
) -> Result<()> {
    let health = cli
        .run(
            SERVICE,
            &[
                "describe-target-health",
                "--target-group-arn",
                target_group_arn,
            ],
        )
        .await?;
    let registered = items(&health, "/TargetHealthDescriptions")
        .iter()
        .any(|t| text(t, "/Target/Id").as_deref() == Some(instance_id));
    if registered {
        tracing::debug!("{} already registered in {}", instance_id, target_group_arn);
        return Ok(());
    }

    let target = format!("Id={},Port={}", instance_id, port);
    match cli
        .run(
            SERVICE,
            &[
                "register-targets",
                "--target-group-arn",
                target_group_arn,
                "--targets",
                &target,
            ],
        )
        .await
    {
        Ok(_) => Ok(()),
        Err(e) if e.code() == Some("DuplicateTarget") => Ok(()),
        Err(e) => Err(e),
    }
}

// Listeners

async fn listeners(
    cli: &AwsCli,
    load_balancer: &ResourceDescriptor,
) -> Result<Vec<ResourceDescriptor>> {
    let Some(arn) = load_balancer.identifier() else {
        return Ok(Vec::new());
    };
    let output = cli
        .run(SERVICE, &["describe-listeners", "--load-balancer-arn", arn])
        .await?;
    Ok(items(&output, "/Listeners")
        .iter()
        .filter_map(|l| listener_descriptor(&load_balancer.name, l))
        .collect())
}

/// `name` is `<load balancer>:<port>`; only HTTP listeners match
pub async fn find_listener(cli: &AwsCli, name: &str) -> Result<Option<ResourceDescriptor>> {
    let (lb_name, port) = split_last(name, "listener")?;
    let Some(lb) = find_load_balancer(cli, lb_name).await? else {
        return Ok(None);
    };
    let Some(arn) = lb.identifier() else {
        return Ok(None);
    };
    let output = cli
        .run(SERVICE, &["describe-listeners", "--load-balancer-arn", arn])
        .await?;
    Ok(items(&output, "/Listeners")
        .iter()
        .filter(|l| {
            l.get("Port").and_then(Value::as_u64).map(|p| p.to_string()).as_deref() == Some(port)
                && text(l, "/Protocol").as_deref() == Some("HTTP")
        })
        .find_map(|l| listener_descriptor(lb_name, l)))
}

pub async fn create_listener(
    cli: &AwsCli,
    name: &str,
    load_balancer_arn: &str,
    target_group_arn: &str,
    port: u16,
) -> Result<ResourceDescriptor> {
    let port_arg = port.to_string();
    let actions = forward_action(target_group_arn).to_string();
    let output = cli
        .run(
            SERVICE,
            &[
                "create-listener",
                "--load-balancer-arn",
                load_balancer_arn,
                "--protocol",
                "HTTP",
                "--port",
                &port_arg,
                "--default-actions",
                &actions,
            ],
        )
        .await?;
    let arn = items(&output, "/Listeners")
        .first()
        .and_then(|l| text(l, "/ListenerArn"))
        .ok_or_else(|| AwsError::UnexpectedResponse(format!("create-listener: {}", output)))?;
    Ok(arn_descriptor(ResourceKind::Listener, name, arn).with_status(ResourceStatus::Available))
}

pub async fn discover_listeners(cli: &AwsCli, pattern: &str) -> Result<Vec<ResourceDescriptor>> {
    let mut found = Vec::new();
    for lb in discover_load_balancers(cli, pattern).await? {
        found.extend(listeners(cli, &lb).await?);
    }
    Ok(found)
}

pub async fn delete_listener(cli: &AwsCli, arn: &str) -> Result<()> {
    cli.run(SERVICE, &["delete-listener", "--listener-arn", arn])
        .await?;
    Ok(())
}

// Listener rules

pub fn forward_action(target_group_arn: &str) -> Value {
    json!([{ "Type": "forward", "TargetGroupArn": target_group_arn }])
}

pub fn header_condition(header_name: &str, header_value: &str) -> Value {
    json!([{
        "Field": "http-header",
        "HttpHeaderConfig": {
            "HttpHeaderName": header_name,
            "Values": [header_value]
        }
    }])
}

/// `name` is `<load balancer>:<port>:<priority>`
pub async fn find_rule(cli: &AwsCli, name: &str) -> Result<Option<ResourceDescriptor>> {
    let (listener, priority) = split_last(name, "listener rule")?;
    let Some(listener) = find_listener(cli, listener).await? else {
        return Ok(None);
    };
    let Some(listener_arn) = listener.identifier() else {
        return Ok(None);
    };
    let output = cli
        .run(SERVICE, &["describe-rules", "--listener-arn", listener_arn])
        .await?;
    Ok(items(&output, "/Rules")
        .iter()
        .find(|r| text(r, "/Priority").as_deref() == Some(priority))
        .and_then(|r| text(r, "/RuleArn"))
        .map(|arn| {
            arn_descriptor(ResourceKind::ListenerRule, name, arn)
                .with_status(ResourceStatus::Available)
        }))
}

pub async fn create_rule(
    cli: &AwsCli,
    name: &str,
    listener_arn: &str,
    target_group_arn: &str,
    priority: u32,
    header_name: &str,
    header_value: &str,
) -> Result<ResourceDescriptor> {
    let priority = priority.to_string();
    let conditions = header_condition(header_name, header_value).to_string();
    let actions = forward_action(target_group_arn).to_string();
    tracing::debug!("Listener rule {} matches {}: {}", name, header_name, header_value);

    let output = cli
        .run(
            SERVICE,
            &[
                "create-rule",
                "--listener-arn",
                listener_arn,
                "--priority",
                &priority,
                "--conditions",
                &conditions,
                "--actions",
                &actions,
            ],
        )
        .await?;
    let arn = items(&output, "/Rules")
        .first()
        .and_then(|r| text(r, "/RuleArn"))
        .ok_or_else(|| AwsError::UnexpectedResponse(format!("create-rule: {}", output)))?;
    Ok(arn_descriptor(ResourceKind::ListenerRule, name, arn).with_status(ResourceStatus::Available))
}

pub async fn delete_rule(cli: &AwsCli, arn: &str) -> Result<()> {
    cli.run(SERVICE, &["delete-rule", "--rule-arn", arn]).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_listener_and_rule_names_split_back() {
        assert_eq!(
            split_last("alb-for-demo:80:10", "rule").unwrap(),
            ("alb-for-demo:80", "10")
        );
        assert_eq!(
            split_last("alb-for-demo:80", "listener").unwrap(),
            ("alb-for-demo", "80")
        );
        assert!(split_last("alb-for-demo", "listener").is_err());
    }

    #[test]
    fn test_header_condition_shape() {
        let conditions = header_condition("X-Custom-Header", "demo_12dab15e4s31");
        assert_eq!(conditions[0]["Field"], "http-header");
        assert_eq!(
            conditions[0]["HttpHeaderConfig"]["HttpHeaderName"],
            "X-Custom-Header"
        );
        assert_eq!(
            conditions[0]["HttpHeaderConfig"]["Values"][0],
            "demo_12dab15e4s31"
        );
    }

    #[test]
    fn test_load_balancer_descriptor() {
        let lb = json!({
            "LoadBalancerName": "alb-for-demo",
            "LoadBalancerArn": "arn:aws:elasticloadbalancing:us-west-2:1:loadbalancer/app/alb-for-demo/abc",
            "DNSName": "alb-for-demo-1.us-west-2.elb.amazonaws.com",
            "State": { "Code": "provisioning" },
            "VpcId": "vpc-1"
        });
        let desc = load_balancer_descriptor(&lb).unwrap();
        assert_eq!(desc.status, ResourceStatus::Pending);
        assert_eq!(
            desc.attr_str(attr::DNS_NAME),
            Some("alb-for-demo-1.us-west-2.elb.amazonaws.com")
        );
        assert_eq!(desc.id, desc.arn);
    }

    #[test]
    fn test_listener_descriptor_names_by_port() {
        let listener = json!({ "ListenerArn": "arn:listener/1", "Port": 80, "Protocol": "HTTP" });
        let desc = listener_descriptor("alb-for-demo", &listener).unwrap();
        assert_eq!(desc.name, "alb-for-demo:80");
    }
}
