//! EC2 instances, machine images and SSM run-command

use crate::cli::{AwsCli, items, name_tag_spec, tag_map, text};
use crate::error::{AwsError, Result};
use crate::network::filters;
use agentstack_cloud::{Invocation, ResourceDescriptor, ResourceKind, ResourceStatus, attr};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde_json::{Value, json};

/// States in which an instance still counts as present
const LIVE_STATES: [&str; 4] = ["pending", "running", "stopping", "stopped"];

/// SSM rejects longer comments
const MAX_COMMENT: usize = 100;

const COMMAND_TIMEOUT_SECS: u32 = 3600;

fn instance_descriptor(instance: &Value) -> Option<ResourceDescriptor> {
    let id = text(instance, "/InstanceId")?;
    let tags = tag_map(items(instance, "/Tags"));
    let name = tags.get("Name").cloned().unwrap_or_else(|| id.clone());
    let mut desc = ResourceDescriptor::new(ResourceKind::Instance, name).with_id(id);
    desc.tags = tags;
    if let Some(state) = text(instance, "/State/Name") {
        desc.status = ResourceStatus::parse(&state);
        desc.set_attribute(attr::STATE, json!(state));
    }
    for (key, pointer) in [
        (attr::PRIVATE_IP, "/PrivateIpAddress"),
        (attr::PUBLIC_IP, "/PublicIpAddress"),
        (attr::SUBNET_ID, "/SubnetId"),
        (attr::VPC_ID, "/VpcId"),
    ] {
        if let Some(value) = text(instance, pointer) {
            desc.set_attribute(key, json!(value));
        }
    }
    Some(desc)
}

fn reservations(output: &Value) -> impl Iterator<Item = &Value> {
    items(output, "/Reservations")
        .iter()
        .flat_map(|r| items(r, "/Instances").iter())
}

async fn describe_instances(cli: &AwsCli, name_filter: &str) -> Result<Vec<ResourceDescriptor>> {
    let filter = filters(&[
        ("tag:Name", &[name_filter]),
        ("instance-state-name", &LIVE_STATES),
    ]);
    let output = cli
        .run("ec2", &["describe-instances", "--filters", &filter])
        .await?;
    Ok(reservations(&output).filter_map(instance_descriptor).collect())
}

pub async fn find(cli: &AwsCli, name: &str) -> Result<Option<ResourceDescriptor>> {
    Ok(describe_instances(cli, name).await?.into_iter().next())
}

/// Launch parameters of one instance
pub struct Launch<'a> {
    pub name: &'a str,
    pub image_id: &'a str,
    pub instance_type: &'a str,
    pub subnet_id: &'a str,
    pub security_group_ids: &'a [String],
    pub instance_profile: &'a str,
    pub volume_size_gb: u32,
    /// Base64 encoded script
    pub user_data: &'a str,
}

pub fn block_devices(volume_size_gb: u32) -> Value {
    json!([{
        "DeviceName": "/dev/xvda",
        "Ebs": {
            "VolumeSize": volume_size_gb,
            "VolumeType": "gp3",
            "Encrypted": true,
            "DeleteOnTermination": true
        }
    }])
}

pub async fn create(cli: &AwsCli, launch: &Launch<'_>) -> Result<ResourceDescriptor> {
    // the CLI base64-encodes --user-data itself
    let script = STANDARD
        .decode(launch.user_data)
        .map_err(|e| AwsError::UnexpectedResponse(format!("user data is not base64: {}", e)))?;
    let script = String::from_utf8_lossy(&script).to_string();

    let profile = format!("Name={}", launch.instance_profile);
    let devices = block_devices(launch.volume_size_gb).to_string();
    let tags = name_tag_spec("instance", launch.name);

    let mut args = vec![
        "run-instances",
        "--image-id",
        launch.image_id,
        "--instance-type",
        launch.instance_type,
        "--count",
        "1",
        "--subnet-id",
        launch.subnet_id,
        "--iam-instance-profile",
        profile.as_str(),
        "--block-device-mappings",
        devices.as_str(),
        "--user-data",
        script.as_str(),
        "--tag-specifications",
        tags.as_str(),
        "--security-group-ids",
    ];
    args.extend(launch.security_group_ids.iter().map(String::as_str));

    let output = cli.run("ec2", &args).await?;
    items(&output, "/Instances")
        .iter()
        .find_map(instance_descriptor)
        .ok_or_else(|| AwsError::UnexpectedResponse(format!("run-instances: {}", output)))
}

/// Raw state name; terminated instances stay visible for a while
pub async fn status(cli: &AwsCli, instance_id: &str) -> Result<String> {
    let output = cli
        .run("ec2", &["describe-instances", "--instance-ids", instance_id])
        .await?;
    reservations(&output)
        .find_map(|i| text(i, "/State/Name"))
        .ok_or_else(|| AwsError::Api {
            code: "InvalidInstanceID.NotFound".to_string(),
            message: format!("instance {} not found", instance_id),
        })
}

pub async fn discover(cli: &AwsCli, pattern: &str) -> Result<Vec<ResourceDescriptor>> {
    describe_instances(cli, &format!("*{}*", pattern)).await
}

pub async fn terminate(cli: &AwsCli, instance_id: &str) -> Result<()> {
    cli.run("ec2", &["terminate-instances", "--instance-ids", instance_id])
        .await?;
    Ok(())
}

/// Newest image matching the first pattern with any non-minimal match
pub async fn latest_image(cli: &AwsCli, name_patterns: &[&str]) -> Result<Option<String>> {
    for &pattern in name_patterns {
        let filter = filters(&[("name", &[pattern]), ("state", &["available"])]);
        let output = cli
            .run(
                "ec2",
                &["describe-images", "--owners", "amazon", "--filters", &filter],
            )
            .await?;
        if let Some(image) = newest_image(items(&output, "/Images")) {
            tracing::debug!("Image for {}: {}", pattern, image);
            return Ok(Some(image));
        }
    }
    Ok(None)
}

fn newest_image(images: &[Value]) -> Option<String> {
    images
        .iter()
        .filter(|i| !text(i, "/Name").unwrap_or_default().contains("minimal"))
        .max_by_key(|i| text(i, "/CreationDate").unwrap_or_default())
        .and_then(|i| text(i, "/ImageId"))
}

// SSM

pub async fn is_managed(cli: &AwsCli, instance_id: &str) -> Result<bool> {
    let filter = format!("Key=InstanceIds,Values={}", instance_id);
    let output = cli
        .run("ssm", &["describe-instance-information", "--filters", &filter])
        .await?;
    Ok(!items(&output, "/InstanceInformationList").is_empty())
}

pub fn run_shell_parameters(script: &str) -> Value {
    json!({
        "commands": [script],
        "workingDirectory": ["/home/ec2-user"],
        "executionTimeout": [COMMAND_TIMEOUT_SECS.to_string()]
    })
}

pub async fn send_script(
    cli: &AwsCli,
    instance_id: &str,
    script: &str,
    comment: &str,
) -> Result<String> {
    let parameters = run_shell_parameters(script).to_string();
    let comment: String = comment.chars().take(MAX_COMMENT).collect();
    let timeout = COMMAND_TIMEOUT_SECS.to_string();
    let output = cli
        .run(
            "ssm",
            &[
                "send-command",
                "--instance-ids",
                instance_id,
                "--document-name",
                "AWS-RunShellScript",
                "--parameters",
                &parameters,
                "--comment",
                &comment,
                "--timeout-seconds",
                &timeout,
            ],
        )
        .await?;
    text(&output, "/Command/CommandId")
        .ok_or_else(|| AwsError::UnexpectedResponse(format!("send-command: {}", output)))
}

/// A command that has not reached the instance yet reads as `Pending`
pub async fn invocation(cli: &AwsCli, command_id: &str, instance_id: &str) -> Result<Invocation> {
    let output = match cli
        .run(
            "ssm",
            &[
                "get-command-invocation",
                "--command-id",
                command_id,
                "--instance-id",
                instance_id,
            ],
        )
        .await
    {
        Ok(output) => output,
        Err(e) if e.code() == Some("InvocationDoesNotExist") => {
            return Ok(Invocation {
                status: "Pending".to_string(),
                ..Default::default()
            });
        }
        Err(e) => return Err(e),
    };
    Ok(Invocation {
        status: text(&output, "/Status").unwrap_or_default(),
        stdout: text(&output, "/StandardOutputContent").unwrap_or_default(),
        stderr: text(&output, "/StandardErrorContent").unwrap_or_default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image(id: &str, name: &str, created: &str) -> Value {
        json!({ "ImageId": id, "Name": name, "CreationDate": created })
    }

    #[test]
    fn test_newest_image_skips_minimal() {
        let images = vec![
            image("ami-old", "al2023-ami-2023.1-x86_64", "2024-01-01T00:00:00.000Z"),
            image("ami-min", "al2023-ami-minimal-2023.9-x86_64", "2025-06-01T00:00:00.000Z"),
            image("ami-new", "al2023-ami-2023.8-x86_64", "2025-05-01T00:00:00.000Z"),
        ];
        assert_eq!(newest_image(&images).as_deref(), Some("ami-new"));
        assert_eq!(newest_image(&[]), None);
    }

    #[test]
    fn test_instance_descriptor() {
        let instance = json!({
            "InstanceId": "i-0abc",
            "State": { "Name": "running" },
            "PrivateIpAddress": "10.20.2.15",
            "SubnetId": "subnet-2",
            "Tags": [{ "Key": "Name", "Value": "app-for-demo" }]
        });
        let desc = instance_descriptor(&instance).unwrap();
        assert_eq!(desc.name, "app-for-demo");
        assert_eq!(desc.status, ResourceStatus::Available);
        assert_eq!(desc.attr_str(attr::PRIVATE_IP), Some("10.20.2.15"));
        assert_eq!(desc.attr_str(attr::PUBLIC_IP), None);
    }

    #[test]
    fn test_run_shell_parameters() {
        let params = run_shell_parameters("echo hi");
        assert_eq!(params["commands"][0], "echo hi");
        assert_eq!(params["executionTimeout"][0], "3600");
    }

    #[test]
    fn test_reservations_flatten() {
        let output = json!({
            "Reservations": [
                { "Instances": [{ "InstanceId": "i-1" }] },
                { "Instances": [{ "InstanceId": "i-2" }, { "InstanceId": "i-3" }] }
            ]
        });
        assert_eq!(reservations(&output).count(), 3);
    }
}
