//! IAM roles and instance profiles

use crate::cli::{AwsCli, items, text};
use crate::error::Result;
use agentstack_cloud::{InlinePolicy, ResourceDescriptor, ResourceKind, ResourceStatus};
use serde_json::Value;

fn role_descriptor(role: &Value) -> Option<ResourceDescriptor> {
    let name = text(role, "/RoleName")?;
    let mut desc = ResourceDescriptor::new(ResourceKind::Role, name)
        .with_status(ResourceStatus::Available);
    desc.id = text(role, "/RoleId");
    desc.arn = text(role, "/Arn");
    Some(desc)
}

fn profile_descriptor(profile: &Value) -> Option<ResourceDescriptor> {
    let name = text(profile, "/InstanceProfileName")?;
    let mut desc = ResourceDescriptor::new(ResourceKind::InstanceProfile, name)
        .with_status(ResourceStatus::Available);
    desc.id = text(profile, "/InstanceProfileId");
    desc.arn = text(profile, "/Arn");
    Some(desc)
}

pub async fn find_role(cli: &AwsCli, name: &str) -> Result<Option<ResourceDescriptor>> {
    let output = cli
        .run_optional("iam", &["get-role", "--role-name", name])
        .await?;
    Ok(output.and_then(|v| v.get("Role").and_then(role_descriptor)))
}

pub async fn create_role(
    cli: &AwsCli,
    name: &str,
    trust_policy: &Value,
    description: &str,
) -> Result<ResourceDescriptor> {
    let document = trust_policy.to_string();
    let output = cli
        .run(
            "iam",
            &[
                "create-role",
                "--role-name",
                name,
                "--assume-role-policy-document",
                &document,
                "--description",
                description,
            ],
        )
        .await?;
    output
        .get("Role")
        .and_then(role_descriptor)
        .ok_or_else(|| unexpected("create-role", &output))
}

pub async fn find_profile(cli: &AwsCli, name: &str) -> Result<Option<ResourceDescriptor>> {
    let output = cli
        .run_optional(
            "iam",
            &["get-instance-profile", "--instance-profile-name", name],
        )
        .await?;
    Ok(output.and_then(|v| v.get("InstanceProfile").and_then(profile_descriptor)))
}

pub async fn create_profile(cli: &AwsCli, name: &str) -> Result<ResourceDescriptor> {
    let output = cli
        .run(
            "iam",
            &["create-instance-profile", "--instance-profile-name", name],
        )
        .await?;
    output
        .get("InstanceProfile")
        .and_then(profile_descriptor)
        .ok_or_else(|| unexpected("create-instance-profile", &output))
}

pub async fn put_inline_policy(cli: &AwsCli, role: &str, policy: &InlinePolicy) -> Result<()> {
    let document = policy.document.to_string();
    cli.run(
        "iam",
        &[
            "put-role-policy",
            "--role-name",
            role,
            "--policy-name",
            &policy.name,
            "--policy-document",
            &document,
        ],
    )
    .await?;
    Ok(())
}

async fn attached_policies(cli: &AwsCli, role: &str) -> Result<Vec<String>> {
    let output = cli
        .run("iam", &["list-attached-role-policies", "--role-name", role])
        .await?;
    Ok(items(&output, "/AttachedPolicies")
        .iter()
        .filter_map(|p| text(p, "/PolicyArn"))
        .collect())
}

/// Attach a managed policy unless it is already attached
pub async fn attach_managed_policy(cli: &AwsCli, role: &str, policy_arn: &str) -> Result<()> {
    if attached_policies(cli, role).await?.iter().any(|p| p == policy_arn) {
        tracing::debug!("Policy {} already attached to {}", policy_arn, role);
        return Ok(());
    }
    cli.run(
        "iam",
        &["attach-role-policy", "--role-name", role, "--policy-arn", policy_arn],
    )
    .await?;
    Ok(())
}

async fn profile_roles(cli: &AwsCli, profile: &str) -> Result<Vec<String>> {
    let output = cli
        .run(
            "iam",
            &["get-instance-profile", "--instance-profile-name", profile],
        )
        .await?;
    Ok(items(&output, "/InstanceProfile/Roles")
        .iter()
        .filter_map(|r| text(r, "/RoleName"))
        .collect())
}

pub async fn add_role_to_profile(cli: &AwsCli, profile: &str, role: &str) -> Result<()> {
    if profile_roles(cli, profile).await?.iter().any(|r| r == role) {
        return Ok(());
    }
    cli.run(
        "iam",
        &[
            "add-role-to-instance-profile",
            "--instance-profile-name",
            profile,
            "--role-name",
            role,
        ],
    )
    .await?;
    Ok(())
}

pub async fn discover_roles(cli: &AwsCli, pattern: &str) -> Result<Vec<ResourceDescriptor>> {
    let output = cli.run("iam", &["list-roles"]).await?;
    Ok(items(&output, "/Roles")
        .iter()
        .filter_map(role_descriptor)
        .filter(|d| d.name.contains(pattern))
        .collect())
}

pub async fn discover_profiles(cli: &AwsCli, pattern: &str) -> Result<Vec<ResourceDescriptor>> {
    let output = cli.run("iam", &["list-instance-profiles"]).await?;
    Ok(items(&output, "/InstanceProfiles")
        .iter()
        .filter_map(profile_descriptor)
        .filter(|d| d.name.contains(pattern))
        .collect())
}

/// Detach managed policies, delete inline policies, leave instance profiles
pub async fn release_role(cli: &AwsCli, role: &str) -> Result<()> {
    for policy_arn in attached_policies(cli, role).await? {
        cli.run(
            "iam",
            &["detach-role-policy", "--role-name", role, "--policy-arn", &policy_arn],
        )
        .await?;
        tracing::debug!("Detached {} from {}", policy_arn, role);
    }

    let inline = cli
        .run("iam", &["list-role-policies", "--role-name", role])
        .await?;
    for name in items(&inline, "/PolicyNames").iter().filter_map(Value::as_str) {
        cli.run(
            "iam",
            &["delete-role-policy", "--role-name", role, "--policy-name", name],
        )
        .await?;
        tracing::debug!("Deleted inline policy {} from {}", name, role);
    }

    let profiles = cli
        .run(
            "iam",
            &["list-instance-profiles-for-role", "--role-name", role],
        )
        .await?;
    for profile in items(&profiles, "/InstanceProfiles")
        .iter()
        .filter_map(|p| text(p, "/InstanceProfileName"))
    {
        cli.run(
            "iam",
            &[
                "remove-role-from-instance-profile",
                "--instance-profile-name",
                &profile,
                "--role-name",
                role,
            ],
        )
        .await?;
        tracing::debug!("Removed {} from instance profile {}", role, profile);
    }
    Ok(())
}

pub async fn release_profile(cli: &AwsCli, profile: &str) -> Result<()> {
    for role in profile_roles(cli, profile).await? {
        cli.run(
            "iam",
            &[
                "remove-role-from-instance-profile",
                "--instance-profile-name",
                profile,
                "--role-name",
                &role,
            ],
        )
        .await?;
    }
    Ok(())
}

pub async fn delete_role(cli: &AwsCli, role: &str) -> Result<()> {
    cli.run("iam", &["delete-role", "--role-name", role]).await?;
    Ok(())
}

pub async fn delete_profile(cli: &AwsCli, profile: &str) -> Result<()> {
    cli.run(
        "iam",
        &["delete-instance-profile", "--instance-profile-name", profile],
    )
    .await?;
    Ok(())
}

fn unexpected(operation: &str, output: &Value) -> crate::error::AwsError {
    crate::error::AwsError::UnexpectedResponse(format!("{}: {}", operation, output))
}
