//! aws CLI wrapper
//!
//! Every control-plane call goes through `aws <service> <args> --region <r>
//! --output json`. Failures are parsed into an [`AwsError::Api`] carrying the
//! error code the CLI printed on stderr.

use crate::error::{AwsError, Result};
use serde_json::Value;
use std::collections::BTreeMap;
use std::process::Stdio;
use tokio::process::Command;

const ERROR_MARKER: &str = "An error occurred (";

/// aws CLI wrapper
pub struct AwsCli {
    region: String,
    program: String,
}

impl AwsCli {
    pub fn new(region: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            program: "aws".to_string(),
        }
    }

    /// Use a different executable (a wrapper script, a pinned install)
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    /// Check that the CLI is installed
    pub async fn check_installed(&self) -> Result<()> {
        let output = Command::new(&self.program)
            .arg("--version")
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await;

        match output {
            Ok(out) if out.status.success() => Ok(()),
            Ok(_) => Err(AwsError::CliNotFound),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(AwsError::CliNotFound),
            Err(e) => Err(e.into()),
        }
    }

    /// Run an aws command and parse its JSON output
    ///
    /// Commands with no output (most deletes) yield `Value::Null`.
    pub async fn run(&self, service: &str, args: &[&str]) -> Result<Value> {
        let stdout = self.run_raw(service, args).await?;
        if stdout.trim().is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&stdout)?)
    }

    /// Like [`run`](Self::run), mapping a not-found error code to `None`
    pub async fn run_optional(&self, service: &str, args: &[&str]) -> Result<Option<Value>> {
        match self.run(service, args).await {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Run an aws command and return stdout
    pub async fn run_raw(&self, service: &str, args: &[&str]) -> Result<String> {
        let mut cmd = Command::new(&self.program);
        cmd.arg(service);
        cmd.args(args);
        cmd.arg("--region").arg(&self.region);
        cmd.arg("--output").arg("json");
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        tracing::debug!(
            "Running: aws {} {} --region {}",
            service,
            args.join(" "),
            self.region
        );

        let output = match cmd.output().await {
            Ok(output) => output,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(AwsError::CliNotFound);
            }
            Err(e) => return Err(e.into()),
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(parse_failure(&stderr));
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

/// Turn CLI stderr into an error, extracting `(Code)` when present
pub fn parse_failure(stderr: &str) -> AwsError {
    if let Some(start) = stderr.find(ERROR_MARKER) {
        let rest = &stderr[start + ERROR_MARKER.len()..];
        if let Some(end) = rest.find(')') {
            let code = rest[..end].to_string();
            let tail = &rest[end + 1..];
            let message = match tail.split_once(": ") {
                Some((_, message)) => message.trim(),
                None => tail.trim(),
            };
            return AwsError::Api {
                code,
                message: message.to_string(),
            };
        }
    }
    AwsError::CommandFailed(stderr.trim().to_string())
}

/// String at a JSON pointer
pub fn text(value: &Value, pointer: &str) -> Option<String> {
    value
        .pointer(pointer)
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// Array at a JSON pointer, empty when missing
pub fn items<'a>(value: &'a Value, pointer: &str) -> &'a [Value] {
    value
        .pointer(pointer)
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

/// EC2 / ELB style `[{Key, Value}]` tags as a map
pub fn tag_map(tags: &[Value]) -> BTreeMap<String, String> {
    tags.iter()
        .filter_map(|t| Some((text(t, "/Key")?, text(t, "/Value")?)))
        .collect()
}

/// `--tag-specifications` value carrying a Name tag
pub fn name_tag_spec(resource_type: &str, name: &str) -> String {
    serde_json::json!([{
        "ResourceType": resource_type,
        "Tags": [{ "Key": "Name", "Value": name }]
    }])
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_failure_with_code() {
        let stderr = "\nAn error occurred (NoSuchEntity) when calling the GetRole operation: \
                      The role with name role-ec2-for-demo cannot be found.\n";
        match parse_failure(stderr) {
            AwsError::Api { code, message } => {
                assert_eq!(code, "NoSuchEntity");
                assert_eq!(message, "The role with name role-ec2-for-demo cannot be found.");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_parse_failure_head_bucket() {
        let stderr = "An error occurred (404) when calling the HeadBucket operation: Not Found";
        let err = parse_failure(stderr);
        assert!(err.is_not_found());
    }

    #[test]
    fn test_parse_failure_without_code() {
        let err = parse_failure(
            "Unable to locate credentials. \
             You can configure credentials by running \"aws configure\".",
        );
        assert!(matches!(err, AwsError::CommandFailed(_)));
    }

    #[test]
    fn test_json_helpers() {
        let value = serde_json::json!({
            "Vpcs": [{
                "VpcId": "vpc-1",
                "Tags": [{"Key": "Name", "Value": "vpc-for-demo"}]
            }]
        });
        let vpcs = items(&value, "/Vpcs");
        assert_eq!(vpcs.len(), 1);
        assert_eq!(text(&vpcs[0], "/VpcId").as_deref(), Some("vpc-1"));
        assert_eq!(tag_map(items(&vpcs[0], "/Tags"))["Name"], "vpc-for-demo");
        assert!(items(&value, "/Subnets").is_empty());
    }

    #[test]
    fn test_name_tag_spec() {
        let spec: Value = serde_json::from_str(&name_tag_spec("vpc", "vpc-for-demo")).unwrap();
        assert_eq!(spec[0]["ResourceType"], "vpc");
        assert_eq!(spec[0]["Tags"][0]["Value"], "vpc-for-demo");
    }
}
