//! Policy documents
//!
//! Trust policies, inline policy sets, the search collection policies, the
//! bucket policy for the distribution and the vector index definition.

use crate::naming::{EMBEDDING_DIMENSIONS, RunConfig};
use agentstack_cloud::InlinePolicy;
use serde_json::{Value, json};

const VERSION: &str = "2012-10-17";

pub const AGENT_MANAGED_POLICIES: [&str; 1] = ["arn:aws:iam::aws:policy/AWSLambdaExecute"];

pub const COMPUTE_MANAGED_POLICIES: [&str; 2] = [
    "arn:aws:iam::aws:policy/CloudWatchAgentServerPolicy",
    "arn:aws:iam::aws:policy/AmazonSSMManagedInstanceCore",
];

fn trust(services: Value) -> Value {
    json!({
        "Version": VERSION,
        "Statement": [{
            "Effect": "Allow",
            "Principal": { "Service": services },
            "Action": "sts:AssumeRole"
        }]
    })
}

fn allow(actions: &[&str], resources: Value) -> Value {
    json!({
        "Version": VERSION,
        "Statement": [{
            "Effect": "Allow",
            "Action": actions,
            "Resource": resources
        }]
    })
}

fn allow_all(actions: &[&str]) -> Value {
    allow(actions, json!(["*"]))
}

/// Assumable by the Bedrock service
pub fn bedrock_trust() -> Value {
    trust(json!("bedrock.amazonaws.com"))
}

/// Assumable by EC2 and Bedrock
pub fn compute_trust() -> Value {
    trust(json!(["ec2.amazonaws.com", "bedrock.amazonaws.com"]))
}

pub fn knowledge_base_policies(run: &RunConfig) -> Vec<InlinePolicy> {
    let p = &run.project_name;
    vec![
        InlinePolicy::new(
            format!("bedrock-invoke-policy-for-{}", p),
            allow(
                &[
                    "bedrock:*",
                    "bedrock:InvokeModel",
                    "bedrock:InvokeModelWithResponseStream",
                    "bedrock:GetInferenceProfile",
                    "bedrock:GetFoundationModel",
                ],
                json!([
                    "*",
                    format!(
                        "arn:aws:bedrock:{}:{}:inference-profile/*",
                        run.region, run.account_id
                    ),
                    format!("arn:aws:bedrock:{}:*:inference-profile/*", run.region),
                    "arn:aws:bedrock:*::foundation-model/*"
                ]),
            ),
        ),
        InlinePolicy::new(
            format!("knowledge-base-s3-policy-for-{}", p),
            allow_all(&["s3:*"]),
        ),
        InlinePolicy::new(
            format!("bedrock-agent-opensearch-policy-for-{}", p),
            allow_all(&["aoss:APIAccessAll"]),
        ),
        InlinePolicy::new(
            format!("bedrock-agent-bedrock-policy-for-{}", p),
            allow(
                &["bedrock:*", "bedrock:GetInferenceProfile"],
                json!([
                    "*",
                    format!("arn:aws:bedrock:{}:*:inference-profile/*", run.region)
                ]),
            ),
        ),
    ]
}

pub fn agent_policies(run: &RunConfig) -> Vec<InlinePolicy> {
    let p = &run.project_name;
    vec![
        InlinePolicy::new(
            format!("bedrock-retrieve-policy-for-{}", p),
            allow(
                &["bedrock:Retrieve"],
                json!([format!(
                    "arn:aws:bedrock:{}:{}:knowledge-base/*",
                    run.region, run.account_id
                )]),
            ),
        ),
        InlinePolicy::new(
            format!("agent-inference-policy-for-{}", p),
            allow(
                &[
                    "bedrock:InvokeModel",
                    "bedrock:InvokeModelWithResponseStream",
                    "bedrock:GetInferenceProfile",
                    "bedrock:GetFoundationModel",
                ],
                json!([
                    format!(
                        "arn:aws:bedrock:{}:{}:inference-profile/*",
                        run.region, run.account_id
                    ),
                    "arn:aws:bedrock:*::foundation-model/*"
                ]),
            ),
        ),
        InlinePolicy::new(
            format!("lambda-invoke-policy-for-{}", p),
            allow_all(&["lambda:InvokeFunction", "cloudwatch:*"]),
        ),
        InlinePolicy::new(
            format!("bedrock-policy-agent-for-{}", p),
            allow_all(&["bedrock:*"]),
        ),
    ]
}

/// Inline policies of the compute role; `pass-role` is scoped to the
/// knowledge-base role
pub fn compute_policies(run: &RunConfig, knowledge_base_role_arn: &str) -> Vec<InlinePolicy> {
    let p = &run.project_name;
    let bedrock = json!({
        "Version": VERSION,
        "Statement": [
            { "Effect": "Allow", "Action": ["bedrock:*"], "Resource": ["*"] },
            {
                "Effect": "Allow",
                "Action": ["bedrock:InvokeModel", "bedrock:InvokeModelWithResponseStream"],
                "Resource": [
                    "arn:aws:bedrock:*:*:inference-profile/*",
                    "arn:aws:bedrock:us-west-2:*:foundation-model/*",
                    "arn:aws:bedrock:us-east-1:*:foundation-model/*",
                    "arn:aws:bedrock:us-east-2:*:foundation-model/*",
                    "arn:aws:bedrock:ap-northeast-2:*:foundation-model/*"
                ]
            }
        ]
    });

    vec![
        InlinePolicy::new(
            format!("secret-manager-policy-ec2-for-{}", p),
            allow_all(&["secretsmanager:GetSecretValue"]),
        ),
        InlinePolicy::new(
            format!("pvre-policy-ec2-for-{}", p),
            allow_all(&["ssm:*", "ssmmessages:*", "ec2messages:*", "tag:*"]),
        ),
        InlinePolicy::new(format!("bedrock-policy-ec2-for-{}", p), bedrock),
        InlinePolicy::new(
            format!("cost-explorer-policy-for-{}", p),
            allow_all(&["ce:GetCostAndUsage"]),
        ),
        InlinePolicy::new(format!("ec2-policy-for-{}", p), allow_all(&["ec2:*"])),
        InlinePolicy::new(
            format!("lambda-invoke-policy-for-{}", p),
            allow_all(&["lambda:InvokeFunction"]),
        ),
        InlinePolicy::new(
            format!("efs-policy-for-{}", p),
            allow_all(&["ec2:DescribeFileSystems", "elasticfilesystem:DescribeFileSystems"]),
        ),
        InlinePolicy::new(
            format!("cognito-policy-for-{}", p),
            allow_all(&[
                "cognito-idp:ListUserPools",
                "cognito-idp:DescribeUserPool",
                "cognito-idp:ListUserPoolClients",
                "cognito-idp:DescribeUserPoolClient",
            ]),
        ),
        InlinePolicy::new(
            format!("bedrock-agentcore-policy-for-{}", p),
            allow_all(&["bedrock-agentcore:*"]),
        ),
        InlinePolicy::new(
            format!("pass-role-for-{}", p),
            allow(&["iam:PassRole"], json!([knowledge_base_role_arn])),
        ),
        InlinePolicy::new(format!("aoss-policy-for-{}", p), allow_all(&["aoss:*"])),
        InlinePolicy::new(format!("getRole-policy-for-{}", p), allow_all(&["iam:GetRole"])),
        InlinePolicy::new(
            format!("s3-bucket-access-policy-for-{}", p),
            allow_all(&["s3:*"]),
        ),
        InlinePolicy::new(
            format!("cloudwatch-logs-policy-for-{}", p),
            allow_all(&[
                "logs:DescribeLogGroups",
                "logs:DescribeLogStreams",
                "logs:GetLogEvents",
                "logs:FilterLogEvents",
                "logs:GetLogGroupFields",
                "logs:GetLogRecord",
                "logs:GetQueryResults",
                "logs:StartQuery",
                "logs:StopQuery",
            ]),
        ),
    ]
}

// ---- search collection ----

pub fn encryption_policy(run: &RunConfig) -> Value {
    json!({
        "Rules": [{
            "ResourceType": "collection",
            "Resource": [format!("collection/{}", run.collection_name())]
        }],
        "AWSOwnedKey": true
    })
}

pub fn network_policy(run: &RunConfig) -> Value {
    let resource = json!([format!("collection/{}", run.collection_name())]);
    json!([{
        "Rules": [
            { "ResourceType": "dashboard", "Resource": resource },
            { "ResourceType": "collection", "Resource": resource }
        ],
        "AllowFromPublic": true
    }])
}

/// Data access for the account root and the given role ARNs
pub fn data_access_principals(run: &RunConfig, role_arns: &[&str]) -> Vec<String> {
    std::iter::once(run.account_root_arn())
        .chain(role_arns.iter().map(|arn| arn.to_string()))
        .collect()
}

pub fn data_access_policy(run: &RunConfig, principals: &[String]) -> Value {
    let collection = run.collection_name();
    json!([{
        "Rules": [
            {
                "Resource": [format!("collection/{}", collection)],
                "Permission": [
                    "aoss:CreateCollectionItems",
                    "aoss:DeleteCollectionItems",
                    "aoss:UpdateCollectionItems",
                    "aoss:DescribeCollectionItems"
                ],
                "ResourceType": "collection"
            },
            {
                "Resource": [format!("index/{}/*", collection)],
                "Permission": [
                    "aoss:CreateIndex",
                    "aoss:DeleteIndex",
                    "aoss:UpdateIndex",
                    "aoss:DescribeIndex",
                    "aoss:ReadDocument",
                    "aoss:WriteDocument"
                ],
                "ResourceType": "index"
            }
        ],
        "Principal": principals
    }])
}

/// k-NN index the knowledge base writes its embeddings into
pub fn vector_index_body() -> Value {
    json!({
        "settings": {
            "index": {
                "knn": true,
                "knn.algo_param.ef_search": 512
            }
        },
        "mappings": {
            "properties": {
                "vector_field": {
                    "type": "knn_vector",
                    "dimension": EMBEDDING_DIMENSIONS,
                    "method": {
                        "name": "hnsw",
                        "engine": "faiss",
                        "space_type": "cosinesimil",
                        "parameters": { "ef_construction": 512, "m": 16 }
                    }
                },
                "AMAZON_BEDROCK_TEXT": { "type": "text" },
                "AMAZON_BEDROCK_METADATA": { "type": "text" }
            }
        }
    })
}

/// Read access to the bucket for the distribution's origin access identity
pub fn bucket_policy(bucket: &str, oai_id: &str) -> Value {
    json!({
        "Version": VERSION,
        "Statement": [{
            "Sid": "AllowCloudFrontAccess",
            "Effect": "Allow",
            "Principal": {
                "AWS": format!(
                    "arn:aws:iam::cloudfront:user/CloudFront Origin Access Identity {}",
                    oai_id
                )
            },
            "Action": "s3:GetObject",
            "Resource": format!("arn:aws:s3:::{}/*", bucket)
        }]
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run() -> RunConfig {
        RunConfig::new("demo", "us-west-2", "111122223333")
    }

    #[test]
    fn test_trust_principals() {
        assert_eq!(
            bedrock_trust()["Statement"][0]["Principal"]["Service"],
            "bedrock.amazonaws.com"
        );
        assert_eq!(
            compute_trust()["Statement"][0]["Principal"]["Service"],
            json!(["ec2.amazonaws.com", "bedrock.amazonaws.com"])
        );
    }

    #[test]
    fn test_compute_pass_role_is_scoped() {
        let kb_arn = "arn:aws:iam::111122223333:role/role-knowledge-base-for-demo-us-west-2";
        let policies = compute_policies(&run(), kb_arn);
        assert_eq!(policies.len(), 14);

        let pass_role = policies
            .iter()
            .find(|p| p.name == "pass-role-for-demo")
            .unwrap();
        assert_eq!(pass_role.document["Statement"][0]["Resource"], json!([kb_arn]));
    }

    #[test]
    fn test_policy_sets_are_named_per_project() {
        let run = run();
        for policy in knowledge_base_policies(&run)
            .iter()
            .chain(agent_policies(&run).iter())
        {
            assert!(policy.name.ends_with("-for-demo"), "{}", policy.name);
        }
    }

    #[test]
    fn test_data_access_principals() {
        let run = run();
        let principals = data_access_principals(&run, &["arn:ec2", "arn:kb"]);
        assert_eq!(principals[0], "arn:aws:iam::111122223333:root");

        let doc = data_access_policy(&run, &principals);
        assert_eq!(doc[0]["Principal"].as_array().unwrap().len(), 3);
        assert_eq!(doc[0]["Rules"][1]["Resource"][0], "index/demo/*");
    }

    #[test]
    fn test_network_policy_allows_public() {
        let doc = network_policy(&run());
        assert_eq!(doc[0]["AllowFromPublic"], true);
        assert_eq!(doc[0]["Rules"][0]["ResourceType"], "dashboard");
    }

    #[test]
    fn test_bucket_policy_grants_oai() {
        let doc = bucket_policy("storage-for-demo", "E2ABC");
        let statement = &doc["Statement"][0];
        assert_eq!(statement["Sid"], "AllowCloudFrontAccess");
        assert_eq!(
            statement["Principal"]["AWS"],
            "arn:aws:iam::cloudfront:user/CloudFront Origin Access Identity E2ABC"
        );
        assert_eq!(statement["Resource"], "arn:aws:s3:::storage-for-demo/*");
    }

    #[test]
    fn test_vector_index_dimension() {
        let body = vector_index_body();
        let field = &body["mappings"]["properties"]["vector_field"];
        assert_eq!(field["dimension"], 1024);
        assert_eq!(field["method"]["engine"], "faiss");
        assert_eq!(body["settings"]["index"]["knn.algo_param.ef_search"], 512);
    }
}
