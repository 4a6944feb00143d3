//! SigV4 request signing
//!
//! Only the vector index request needs it: the search collection's data plane
//! has no CLI command, so the request goes over HTTPS. Credentials come from
//! the SDK's default chain (environment, profile, SSO, instance role), the
//! same sources the CLI reads.

use crate::error::{AwsError, Result};
use aws_config::{BehaviorVersion, Region};
use aws_credential_types::Credentials;
use aws_credential_types::provider::{ProvideCredentials, SharedCredentialsProvider};
use aws_sigv4::http_request::{
    PayloadChecksumKind, SignableBody, SignableRequest, SigningSettings, sign,
};
use aws_sigv4::sign::v4;
use std::time::SystemTime;

/// The default credential chain for `region`
pub async fn credentials_provider(region: &str) -> Result<SharedCredentialsProvider> {
    let config = aws_config::defaults(BehaviorVersion::latest())
        .region(Region::new(region.to_string()))
        .load()
        .await;
    config
        .credentials_provider()
        .ok_or_else(|| AwsError::Credentials("no credential provider configured".to_string()))
}

pub async fn resolve(provider: &SharedCredentialsProvider) -> Result<Credentials> {
    provider
        .provide_credentials()
        .await
        .map_err(|e| AwsError::Credentials(e.to_string()))
}

/// A request about to be signed; only these headers enter the signature
pub struct UnsignedRequest<'a> {
    pub method: &'a str,
    pub url: &'a str,
    pub headers: &'a [(&'a str, &'a str)],
    pub body: &'a [u8],
}

/// Headers to add to the request
///
/// `x-amz-date`, `x-amz-content-sha256`, the session token header when the
/// credentials carry one, and `authorization`.
pub fn signing_headers(
    request: &UnsignedRequest<'_>,
    credentials: Credentials,
    region: &str,
    service: &str,
    time: SystemTime,
) -> Result<Vec<(String, String)>> {
    let identity = credentials.into();
    let mut settings = SigningSettings::default();
    settings.payload_checksum_kind = PayloadChecksumKind::XAmzSha256;

    let params = v4::SigningParams::builder()
        .identity(&identity)
        .region(region)
        .name(service)
        .time(time)
        .settings(settings)
        .build()
        .map_err(|e| AwsError::Signing(e.to_string()))?
        .into();
    let signable = SignableRequest::new(
        request.method,
        request.url,
        request.headers.iter().copied(),
        SignableBody::Bytes(request.body),
    )
    .map_err(|e| AwsError::Signing(e.to_string()))?;

    let (instructions, _signature) = sign(signable, &params)
        .map_err(|e| AwsError::Signing(e.to_string()))?
        .into_parts();
    Ok(instructions
        .headers()
        .map(|(name, value)| (name.to_string(), value.to_string()))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, UNIX_EPOCH};

    fn credentials() -> Credentials {
        Credentials::new(
            "AKIDEXAMPLE",
            "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY",
            Some("token".to_string()),
            None,
            "test",
        )
    }

    fn header(headers: &[(String, String)], name: &str) -> String {
        headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.clone())
            .unwrap_or_else(|| panic!("missing {}", name))
    }

    #[test]
    fn test_signing_headers() {
        // 2025-01-02T03:04:05Z
        let time = UNIX_EPOCH + Duration::from_secs(1_735_787_045);
        let request = UnsignedRequest {
            method: "PUT",
            url: "https://abc123.us-west-2.aoss.amazonaws.com/demo-index",
            headers: &[("host", "abc123.us-west-2.aoss.amazonaws.com")],
            body: b"{}",
        };

        let headers = signing_headers(&request, credentials(), "us-west-2", "aoss", time).unwrap();

        assert_eq!(header(&headers, "x-amz-date"), "20250102T030405Z");
        assert_eq!(header(&headers, "x-amz-security-token"), "token");
        assert_eq!(
            header(&headers, "x-amz-content-sha256"),
            "44136fa355b3678a1146ad16f7e8649e94fb4fc21fe77e8310c060f61caaff8a"
        );
        let auth = header(&headers, "authorization");
        assert!(auth.starts_with(
            "AWS4-HMAC-SHA256 Credential=AKIDEXAMPLE/20250102/us-west-2/aoss/aws4_request"
        ));
        assert!(auth.contains("SignedHeaders=host;x-amz-content-sha256;x-amz-date"));

        // Deterministic for a fixed clock
        let again = signing_headers(&request, credentials(), "us-west-2", "aoss", time).unwrap();
        assert_eq!(headers, again);
    }

    #[test]
    fn test_escaped_path_signs() {
        let request = UnsignedRequest {
            method: "GET",
            url: "https://abc123.us-west-2.aoss.amazonaws.com/index%20with%20space",
            headers: &[("host", "abc123.us-west-2.aoss.amazonaws.com")],
            body: b"",
        };
        let headers =
            signing_headers(&request, credentials(), "us-west-2", "aoss", SystemTime::now())
                .unwrap();
        assert!(header(&headers, "authorization").contains("Signature="));
    }

    #[test]
    fn test_secret_is_not_printed() {
        assert!(!format!("{:?}", credentials()).contains("EXAMPLEKEY"));
    }
}
