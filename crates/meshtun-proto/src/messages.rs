//! Protocol message types
//!
//! Field names follow the JSON contract shared with relay nodes and the
//! registry, hence the explicit renames.

use serde::{Deserialize, Serialize};

/// Payload of a client-authorize-request frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizeRequest {
    /// Operating system of the client (e.g. "linux", "macos", "windows")
    pub platform: String,
    pub version: String,
    pub key: String,
}

impl AuthorizeRequest {
    /// Build a request describing the running host
    pub fn for_host(key: impl Into<String>) -> Self {
        Self {
            platform: platform_id().to_string(),
            version: crate::PROTOCOL_VERSION.to_string(),
            key: key.into(),
        }
    }
}

/// Payload of a server-authorize-response frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizeResponse {
    #[serde(rename = "accessIP")]
    pub access_ip: String,
    pub gateway: String,
    /// Route manifest URL; empty when the relay has none
    #[serde(rename = "routeScriptUrl", default)]
    pub route_script_url: String,
}

impl AuthorizeResponse {
    pub fn route_url(&self) -> Option<&str> {
        let url = self.route_script_url.trim();
        (!url.is_empty()).then_some(url)
    }
}

/// Registry discovery request body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessRequest {
    #[serde(rename = "authToken")]
    pub auth_token: String,
    #[serde(rename = "isWindows", default)]
    pub is_windows: bool,
}

/// Registry discovery answer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessResponse {
    #[serde(rename = "serverAddress")]
    pub server_address: String,
}

/// Envelope used by every registry response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub data: Option<T>,
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            data: Some(data),
            error: None,
        }
    }

    pub fn err(error: impl Into<String>) -> Self {
        Self {
            data: None,
            error: Some(error.into()),
        }
    }

    /// Convert into a `Result`, treating a present error as failure
    pub fn into_result(self) -> Result<Option<T>, String> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.data),
        }
    }
}

/// Platform identifier advertised by this build
pub fn platform_id() -> &'static str {
    std::env::consts::OS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_authorize_response_field_names() {
        let json = r#"{"accessIP":"10.8.0.5","gateway":"10.8.0.1","routeScriptUrl":""}"#;
        let resp: AuthorizeResponse = serde_json::from_str(json).unwrap();
        assert_eq!(resp.access_ip, "10.8.0.5");
        assert_eq!(resp.gateway, "10.8.0.1");
        assert_eq!(resp.route_url(), None);

        let encoded = serde_json::to_value(&resp).unwrap();
        assert_eq!(encoded["accessIP"], "10.8.0.5");
        assert!(encoded.get("access_ip").is_none());
    }

    #[test]
    fn test_authorize_response_missing_route_url() {
        let json = r#"{"accessIP":"10.8.0.5","gateway":"10.8.0.1"}"#;
        let resp: AuthorizeResponse = serde_json::from_str(json).unwrap();
        assert!(resp.route_script_url.is_empty());
    }

    #[test]
    fn test_access_request_field_names() {
        let req: AccessRequest =
            serde_json::from_str(r#"{"authToken":"abcdefg","isWindows":false}"#).unwrap();
        assert_eq!(req.auth_token, "abcdefg");
        assert!(!req.is_windows);
    }

    #[test]
    fn test_api_response_shapes() {
        let ok = ApiResponse::ok(AccessResponse {
            server_address: "1.2.3.4:9000".to_string(),
        });
        let value = serde_json::to_value(&ok).unwrap();
        assert_eq!(value["data"]["serverAddress"], "1.2.3.4:9000");
        assert!(value["error"].is_null());

        let err: ApiResponse<AccessResponse> = ApiResponse::err("auth fail");
        let value = serde_json::to_value(&err).unwrap();
        assert!(value["data"].is_null());
        assert_eq!(value["error"], "auth fail");
        assert_eq!(err.into_result(), Err("auth fail".to_string()));
    }

    #[test]
    fn test_authorize_request_for_host() {
        let req = AuthorizeRequest::for_host("secret");
        assert_eq!(req.platform, std::env::consts::OS);
        assert_eq!(req.key, "secret");
        assert!(!req.version.is_empty());
    }
}
