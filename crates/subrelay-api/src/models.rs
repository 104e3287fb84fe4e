use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use subrelay_registry::{
    Credential, PublicKey, Registration, Scheme, SiteBinding, Subdomain, Variant,
};
use utoipa::ToSchema;

use crate::error::ApiError;

/// Register request body
///
/// Exactly `token`, `subdomain` and the credential field of the relay's
/// variant: `public_key` (ssh-key) or `scheme` (agent).
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct RegisterRequest {
    /// Pre-issued bearer token
    pub token: String,
    /// Desired subdomain (letters, digits, hyphen)
    pub subdomain: String,
    /// Base64 body of an `ssh-rsa` key (ssh-key variant)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
    /// `http` or `https` (agent variant)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheme: Option<String>,
}

const TOKEN_FIELD: &str = "token";
const SUBDOMAIN_FIELD: &str = "subdomain";

fn string_field<'a>(object: &'a Map<String, Value>, name: &str) -> Result<&'a str, ApiError> {
    match object.get(name) {
        Some(Value::String(s)) => Ok(s),
        Some(_) => Err(ApiError::MalformedBody(format!("{} must be a string", name))),
        None => Err(ApiError::MissingParameter(name.to_string())),
    }
}

impl RegisterRequest {
    /// Parse and validate a raw request body for the given variant
    pub fn parse(body: &[u8], variant: Variant) -> Result<Registration, ApiError> {
        let object: Map<String, Value> = serde_json::from_slice(body)
            .map_err(|e| ApiError::MalformedBody(e.to_string()))?;

        let credential_field = variant.credential_field();
        let allowed = [TOKEN_FIELD, SUBDOMAIN_FIELD, credential_field];
        if let Some(unknown) = object.keys().find(|k| !allowed.contains(&k.as_str())) {
            return Err(ApiError::UnknownParameter(unknown.clone()));
        }
        if let Some(missing) = allowed.iter().find(|k| !object.contains_key(**k)) {
            return Err(ApiError::MissingParameter(missing.to_string()));
        }

        let token = string_field(&object, TOKEN_FIELD)?;
        let raw_credential = string_field(&object, credential_field)?;
        let credential = match variant {
            Variant::SshKey => Credential::PublicKey(PublicKey::parse(raw_credential)?),
            Variant::Agent => Credential::Scheme(raw_credential.parse::<Scheme>()?),
        };
        let subdomain = Subdomain::parse(string_field(&object, SUBDOMAIN_FIELD)?)?;

        Ok(Registration {
            token: token.to_string(),
            subdomain,
            credential,
        })
    }
}

/// Result marker of the response envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum ResultKind {
    Success,
    Error,
}

/// Resolved binding returned on success
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct RegisterData {
    /// Tunnel port assigned to the token
    pub port: u16,
    pub subdomain: String,
    /// Only reported by agent relays
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheme: Option<String>,
}

impl RegisterData {
    pub fn from_binding(binding: &SiteBinding, variant: Variant) -> Self {
        Self {
            port: binding.port,
            subdomain: binding.subdomain.to_string(),
            scheme: match variant {
                Variant::Agent => Some(binding.scheme.to_string()),
                Variant::SshKey => None,
            },
        }
    }
}

/// Response envelope shared by success and error replies
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct RegisterResponse {
    pub result: ResultKind,
    pub msg: Vec<String>,
    pub data: Option<RegisterData>,
}

impl RegisterResponse {
    pub fn success(data: RegisterData) -> Self {
        Self {
            result: ResultKind::Success,
            msg: Vec::new(),
            data: Some(data),
        }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            result: ResultKind::Error,
            msg: vec![msg.into()],
            data: None,
        }
    }
}

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    /// Size of the token allow-list
    pub tokens: usize,
    pub variant: String,
}
