use serde::Deserialize;

use crate::{Result, SwiftError};

/// Keystone protocol generation, selected by the `/vN` suffix of the auth URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthVersion {
    V1,
    V2,
    V3,
}

impl AuthVersion {
    /// Parse the version from the trailing path segment of the auth URL.
    /// Accepts `/v1`, `/v2`, `/v3` and their `.0` forms.
    pub fn from_url(url: &str) -> Result<Self> {
        let last = url
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or_default();
        match last {
            "v1" | "v1.0" => Ok(AuthVersion::V1),
            "v2" | "v2.0" => Ok(AuthVersion::V2),
            "v3" | "v3.0" => Ok(AuthVersion::V3),
            _ => Err(SwiftError::AuthVersion(url.to_string())),
        }
    }
}

/// Everything needed to (re-)authenticate against the object store.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub api_key: String,
    pub auth_url: String,
    /// Required for v3.
    pub domain: Option<String>,
    /// Required for v2.
    pub tenant: Option<String>,
}

/// A live token plus the storage endpoint it is valid for.
#[derive(Debug, Clone)]
pub struct AuthSession {
    pub storage_url: String,
    pub token: String,
}

// ---------------------------------------------------------------------------
// Keystone response bodies (only the fields we read)
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct V2AuthResponse {
    access: V2Access,
}

#[derive(Deserialize)]
struct V2Access {
    token: V2Token,
    #[serde(rename = "serviceCatalog", default)]
    service_catalog: Vec<V2Service>,
}

#[derive(Deserialize)]
struct V2Token {
    id: String,
}

#[derive(Deserialize)]
struct V2Service {
    #[serde(rename = "type")]
    service_type: String,
    #[serde(default)]
    endpoints: Vec<V2Endpoint>,
}

#[derive(Deserialize)]
struct V2Endpoint {
    #[serde(rename = "publicURL")]
    public_url: String,
}

#[derive(Deserialize)]
struct V3AuthResponse {
    token: V3Token,
}

#[derive(Deserialize)]
struct V3Token {
    #[serde(default)]
    catalog: Vec<V3Service>,
}

#[derive(Deserialize)]
struct V3Service {
    #[serde(rename = "type")]
    service_type: String,
    #[serde(default)]
    endpoints: Vec<V3Endpoint>,
}

#[derive(Deserialize)]
struct V3Endpoint {
    interface: String,
    url: String,
}

// ---------------------------------------------------------------------------
// Token negotiation
// ---------------------------------------------------------------------------

/// Obtain a token and storage URL for `creds`, speaking whichever auth
/// generation the URL names.
pub fn authenticate(agent: &ureq::Agent, creds: &Credentials) -> Result<AuthSession> {
    match AuthVersion::from_url(&creds.auth_url)? {
        AuthVersion::V1 => authenticate_v1(agent, creds),
        AuthVersion::V2 => authenticate_v2(agent, creds),
        AuthVersion::V3 => authenticate_v3(agent, creds),
    }
}

fn authenticate_v1(agent: &ureq::Agent, creds: &Credentials) -> Result<AuthSession> {
    let resp = agent
        .get(&creds.auth_url)
        .set("X-Auth-User", &creds.username)
        .set("X-Auth-Key", &creds.api_key)
        .call()
        .map_err(|e| SwiftError::Auth(e.to_string()))?;

    let storage_url = required_header(&resp, "X-Storage-Url")?;
    let token = required_header(&resp, "X-Auth-Token")?;
    Ok(AuthSession { storage_url, token })
}

fn authenticate_v2(agent: &ureq::Agent, creds: &Credentials) -> Result<AuthSession> {
    let tenant = creds
        .tenant
        .as_deref()
        .ok_or_else(|| SwiftError::Credentials("v2 auth requires a tenant name".into()))?;

    let url = format!("{}/tokens", creds.auth_url.trim_end_matches('/'));
    let body = serde_json::json!({
        "auth": {
            "passwordCredentials": {
                "username": creds.username,
                "password": creds.api_key,
            },
            "tenantName": tenant,
        }
    });

    let resp = agent
        .post(&url)
        .send_json(body)
        .map_err(|e| SwiftError::Auth(e.to_string()))?;
    let parsed: V2AuthResponse = resp
        .into_json()
        .map_err(|e| malformed("v2 auth", e.to_string()))?;

    let storage_url = parsed
        .access
        .service_catalog
        .iter()
        .find(|s| s.service_type == "object-store")
        .and_then(|s| s.endpoints.first())
        .map(|e| e.public_url.clone())
        .ok_or_else(|| malformed("v2 auth", "no object-store endpoint in catalog".into()))?;

    Ok(AuthSession {
        storage_url,
        token: parsed.access.token.id,
    })
}

fn authenticate_v3(agent: &ureq::Agent, creds: &Credentials) -> Result<AuthSession> {
    let domain = creds
        .domain
        .as_deref()
        .ok_or_else(|| SwiftError::Credentials("v3 auth requires a domain name".into()))?;

    let url = format!("{}/auth/tokens", creds.auth_url.trim_end_matches('/'));
    let body = serde_json::json!({
        "auth": {
            "identity": {
                "methods": ["password"],
                "password": {
                    "user": {
                        "name": creds.username,
                        "domain": { "name": domain },
                        "password": creds.api_key,
                    }
                }
            },
            "scope": { "domain": { "name": domain } },
        }
    });

    let resp = agent
        .post(&url)
        .send_json(body)
        .map_err(|e| SwiftError::Auth(e.to_string()))?;
    let token = required_header(&resp, "X-Subject-Token")?;
    let parsed: V3AuthResponse = resp
        .into_json()
        .map_err(|e| malformed("v3 auth", e.to_string()))?;

    let storage_url = parsed
        .token
        .catalog
        .iter()
        .find(|s| s.service_type == "object-store")
        .and_then(|s| s.endpoints.iter().find(|e| e.interface == "public"))
        .map(|e| e.url.clone())
        .ok_or_else(|| malformed("v3 auth", "no public object-store endpoint in catalog".into()))?;

    Ok(AuthSession { storage_url, token })
}

fn required_header(resp: &ureq::Response, name: &str) -> Result<String> {
    resp.header(name)
        .map(|v| v.to_string())
        .ok_or_else(|| malformed("auth", format!("response missing {name} header")))
}

fn malformed(op: &str, message: String) -> SwiftError {
    SwiftError::MalformedResponse {
        op: op.to_string(),
        message,
    }
}
