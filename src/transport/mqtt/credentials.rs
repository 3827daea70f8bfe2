//! Credential material for the bridge: signing key, tokens and CA bundle

use super::connection::MqttError;
use crate::config::IotCoreSection;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info};

/// Public CA bundle fetched when `ca_certs_path` does not exist yet
pub const CA_CERTS_URL: &str = "https://pki.google.com/roots.pem";

/// Token lifetime in minutes
pub const TOKEN_LIFETIME_MINUTES: i64 = 60;

/// Claims of the connection token
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Claims {
    pub iat: i64,
    pub exp: i64,
    pub aud: String,
}

impl Claims {
    pub fn new(project_id: &str) -> Self {
        let now = chrono::Utc::now();
        Self {
            iat: now.timestamp(),
            exp: (now + chrono::Duration::minutes(TOKEN_LIFETIME_MINUTES)).timestamp(),
            aud: project_id.to_string(),
        }
    }
}

/// PEM private key from the inline value, or else from `private_key_path`
pub async fn load_private_key(section: &IotCoreSection) -> Result<Vec<u8>, MqttError> {
    if let Some(key) = &section.private_key {
        return Ok(key.as_bytes().to_vec());
    }

    let path = section
        .private_key_path
        .as_ref()
        .ok_or_else(|| MqttError::Credentials("no private key configured".to_string()))?;

    tokio::fs::read(path).await.map_err(|e| {
        MqttError::Credentials(format!("failed to read private key {}: {e}", path.display()))
    })
}

/// Sign an RS256 token for the given project
pub fn create_jwt(project_id: &str, private_key_pem: &[u8]) -> Result<String, MqttError> {
    let key = EncodingKey::from_rsa_pem(private_key_pem)
        .map_err(|e| MqttError::Credentials(format!("invalid private key: {e}")))?;

    let token = encode(&Header::new(Algorithm::RS256), &Claims::new(project_id), &key)
        .map_err(|e| MqttError::Credentials(format!("failed to sign token: {e}")))?;

    debug!(project_id, "Issued connection token");
    Ok(token)
}

/// CA bundle at `path`, downloaded from [`CA_CERTS_URL`] if missing
pub async fn load_ca_certs(path: &Path) -> Result<Vec<u8>, MqttError> {
    load_ca_certs_from(path, CA_CERTS_URL).await
}

pub async fn load_ca_certs_from(path: &Path, url: &str) -> Result<Vec<u8>, MqttError> {
    if tokio::fs::try_exists(path).await.unwrap_or(false) {
        return tokio::fs::read(path).await.map_err(|e| {
            MqttError::CaCertificates(format!("failed to read {}: {e}", path.display()))
        });
    }

    info!(url, path = %path.display(), "Downloading CA certificates");
    let response = reqwest::get(url)
        .await
        .and_then(|response| response.error_for_status())
        .map_err(|e| MqttError::CaCertificates(format!("failed to download {url}: {e}")))?;
    let certs = response
        .bytes()
        .await
        .map_err(|e| MqttError::CaCertificates(format!("failed to download {url}: {e}")))?;

    tokio::fs::write(path, &certs).await.map_err(|e| {
        MqttError::CaCertificates(format!("failed to write {}: {e}", path.display()))
    })?;

    Ok(certs.to_vec())
}
