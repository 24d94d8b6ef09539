//! Azure AD access tokens for SQL connections.
//!
//! One client-credentials request per new connection. Tokens are not cached:
//! pooled connections stay authenticated after the token expires, and a new
//! connection simply asks for a new token.

use serde::Deserialize;
use tracing::debug;

use crate::error::ProviderError;

/// OAuth scope for Azure SQL Database.
pub const TOKEN_SCOPE: &str = "https://database.windows.net/.default";

const AUTHORITY: &str = "https://login.microsoftonline.com";

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

/// Token endpoint for a tenant.
pub fn token_url(tenant_id: &str) -> String {
    format!("{}/{}/oauth2/v2.0/token", AUTHORITY, tenant_id)
}

/// Request an access token for a service principal.
pub async fn acquire_token(
    http: &reqwest::Client,
    tenant_id: &str,
    client_id: &str,
    client_secret: &str,
) -> Result<String, ProviderError> {
    debug!(tenant_id, client_id, "requesting Azure AD token");
    let response = http
        .post(token_url(tenant_id))
        .form(&[
            ("grant_type", "client_credentials"),
            ("client_id", client_id),
            ("client_secret", client_secret),
            ("scope", TOKEN_SCOPE),
        ])
        .send()
        .await?
        .error_for_status()?;

    let token: TokenResponse = response.json().await?;
    if token.access_token.is_empty() {
        return Err(ProviderError::PermissionDenied(
            "Azure AD returned an empty access token".to_string(),
        ));
    }
    Ok(token.access_token)
}
