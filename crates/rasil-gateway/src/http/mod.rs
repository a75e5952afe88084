pub mod conversations;
pub mod errors;
pub mod health;
pub mod inbox;
pub mod webhooks;

use std::sync::Arc;

use axum::http::HeaderMap;
use rasil_core::types::LicenseId;
use rasil_store::licenses::{validate_license_key, Validation};

use crate::app::AppState;
use self::errors::ApiError;

/// Resolve the tenant from the `X-License-Key` header. Every operator-facing
/// route goes through this; webhooks authenticate differently.
pub async fn license_from_headers(
    state: &Arc<AppState>,
    headers: &HeaderMap,
) -> Result<LicenseId, ApiError> {
    let key = headers
        .get("x-license-key")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(ApiError::auth_required)?;

    match validate_license_key(&state.db, key).await? {
        Validation::Valid { license_id, .. } => Ok(license_id),
        Validation::Invalid { reason } => Err(ApiError::forbidden(reason)),
    }
}
