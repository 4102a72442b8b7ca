use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Access-token payload. Carries denormalized identity fields so downstream
/// handlers can build a principal without a database round-trip.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessClaims {
    pub sub: Uuid,
    pub username: String,
    pub email: String,
    pub full_name: String,
    pub iat: usize,
    pub exp: usize,
    pub iss: String,
}

/// Refresh-token payload. Subject only; everything else is looked up at
/// rotation time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshClaims {
    pub sub: Uuid,
    pub iat: usize,
    pub exp: usize,
    pub iss: String,
}
