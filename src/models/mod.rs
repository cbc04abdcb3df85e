// src/models/mod.rs

pub mod approval;
pub mod loan;
pub mod subscription;

use serde::{Deserialize, Serialize};

// ─── JWT Claims ───────────────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    /// User id
    pub sub: String,
    pub name: String,
    /// Commercial partner the user acts for on the portal
    pub partner_id: String,
    #[serde(default)]
    pub groups: Vec<String>,
    pub exp: usize,
    pub iat: usize,
}
