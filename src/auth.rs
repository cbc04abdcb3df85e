// src/auth.rs

use crate::{
    errors::AppError,
    models::{Claims, approval::Approver},
    state::AppState,
};
use axum::{
    extract::{FromRequestParts, OptionalFromRequestParts},
    http::{HeaderMap, request::Parts},
};
use jsonwebtoken::{DecodingKey, Validation, decode};
use uuid::Uuid;

/// Authenticated user extractor.
/// Add `auth: AuthUser` as a parameter in any handler that requires authentication.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user: Approver,
    /// Partner the user acts for on the portal
    pub partner_id: Uuid,
}

fn bearer_token(headers: &HeaderMap) -> Result<Option<&str>, AppError> {
    let Some(auth_header) = headers.get("Authorization") else {
        return Ok(None);
    };
    let auth_header = auth_header
        .to_str()
        .map_err(|_| AppError::Unauthorized("Invalid Authorization header".to_string()))?;
    let token = auth_header
        .strip_prefix("Bearer ")
        .ok_or_else(|| AppError::Unauthorized("Invalid Authorization format".to_string()))?;
    Ok(Some(token))
}

fn verify(token: &str, secret: &str) -> Result<AuthUser, AppError> {
    let token_data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .map_err(|_| AppError::InvalidToken)?;

    let claims = token_data.claims;
    let user_id = Uuid::parse_str(&claims.sub).map_err(|_| AppError::InvalidToken)?;
    let partner_id = Uuid::parse_str(&claims.partner_id).map_err(|_| AppError::InvalidToken)?;

    Ok(AuthUser {
        user: Approver {
            user_id,
            name: claims.name,
            groups: claims.groups,
        },
        partner_id,
    })
}

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = bearer_token(&parts.headers)?
            .ok_or_else(|| AppError::Unauthorized("Missing Authorization header".to_string()))?;
        verify(token, &state.config.jwt_secret)
    }
}

/// Portal pages also serve anonymous visitors; a present but invalid token
/// is still rejected.
impl OptionalFromRequestParts<AppState> for AuthUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Option<Self>, Self::Rejection> {
        match bearer_token(&parts.headers)? {
            Some(token) => verify(token, &state.config.jwt_secret).map(Some),
            None => Ok(None),
        }
    }
}

pub fn generate_token(
    user: &Approver,
    partner_id: Uuid,
    secret: &str,
    expiry_hours: i64,
) -> Result<String, AppError> {
    use chrono::Utc;
    use jsonwebtoken::{EncodingKey, Header, encode};

    let now = Utc::now().timestamp() as usize;
    let exp = (Utc::now() + chrono::Duration::hours(expiry_hours)).timestamp() as usize;

    let claims = Claims {
        sub: user.user_id.to_string(),
        name: user.name.clone(),
        partner_id: partner_id.to_string(),
        groups: user.groups.clone(),
        exp,
        iat: now,
    };

    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| AppError::Internal(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issued_tokens_round_trip_into_the_approver() {
        let user = Approver {
            user_id: Uuid::new_v4(),
            name: "Alice".to_string(),
            groups: vec!["purchase_manager".to_string()],
        };
        let partner = Uuid::new_v4();
        let token = generate_token(&user, partner, "secret", 1).unwrap();

        let auth = verify(&token, "secret").unwrap();
        assert_eq!(auth.user.user_id, user.user_id);
        assert_eq!(auth.user.groups, user.groups);
        assert_eq!(auth.partner_id, partner);
        assert!(matches!(verify(&token, "other"), Err(AppError::InvalidToken)));
    }
}
