use axum::{
    extract::Request,
    http::{header::AUTHORIZATION, HeaderMap},
    middleware::Next,
    response::Response,
};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use pulse_core::{PulseContext, PulseError, PulseResult};
use pulse_services::UserService;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing;

/// 7-day tokens, no rotation; the identity front-door signs with the same
/// shared secret.
pub const TOKEN_LIFETIME_DAYS: u64 = 7;

/// JWT claims carried by the bearer credential.
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub email: String,
    pub name: String,
    pub exp: usize,
}

/// Authenticated principal attached to a connection or request. The subject
/// here is authoritative; client-supplied user ids are never trusted.
#[derive(Debug, Clone)]
pub struct Principal {
    pub subject: String,
    pub email: String,
    pub display_name: String,
}

fn extract_token(auth_header: Option<&str>) -> Option<String> {
    auth_header?
        .strip_prefix("Bearer ")
        .map(|s| s.trim().to_string())
}

pub fn bearer_from_headers(headers: &HeaderMap) -> Option<String> {
    extract_token(headers.get(AUTHORIZATION).and_then(|h| h.to_str().ok()))
}

pub fn generate_token(
    subject: &str,
    email: &str,
    name: &str,
    secret: &str,
) -> PulseResult<String> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|_| PulseError::Dependency("system clock before epoch".to_string()))?
        .as_secs() as usize;

    let claims = Claims {
        sub: subject.to_string(),
        email: email.to_string(),
        name: name.to_string(),
        exp: now + (TOKEN_LIFETIME_DAYS * 24 * 60 * 60) as usize,
    };

    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_ref()),
    )
    .map_err(|e| PulseError::Dependency(format!("failed to sign token: {}", e)))
}

/// Signature and expiry check only; does not touch the database.
pub fn verify_token(token: &str, secret: &str) -> PulseResult<Claims> {
    let decoding_key = DecodingKey::from_secret(secret.as_ref());
    let validation = Validation::default();

    match decode::<Claims>(token, &decoding_key, &validation) {
        Ok(token_data) => Ok(token_data.claims),
        Err(e) => {
            tracing::debug!("Token verification failed: {}", e);
            Err(PulseError::Unauthenticated("invalid credential".to_string()))
        }
    }
}

/// Full verification: valid token whose subject resolves to a persisted
/// user. Anything else is unauthenticated.
pub async fn resolve_principal(ctx: &PulseContext, token: &str) -> PulseResult<Principal> {
    let claims = verify_token(token, &ctx.config.server.auth_secret)?;

    let user = UserService::new(ctx.clone())
        .find_by_id(&claims.sub)
        .await?
        .ok_or_else(|| PulseError::Unauthenticated("unknown subject".to_string()))?;

    Ok(Principal {
        subject: user.id,
        email: user.email,
        display_name: user.display_name,
    })
}

/// Axum middleware guarding the REST surface. The WebSocket route
/// authenticates in-band, and `/auth/sync` verifies the token itself
/// because the user row may not exist yet.
pub async fn auth_middleware(mut req: Request, next: Next) -> Result<Response, PulseError> {
    let path = req.uri().path();
    if path == "/health" || path.starts_with("/ws") || path == "/auth/sync" {
        return Ok(next.run(req).await);
    }

    let auth_header = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok());

    let token = extract_token(auth_header)
        .ok_or_else(|| PulseError::Unauthenticated("missing bearer token".to_string()))?;

    let ctx = req
        .extensions()
        .get::<PulseContext>()
        .cloned()
        .ok_or_else(|| PulseError::Dependency("missing context".to_string()))?;

    let principal = resolve_principal(&ctx, &token).await?;

    tracing::debug!("Authenticated request for {}", principal.subject);
    req.extensions_mut().insert(principal);

    Ok(next.run(req).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "test-secret";

    #[test]
    fn token_round_trips() {
        let token = generate_token("u1", "a@example.com", "Ada", SECRET).unwrap();
        let claims = verify_token(&token, SECRET).unwrap();
        assert_eq!(claims.sub, "u1");
        assert_eq!(claims.email, "a@example.com");
        assert_eq!(claims.name, "Ada");
    }

    #[test]
    fn rejects_wrong_secret() {
        let token = generate_token("u1", "a@example.com", "Ada", SECRET).unwrap();
        assert!(verify_token(&token, "other-secret").is_err());
    }

    #[test]
    fn rejects_expired_token() {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs() as usize;
        let claims = Claims {
            sub: "u1".to_string(),
            email: "a@example.com".to_string(),
            name: "Ada".to_string(),
            exp: now - 600,
        };
        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(SECRET.as_ref()),
        )
        .unwrap();
        assert!(verify_token(&token, SECRET).is_err());
    }

    #[test]
    fn extracts_bearer_tokens() {
        assert_eq!(
            extract_token(Some("Bearer abc.def.ghi")),
            Some("abc.def.ghi".to_string())
        );
        assert_eq!(extract_token(Some("Basic abc")), None);
        assert_eq!(extract_token(None), None);
    }
}
