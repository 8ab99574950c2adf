use chrono::{Duration, Utc};
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};

use super::error::ApiError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub username: String,
    pub is_admin: bool,
    pub exp: usize,
    pub iat: usize,
}

pub struct JwtUtil {
    secret: String,
    expires_in_secs: i64,
}

impl JwtUtil {
    pub fn new(secret: impl Into<String>, expires_in_secs: i64) -> Self {
        Self { secret: secret.into(), expires_in_secs }
    }

    pub fn generate_token(&self, user_id: uuid::Uuid, username: &str, is_admin: bool) -> ApiResult<String> {
        let now = Utc::now();
        let exp = now + Duration::seconds(self.expires_in_secs);
        let claims = Claims {
            sub: user_id.to_string(),
            username: username.to_string(),
            is_admin,
            exp: exp.timestamp() as usize,
            iat: now.timestamp() as usize,
        };
        encode(&Header::default(), &claims, &EncodingKey::from_secret(self.secret.as_bytes()))
            .map_err(|err| ApiError::internal_error(format!("failed to sign token: {err}")))
    }

    pub fn verify_token(&self, token: &str) -> ApiResult<Claims> {
        decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.secret.as_bytes()),
            &Validation::default(),
        )
        .map(|data| data.claims)
        .map_err(|err| ApiError::unauthorized(format!("invalid token: {err}")))
    }
}

use super::error::ApiResult;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_token() {
        let util = JwtUtil::new("test-secret", 3600);
        let user_id = uuid::Uuid::new_v4();
        let token = util.generate_token(user_id, "alice", false).unwrap();
        let claims = util.verify_token(&token).unwrap();
        assert_eq!(claims.sub, user_id.to_string());
        assert_eq!(claims.username, "alice");
        assert!(!claims.is_admin);
    }

    #[test]
    fn rejects_tampered_token() {
        let util = JwtUtil::new("test-secret", 3600);
        let other = JwtUtil::new("other-secret", 3600);
        let token = util.generate_token(uuid::Uuid::new_v4(), "alice", false).unwrap();
        assert!(other.verify_token(&token).is_err());
    }
}
