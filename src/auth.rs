//! A2 collaborator interface: decodes the bearer JWT into an `AuthContext`
//! (spec.md §3 "AuthContext", SPEC_FULL.md §4.10). Identity CRUD and token
//! issuance stay out of scope — this is the simplest correct verification
//! step the core needs to be exercised end-to-end.

use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use serde_json::Value as JsonValue;

use crate::error::{AppError, AppResult};
use crate::rls::{AuthContext, Claims};

/// The out-of-scope collaborator trait: anything that can turn a bearer
/// token into claims. Identity issuance/rotation lives elsewhere.
pub trait ClaimsProvider: Send + Sync {
    fn decode(&self, bearer: &str) -> AppResult<Claims>;
}

#[derive(Debug, Deserialize)]
struct RawClaims {
    sub: Option<String>,
    role: Option<String>,
    email: Option<String>,
}

/// HS256 verification against `Config::jwt_secret`. No refresh, no key
/// rotation, no multi-issuer support — those are out of scope per §1.
pub struct JwtClaimsProvider {
    secret: String,
}

impl JwtClaimsProvider {
    pub fn new(secret: impl Into<String>) -> Self {
        Self { secret: secret.into() }
    }
}

impl ClaimsProvider for JwtClaimsProvider {
    fn decode(&self, bearer: &str) -> AppResult<Claims> {
        let key = DecodingKey::from_secret(self.secret.as_bytes());
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;

        let token_data = decode::<JsonValue>(bearer, &key, &validation)
            .map_err(|e| AppError::permission_denied(format!("invalid bearer token: {e}")))?;
        let raw: RawClaims = serde_json::from_value(token_data.claims.clone())
            .map_err(|e| AppError::permission_denied(format!("malformed claims: {e}")))?;

        Ok(Claims {
            sub: raw.sub,
            role: raw.role.unwrap_or_else(|| "authenticated".to_string()),
            email: raw.email,
            raw: token_data.claims,
        })
    }
}

/// Builds the per-request `AuthContext` from the `apikey` and
/// `Authorization: Bearer` headers per spec.md §6. The `apikey` alone
/// selects `anon`/`service_role`; a bearer JWT (when present) further
/// resolves the caller's claims and supersedes the apikey-derived role.
pub fn auth_context_from_headers(
    apikey: Option<&str>,
    bearer: Option<&str>,
    provider: &dyn ClaimsProvider,
    anon_key: &str,
    service_key: &str,
) -> AppResult<AuthContext> {
    if let Some(token) = bearer {
        let claims = provider.decode(token)?;
        let bypass = claims.role == "service_role";
        return Ok(AuthContext { claims, bypass_rls: bypass });
    }

    match apikey {
        Some(key) if key == service_key => Ok(AuthContext::service_role()),
        Some(key) if key == anon_key => Ok(AuthContext::anonymous()),
        Some(_) => Err(AppError::permission_denied("invalid API key")),
        None => Ok(AuthContext::anonymous()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    #[derive(serde::Serialize)]
    struct TestClaims {
        sub: String,
        role: String,
        exp: usize,
    }

    #[test]
    fn decodes_valid_token_and_falls_back_role() {
        let secret = "test-secret";
        let provider = JwtClaimsProvider::new(secret);
        let claims = TestClaims { sub: "user-1".to_string(), role: "authenticated".to_string(), exp: 9_999_999_999 };
        let token = encode(&Header::default(), &claims, &EncodingKey::from_secret(secret.as_bytes())).unwrap();
        let decoded = provider.decode(&token).unwrap();
        assert_eq!(decoded.sub, Some("user-1".to_string()));
        assert_eq!(decoded.role, "authenticated");
    }

    #[test]
    fn rejects_token_signed_with_wrong_secret() {
        let provider = JwtClaimsProvider::new("right-secret");
        let claims = TestClaims { sub: "user-1".to_string(), role: "authenticated".to_string(), exp: 9_999_999_999 };
        let token = encode(&Header::default(), &claims, &EncodingKey::from_secret(b"wrong-secret")).unwrap();
        assert!(provider.decode(&token).is_err());
    }

    #[test]
    fn service_role_apikey_bypasses_rls() {
        let ctx = auth_context_from_headers(Some("service-key"), None, &JwtClaimsProvider::new("s"), "anon-key", "service-key").unwrap();
        assert!(ctx.bypass_rls);
    }

    #[test]
    fn anon_apikey_is_not_bypassed() {
        let ctx = auth_context_from_headers(Some("anon-key"), None, &JwtClaimsProvider::new("s"), "anon-key", "service-key").unwrap();
        assert!(!ctx.bypass_rls);
        assert_eq!(ctx.claims.role, "anon");
    }
}
