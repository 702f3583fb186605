//! # Identity Module
//!
//! Demo identities for room features. Every visitor can mint an anonymous
//! user with a short-lived JWT access token and a rotating refresh token;
//! password and OAuth flows are deliberately absent.
//!
//! A caller is identified by up to two dimensions: the authenticated user id
//! from the bearer token, and a client-generated session id sent with room
//! requests. The session id exists so one authenticated account can run
//! several concurrent demo identities (two tabs, two cursors).

use crate::api::AppState;
use crate::db::{field_i64, field_str, now_ms, RoomStore, SqlValue};
use crate::error::{RoomError, RoomResult};

use axum::{
    extract::{Path, State},
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

/// Access token expiry (1 hour)
const ACCESS_TOKEN_DURATION: Duration = Duration::from_secs(3600);

/// Refresh token expiry (7 days)
const REFRESH_TOKEN_DURATION: Duration = Duration::from_secs(7 * 24 * 3600);

/// Maximum display name length; longer names are truncated server-side
pub const MAX_USER_NAME_LENGTH: usize = 100;

/// Identity service managing demo users and auth sessions
#[derive(Clone)]
pub struct IdentityService {
    store: Arc<RoomStore>,
    jwt_secret: Vec<u8>,
}

/// User record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub name: Option<String>,
    pub image: Option<String>,
    pub is_anonymous: bool,
    pub created_at: i64,
}

/// Public profile: only safe fields, never verification or session data
#[derive(Debug, Clone, Serialize)]
pub struct PublicProfile {
    pub id: String,
    pub name: Option<String>,
    pub image: Option<String>,
}

/// Token pair returned after minting an identity
#[derive(Debug, Serialize)]
pub struct AuthTokens {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_in: i64,
    pub token_type: String,
    pub user: User,
}

/// JWT Claims structure
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (user id)
    pub sub: String,
    /// Expiration time (Unix timestamp, seconds)
    pub exp: u64,
    /// Issued at time (Unix timestamp, seconds)
    pub iat: u64,
}

/// The resolved identity of a request. Either dimension may be absent.
#[derive(Debug, Clone, Default)]
pub struct Caller {
    pub user_id: Option<String>,
    pub session_id: Option<String>,
}

impl Caller {
    /// A request with neither a user nor a session carries no identity
    pub fn has_identity(&self) -> bool {
        self.user_id.is_some() || self.session_id.is_some()
    }

    /// Ownership check for deletion: allowed if the record has no owning
    /// user, the caller is that user, or the record's session matches.
    pub fn may_delete(&self, owner_user: Option<&str>, owner_session: Option<&str>) -> bool {
        match owner_user {
            None => true,
            Some(owner) => {
                self.user_id.as_deref() == Some(owner)
                    || (owner_session.is_some()
                        && owner_session == self.session_id.as_deref())
            }
        }
    }
}

impl IdentityService {
    pub fn new(store: Arc<RoomStore>, jwt_secret: Vec<u8>) -> Self {
        Self { store, jwt_secret }
    }

    /// Generate a secure random JWT secret
    pub fn generate_secret() -> Vec<u8> {
        let mut secret = vec![0u8; 64];
        rand::thread_rng().fill(&mut secret[..]);
        secret
    }

    /// Generate an opaque refresh token
    fn generate_refresh_token() -> String {
        use base64::Engine;
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill(&mut bytes);
        base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
    }

    /// Generate a JWT access token for the user
    fn generate_access_token(&self, user: &User) -> RoomResult<String> {
        let now = (now_ms() / 1000) as u64;
        let claims = Claims {
            sub: user.id.clone(),
            iat: now,
            exp: now + ACCESS_TOKEN_DURATION.as_secs(),
        };

        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(&self.jwt_secret),
        )
        .map_err(|e| RoomError::Internal(anyhow::anyhow!("JWT encoding failed: {}", e)))
    }

    /// Validate a JWT access token and return claims
    pub fn validate_token(&self, token: &str) -> RoomResult<Claims> {
        decode::<Claims>(
            token,
            &DecodingKey::from_secret(&self.jwt_secret),
            &Validation::default(),
        )
        .map(|data| data.claims)
        .map_err(|e| RoomError::Unauthorized(format!("Invalid token: {}", e)))
    }

    /// Create a fresh anonymous user and mint its tokens
    pub async fn create_anonymous(&self, name: Option<String>) -> RoomResult<AuthTokens> {
        let id = Uuid::new_v4().to_string();
        let name = name.map(|n| truncate(n.trim(), MAX_USER_NAME_LENGTH)).filter(|n| !n.is_empty());

        self.store
            .execute(
                "INSERT INTO users (id, name, is_anonymous, created_at) VALUES (?, ?, 1, ?)"
                    .to_string(),
                vec![
                    SqlValue::Text(id.clone()),
                    SqlValue::opt_text(name),
                    SqlValue::Integer(now_ms()),
                ],
            )
            .await?;

        let user = self.get_user(&id).await?;
        info!("Anonymous user created: {}", user.id);
        self.create_session(user).await
    }

    /// Persist a refresh token and return the token pair
    async fn create_session(&self, user: User) -> RoomResult<AuthTokens> {
        let access_token = self.generate_access_token(&user)?;
        let refresh_token = Self::generate_refresh_token();
        let expires_at = now_ms() + REFRESH_TOKEN_DURATION.as_millis() as i64;

        self.store
            .execute(
                "INSERT INTO auth_sessions (id, user_id, refresh_token, expires_at, created_at) VALUES (?, ?, ?, ?, ?)"
                    .to_string(),
                vec![
                    SqlValue::Text(Uuid::new_v4().to_string()),
                    SqlValue::Text(user.id.clone()),
                    SqlValue::Text(refresh_token.clone()),
                    SqlValue::Integer(expires_at),
                    SqlValue::Integer(now_ms()),
                ],
            )
            .await?;

        Ok(AuthTokens {
            access_token,
            refresh_token,
            expires_in: ACCESS_TOKEN_DURATION.as_secs() as i64,
            token_type: "Bearer".to_string(),
            user,
        })
    }

    /// Rotate a refresh token: the old session row is deleted and a new one
    /// inserted, so a token can be redeemed at most once.
    pub async fn refresh(&self, refresh_token: &str) -> RoomResult<AuthTokens> {
        let rows = self
            .store
            .query(
                "SELECT user_id, expires_at FROM auth_sessions WHERE refresh_token = ?"
                    .to_string(),
                vec![SqlValue::Text(refresh_token.to_string())],
            )
            .await?;

        let row = rows
            .first()
            .ok_or_else(|| RoomError::unauthorized("Invalid refresh token"))?;

        let user_id = field_str(row, "user_id")
            .ok_or_else(|| RoomError::Internal(anyhow::anyhow!("Missing user_id")))?;
        let expires_at = field_i64(row, "expires_at").unwrap_or(0);

        self.store
            .execute(
                "DELETE FROM auth_sessions WHERE refresh_token = ?".to_string(),
                vec![SqlValue::Text(refresh_token.to_string())],
            )
            .await?;

        if expires_at < now_ms() {
            return Err(RoomError::unauthorized("Refresh token expired"));
        }

        let user = self.get_user(&user_id).await?;
        self.create_session(user).await
    }

    /// Logout - invalidate the refresh token. Idempotent.
    pub async fn logout(&self, refresh_token: &str) -> RoomResult<()> {
        self.store
            .execute(
                "DELETE FROM auth_sessions WHERE refresh_token = ?".to_string(),
                vec![SqlValue::Text(refresh_token.to_string())],
            )
            .await?;
        Ok(())
    }

    /// Get a user by id
    pub async fn get_user(&self, id: &str) -> RoomResult<User> {
        let rows = self
            .store
            .query(
                "SELECT id, name, image, is_anonymous, created_at FROM users WHERE id = ?"
                    .to_string(),
                vec![SqlValue::Text(id.to_string())],
            )
            .await?;

        let row = rows
            .first()
            .ok_or_else(|| RoomError::not_found("User not found"))?;
        row_to_user(row)
    }

    /// Get a user's public profile only
    pub async fn public_profile(&self, id: &str) -> RoomResult<PublicProfile> {
        let user = self.get_user(id).await?;
        Ok(PublicProfile {
            id: user.id,
            name: user.name,
            image: user.image,
        })
    }

    /// Update display name and/or image of the authenticated user
    pub async fn update_profile(
        &self,
        user_id: &str,
        name: Option<String>,
        image: Option<String>,
    ) -> RoomResult<User> {
        if let Some(name) = name {
            let name = truncate(name.trim(), MAX_USER_NAME_LENGTH);
            self.store
                .execute(
                    "UPDATE users SET name = ? WHERE id = ?".to_string(),
                    vec![SqlValue::Text(name), SqlValue::Text(user_id.to_string())],
                )
                .await?;
        }
        if let Some(image) = image {
            self.store
                .execute(
                    "UPDATE users SET image = ? WHERE id = ?".to_string(),
                    vec![SqlValue::Text(image), SqlValue::Text(user_id.to_string())],
                )
                .await?;
        }

        self.get_user(user_id).await
    }

    /// Resolve the caller's identity. An absent or invalid bearer token maps
    /// to no user rather than an error: room endpoints work unauthenticated.
    pub fn resolve_caller(&self, headers: &HeaderMap, session_id: Option<String>) -> Caller {
        let user_id = bearer_token(headers)
            .and_then(|token| self.validate_token(token).ok())
            .map(|claims| claims.sub);
        if user_id.is_none() && session_id.is_none() {
            debug!("Request carries no identity");
        }
        Caller {
            user_id,
            session_id: session_id.filter(|s| !s.is_empty()),
        }
    }

    /// Extract the authenticated user id or fail with 401
    pub fn require_user(&self, headers: &HeaderMap) -> RoomResult<String> {
        let token = bearer_token(headers)
            .ok_or_else(|| RoomError::unauthorized("Missing authorization header"))?;
        Ok(self.validate_token(token)?.sub)
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
}

fn truncate(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

/// Convert a queried row to a User
fn row_to_user(row: &[(String, serde_json::Value)]) -> RoomResult<User> {
    Ok(User {
        id: field_str(row, "id")
            .ok_or_else(|| RoomError::Internal(anyhow::anyhow!("Missing field: id")))?,
        name: field_str(row, "name"),
        image: field_str(row, "image"),
        is_anonymous: field_i64(row, "is_anonymous").unwrap_or(0) == 1,
        created_at: field_i64(row, "created_at").unwrap_or(0),
    })
}

// ============================================================================
// Request/Response DTOs
// ============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct AnonymousSignupRequest {
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

#[derive(Debug, Deserialize)]
pub struct UpdateProfileRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub image: Option<String>,
}

// ============================================================================
// API Handlers
// ============================================================================

/// POST /v1/auth/anonymous
async fn anonymous_handler(
    State(state): State<AppState>,
    body: Option<Json<AnonymousSignupRequest>>,
) -> Result<impl IntoResponse, RoomError> {
    let req = body.map(|Json(r)| r).unwrap_or_default();
    let tokens = state.identity.create_anonymous(req.name).await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "success": true, "data": tokens })),
    ))
}

/// POST /v1/auth/refresh
async fn refresh_handler(
    State(state): State<AppState>,
    Json(req): Json<RefreshRequest>,
) -> Result<impl IntoResponse, RoomError> {
    let tokens = state.identity.refresh(&req.refresh_token).await?;
    Ok(Json(json!({ "success": true, "data": tokens })))
}

/// POST /v1/auth/logout
async fn logout_handler(
    State(state): State<AppState>,
    Json(req): Json<RefreshRequest>,
) -> Result<impl IntoResponse, RoomError> {
    state.identity.logout(&req.refresh_token).await?;
    Ok(Json(json!({ "success": true, "message": "Logged out" })))
}

/// GET /v1/auth/me
async fn me_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, RoomError> {
    let user_id = state.identity.require_user(&headers)?;
    let user = state.identity.get_user(&user_id).await?;
    Ok(Json(json!({ "success": true, "data": user })))
}

/// PUT /v1/auth/profile
async fn update_profile_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<UpdateProfileRequest>,
) -> Result<impl IntoResponse, RoomError> {
    let user_id = state.identity.require_user(&headers)?;
    let user = state
        .identity
        .update_profile(&user_id, req.name, req.image)
        .await?;
    Ok(Json(json!({ "success": true, "data": user })))
}

/// GET /v1/users/:id - public profile only
async fn public_profile_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, RoomError> {
    let profile = state.identity.public_profile(&id).await?;
    Ok(Json(json!({ "success": true, "data": profile })))
}

/// Identity routes, nested under /v1 by the main router
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/auth/anonymous", post(anonymous_handler))
        .route("/auth/refresh", post(refresh_handler))
        .route("/auth/logout", post(logout_handler))
        .route("/auth/me", get(me_handler))
        .route("/auth/profile", put(update_profile_handler))
        .route("/users/:id", get(public_profile_handler))
}

// ============================================================================
// Tests
// ============================================================================
