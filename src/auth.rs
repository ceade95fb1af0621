use argon2::{
    Argon2,
    password_hash::{
        rand_core::OsRng,
        PasswordHash, PasswordHasher, PasswordVerifier, SaltString,
    },
};
use anyhow::Result;
use axum::{
    extract::{Request, State},
    http::{header, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use tracing::{error, warn};

use crate::config::LoginCfg;
use crate::context::AppContext;

pub fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| anyhow::anyhow!("failed to hash password: {}", e))?;
    Ok(hash.to_string())
}

pub fn verify_password(password: &str, hash: &str) -> Result<bool> {
    let parsed_hash = PasswordHash::new(hash)
        .map_err(|e| anyhow::anyhow!("invalid stored password hash: {}", e))?;
    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed_hash)
        .is_ok())
}

/// `(username, password)` from an `Authorization: Basic ...` header.
pub fn parse_basic(value: &str) -> Option<(String, String)> {
    let encoded = value.strip_prefix("Basic ")?.trim();
    let decoded = STANDARD.decode(encoded).ok()?;
    let text = String::from_utf8(decoded).ok()?;
    let (user, pass) = text.split_once(':')?;
    Some((user.to_string(), pass.to_string()))
}

async fn credentials_ok(login: &LoginCfg, header_value: Option<&HeaderValue>) -> bool {
    let Some((user, pass)) = header_value.and_then(|v| v.to_str().ok()).and_then(parse_basic) else {
        return false;
    };
    if user != login.username {
        return false;
    }
    let hash = login.password_hash.clone();
    // CPU-bound
    match tokio::task::spawn_blocking(move || verify_password(&pass, &hash)).await {
        Ok(Ok(ok)) => ok,
        Ok(Err(e)) => {
            error!("login check failed: {e}");
            false
        }
        Err(e) => {
            error!("login check panicked: {e}");
            false
        }
    }
}

/// Rejects requests without valid Basic credentials when login is active.
pub async fn require_login(State(ctx): State<AppContext>, req: Request, next: Next) -> Response {
    let login = &ctx.config.login;
    if !login.active {
        return next.run(req).await;
    }
    let authorization = req.headers().get(header::AUTHORIZATION).cloned();
    if credentials_ok(login, authorization.as_ref()).await {
        return next.run(req).await;
    }
    warn!(path = %req.uri().path(), "unauthorized request");
    (
        StatusCode::UNAUTHORIZED,
        [(header::WWW_AUTHENTICATE, HeaderValue::from_static("Basic realm=\"annogen\""))],
        "login required",
    )
        .into_response()
}
