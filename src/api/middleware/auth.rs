use crate::api::error::AppError;
use crate::utils::auth::{Claims, validate_jwt};
use crate::{AppState, entities::prelude::Users};
use axum::{
    extract::{Request, State},
    http::{HeaderMap, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use sea_orm::EntityTrait;
use serde::Deserialize;

#[derive(Deserialize)]
struct AuthQuery {
    token: Option<String>,
}

/// Bearer header first, then `?token=`, then the `token` cookie set at login.
fn extract_token(req: &Request) -> Option<String> {
    let auth_header = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(|s| s.to_string());

    if auth_header.is_some() {
        return auth_header;
    }

    let query = req.uri().query().unwrap_or_default();
    if let Some(token) = serde_urlencoded::from_str::<AuthQuery>(query)
        .ok()
        .and_then(|q| q.token)
    {
        return Some(token);
    }

    token_cookie(req.headers())
}

fn token_cookie(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .find_map(|pair| pair.trim().strip_prefix("token=").map(str::to_string))
        .filter(|t| !t.is_empty())
}

async fn authenticate(
    state: &AppState,
    token: Option<String>,
) -> Result<Option<Claims>, AppError> {
    let Some(token) = token else {
        return Ok(None);
    };

    let Ok(claims) = validate_jwt(&token, &state.config.jwt_secret) else {
        return Ok(None);
    };

    // Check if user still exists in DB
    let user_exists = Users::find_by_id(claims.sub.clone())
        .one(&state.db)
        .await?
        .is_some();

    Ok(user_exists.then_some(claims))
}

/// For API routes: unauthenticated requests get a JSON 401.
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, AppError> {
    match authenticate(&state, extract_token(&req)).await? {
        Some(claims) => {
            req.extensions_mut().insert(claims);
            Ok(next.run(req).await)
        }
        None => Err(AppError::Unauthorized("Authentication required".to_string())),
    }
}

/// For page routes: unauthenticated requests are sent to the login page.
pub async fn page_auth_middleware(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, AppError> {
    match authenticate(&state, extract_token(&req)).await? {
        Some(claims) => {
            req.extensions_mut().insert(claims);
            Ok(next.run(req).await)
        }
        None => {
            let next_path = req.uri().path().to_string();
            let query = serde_urlencoded::to_string(&[("next", next_path.as_str())])
                .unwrap_or_default();
            let location = format!("{}?{}", state.config.login_url, query);
            Ok((StatusCode::FOUND, [(header::LOCATION, location)]).into_response())
        }
    }
}
