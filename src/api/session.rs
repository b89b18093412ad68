use actix_web::cookie::{time, Cookie, SameSite};
use actix_web::{web, HttpResponse};
use mongodb::bson::doc;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::auth::{verify_password, Session};
use crate::error::{ApiError, ApiResult};
use crate::middleware::SESSION_COOKIE;
use crate::models::{PublicUser, User};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub token: String,
    pub user: PublicUser,
}

/// Same answer for an unknown email and a wrong password.
pub async fn authenticate(state: &AppState, email: &str, password: &str) -> ApiResult<LoginResponse> {
    let invalid = || ApiError::Unauthorized("Invalid credentials".to_string());
    let user = state
        .db
        .find_one::<User>(doc! { "email": email })
        .await?
        .ok_or_else(invalid)?;
    if !verify_password(&user.password, password) {
        return Err(invalid());
    }
    let token = state.tokens.issue(&user.id, user.role)?;
    Ok(LoginResponse { token, user: user.into() })
}

pub async fn login(state: web::Data<AppState>, body: web::Json<LoginRequest>) -> ApiResult<HttpResponse> {
    let response = authenticate(&state, &body.email, &body.password).await?;
    let cookie = Cookie::build(SESSION_COOKIE, response.token.clone())
        .path("/")
        .http_only(true)
        .same_site(SameSite::Lax)
        .max_age(time::Duration::hours(state.config.session_ttl_hours))
        .finish();
    Ok(HttpResponse::Ok().cookie(cookie).json(response))
}

pub async fn logout() -> HttpResponse {
    let mut cookie = Cookie::build(SESSION_COOKIE, "").path("/").finish();
    cookie.make_removal();
    HttpResponse::Ok()
        .cookie(cookie)
        .json(json!({ "message": "Logged out" }))
}

pub async fn current(session: Session) -> HttpResponse {
    HttpResponse::Ok().json(session)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Role;
    use crate::state::testing::{self, seed_user, PASSWORD};

    #[actix_web::test]
    async fn login_issues_token_for_role() {
        let app = testing::app();
        let admin = seed_user(&app.state, "root@example.com", Role::Admin).await;

        let response = authenticate(&app.state, "root@example.com", PASSWORD).await.unwrap();
        let session = app.state.tokens.verify(&response.token).unwrap();
        assert_eq!(session, testing::session(&admin));
    }

    #[actix_web::test]
    async fn unknown_email_and_bad_password_look_the_same() {
        let app = testing::app();
        seed_user(&app.state, "a@example.com", Role::Customer).await;

        let missing = authenticate(&app.state, "b@example.com", PASSWORD).await.unwrap_err();
        let wrong = authenticate(&app.state, "a@example.com", "nope").await.unwrap_err();
        assert!(matches!(missing, ApiError::Unauthorized(_)));
        assert_eq!(missing.to_string(), wrong.to_string());
    }
}
