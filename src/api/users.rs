use actix_web::{web, HttpResponse};
use chrono::{Duration, Utc};
use mongodb::bson::{doc, Bson, Document};
use serde::{Deserialize, Serialize};
use serde_json::json;
use validator::Validate;

use super::nullable;
use crate::auth::{hash_password, verification_token, Session};
use crate::db::{newest_first, Db, StoreError};
use crate::emails;
use crate::error::{ApiError, ApiResult};
use crate::middleware::Admin;
use crate::models::{new_id, ts, PublicUser, Role, User};
use crate::state::AppState;

const VERIFICATION_TTL_HOURS: i64 = 24;

#[derive(Debug, Deserialize, Validate)]
pub struct RegisterRequest {
    #[validate(email)]
    pub email: String,
    #[validate(length(min = 1))]
    pub password: String,
    #[validate(length(min = 1))]
    pub name: String,
    pub phone: Option<String>,
    pub address: Option<String>,
    pub role: Option<Role>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct UpdateUserRequest {
    pub id: String,
    #[validate(email)]
    pub email: Option<String>,
    #[validate(length(min = 1))]
    pub name: Option<String>,
    #[serde(default, deserialize_with = "nullable")]
    pub phone: Option<Option<String>>,
    #[serde(default, deserialize_with = "nullable")]
    pub address: Option<Option<String>>,
    pub role: Option<Role>,
    #[validate(length(min = 1))]
    pub password: Option<String>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum Verification {
    Verified,
    AlreadyVerified,
}

fn email_taken(err: StoreError) -> ApiError {
    match err {
        StoreError::Duplicate(_) => ApiError::Conflict("User already exists".to_string()),
        other => other.into(),
    }
}

/// Creates an unverified account. Only an admin caller may hand out the
/// ADMIN role; everyone else gets CUSTOMER.
pub async fn register(state: &AppState, caller: Option<&Session>, req: RegisterRequest) -> ApiResult<User> {
    req.validate()?;
    if state.db.find_one::<User>(doc! { "email": &req.email }).await?.is_some() {
        return Err(ApiError::Conflict("User already exists".to_string()));
    }

    let by_admin = caller.map_or(false, Session::is_admin);
    let role = match req.role {
        Some(role) if by_admin => role,
        _ => Role::Customer,
    };

    let now = Utc::now();
    let token = verification_token();
    let user = User {
        id: new_id(),
        email: req.email,
        password: hash_password(&req.password)?,
        name: req.name,
        phone: req.phone,
        address: req.address,
        role,
        is_verified: false,
        verification_token: Some(token.clone()),
        verification_token_expiry: Some(now + Duration::hours(VERIFICATION_TTL_HOURS)),
        consumed_verification_token: None,
        created_at: now,
        updated_at: now,
    };
    state.db.insert(&user).await.map_err(email_taken)?;
    log::info!("Registered {} as {}", user.email, user.role.as_str());

    let email = if by_admin {
        emails::welcome(&state.config, &user.email, &user.name, &token)
    } else {
        emails::verification(&state.config, &user.email, &user.name, &token)
    };
    state.mail(email);

    Ok(user)
}

pub async fn verify_email(db: &Db, token: &str) -> ApiResult<Verification> {
    if token.trim().is_empty() {
        return Err(ApiError::Validation("Verification token is required".to_string()));
    }
    let invalid = || ApiError::Validation("Invalid or expired verification token".to_string());

    let Some(user) = db.find_one::<User>(doc! { "verificationToken": token }).await? else {
        return match db.find_one::<User>(doc! { "consumedVerificationToken": token }).await? {
            Some(user) if user.is_verified => Ok(Verification::AlreadyVerified),
            _ => Err(invalid()),
        };
    };

    if user.verification_token_expiry.map_or(false, |expiry| expiry < Utc::now()) {
        return Err(ApiError::Validation(
            "Verification token has expired. Please request a new one.".to_string(),
        ));
    }
    if user.is_verified {
        return Ok(Verification::AlreadyVerified);
    }

    let consumed = db
        .update_where::<User>(
            doc! { "id": &user.id, "verificationToken": token },
            doc! {
                "isVerified": true,
                "verificationToken": Bson::Null,
                "verificationTokenExpiry": Bson::Null,
                "consumedVerificationToken": token,
                "updatedAt": ts::bson(&Utc::now()),
            },
        )
        .await?;
    // A concurrent request consumed it first.
    if !consumed {
        return Ok(Verification::AlreadyVerified);
    }
    log::info!("Verified {}", user.email);
    Ok(Verification::Verified)
}

pub async fn list_users(db: &Db, role: Option<Role>) -> ApiResult<Vec<PublicUser>> {
    let mut filter = Document::new();
    if let Some(role) = role {
        filter.insert("role", role);
    }
    let users = db.find::<User>(filter, newest_first()).await?;
    Ok(users.into_iter().map(PublicUser::from).collect())
}

pub async fn update_user(db: &Db, req: UpdateUserRequest) -> ApiResult<PublicUser> {
    req.validate()?;
    let user = db
        .get::<User>(&req.id)
        .await?
        .ok_or_else(|| ApiError::NotFound("User not found".to_string()))?;

    let mut set = doc! { "updatedAt": ts::bson(&Utc::now()) };
    if let Some(email) = req.email {
        if email != user.email {
            if db.find_one::<User>(doc! { "email": &email }).await?.is_some() {
                return Err(ApiError::Conflict("Email already in use".to_string()));
            }
            set.insert("email", email);
        }
    }
    if let Some(name) = req.name {
        set.insert("name", name);
    }
    if let Some(phone) = req.phone {
        set.insert("phone", phone);
    }
    if let Some(address) = req.address {
        set.insert("address", address);
    }
    if let Some(role) = req.role {
        set.insert("role", role);
    }
    if let Some(password) = req.password {
        set.insert("password", hash_password(&password)?);
    }

    if !db.update::<User>(&user.id, set).await.map_err(email_taken)? {
        return Err(ApiError::NotFound("User not found".to_string()));
    }
    db.get::<User>(&user.id)
        .await?
        .map(PublicUser::from)
        .ok_or_else(|| ApiError::NotFound("User not found".to_string()))
}

pub async fn delete_user(db: &Db, caller: &Session, id: Option<&str>) -> ApiResult<()> {
    let id = id
        .filter(|id| !id.is_empty())
        .ok_or_else(|| ApiError::Validation("User ID is required".to_string()))?;
    if id == caller.id {
        return Err(ApiError::Validation("You cannot delete your own account".to_string()));
    }
    if !db.delete::<User>(id).await? {
        return Err(ApiError::NotFound("User not found".to_string()));
    }
    log::info!("User {} deleted by {}", id, caller.id);
    Ok(())
}

/// Operator bootstrap: a verified ADMIN with no verification mail.
pub async fn create_admin(db: &Db, email: &str, password: &str, name: &str) -> ApiResult<User> {
    if db.find_one::<User>(doc! { "email": email }).await?.is_some() {
        return Err(ApiError::Conflict("User already exists".to_string()));
    }
    let now = Utc::now();
    let user = User {
        id: new_id(),
        email: email.to_string(),
        password: hash_password(password)?,
        name: name.to_string(),
        phone: None,
        address: None,
        role: Role::Admin,
        is_verified: true,
        verification_token: None,
        verification_token_expiry: None,
        consumed_verification_token: None,
        created_at: now,
        updated_at: now,
    };
    db.insert(&user).await.map_err(email_taken)?;
    Ok(user)
}

#[derive(Serialize)]
struct Registered {
    #[serde(flatten)]
    user: PublicUser,
    message: &'static str,
}

#[derive(Deserialize)]
pub struct RoleQuery {
    role: Option<Role>,
}

#[derive(Deserialize)]
pub struct IdQuery {
    id: Option<String>,
}

#[derive(Deserialize)]
pub struct TokenQuery {
    token: Option<String>,
}

pub async fn create(
    state: web::Data<AppState>,
    caller: Option<Session>,
    body: web::Json<RegisterRequest>,
) -> ApiResult<HttpResponse> {
    let user = register(&state, caller.as_ref(), body.into_inner()).await?;
    Ok(HttpResponse::Created().json(Registered {
        user: user.into(),
        message: "Registration successful! Please check your email to verify your account.",
    }))
}

pub async fn verify(state: web::Data<AppState>, query: web::Query<TokenQuery>) -> ApiResult<HttpResponse> {
    let token = query.into_inner().token.unwrap_or_default();
    let body = match verify_email(&state.db, &token).await? {
        Verification::Verified => json!({
            "message": "Email verified successfully! You can now log in.",
            "verified": true,
        }),
        Verification::AlreadyVerified => json!({
            "message": "Email already verified. You can now log in.",
            "verified": true,
        }),
    };
    Ok(HttpResponse::Ok().json(body))
}

pub async fn list(state: web::Data<AppState>, _admin: Admin, query: web::Query<RoleQuery>) -> ApiResult<HttpResponse> {
    let users = list_users(&state.db, query.into_inner().role).await?;
    Ok(HttpResponse::Ok().json(users))
}

pub async fn update(
    state: web::Data<AppState>,
    _admin: Admin,
    body: web::Json<UpdateUserRequest>,
) -> ApiResult<HttpResponse> {
    let user = update_user(&state.db, body.into_inner()).await?;
    Ok(HttpResponse::Ok().json(user))
}

pub async fn delete(state: web::Data<AppState>, admin: Admin, query: web::Query<IdQuery>) -> ApiResult<HttpResponse> {
    delete_user(&state.db, &admin.0, query.id.as_deref()).await?;
    Ok(HttpResponse::Ok().json(json!({ "message": "User deleted successfully" })))
}
