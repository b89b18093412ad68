use actix_service::{forward_ready, Service};
use actix_web::dev::{Payload, ServiceRequest, ServiceResponse, Transform};
use actix_web::http::header::{HeaderMap, AUTHORIZATION};
use actix_web::{Error, FromRequest, HttpMessage, HttpRequest};
use futures::future::{ok, ready, LocalBoxFuture, Ready};
use std::rc::Rc;

use crate::auth::{Session, TokenService};
use crate::error::ApiError;

pub const SESSION_COOKIE: &str = "session";

/// Resolves the caller's session from `Authorization: Bearer` or the
/// session cookie and stores it in the request extensions. Requests without
/// a valid token pass through anonymously; handlers decide what needs one.
pub struct SessionMiddleware {
    tokens: TokenService,
}

impl SessionMiddleware {
    pub fn new(tokens: TokenService) -> Self {
        SessionMiddleware { tokens }
    }
}

impl<S, B> Transform<S, ServiceRequest> for SessionMiddleware
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Transform = SessionMiddlewareService<S>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ok(SessionMiddlewareService {
            service: Rc::new(service),
            tokens: self.tokens.clone(),
        })
    }
}

pub struct SessionMiddlewareService<S> {
    service: Rc<S>,
    tokens: TokenService,
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    value.strip_prefix("Bearer ").map(|t| t.trim().to_string())
}

impl<S, B> Service<ServiceRequest> for SessionMiddlewareService<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let token = bearer_token(req.headers())
            .or_else(|| req.cookie(SESSION_COOKIE).map(|c| c.value().to_string()));

        if let Some(token) = token {
            match self.tokens.verify(&token) {
                Ok(session) => {
                    req.extensions_mut().insert(session);
                }
                Err(e) => log::debug!("Ignoring invalid session token: {}", e),
            }
        }

        let service = self.service.clone();
        Box::pin(async move { service.call(req).await })
    }
}

impl FromRequest for Session {
    type Error = ApiError;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _: &mut Payload) -> Self::Future {
        ready(
            req.extensions()
                .get::<Session>()
                .cloned()
                .ok_or_else(|| ApiError::Unauthorized("Unauthorized".to_string())),
        )
    }
}

/// A session whose role is ADMIN.
#[derive(Debug, Clone)]
pub struct Admin(pub Session);

impl FromRequest for Admin {
    type Error = ApiError;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _: &mut Payload) -> Self::Future {
        let result = match req.extensions().get::<Session>() {
            Some(session) if session.is_admin() => Ok(Admin(session.clone())),
            Some(_) => Err(ApiError::Forbidden("Admin access required".to_string())),
            None => Err(ApiError::Unauthorized("Unauthorized".to_string())),
        };
        ready(result)
    }
}
