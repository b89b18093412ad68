//! HTTP surface. Each resource module holds its request types, the
//! operations behind them and the thin actix handlers.

use actix_web::{error, web, HttpResponse};
use serde::{Deserialize, Deserializer};
use serde_json::json;

use crate::error::ApiError;

pub mod complaints;
pub mod inventory;
pub mod leads;
pub mod orders;
pub mod products;
pub mod session;
pub mod users;

/// Distinguishes an absent field (`None`) from an explicit `null`
/// (`Some(None)`) in partial updates.
pub(crate) fn nullable<'de, T, D>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

fn json_config() -> web::JsonConfig {
    web::JsonConfig::default()
        .error_handler(|err, _req| error::Error::from(ApiError::Validation(err.to_string())))
}

fn query_config() -> web::QueryConfig {
    web::QueryConfig::default()
        .error_handler(|err, _req| error::Error::from(ApiError::Validation(err.to_string())))
}

async fn health() -> HttpResponse {
    HttpResponse::Ok().json(json!({ "status": "ok" }))
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api")
            .app_data(json_config())
            .app_data(query_config())
            .route("/health", web::get().to(health))
            .route("/auth/login", web::post().to(session::login))
            .route("/auth/logout", web::post().to(session::logout))
            .route("/auth/session", web::get().to(session::current))
            .route("/auth/verify", web::get().to(users::verify))
            .service(
                web::resource("/users")
                    .route(web::get().to(users::list))
                    .route(web::post().to(users::create))
                    .route(web::put().to(users::update))
                    .route(web::delete().to(users::delete)),
            )
            .service(
                web::resource("/products")
                    .route(web::get().to(products::list))
                    .route(web::post().to(products::create)),
            )
            .service(
                web::resource("/products/{id}")
                    .route(web::get().to(products::get))
                    .route(web::put().to(products::update))
                    .route(web::delete().to(products::delete)),
            )
            .route("/inventory/qr-scan", web::post().to(inventory::scan_code))
            .service(
                web::resource("/inventory")
                    .route(web::get().to(inventory::list))
                    .route(web::post().to(inventory::create))
                    .route(web::put().to(inventory::update))
                    .route(web::delete().to(inventory::delete)),
            )
            .service(
                web::resource("/leads")
                    .route(web::get().to(leads::list))
                    .route(web::post().to(leads::create))
                    .route(web::put().to(leads::update)),
            )
            .service(
                web::resource("/orders")
                    .route(web::get().to(orders::list))
                    .route(web::post().to(orders::create)),
            )
            .service(
                web::resource("/orders/{id}")
                    .route(web::get().to(orders::get))
                    .route(web::put().to(orders::update)),
            )
            .service(
                web::resource("/complaints")
                    .route(web::get().to(complaints::list))
                    .route(web::post().to(complaints::create))
                    .route(web::put().to(complaints::update)),
            ),
    );
}
