use std::io;
use std::sync::Arc;

use actix_web::middleware::Logger;
use actix_web::{web, App, HttpServer};

use storefront::api;
use storefront::config::Config;
use storefront::db;
use storefront::mailer::{LogMailer, Mailer, SmtpMailer};
use storefront::middleware::SessionMiddleware;
use storefront::state::AppState;

fn startup_error(err: impl std::fmt::Display) -> io::Error {
    io::Error::new(io::ErrorKind::Other, err.to_string())
}

#[actix_web::main]
async fn main() -> io::Result<()> {
    dotenv::dotenv().ok(); // Load environment variables from .env file
    env_logger::init();

    let config = Config::from_env().map_err(startup_error)?;
    let store = db::connect(&config.database_url, &config.database_name)
        .await
        .map_err(startup_error)?;

    let mailer: Arc<dyn Mailer> = match &config.smtp {
        Some(smtp) => Arc::new(SmtpMailer::new(smtp).map_err(startup_error)?),
        None => {
            log::warn!("SMTP_HOST is not set; outgoing mail is only logged");
            Arc::new(LogMailer)
        }
    };

    let bind_addr = config.bind_addr.clone();
    let state = AppState::new(config, store, mailer);
    log::info!("Listening on {}", bind_addr);

    HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(state.clone()))
            .wrap(SessionMiddleware::new(state.tokens.clone()))
            .wrap(Logger::default())
            .configure(api::configure)
    })
    .bind(bind_addr)?
    .run()
    .await
}
