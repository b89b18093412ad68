use std::sync::Arc;

use crate::auth::TokenService;
use crate::config::Config;
use crate::db::{Db, DocumentStore};
use crate::mailer::{self, Email, MailError, Mailer};

/// Shared by every worker; cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub db: Db,
    pub mailer: Arc<dyn Mailer>,
    pub tokens: TokenService,
    pub config: Arc<Config>,
}

impl AppState {
    pub fn new(config: Config, store: Arc<dyn DocumentStore>, mailer: Arc<dyn Mailer>) -> Self {
        AppState {
            db: Db::new(store),
            mailer,
            tokens: TokenService::new(&config.jwt_secret, config.session_ttl_hours),
            config: Arc::new(config),
        }
    }

    /// Fire-and-forget delivery. A message that failed to render is logged
    /// and dropped.
    pub fn mail(&self, email: Result<Email, MailError>) {
        match email {
            Ok(email) => mailer::dispatch(self.mailer.clone(), email),
            Err(e) => log::error!("Failed to prepare mail: {}", e),
        }
    }
}
