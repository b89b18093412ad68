pub mod api;
pub mod auth;
pub mod config;
pub mod db;
pub mod emails;
pub mod error;
pub mod mailer;
pub mod middleware;
pub mod models;
pub mod pdf;
pub mod qr;
pub mod state;
