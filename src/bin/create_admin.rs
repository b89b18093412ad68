//! Seeds an administrator account so the first login is possible.

use std::process::ExitCode;

use clap::Parser;

use storefront::api::users::create_admin;
use storefront::config::Config;
use storefront::db::{self, Db};

#[derive(Parser)]
#[command(about = "Create a verified ADMIN user")]
struct Args {
    /// Login email of the new administrator.
    email: String,
    password: String,
    /// Display name.
    #[arg(default_value = "Admin")]
    name: String,
}

#[actix_web::main]
async fn main() -> ExitCode {
    dotenv::dotenv().ok();
    env_logger::init();
    let args = Args::parse();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };
    let store = match db::connect(&config.database_url, &config.database_name).await {
        Ok(store) => store,
        Err(e) => {
            eprintln!("Could not connect to the database: {e}");
            return ExitCode::FAILURE;
        }
    };

    match create_admin(&Db::new(store), &args.email, &args.password, &args.name).await {
        Ok(user) => {
            println!("Created admin {} ({})", user.email, user.id);
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Could not create admin: {e}");
            ExitCode::FAILURE
        }
    }
}
