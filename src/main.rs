use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{error, info};

mod calendar;
mod config;
mod correlate;
mod error;
mod identity;
mod interface;
mod lifecycle;
mod models;
mod policy;
mod session;
mod store;
mod web;

use crate::models::Role;
use crate::store::NewUser;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file
    if let Err(e) = dotenvy::dotenv() {
        // It's not fatal if .env doesn't exist, but good to know
        info!("No .env file found or failed to load: {}", e);
    }

    // Initialize logging with default filter if RUST_LOG is not set
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    info!("Helpdesk daemon starting...");

    let config = config::Config::from_env()?;

    info!("Initializing store at {}", config.database_path.display());
    let store = store::Store::new(&config.database_path).await?;
    store.init().await?;
    store
        .ensure_organization(config.default_org_id, &config.default_org_name)
        .await?;
    bootstrap_admin(&store, &config).await?;

    let sessions = session::SessionManager::new(Arc::new(
        session::MemorySessionStore::default(),
    ));
    let identity = identity::IdentityResolver::new(store.clone(), config.default_org_id);
    let calendar = calendar::CalendarClient::new(&config, store.clone());

    // Telegram bot, if a token is configured.
    let telegram = match config.telegram_token.clone() {
        Some(token) => Some(interface::telegram::TelegramInterface::new(
            token,
            store.clone(),
            identity.clone(),
        )?),
        None => {
            info!("No Telegram token found, skipping Telegram bot startup.");
            None
        }
    };
    let notifier = telegram.as_ref().map(|t| t.notifier());

    let state = web::AppState {
        correlator: correlate::Correlator::new(store.clone()),
        lifecycle: lifecycle::TicketLifecycle::new(store.clone()),
        store,
        sessions,
        calendar,
        notifier,
        oauth_states: Arc::new(Mutex::new(HashMap::new())),
    };
    let app = web::router(state);

    let addr = format!("{}:{}", config.http_host, config.http_port);
    info!("Starting HTTP server on {}", addr);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    let telegram_handle = tokio::spawn(async move {
        if let Some(telegram) = telegram {
            if let Err(e) = telegram.run().await {
                error!("Telegram bot stopped with error: {}", e);
            }
        } else {
            std::future::pending::<()>().await;
        }
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
        res = axum::serve(listener, app) => {
            if let Err(e) = res {
                error!("Server stopped with error: {}", e);
            }
        }
        _ = telegram_handle => {
            error!("Telegram handle finished unexpectedly");
        }
    }

    Ok(())
}

/// Create the initial admin account from ADMIN_EMAIL/ADMIN_PASSWORD when
/// the user table is empty, so a fresh deployment has a way in.
async fn bootstrap_admin(store: &store::Store, config: &config::Config) -> anyhow::Result<()> {
    let (Some(email), Some(password)) = (&config.admin_email, &config.admin_password) else {
        return Ok(());
    };
    if store.count_users().await? > 0 {
        return Ok(());
    }

    let admin = store
        .create_user(&NewUser {
            organization_id: config.default_org_id,
            telegram_id: None,
            username: None,
            email: Some(email.clone()),
            password_hash: Some(session::hash_password(password)?),
            role: Role::Admin,
            full_name: Some("Administrator".into()),
        })
        .await?;
    info!(user_id = admin.id, "bootstrapped admin account");
    Ok(())
}
