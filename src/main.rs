//! Staff Reviews
//!
//! A web application for running staff performance review cycles.
//!
//! ## Features
//!
//! - **Review cycles**: Periods laid out as dated stages
//! - **Nominations**: Staff pick their reviewers, internal or external
//! - **Feedback**: Reviewers answer per-role forms until the deadline
//! - **External reviewers**: Invitation codes and emailed sign-in links
//! - **Console**: Batch commands for running a cycle

mod batch;
mod clock;
mod commands;
mod config;
mod db;
mod export;
mod handlers;
mod mailer;
mod models;
mod validation;
mod workflow;

use axum::{
    middleware::{from_fn, from_fn_with_state},
    routing::{delete, get, post, put},
    Router,
};
use clap::Parser;
use clock::{Clock, SystemClock};
use commands::{Cli, Command};
use handlers::middleware::{require_admin, require_external, require_staff, security_headers};
use handlers::AppState;
use mailer::LogMailer;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::{
    cors::{Any, CorsLayer},
    limit::RequestBodyLimitLayer,
    services::ServeDir,
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Largest accepted request body (form YAML included)
const MAX_BODY_SIZE: usize = 1024 * 1024;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "staff_reviews=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    // Load configuration
    let config = config::Config::from_env()?;

    // Create database pool
    tracing::info!("Connecting to database...");
    let pool = db::create_pool(&config.database_url).await?;
    tracing::info!("Database connected");

    // Run migrations
    tracing::info!("Running database migrations...");
    db::run_migrations(&pool).await?;

    match cli.command {
        None | Some(Command::Serve) => serve(config, pool).await,
        Some(Command::Task(task)) => task.run(&pool, SystemClock.now(), config.timezone).await,
    }
}

async fn serve(
    config: config::Config,
    pool: sqlx::PgPool,
) -> Result<(), Box<dyn std::error::Error>> {
    tracing::info!("Starting Staff Reviews");
    tracing::info!("Environment: {:?}", config.environment);
    tracing::info!("Review time zone: {}", config.timezone);

    // Create application state
    let state = AppState {
        pool,
        clock: Arc::new(SystemClock),
        mailer: Arc::new(LogMailer),
        timezone: config.timezone,
        public_url: config.public_url.clone(),
        mail_sender: config.mail_sender.clone(),
        is_production: config.is_production(),
        trusted_proxies: config.trusted_proxies.clone(),
        session_hours: config.session_expiry_hours,
        external_session_hours: config.external_session_hours,
    };

    // Build CORS layer
    let cors = if config.is_production() {
        CorsLayer::new()
            .allow_origin(
                config
                    .cors_origins
                    .iter()
                    .filter_map(|o| o.parse().ok())
                    .collect::<Vec<_>>(),
            )
            .allow_methods(Any)
            .allow_headers(Any)
            .allow_credentials(true)
    } else {
        CorsLayer::permissive()
    };

    // Staff endpoints
    let staff_routes = Router::new()
        .route("/me", get(handlers::get_current_staff))
        .route("/cycle", get(handlers::get_cycle))
        .route("/cycle/nominations", get(handlers::my_nominations))
        .route("/cycle/to-review", get(handlers::to_review))
        .route("/cycle/line-reports", get(handlers::line_reports))
        .route("/cycle/forms", get(handlers::cycle_forms))
        .route("/cycle/external-invites", get(handlers::external_invites))
        .route("/nominations", post(handlers::create_nomination))
        .route("/nominations/:id", delete(handlers::delete_nomination))
        .route("/nominations/:id/send-invite", post(handlers::send_invite))
        .route("/responses", put(handlers::save_response))
        .route_layer(from_fn_with_state(state.clone(), require_staff));

    // Admin endpoints
    let admin_routes = Router::new()
        .route(
            "/periods",
            get(handlers::list_periods).post(handlers::create_period),
        )
        .route("/periods/:id", get(handlers::get_period))
        .route(
            "/periods/:id/default-stages",
            post(handlers::add_default_stages),
        )
        .route("/periods/:id/forms", post(handlers::add_forms))
        .route(
            "/periods/:id/nominate-line-managers",
            post(handlers::nominate_line_managers),
        )
        .route("/periods/:id/invitations", get(handlers::list_invitations))
        .route("/periods/:id/export", get(handlers::export_period))
        .route("/stages/:id", put(handlers::update_stage))
        .route("/nominations/:id/deadline", put(handlers::set_deadline))
        .route_layer(from_fn(require_admin))
        .route_layer(from_fn_with_state(state.clone(), require_staff));

    // External reviewer endpoints; sign-in routes are public
    let external_routes = Router::new()
        .route("/me", get(handlers::get_current_external))
        .route("/reviews", get(handlers::external_reviews))
        .route("/responses", put(handlers::save_external_response))
        .route_layer(from_fn_with_state(state.clone(), require_external))
        .route("/token", post(handlers::send_token))
        .route("/redeem", post(handlers::redeem_token))
        .route("/logout", post(handlers::external_logout));

    // Build API routes
    let api_routes = Router::new()
        .route("/login", post(handlers::staff_login))
        .route("/logout", post(handlers::staff_logout))
        .merge(staff_routes)
        .nest("/external", external_routes)
        .nest("/admin", admin_routes);

    // Build main router
    let app = Router::new()
        .nest("/api", api_routes)
        .nest_service("/", ServeDir::new(&config.frontend_dir))
        .layer(from_fn_with_state(state.clone(), security_headers))
        .layer(TraceLayer::new_for_http())
        .layer(RequestBodyLimitLayer::new(MAX_BODY_SIZE))
        .layer(cors)
        .with_state(state);

    // Start server
    let addr = config.server_addr();
    tracing::info!("Server listening on http://{}", addr);
    tracing::info!("Frontend served from: {}", config.frontend_dir);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
