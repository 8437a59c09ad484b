// Umbrella Bot v0.1
use axum::{
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::RwLock;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

mod config;
mod errors;
mod helpers;
mod routes;
mod services;
mod store;

use config::AppConfig;
use routes::webhook::AppState;
use services::line::LineClient;
use services::registry::UserRegistry;
use services::responder::IntentResponder;
use services::scheduler::{NotificationScheduler, SchedulerState, SharedSchedulerState, SystemClock};
use services::weather::WeatherClient;
use store::settings_file::SettingsFile;

/// How long shutdown waits for an in-progress scheduler tick before abandoning it.
const SCHEDULER_STOP_GRACE_SECS: u64 = 5;

/// OpenAPI document for the bot.
#[derive(OpenApi)]
#[openapi(
    info(
        title = "Umbrella Bot",
        version = "0.1.0",
        description = "LINE bot that tells users whether they need an umbrella today. \
            Classifies the hourly precipitation probability forecast for the user's \
            stored location and can push the answer daily at a chosen time.",
        license(name = "MIT"),
    ),
    tags(
        (name = "Health", description = "Service health check"),
        (name = "Webhook", description = "LINE Messaging API webhook"),
        (name = "Scheduler", description = "Daily notification scheduler status"),
    ),
    paths(
        routes::health::health_check,
        routes::webhook::callback,
        routes::scheduler::get_scheduler_status,
    ),
    components(
        schemas(
            routes::health::HealthResponse,
            services::scheduler::SchedulerState,
            errors::ErrorResponse,
        )
    )
)]
struct ApiDoc;

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "umbrella_bot=debug,tower_http=debug".into());

    if std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json")) {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

/// Log a fatal startup error and exit with status 1.
fn fatal(context: &str, err: impl std::fmt::Display) -> ! {
    tracing::error!("{}: {}", context, err);
    std::process::exit(1);
}

#[tokio::main]
async fn main() {
    init_tracing();

    let config = AppConfig::from_env().unwrap_or_else(|e| fatal("Invalid configuration", e));

    // Restore user settings; a malformed file must not be overwritten
    let registry = UserRegistry::new(SettingsFile::new(&config.settings_path));
    if let Err(e) = registry.load_all().await {
        fatal("Failed to load user settings", e);
    }

    let weather = WeatherClient::new(
        &config.weather_endpoint,
        &config.weather_username,
        &config.weather_password,
        &config.weather_language,
        &config.weather_units,
    )
    .unwrap_or_else(|e| fatal("Failed to create weather client", e));
    let line = LineClient::new(
        &config.line_api_base_url,
        &config.line_channel_access_token,
    )
    .unwrap_or_else(|e| fatal("Failed to create LINE client", e));

    let responder = Arc::new(IntentResponder::new(
        Arc::new(weather),
        config.thresholds,
        config.forecast_length_hours,
    ));

    // Spawn the notification scheduler
    let poll_interval = Duration::from_secs(config.poll_interval_secs);
    let scheduler_state: SharedSchedulerState = Arc::new(RwLock::new(SchedulerState::new(
        config.timezone,
        poll_interval,
    )));
    let scheduler = NotificationScheduler::new(
        registry.clone(),
        responder.clone(),
        Arc::new(line.clone()),
        Arc::new(SystemClock),
        config.timezone,
        poll_interval,
        config.notify_when_clear,
        scheduler_state.clone(),
    );
    let scheduler_handle = scheduler.spawn();

    let app_state = AppState {
        registry: registry.clone(),
        responder,
        line,
        channel_secret: Arc::from(config.line_channel_secret.as_str()),
    };

    // Build router
    let webhook_routes = Router::new()
        .route("/callback", post(routes::webhook::callback))
        .with_state(app_state);

    let health_routes = Router::new()
        .route("/api/v1/health", get(routes::health::health_check))
        .with_state(registry.clone());

    let scheduler_routes = Router::new()
        .route(
            "/api/v1/scheduler/status",
            get(routes::scheduler::get_scheduler_status),
        )
        .with_state(scheduler_state);

    let app = Router::new()
        .merge(webhook_routes)
        .merge(health_routes)
        .merge(scheduler_routes)
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .layer(TraceLayer::new_for_http());

    // Start server
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("Umbrella bot listening on {}", addr);
    tracing::info!(
        "Swagger UI available at http://localhost:{}/swagger-ui/",
        config.port
    );

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .unwrap_or_else(|e| fatal("Failed to bind TCP listener", e));
    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(async {
            shutdown_signal().await;
            tracing::info!("Shutdown signal received, stopping scheduler...");
        })
        .await
    {
        tracing::error!("Server terminated unexpectedly: {}", e);
    }

    // Stop the scheduler, then flush settings before exiting
    scheduler_handle
        .stop(Duration::from_secs(SCHEDULER_STOP_GRACE_SECS))
        .await;
    match registry.save_all().await {
        Ok(()) => tracing::info!("Saved user settings"),
        Err(e) => tracing::error!("Failed to save user settings: {}", e),
    }

    tracing::info!("Server stopped cleanly");
}
