use std::sync::Arc;

use actix_cors::Cors;
use actix_web::{middleware::Logger, web, App, HttpServer};

use isobox::config::Config;
use isobox::dispatch::Dispatcher;
use isobox::http::handlers::{execute_code, health_check, submit_code, AppState};
use isobox::http::rate_limit::RateLimitMiddleware;
use isobox::http::request_id::RequestIdMiddleware;
use isobox::language::LanguageRegistry;
use isobox::stats::StatsSink;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    log::info!("Starting isobox server...");

    match std::process::Command::new("docker").arg("--version").output() {
        Ok(output) if output.status.success() => {
            let version = String::from_utf8_lossy(&output.stdout);
            log::info!("Docker available: {}", version.trim());
        }
        _ => {
            log::error!("Docker is not available or not running!");
            std::process::exit(1);
        }
    }

    let config = Config::from_env();
    let registry = Arc::new(LanguageRegistry::new());
    let (stats, _stats_handle) = StatsSink::spawn(1024);
    let dispatcher = Dispatcher::start(
        config.dispatch,
        registry.clone(),
        config.sandbox_root.clone(),
        stats,
    );

    let app_state = web::Data::new(AppState {
        dispatcher,
        registry,
    });

    let bind_address = format!("0.0.0.0:{}", config.port);
    log::info!("Server starting on {}", bind_address);

    // Built once and cloned into every worker thread so the token buckets
    // are shared process-wide rather than reset per worker.
    let rate_limiter = RateLimitMiddleware::new(config.rate_limit, config.rate_window);
    let read_timeout = config.read_timeout;
    let idle_timeout = config.idle_timeout;

    HttpServer::new(move || {
        App::new()
            .app_data(app_state.clone())
            .wrap(Logger::default())
            .wrap(RequestIdMiddleware)
            .wrap(rate_limiter.clone())
            .wrap(Cors::permissive())
            .route("/health", web::get().to(health_check))
            .route("/execute", web::post().to(execute_code))
            .route("/submit", web::post().to(submit_code))
    })
    .client_request_timeout(read_timeout)
    .keep_alive(idle_timeout)
    .bind(&bind_address)?
    .run()
    .await
}
