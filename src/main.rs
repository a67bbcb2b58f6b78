mod api;
mod auth;
mod models;
mod store;
mod sync;

use actix_cors::Cors;
use actix_web::{middleware, web, App, HttpServer};
use std::env;
use std::sync::Arc;

use api::AppState;
use auth::AuthService;
use store::{SqliteSync, SyncStore};
use sync::{CounterReconciler, ReconcilePolicy, RelationshipToggle, ThreadRegistry};

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    // Initialize logger
    env_logger::init_from_env(env_logger::Env::default().default_filter_or("info"));

    // Load environment variables
    dotenvy::dotenv().ok();

    // Get configuration from environment
    let port: u16 = env::var("PORT")
        .unwrap_or_else(|_| "8071".to_string())
        .parse()
        .expect("PORT must be a number");

    let db_path = env::var("DATABASE_PATH").unwrap_or_else(|_| "feedsync.db".to_string());

    let jwt_secret = env::var("JWT_SECRET").unwrap_or_else(|_| {
        log::warn!("JWT_SECRET not set, using default (not secure for production!)");
        "default_jwt_secret_change_me".to_string()
    });

    let reconcile_every: u64 = env::var("RECONCILE_EVERY")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8);

    // Initialize the sync store
    let store: Arc<dyn SyncStore> =
        Arc::new(SqliteSync::new(&db_path).expect("Failed to initialize database"));

    // Initialize auth service
    let auth_service = Arc::new(AuthService::new(jwt_secret));

    // One counter-validation pass every N toggles, shared across workers
    let reconcile_policy = Arc::new(ReconcilePolicy::new(reconcile_every));

    log::info!("Database: {}", db_path);
    log::info!("Reconciling counters every {} toggles", reconcile_every);
    log::info!("Starting feedsync server on port {}", port);

    HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .wrap(middleware::Logger::default())
            .wrap(cors)
            // Registered individually for the auth extractor
            .app_data(web::Data::new(auth_service.clone()))
            .app_data(web::Data::new(AppState {
                store: store.clone(),
                threads: ThreadRegistry::new(store.clone()),
                interactions: RelationshipToggle::new(store.clone()),
                reconciler: CounterReconciler::new(store.clone()),
                reconcile_policy: reconcile_policy.clone(),
            }))
            .configure(api::configure_routes)
    })
    .bind(("0.0.0.0", port))?
    .run()
    .await
}
