use actix_cors::Cors;
use actix_web::{middleware::Compress, web, App, HttpServer};
use std::sync::Arc;
use tracing::{info, Level};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::EnvFilter;
use utoipa::OpenApi; // bring trait into scope for ApiDoc::openapi()
use utoipa_swagger_ui::SwaggerUi;

use disciplina::cache::{EventBus, QueryCache};
use disciplina::config::AppConfig;
use disciplina::openapi::ApiDoc;
use disciplina::repo::Repo;
use disciplina::storage::build_evidence_store;
use disciplina::{config, AppState, CaseService};

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    // Load .env automatically only in debug builds; deployments set the environment externally.
    if cfg!(debug_assertions) {
        let _ = dotenv::dotenv();
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .init();

    info!("Bootstrapping disciplina server");
    let cfg = AppConfig::from_env();
    info!(
        frontend = %cfg.frontend_url,
        retries = cfg.retry.retries,
        timeout_ms = cfg.retry.timeout.as_millis() as u64,
        "configuration loaded"
    );

    #[cfg(all(feature = "inmem-store", not(feature = "postgres-store")))]
    let repo: Arc<dyn Repo> = {
        info!("Using in-memory repository backend");
        Arc::new(disciplina::repo::inmem::InMemRepo::new())
    };

    #[cfg(feature = "postgres-store")]
    let repo: Arc<dyn Repo> = {
        use sqlx::postgres::PgPoolOptions;
        let db_url = cfg
            .database_url
            .clone()
            .ok_or_else(|| anyhow::anyhow!("DATABASE_URL must be set for postgres-store"))?;
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(cfg.retry.timeout)
            .connect_lazy(&db_url)?;
        info!("Using Postgres repository backend");
        Arc::new(disciplina::repo::pg::PgRepo::new(pool))
    };

    let store = build_evidence_store(&cfg.s3).await?;

    let cache = QueryCache::new(cfg.cache_ttl);
    let bus = EventBus::default();
    // also invalidates on events published outside the service
    let _listener = cache.follow(&bus);
    let service = CaseService::new(repo, store, cache, bus, cfg.retry, cfg.default_investigation_days);

    let openapi = ApiDoc::openapi();
    info!("OpenAPI spec generated");

    let frontend_url = cfg.frontend_url.clone();
    let server = HttpServer::new(move || {
        let cors = Cors::default()
            // during local dev allow React/Vite default ports
            .allowed_origin("http://localhost:5173")
            .allowed_origin("http://127.0.0.1:5173")
            .allowed_origin(&frontend_url)
            .allow_any_header()
            .allowed_methods(["GET", "POST", "PATCH", "OPTIONS"])
            .max_age(3600);

        App::new()
            .wrap(TracingLogger::default())
            .wrap(Compress::default())
            .wrap(cors)
            .app_data(web::Data::new(AppState { service: service.clone() }))
            .configure(config)
            .service(SwaggerUi::new("/docs/{_:.*}").url("/docs/openapi.json", openapi.clone()))
    })
    .bind((cfg.host.as_str(), cfg.port))?;

    info!("Listening on http://{}:{}", cfg.host, cfg.port);

    server.run().await?;
    Ok(())
}
