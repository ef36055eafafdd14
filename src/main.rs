use authcore::auth::AuthenticationService;
use authcore::configuration::get_configuration;
use authcore::retention;
use authcore::startup::run;
use authcore::store::PgStore;
use authcore::telemetry::init_telemetry;
use sqlx::postgres::PgPoolOptions;
use std::net::TcpListener;
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> std::io::Result<()> {
    let configuration = get_configuration().map_err(|e| {
        eprintln!("Failed to read configuration: {}", e);
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "Configuration error")
    })?;

    init_telemetry(configuration.application.log_format);
    tracing::info!("Configuration loaded, starting application");

    let database = &configuration.database;
    let pool = PgPoolOptions::new()
        .max_connections(database.max_connections)
        .acquire_timeout(Duration::from_secs(database.acquire_timeout_secs))
        .connect(&database.connection_string())
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Failed to create connection pool");
            std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "Database connection error",
            )
        })?;
    tracing::info!("Database connection pool created");

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Failed to run database migrations");
            std::io::Error::new(std::io::ErrorKind::Other, "Migration error")
        })?;

    let store = Arc::new(PgStore::new(pool));
    let service = AuthenticationService::new(
        store,
        configuration.jwt.clone(),
        configuration.auth.clone(),
    );

    let retention_job = retention::spawn(service.clone(), &configuration.auth);

    let address = format!(
        "{}:{}",
        configuration.application.host, configuration.application.port
    );
    let listener = TcpListener::bind(&address)?;
    tracing::info!(address = %address, "Server listening");

    let result = run(listener, service)?.await;

    retention_job.abort();
    tracing::info!("Server stopped");
    result
}
