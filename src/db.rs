use crate::config::AppConfig;
use crate::entities;
use sea_orm::{ConnectOptions, ConnectionTrait, Database, DatabaseConnection, DbErr, Schema};
use std::time::Duration;
use tracing::{debug, info};

/// Type alias for a database connection pool
pub type DbPool = DatabaseConnection;

/// Establishes a connection pool using the application's pool settings.
pub async fn connect(config: &AppConfig) -> Result<DbPool, DbErr> {
    debug!("Connecting to database at {}", config.database_url);

    let mut opt = ConnectOptions::new(config.database_url.clone());
    opt.max_connections(config.db_max_connections)
        .min_connections(config.db_min_connections)
        .connect_timeout(Duration::from_secs(30))
        .acquire_timeout(Duration::from_secs(8))
        .idle_timeout(Duration::from_secs(600))
        .sqlx_logging(false);

    let pool = Database::connect(opt).await?;
    info!(
        "Database connected (max_connections={})",
        config.db_max_connections
    );
    Ok(pool)
}

/// Bootstraps the schema from the entity definitions. Safe to run on every
/// startup; existing tables are left alone.
pub async fn migrate(db: &DatabaseConnection) -> Result<(), DbErr> {
    let backend = db.get_database_backend();
    let schema = Schema::new(backend);

    let mut statements = vec![
        schema.create_table_from_entity(entities::Product),
        schema.create_table_from_entity(entities::CartLine),
        schema.create_table_from_entity(entities::Order),
        schema.create_table_from_entity(entities::OrderItem),
        schema.create_table_from_entity(entities::MpesaTransaction),
    ];

    for stmt in statements.iter_mut() {
        stmt.if_not_exists();
        db.execute(backend.build(&*stmt)).await?;
    }

    info!("Schema bootstrap complete");
    Ok(())
}
