pub mod entities;
pub mod enums;
pub mod services;

use sea_orm::{ConnectOptions, ConnectionTrait, Database, DatabaseConnection, DbErr, Schema};
use tracing::info;

use self::entities::account;

/// Connects to the account database and makes sure the schema exists.
pub async fn connect(database_url: &str) -> Result<DatabaseConnection, DbErr> {
    let mut opt = ConnectOptions::new(database_url.to_owned());
    opt.max_connections(5).sqlx_logging(false);
    if database_url.starts_with("sqlite:") {
        // SQLite serialises writers anyway; a single connection also keeps
        // `sqlite::memory:` databases alive for the lifetime of the pool.
        opt.max_connections(1).min_connections(1);
    }

    let db = Database::connect(opt).await?;
    ensure_schema(&db).await?;
    Ok(db)
}

/// Creates the `accounts` table from the entity definition if it is missing.
pub async fn ensure_schema(db: &DatabaseConnection) -> Result<(), DbErr> {
    let backend = db.get_database_backend();
    let schema = Schema::new(backend);
    let mut stmt = schema.create_table_from_entity(account::Entity);
    stmt.if_not_exists();
    db.execute(backend.build(&stmt)).await?;
    info!("Account schema is ready.");
    Ok(())
}
