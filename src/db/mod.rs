pub mod schema;
pub mod writer;
pub mod query;
pub mod store;

use anyhow::{Context, Result};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;
use std::path::Path;

pub type DbPool = r2d2::Pool<SqliteConnectionManager>;
pub type PooledConn = r2d2::PooledConnection<SqliteConnectionManager>;

pub fn open_or_create<P: AsRef<Path>>(db_path: P) -> Result<Connection> {
    let conn = Connection::open(db_path)?;
    schema::apply_pragmas(&conn)?;
    schema::apply_schema(&conn)?;
    Ok(conn)
}

/// Pool of WAL connections. Every pooled connection gets the same pragmas so
/// background workers can each hold their own connection.
pub fn create_pool<P: AsRef<Path>>(db_path: P, size: u32) -> Result<DbPool> {
    let db_path = db_path.as_ref();
    // Run the schema once on a dedicated connection before handing out pooled ones.
    drop(open_or_create(db_path).with_context(|| format!("Failed to open database {:?}", db_path))?);
    let manager = SqliteConnectionManager::file(db_path).with_init(|conn| schema::apply_pragmas(conn));
    let pool = r2d2::Pool::builder()
        .max_size(size.max(1))
        .build(manager)
        .context("Failed to build SQLite connection pool")?;
    Ok(pool)
}
