//! Idempotent migration runner: applies every `CREATE TABLE IF NOT EXISTS`
//! / index statement in [`crate::schema`] on startup.

use crate::schema;
use libsql::Connection;
use memfuse_core::error::{Error, Result};

pub async fn run(conn: &Connection) -> Result<()> {
    for statement in schema::all_statements() {
        conn.execute(statement, ())
            .await
            .map_err(|e| Error::Storage(format!("migration failed: {e}")))?;
    }
    Ok(())
}
