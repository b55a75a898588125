//! Connection strings and statement text

use super::credentials::Credentials;
use crate::error::{ConnectError, Result};

/// Seconds libpq-style connect waits before giving up
pub const CONNECT_TIMEOUT_SECS: u64 = 10;

/// Connection string for a session through a tunnel on `local_port`.
///
/// Values are emitted unquoted, so anything that would need quoting is
/// rejected instead.
pub fn connection_string(local_port: u16, credentials: &Credentials) -> Result<String> {
    check_parameter("user", &credentials.user)?;
    check_parameter("dbname", &credentials.database)?;
    if let Some(password) = &credentials.password {
        check_parameter("password", password)?;
    }

    let mut conn = format!(
        "host=127.0.0.1 port={} user={} dbname={} sslmode=disable connect_timeout={}",
        local_port, credentials.user, credentials.database, CONNECT_TIMEOUT_SECS
    );
    if let Some(password) = &credentials.password {
        conn.push_str(" password=");
        conn.push_str(password);
    }
    Ok(conn)
}

fn check_parameter(field: &'static str, value: &str) -> Result<()> {
    let bad = value.is_empty()
        || value
            .chars()
            .any(|c| c.is_whitespace() || c == '\'' || c == '"' || c == '\\');
    if bad {
        return Err(ConnectError::Malformed {
            field,
            value: if field == "password" {
                "<redacted>".to_string()
            } else {
                value.to_string()
            },
        }
        .into());
    }
    Ok(())
}

/// Double-quote an identifier, doubling embedded quotes
pub fn quote_identifier(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Drop and recreate `schema`, owned by `owner`
pub fn recreate_schema(schema: &str, owner: &str) -> String {
    let schema = quote_identifier(schema);
    format!(
        "DROP SCHEMA IF EXISTS {schema} CASCADE; CREATE SCHEMA {schema} AUTHORIZATION {};",
        quote_identifier(owner)
    )
}

/// Create one empty table in `schema`
pub fn create_table(schema: &str, table: &str) -> String {
    format!(
        "CREATE TABLE {}.{} (id bigserial)",
        quote_identifier(schema),
        quote_identifier(table)
    )
}

/// Count of tables in a schema; bound parameter `$1` is the schema
pub const COUNT_TABLES: &str =
    "SELECT count(*) FROM information_schema.tables WHERE table_schema = $1";

/// Streaming replication connections as the primary sees them
pub const REPLICATION_STATUS: &str =
    "SELECT application_name, state FROM pg_stat_replication";

pub const IS_IN_RECOVERY: &str = "SELECT pg_is_in_recovery()";

/// Sample rows table, created if missing
pub fn create_rows_table(table: &str) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {} (\
         id bigserial PRIMARY KEY, \
         name text NOT NULL, \
         int_value bigint NOT NULL, \
         float_value double precision NOT NULL)",
        quote_identifier(table)
    )
}

/// Drop the sample rows table left by an earlier run and create it empty
pub fn recreate_rows_table(table: &str) -> String {
    format!(
        "DROP TABLE IF EXISTS {}; {}",
        quote_identifier(table),
        create_rows_table(table)
    )
}

/// Insert one sample row; parameters are name, int value, float value
pub fn insert_row(table: &str) -> String {
    format!(
        "INSERT INTO {} (name, int_value, float_value) VALUES ($1, $2, $3)",
        quote_identifier(table)
    )
}

pub fn count_rows(table: &str) -> String {
    format!("SELECT count(*) FROM {}", quote_identifier(table))
}
