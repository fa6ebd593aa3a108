//! Catalog queries and raw table access for SQLite.
//!
//! Everything here takes a `&mut SqliteConnection` so the same helpers run
//! on a pooled connection or inside a transaction.

use sqlx::SqliteConnection;
use tracing::{debug, warn};

use super::error::StorageResult;
use super::schema::Schema;
use super::snapshot::{BindValue, SnapshotRow, decode_row};

/// Quote an identifier for interpolation into SQL.
pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// List user tables from the catalog.
pub(crate) async fn list_tables(conn: &mut SqliteConnection) -> StorageResult<Vec<String>> {
    let tables = sqlx::query_scalar(
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
    )
    .fetch_all(conn)
    .await?;
    Ok(tables)
}

/// Exact row count of a table.
pub(crate) async fn row_count(conn: &mut SqliteConnection, table: &str) -> StorageResult<i64> {
    let sql = format!("SELECT COUNT(*) FROM {}", quote_ident(table));
    let count = sqlx::query_scalar(&sql).fetch_one(conn).await?;
    Ok(count)
}

/// Column names of a table, in declaration order.
pub(crate) async fn table_columns(
    conn: &mut SqliteConnection,
    table: &str,
) -> StorageResult<Vec<String>> {
    let columns = sqlx::query_scalar("SELECT name FROM pragma_table_info(?) ORDER BY cid")
        .bind(table)
        .fetch_all(conn)
        .await?;
    Ok(columns)
}

/// Run every table's create statement.
pub(crate) async fn apply_schema(conn: &mut SqliteConnection, schema: &Schema) -> StorageResult<()> {
    for table in &schema.tables {
        debug!(table = %table.name, "Applying table definition");
        sqlx::query(&table.create_sql).execute(&mut *conn).await?;
    }
    Ok(())
}

/// Required tables missing from the catalog.
pub(crate) async fn missing_tables(
    conn: &mut SqliteConnection,
    schema: &Schema,
) -> StorageResult<Vec<String>> {
    let present = list_tables(conn).await?;
    Ok(schema
        .table_names()
        .filter(|name| !present.iter().any(|p| p == name))
        .map(str::to_string)
        .collect())
}

/// Drop every user table in the catalog.
pub(crate) async fn drop_all_tables(conn: &mut SqliteConnection) -> StorageResult<Vec<String>> {
    let tables = list_tables(&mut *conn).await?;
    for table in &tables {
        sqlx::query(&format!("DROP TABLE IF EXISTS {}", quote_ident(table)))
            .execute(&mut *conn)
            .await?;
    }
    Ok(tables)
}

/// Read all rows of a table in insertion order.
pub(crate) async fn read_rows(
    conn: &mut SqliteConnection,
    table: &str,
) -> StorageResult<Vec<SnapshotRow>> {
    let sql = format!("SELECT * FROM {} ORDER BY rowid", quote_ident(table));
    let rows = sqlx::query(&sql).fetch_all(conn).await?;
    rows.iter().map(decode_row).collect()
}

/// Delete every row of a table.
pub(crate) async fn clear_table(conn: &mut SqliteConnection, table: &str) -> StorageResult<u64> {
    let result = sqlx::query(&format!("DELETE FROM {}", quote_ident(table)))
        .execute(conn)
        .await?;
    Ok(result.rows_affected())
}

/// Insert rows in order, skipping columns the table does not have.
pub(crate) async fn insert_rows(
    conn: &mut SqliteConnection,
    table: &str,
    rows: &[SnapshotRow],
) -> StorageResult<usize> {
    let columns = table_columns(&mut *conn, table).await?;

    for row in rows {
        let (names, values): (Vec<&str>, Vec<BindValue>) = row
            .iter()
            .filter(|(name, _)| {
                let known = columns.iter().any(|c| c == *name);
                if !known {
                    warn!(table, column = %name, "Skipping unknown column");
                }
                known
            })
            .map(|(name, value)| (name.as_str(), BindValue::from(value)))
            .unzip();

        let sql = if names.is_empty() {
            format!("INSERT INTO {} DEFAULT VALUES", quote_ident(table))
        } else {
            let quoted: Vec<String> = names.iter().map(|n| quote_ident(n)).collect();
            let placeholders = vec!["?"; names.len()].join(", ");
            format!(
                "INSERT INTO {} ({}) VALUES ({})",
                quote_ident(table),
                quoted.join(", "),
                placeholders
            )
        };

        let mut query = sqlx::query(&sql);
        for value in values {
            query = match value {
                BindValue::Null => query.bind(None::<String>),
                BindValue::Integer(i) => query.bind(i),
                BindValue::Real(f) => query.bind(f),
                BindValue::Text(s) => query.bind(s),
            };
        }
        query.execute(&mut *conn).await?;
    }

    Ok(rows.len())
}
