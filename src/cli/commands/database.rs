//! Local database commands.

use std::path::Path;

use tabled::{Table, Tabled, settings::Style};

use crate::cli::error::{CliError, CliResult};
use crate::storage::{DatabaseSnapshot, StorageManager};

#[derive(Tabled)]
struct RowCountRow {
    #[tabled(rename = "Table")]
    table: String,
    #[tabled(rename = "Rows")]
    rows: String,
}

/// Show location, connection state and row counts.
pub async fn status(storage: &StorageManager) -> CliResult<String> {
    let mut output = String::new();
    output.push_str(&format!("Database: {}\n", storage.db_path().display()));

    if !storage.exists() {
        output.push_str("Status:   not created\n");
        return Ok(output);
    }

    let counts = storage.row_counts().await?;
    output.push_str(&format!("Status:   {:?}\n\n", storage.state()));

    let rows: Vec<RowCountRow> = counts
        .into_iter()
        .map(|(table, rows)| RowCountRow {
            table,
            rows: rows.to_string(),
        })
        .collect();
    let mut table = Table::new(rows);
    table.with(Style::rounded());
    output.push_str(&table.to_string());
    Ok(output)
}

pub async fn reset(storage: &StorageManager) -> CliResult<String> {
    storage.reset().await?;
    Ok(format!(
        "✓ Database reset: {}",
        storage.db_path().display()
    ))
}

/// Write a full snapshot to `output` as JSON.
pub async fn export(storage: &StorageManager, output: &Path) -> CliResult<String> {
    let snapshot = storage.export_snapshot().await?;
    let bytes = snapshot.to_json_bytes()?;
    tokio::fs::write(output, bytes)
        .await
        .map_err(|source| CliError::File {
            path: output.to_path_buf(),
            source,
        })?;

    Ok(format!(
        "✓ Exported {} rows from {} tables to {}",
        snapshot.total_rows(),
        snapshot.tables.len(),
        output.display()
    ))
}

/// Replace local tables with the contents of a snapshot file.
pub async fn import(storage: &StorageManager, input: &Path) -> CliResult<String> {
    let bytes = tokio::fs::read(input)
        .await
        .map_err(|source| CliError::File {
            path: input.to_path_buf(),
            source,
        })?;
    let snapshot = DatabaseSnapshot::from_json_slice(&bytes)?;
    storage.import_snapshot(&snapshot).await?;

    Ok(format!(
        "✓ Imported {} rows from {}",
        snapshot.total_rows(),
        input.display()
    ))
}

pub async fn delete(storage: &StorageManager) -> CliResult<String> {
    if !storage.exists() {
        return Ok("ℹ Nothing to delete".to_string());
    }
    storage.delete().await?;
    Ok(format!("✓ Deleted {}", storage.db_path().display()))
}
