//! Table definitions for the local store.
//!
//! The schema is plain data: an ordered list of tables, each with an
//! idempotent `CREATE TABLE IF NOT EXISTS` statement, plus an optional seed
//! set that is written once into an empty primary table.

use serde_json::json;

use super::snapshot::SnapshotRow;

/// A required table and the statement that creates it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSpec {
    pub name: String,
    pub create_sql: String,
}

impl TableSpec {
    pub fn new(name: impl Into<String>, create_sql: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            create_sql: create_sql.into(),
        }
    }
}

/// Rows written into `table` the first time it is found empty.
#[derive(Debug, Clone, PartialEq)]
pub struct SeedSpec {
    pub table: String,
    pub rows: Vec<SnapshotRow>,
}

/// The fixed table set of the local store.
#[derive(Debug, Clone, PartialEq)]
pub struct Schema {
    pub tables: Vec<TableSpec>,
    pub seed: Option<SeedSpec>,
}

impl Schema {
    pub fn new(tables: Vec<TableSpec>) -> Self {
        Self { tables, seed: None }
    }

    pub fn with_seed(mut self, seed: SeedSpec) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Names of all required tables, in creation order.
    pub fn table_names(&self) -> impl Iterator<Item = &str> {
        self.tables.iter().map(|t| t.name.as_str())
    }

    pub fn contains(&self, table: &str) -> bool {
        self.tables.iter().any(|t| t.name == table)
    }

    /// The application schema.
    ///
    /// `category` is the primary data table and receives the default
    /// category set on first start. `profile` holds the local user profile;
    /// JSON-structured columns (`preferences`, `attachments`) are TEXT.
    pub fn application() -> Self {
        Self::new(vec![
            TableSpec::new(
                "profile",
                "CREATE TABLE IF NOT EXISTS profile (
                    id TEXT PRIMARY KEY NOT NULL,
                    display_name TEXT NOT NULL,
                    preferences TEXT NOT NULL DEFAULT '{}',
                    updated_at TEXT NOT NULL
                )",
            ),
            TableSpec::new(
                "category",
                "CREATE TABLE IF NOT EXISTS category (
                    id TEXT PRIMARY KEY NOT NULL,
                    name TEXT NOT NULL,
                    color TEXT,
                    sort_order INTEGER NOT NULL DEFAULT 0
                )",
            ),
            TableSpec::new(
                "entry",
                "CREATE TABLE IF NOT EXISTS entry (
                    id TEXT PRIMARY KEY NOT NULL,
                    category_id TEXT,
                    title TEXT NOT NULL,
                    body TEXT,
                    amount REAL,
                    attachments TEXT NOT NULL DEFAULT '[]',
                    created_at TEXT NOT NULL
                )",
            ),
            TableSpec::new(
                "setting",
                "CREATE TABLE IF NOT EXISTS setting (
                    key TEXT PRIMARY KEY NOT NULL,
                    value TEXT NOT NULL
                )",
            ),
        ])
        .with_seed(SeedSpec {
            table: "category".to_string(),
            rows: default_categories(),
        })
    }
}

impl Default for Schema {
    fn default() -> Self {
        Self::application()
    }
}

fn default_categories() -> Vec<SnapshotRow> {
    [
        ("general", "General", "#607d8b", 0),
        ("personal", "Personal", "#4caf50", 1),
        ("work", "Work", "#2196f3", 2),
    ]
    .into_iter()
    .filter_map(|(id, name, color, sort_order)| {
        json!({
            "id": id,
            "name": name,
            "color": color,
            "sort_order": sort_order,
        })
        .as_object()
        .cloned()
    })
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_application_schema_tables() {
        let schema = Schema::application();
        let names: Vec<&str> = schema.table_names().collect();
        assert_eq!(names, vec!["profile", "category", "entry", "setting"]);
    }

    #[test]
    fn test_application_schema_is_non_destructive() {
        for table in Schema::application().tables {
            assert!(
                table.create_sql.contains("IF NOT EXISTS"),
                "{} must not clobber existing data",
                table.name
            );
        }
    }

    #[test]
    fn test_seed_targets_known_table() {
        let schema = Schema::application();
        let seed = schema.seed.as_ref().expect("application schema has a seed");
        assert!(schema.contains(&seed.table));
        assert_eq!(seed.rows.len(), 3);
        assert_eq!(seed.rows[0]["id"], "general");
    }
}
