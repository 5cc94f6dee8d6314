//! SQLite dialect for migrations.
//!
//! SQLite has limited ALTER TABLE support: columns can be added and dropped
//! (3.35.0+), but column types, nullability, defaults, foreign keys and
//! primary keys can only be changed by recreating the table. Those operations
//! return `None` so the planner emits a manual placeholder for them.
//!
//! Foreign keys of new tables are declared inside CREATE TABLE; unique
//! constraints are always unique indexes, so they can be dropped by name.

use super::MigrationDialect;
use crate::schema::{Column, Constraint, ConstraintKind, ForeignKey, Index, PrimaryKey, Table};

/// SQLite migration dialect.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteDialect;

impl SqliteDialect {
    /// Creates a new SQLite dialect.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Returns the column that should carry an inline
    /// `PRIMARY KEY AUTOINCREMENT`, if any.
    fn autoincrement_key<'a>(&self, table: &'a Table) -> Option<&'a str> {
        let pk = table.primary_key.as_ref()?;
        match pk.columns.as_slice() {
            [only] => table
                .get_column(only)
                .filter(|c| c.auto_increment)
                .map(|c| c.name.as_str()),
            _ => None,
        }
    }
}

impl MigrationDialect for SqliteDialect {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    // Foreign keys are only checked when rows change, so a table may
    // reference one created after it.
    fn inlines_foreign_keys(&self) -> bool {
        true
    }

    // A named UNIQUE clause becomes an anonymous autoindex in SQLite, which
    // cannot be dropped by name. Unique constraints are created as indexes.
    fn inlines_constraint(&self, constraint: &Constraint) -> bool {
        constraint.kind != ConstraintKind::Unique
    }

    fn create_table(&self, table: &Table) -> String {
        let inline_key = self.autoincrement_key(table);

        let mut defs: Vec<String> = table
            .ordered_columns()
            .into_iter()
            .map(|c| {
                let def = self.column_definition(c);
                if Some(c.name.as_str()) == inline_key {
                    format!("{} PRIMARY KEY AUTOINCREMENT", def)
                } else {
                    def
                }
            })
            .collect();

        if let (Some(pk), None) = (&table.primary_key, inline_key) {
            defs.push(format!(
                "CONSTRAINT {} PRIMARY KEY ({})",
                self.quote_identifier(&pk.name),
                self.quote_list(&pk.columns)
            ));
        }

        defs.extend(self.table_clauses(table));

        format!(
            "CREATE TABLE {} (\n  {}\n)",
            self.quote_identifier(&table.name),
            defs.join(",\n  ")
        )
    }

    fn alter_column_type(&self, _table: &str, _column: &Column) -> Option<String> {
        None
    }

    fn set_column_nullable(&self, _table: &str, _column: &str, _nullable: bool) -> Option<String> {
        None
    }

    fn set_column_default(
        &self,
        _table: &str,
        _column: &str,
        _default: Option<&str>,
    ) -> Option<String> {
        None
    }

    fn add_foreign_key(&self, _table: &str, _fk: &ForeignKey) -> Option<String> {
        None
    }

    fn drop_foreign_key(&self, _table: &str, _name: &str) -> Option<String> {
        None
    }

    fn add_constraint(&self, table: &str, constraint: &Constraint) -> Option<String> {
        // Unique constraints after creation are done via unique indexes.
        match constraint.kind {
            ConstraintKind::Unique => Some(self.create_index(
                table,
                &Index {
                    name: constraint.name.clone(),
                    columns: constraint.columns.clone(),
                    unique: true,
                },
            )),
            ConstraintKind::Check => None,
        }
    }

    fn drop_constraint(&self, _table: &str, constraint: &Constraint) -> Option<String> {
        match constraint.kind {
            ConstraintKind::Unique => Some(format!(
                "DROP INDEX {}",
                self.quote_identifier(&constraint.name)
            )),
            ConstraintKind::Check => None,
        }
    }

    fn add_primary_key(&self, _table: &str, _pk: &PrimaryKey) -> Option<String> {
        None
    }

    fn drop_primary_key(&self, _table: &str, _pk: &PrimaryKey) -> Option<String> {
        None
    }
}
