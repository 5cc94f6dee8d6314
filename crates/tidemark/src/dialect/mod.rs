//! Database dialect implementations.
//!
//! Each dialect knows how to render individual DDL statements for its
//! database. Statements a dialect cannot express return `None`; the planner
//! turns those into manual placeholders instead of silently skipping them.

mod postgres;
mod sqlite;

pub use postgres::PostgresDialect;
pub use sqlite::SqliteDialect;

use crate::schema::{Column, Constraint, ConstraintKind, ForeignKey, Index, PrimaryKey, Table};

/// Trait for database-specific SQL generation.
pub trait MigrationDialect: Send + Sync {
    /// Returns the dialect name.
    fn name(&self) -> &'static str;

    /// Quotes an identifier (table name, column name, etc.).
    fn quote_identifier(&self, name: &str) -> String {
        format!("\"{}\"", name.replace('"', "\"\""))
    }

    /// Quotes and joins a list of identifiers.
    fn quote_list(&self, names: &[String]) -> String {
        names
            .iter()
            .map(|n| self.quote_identifier(n))
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Generates column definition SQL. Type and default are emitted verbatim.
    fn column_definition(&self, column: &Column) -> String {
        let mut parts = vec![
            self.quote_identifier(&column.name),
            column.sql_type.clone(),
        ];

        if let Some(identity) = column.identity.to_sql() {
            parts.push(identity.to_string());
        }

        if !column.nullable {
            parts.push("NOT NULL".to_string());
        }

        if column.unique {
            parts.push("UNIQUE".to_string());
        }

        if let Some(default) = column.default_sql() {
            parts.push(format!("DEFAULT {}", default));
        }

        parts.join(" ")
    }

    /// Generates a named table-level constraint clause.
    fn constraint_clause(&self, constraint: &Constraint) -> String {
        let body = match constraint.kind {
            ConstraintKind::Unique => format!("UNIQUE ({})", self.quote_list(&constraint.columns)),
            ConstraintKind::Check => {
                format!("CHECK ({})", constraint.check.as_deref().unwrap_or("TRUE"))
            }
        };
        format!(
            "CONSTRAINT {} {}",
            self.quote_identifier(&constraint.name),
            body
        )
    }

    /// Generates a foreign key clause (shared by inline and ALTER forms).
    fn foreign_key_clause(&self, fk: &ForeignKey) -> String {
        format!(
            "CONSTRAINT {} FOREIGN KEY ({}) REFERENCES {} ({}) ON DELETE {} ON UPDATE {}",
            self.quote_identifier(&fk.name),
            self.quote_list(&fk.columns),
            self.quote_identifier(&fk.references_table),
            self.quote_list(&fk.references_columns),
            fk.on_delete.to_sql(),
            fk.on_update.to_sql()
        )
    }

    /// Returns true if CREATE TABLE carries the table's foreign keys.
    ///
    /// Only dialects that accept references to tables created later may
    /// inline them; otherwise the planner adds foreign keys once every table
    /// exists.
    fn inlines_foreign_keys(&self) -> bool {
        false
    }

    /// Returns true if `constraint` is rendered inside CREATE TABLE. Other
    /// constraints are added with [`add_constraint`](Self::add_constraint)
    /// right after the table is created.
    fn inlines_constraint(&self, _constraint: &Constraint) -> bool {
        true
    }

    /// Generates the table-level clauses following the column definitions:
    /// inlined constraints, then inlined foreign keys.
    fn table_clauses(&self, table: &Table) -> Vec<String> {
        let mut clauses: Vec<String> = table
            .constraints
            .values()
            .filter(|c| self.inlines_constraint(c))
            .map(|c| self.constraint_clause(c))
            .collect();

        if self.inlines_foreign_keys() {
            clauses.extend(
                table
                    .foreign_keys
                    .values()
                    .map(|fk| self.foreign_key_clause(fk)),
            );
        }
        clauses
    }

    /// Generates CREATE TABLE with columns, primary key and the clauses from
    /// [`table_clauses`](Self::table_clauses).
    fn create_table(&self, table: &Table) -> String {
        let mut defs: Vec<String> = table
            .ordered_columns()
            .into_iter()
            .map(|c| self.column_definition(c))
            .collect();

        if let Some(pk) = &table.primary_key {
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

    /// Generates SQL for dropping a table.
    fn drop_table(&self, name: &str) -> String {
        format!("DROP TABLE {}", self.quote_identifier(name))
    }

    /// Generates SQL for adding a column.
    fn add_column(&self, table: &str, column: &Column) -> String {
        format!(
            "ALTER TABLE {} ADD COLUMN {}",
            self.quote_identifier(table),
            self.column_definition(column)
        )
    }

    /// Generates SQL for dropping a column.
    fn drop_column(&self, table: &str, column: &str) -> String {
        format!(
            "ALTER TABLE {} DROP COLUMN {}",
            self.quote_identifier(table),
            self.quote_identifier(column)
        )
    }

    /// Generates SQL for creating an index.
    fn create_index(&self, table: &str, index: &Index) -> String {
        format!(
            "CREATE {}INDEX {} ON {} ({})",
            if index.unique { "UNIQUE " } else { "" },
            self.quote_identifier(&index.name),
            self.quote_identifier(table),
            self.quote_list(&index.columns)
        )
    }

    /// Generates SQL for dropping an index.
    fn drop_index(&self, _table: &str, index: &Index) -> String {
        format!("DROP INDEX {}", self.quote_identifier(&index.name))
    }

    /// Changes a column's type to the one in `column`.
    fn alter_column_type(&self, table: &str, column: &Column) -> Option<String>;

    /// Sets or drops NOT NULL on a column.
    fn set_column_nullable(&self, table: &str, column: &str, nullable: bool) -> Option<String>;

    /// Sets or drops a column default.
    fn set_column_default(
        &self,
        table: &str,
        column: &str,
        default: Option<&str>,
    ) -> Option<String>;

    /// Adds a foreign key to an existing table.
    fn add_foreign_key(&self, table: &str, fk: &ForeignKey) -> Option<String>;

    /// Drops a foreign key from a table.
    fn drop_foreign_key(&self, table: &str, name: &str) -> Option<String>;

    /// Adds a named constraint to an existing table.
    fn add_constraint(&self, table: &str, constraint: &Constraint) -> Option<String>;

    /// Drops a named constraint.
    fn drop_constraint(&self, table: &str, constraint: &Constraint) -> Option<String>;

    /// Adds a primary key to an existing table.
    fn add_primary_key(&self, table: &str, pk: &PrimaryKey) -> Option<String>;

    /// Drops a table's primary key.
    fn drop_primary_key(&self, table: &str, pk: &PrimaryKey) -> Option<String>;
}
