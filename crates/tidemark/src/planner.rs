//! Statement planner.
//!
//! Turns a [`SchemaDiff`] into an ordered list of forward ("up") statements
//! and an independently built list of inverse ("down") statements.
//!
//! Up order:
//!
//! 1. create new tables (columns, primary key, the constraints the dialect
//!    inlines, and foreign keys if the dialect inlines them)
//! 2. add new columns, then alter modified columns
//! 3. create new indexes, then add new constraints (including those of new
//!    tables that the dialect does not inline)
//! 4. add new foreign keys, now that every referenced table exists
//! 5. apply primary key changes
//! 6. drop removed foreign keys (including those owned by dropped tables),
//!    then removed constraints
//! 7. drop removed indexes
//! 8. drop removed columns
//! 9. drop removed tables
//!
//! Deferring every foreign key until all tables exist means tables that
//! reference each other need no dependency sorting. Dialects that inline
//! foreign keys must accept references to tables created later. Within a
//! step, statements for the same table are emitted together.
//!
//! Anything the dialect cannot express is emitted as a `-- MANUAL:` comment
//! and reported in [`MigrationPlan::warnings`].

use std::fmt;

use crate::diff::{ColumnChange, SchemaDiff, TableDiff};
use crate::dialect::MigrationDialect;
use crate::schema::{Column, Table};

/// Prefix of placeholder statements that need to be completed by hand.
pub const MANUAL_PREFIX: &str = "-- MANUAL:";

/// Which statement list a warning belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Forward statements.
    Up,
    /// Inverse statements.
    Down,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Up => write!(f, "up"),
            Self::Down => write!(f, "down"),
        }
    }
}

/// A statement the planner could not generate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanWarning {
    /// Statement list containing the placeholder.
    pub direction: Direction,
    /// Affected table.
    pub table: String,
    /// What has to be done by hand.
    pub message: String,
}

impl fmt::Display for PlanWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} migration needs a manual step on '{}': {}",
            self.direction, self.table, self.message
        )
    }
}

/// Forward and inverse statements for a diff.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationPlan {
    /// Forward statements, in execution order.
    pub up: Vec<String>,
    /// Inverse statements, in execution order.
    pub down: Vec<String>,
    /// Placeholders that require manual completion.
    pub warnings: Vec<PlanWarning>,
}

impl MigrationPlan {
    /// Returns true if there is nothing to execute in either direction.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.up.is_empty() && self.down.is_empty()
    }

    /// Returns true if any statement is a manual placeholder.
    #[must_use]
    pub fn requires_manual_steps(&self) -> bool {
        !self.warnings.is_empty()
    }
}

/// Generates the up and down statements for `diff`.
#[must_use]
pub fn generate_migration(diff: &SchemaDiff, dialect: &dyn MigrationDialect) -> MigrationPlan {
    let mut warnings = Vec::new();
    let up = build_up(diff, dialect, &mut warnings);
    let down = build_down(diff, dialect, &mut warnings);
    MigrationPlan { up, down, warnings }
}

/// Accumulates statements for one direction.
struct Statements<'w> {
    direction: Direction,
    sql: Vec<String>,
    warnings: &'w mut Vec<PlanWarning>,
}

impl<'w> Statements<'w> {
    fn new(direction: Direction, warnings: &'w mut Vec<PlanWarning>) -> Self {
        Self {
            direction,
            sql: Vec::new(),
            warnings,
        }
    }

    fn push(&mut self, sql: String) {
        self.sql.push(sql);
    }

    /// Pushes `sql`, or a placeholder plus a warning when the dialect
    /// returned nothing.
    fn push_or_manual(&mut self, table: &str, sql: Option<String>, description: String) {
        match sql {
            Some(sql) => self.sql.push(sql),
            None => {
                self.sql.push(format!("{} {}", MANUAL_PREFIX, description));
                self.warnings.push(PlanWarning {
                    direction: self.direction,
                    table: table.to_string(),
                    message: description,
                });
            }
        }
    }

    /// Emits the statements turning column `from` into column `to`.
    fn alter_column(
        &mut self,
        dialect: &dyn MigrationDialect,
        table: &str,
        change: &ColumnChange,
        from: &Column,
        to: &Column,
    ) {
        if change.type_changed {
            self.push_or_manual(
                table,
                dialect.alter_column_type(table, to),
                format!(
                    "change type of column '{}' from {} to {}",
                    to.name, from.sql_type, to.sql_type
                ),
            );
        }
        if change.null_changed {
            self.push_or_manual(
                table,
                dialect.set_column_nullable(table, &to.name, to.nullable),
                format!(
                    "make column '{}' {}",
                    to.name,
                    if to.nullable { "nullable" } else { "NOT NULL" }
                ),
            );
        }
        if change.default_changed {
            self.push_or_manual(
                table,
                dialect.set_column_default(table, &to.name, to.default_sql()),
                match to.default_sql() {
                    Some(expr) => format!("set default of column '{}' to {}", to.name, expr),
                    None => format!("drop default of column '{}'", to.name),
                },
            );
        }
    }

    /// Adds the constraints of a freshly created table that CREATE TABLE
    /// left out.
    fn separate_constraints(&mut self, dialect: &dyn MigrationDialect, table: &Table, verb: &str) {
        for constraint in table.constraints.values() {
            if !dialect.inlines_constraint(constraint) {
                self.push_or_manual(
                    &table.name,
                    dialect.add_constraint(&table.name, constraint),
                    format!("{} constraint '{}'", verb, constraint.name),
                );
            }
        }
    }

    fn finish(self) -> Vec<String> {
        self.sql
    }
}

fn build_up(
    diff: &SchemaDiff,
    dialect: &dyn MigrationDialect,
    warnings: &mut Vec<PlanWarning>,
) -> Vec<String> {
    let mut out = Statements::new(Direction::Up, warnings);
    let modified: &[TableDiff] = &diff.tables_modified;

    for table in &diff.tables_added {
        out.push(dialect.create_table(table));
    }

    for td in modified {
        for column in &td.columns_added {
            out.push(dialect.add_column(&td.table_name, column));
        }
    }
    for td in modified {
        for change in &td.columns_modified {
            out.alter_column(dialect, &td.table_name, change, &change.old, &change.new);
        }
    }

    for table in &diff.tables_added {
        for index in table.indexes.values() {
            out.push(dialect.create_index(&table.name, index));
        }
    }
    for td in modified {
        for index in &td.indexes_added {
            out.push(dialect.create_index(&td.table_name, index));
        }
    }
    for table in &diff.tables_added {
        out.separate_constraints(dialect, table, "add");
    }
    for td in modified {
        for constraint in &td.constraints_added {
            out.push_or_manual(
                &td.table_name,
                dialect.add_constraint(&td.table_name, constraint),
                format!("add constraint '{}'", constraint.name),
            );
        }
    }

    if !dialect.inlines_foreign_keys() {
        for table in &diff.tables_added {
            for fk in table.foreign_keys.values() {
                out.push_or_manual(
                    &table.name,
                    dialect.add_foreign_key(&table.name, fk),
                    format!("add foreign key '{}'", fk.name),
                );
            }
        }
    }
    for td in modified {
        for fk in &td.foreign_keys_added {
            out.push_or_manual(
                &td.table_name,
                dialect.add_foreign_key(&td.table_name, fk),
                format!("add foreign key '{}'", fk.name),
            );
        }
    }

    for td in modified {
        if let Some(change) = &td.primary_key_changed {
            if let Some(old) = &change.old {
                out.push_or_manual(
                    &td.table_name,
                    dialect.drop_primary_key(&td.table_name, old),
                    format!("drop primary key '{}'", old.name),
                );
            }
            if let Some(new) = &change.new {
                out.push_or_manual(
                    &td.table_name,
                    dialect.add_primary_key(&td.table_name, new),
                    format!("add primary key '{}' ({})", new.name, new.columns.join(", ")),
                );
            }
        }
    }

    for td in modified {
        for fk in &td.foreign_keys_dropped {
            out.push_or_manual(
                &td.table_name,
                dialect.drop_foreign_key(&td.table_name, &fk.name),
                format!("drop foreign key '{}'", fk.name),
            );
        }
    }
    for table in &diff.tables_dropped {
        for fk in table.foreign_keys.values() {
            // DROP TABLE removes the key anyway when the dialect cannot.
            if let Some(sql) = dialect.drop_foreign_key(&table.name, &fk.name) {
                out.push(sql);
            }
        }
    }
    for td in modified {
        for constraint in &td.constraints_dropped {
            out.push_or_manual(
                &td.table_name,
                dialect.drop_constraint(&td.table_name, constraint),
                format!("drop constraint '{}'", constraint.name),
            );
        }
    }

    for td in modified {
        for index in &td.indexes_dropped {
            out.push(dialect.drop_index(&td.table_name, index));
        }
    }

    for td in modified {
        for column in &td.columns_dropped {
            out.push(dialect.drop_column(&td.table_name, &column.name));
        }
    }

    for table in &diff.tables_dropped {
        out.push(dialect.drop_table(&table.name));
    }

    out.finish()
}

fn build_down(
    diff: &SchemaDiff,
    dialect: &dyn MigrationDialect,
    warnings: &mut Vec<PlanWarning>,
) -> Vec<String> {
    let mut out = Statements::new(Direction::Down, warnings);
    let modified: &[TableDiff] = &diff.tables_modified;

    for table in &diff.tables_dropped {
        out.push(dialect.create_table(table));
    }

    // Dropped columns come from the actual snapshot, so the original
    // definition is always available.
    for td in modified {
        for column in &td.columns_dropped {
            out.push(dialect.add_column(&td.table_name, column));
        }
    }

    for table in &diff.tables_dropped {
        for index in table.indexes.values() {
            out.push(dialect.create_index(&table.name, index));
        }
    }
    for td in modified {
        for index in &td.indexes_dropped {
            out.push(dialect.create_index(&td.table_name, index));
        }
    }
    for table in &diff.tables_dropped {
        out.separate_constraints(dialect, table, "restore");
    }
    for td in modified {
        for constraint in &td.constraints_dropped {
            out.push_or_manual(
                &td.table_name,
                dialect.add_constraint(&td.table_name, constraint),
                format!("restore constraint '{}'", constraint.name),
            );
        }
    }

    if !dialect.inlines_foreign_keys() {
        for table in &diff.tables_dropped {
            for fk in table.foreign_keys.values() {
                out.push_or_manual(
                    &table.name,
                    dialect.add_foreign_key(&table.name, fk),
                    format!("restore foreign key '{}'", fk.name),
                );
            }
        }
    }
    for td in modified {
        for fk in &td.foreign_keys_dropped {
            out.push_or_manual(
                &td.table_name,
                dialect.add_foreign_key(&td.table_name, fk),
                format!("restore foreign key '{}'", fk.name),
            );
        }
    }

    for td in modified {
        if let Some(change) = &td.primary_key_changed {
            if let Some(new) = &change.new {
                out.push_or_manual(
                    &td.table_name,
                    dialect.drop_primary_key(&td.table_name, new),
                    format!("drop primary key '{}'", new.name),
                );
            }
            if let Some(old) = &change.old {
                out.push_or_manual(
                    &td.table_name,
                    dialect.add_primary_key(&td.table_name, old),
                    format!("restore primary key '{}' ({})", old.name, old.columns.join(", ")),
                );
            }
        }
    }

    for td in modified {
        for change in &td.columns_modified {
            out.alter_column(dialect, &td.table_name, change, &change.new, &change.old);
        }
    }

    for td in modified {
        for fk in &td.foreign_keys_added {
            out.push_or_manual(
                &td.table_name,
                dialect.drop_foreign_key(&td.table_name, &fk.name),
                format!("drop foreign key '{}'", fk.name),
            );
        }
    }
    for table in &diff.tables_added {
        for fk in table.foreign_keys.values() {
            if let Some(sql) = dialect.drop_foreign_key(&table.name, &fk.name) {
                out.push(sql);
            }
        }
    }
    for td in modified {
        for constraint in &td.constraints_added {
            out.push_or_manual(
                &td.table_name,
                dialect.drop_constraint(&td.table_name, constraint),
                format!("drop constraint '{}'", constraint.name),
            );
        }
    }

    for td in modified {
        for index in &td.indexes_added {
            out.push(dialect.drop_index(&td.table_name, index));
        }
    }

    for td in modified {
        for column in &td.columns_added {
            out.push(dialect.drop_column(&td.table_name, &column.name));
        }
    }

    for table in &diff.tables_added {
        out.push(dialect.drop_table(&table.name));
    }

    out.finish()
}
