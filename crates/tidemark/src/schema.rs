//! Schema snapshot types.
//!
//! A [`Snapshot`] describes the structure of a database at one point in time.
//! Two of them meet in every comparison: the *desired* snapshot (what the code
//! expects) and the *actual* snapshot (what the database currently has). Both
//! are plain values; this module has no behavior beyond construction helpers
//! and the comparisons the differ relies on.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Identity generation mode for a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum IdentityMode {
    /// Not an identity column.
    #[default]
    None,
    /// `GENERATED ALWAYS AS IDENTITY`.
    Always,
    /// `GENERATED BY DEFAULT AS IDENTITY`.
    ByDefault,
}

impl IdentityMode {
    /// Returns the SQL clause for this mode, if any.
    #[must_use]
    pub fn to_sql(&self) -> Option<&'static str> {
        match self {
            Self::None => None,
            Self::Always => Some("GENERATED ALWAYS AS IDENTITY"),
            Self::ByDefault => Some("GENERATED BY DEFAULT AS IDENTITY"),
        }
    }
}

/// Foreign key action (ON DELETE, ON UPDATE).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ForeignKeyAction {
    /// No action (error if referenced row is deleted/updated).
    #[default]
    NoAction,
    /// Cascade the delete/update to referencing rows.
    Cascade,
    /// Restrict (same as NoAction but checked immediately).
    Restrict,
    /// Set the foreign key column to NULL.
    SetNull,
    /// Set the foreign key column to its default value.
    SetDefault,
}

impl ForeignKeyAction {
    /// Returns the SQL representation of this action.
    #[must_use]
    pub fn to_sql(&self) -> &'static str {
        match self {
            Self::NoAction => "NO ACTION",
            Self::Cascade => "CASCADE",
            Self::Restrict => "RESTRICT",
            Self::SetNull => "SET NULL",
            Self::SetDefault => "SET DEFAULT",
        }
    }
}

/// A table column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    /// Column name, unique within its table.
    pub name: String,
    /// SQL type as written, e.g. `varchar(255)`. Compared textually.
    pub sql_type: String,
    /// Whether the column allows NULL values.
    pub nullable: bool,
    /// Whether the column carries a UNIQUE constraint.
    #[serde(default)]
    pub unique: bool,
    /// Whether the column auto-increments.
    #[serde(default)]
    pub auto_increment: bool,
    /// Identity generation mode.
    #[serde(default)]
    pub identity: IdentityMode,
    /// Default expression as raw SQL.
    #[serde(default)]
    pub default: Option<String>,
    /// Ordinal position, used to order columns in CREATE statements.
    #[serde(default)]
    pub position: usize,
}

impl Column {
    /// Creates a nullable column with no default.
    #[must_use]
    pub fn new(name: impl Into<String>, sql_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sql_type: sql_type.into(),
            nullable: true,
            unique: false,
            auto_increment: false,
            identity: IdentityMode::None,
            default: None,
            position: 0,
        }
    }

    /// Sets the column as NOT NULL.
    #[must_use]
    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    /// Sets the column as unique.
    #[must_use]
    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// Sets the column to auto-increment.
    #[must_use]
    pub fn auto_increment(mut self) -> Self {
        self.auto_increment = true;
        self
    }

    /// Sets the identity mode.
    #[must_use]
    pub fn identity(mut self, mode: IdentityMode) -> Self {
        self.identity = mode;
        self
    }

    /// Sets the default expression.
    #[must_use]
    pub fn default_expr(mut self, expr: impl Into<String>) -> Self {
        self.default = Some(expr.into());
        self
    }

    /// Sets the ordinal position.
    #[must_use]
    pub fn position(mut self, position: usize) -> Self {
        self.position = position;
        self
    }

    /// Returns the default expression, treating an empty string as no default.
    #[must_use]
    pub fn default_sql(&self) -> Option<&str> {
        self.default.as_deref().filter(|expr| !expr.is_empty())
    }
}

/// A primary key constraint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PrimaryKey {
    /// Constraint name.
    pub name: String,
    /// Key columns, in order.
    pub columns: Vec<String>,
}

impl PrimaryKey {
    /// Creates a primary key.
    #[must_use]
    pub fn new(name: impl Into<String>, columns: &[&str]) -> Self {
        Self {
            name: name.into(),
            columns: columns.iter().map(ToString::to_string).collect(),
        }
    }
}

/// A foreign key constraint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ForeignKey {
    /// Constraint name.
    pub name: String,
    /// Column(s) in the referencing table.
    pub columns: Vec<String>,
    /// Referenced table name.
    pub references_table: String,
    /// Referenced column(s).
    pub references_columns: Vec<String>,
    /// Action on delete.
    #[serde(default)]
    pub on_delete: ForeignKeyAction,
    /// Action on update.
    #[serde(default)]
    pub on_update: ForeignKeyAction,
}

impl ForeignKey {
    /// Creates a foreign key with `NO ACTION` on delete and update.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        columns: &[&str],
        references_table: impl Into<String>,
        references_columns: &[&str],
    ) -> Self {
        Self {
            name: name.into(),
            columns: columns.iter().map(ToString::to_string).collect(),
            references_table: references_table.into(),
            references_columns: references_columns.iter().map(ToString::to_string).collect(),
            on_delete: ForeignKeyAction::NoAction,
            on_update: ForeignKeyAction::NoAction,
        }
    }

    /// Sets the ON DELETE action.
    #[must_use]
    pub fn on_delete(mut self, action: ForeignKeyAction) -> Self {
        self.on_delete = action;
        self
    }

    /// Sets the ON UPDATE action.
    #[must_use]
    pub fn on_update(mut self, action: ForeignKeyAction) -> Self {
        self.on_update = action;
        self
    }
}

/// An index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Index {
    /// Index name.
    pub name: String,
    /// Indexed columns, in order.
    pub columns: Vec<String>,
    /// Whether this is a unique index.
    #[serde(default)]
    pub unique: bool,
}

impl Index {
    /// Creates a non-unique index.
    #[must_use]
    pub fn new(name: impl Into<String>, columns: &[&str]) -> Self {
        Self {
            name: name.into(),
            columns: columns.iter().map(ToString::to_string).collect(),
            unique: false,
        }
    }

    /// Makes this a unique index.
    #[must_use]
    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }
}

/// Kind of a named table constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConstraintKind {
    /// `UNIQUE (columns)`.
    Unique,
    /// `CHECK (expression)`.
    Check,
}

/// A named table constraint other than primary and foreign keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Constraint {
    /// Constraint name.
    pub name: String,
    /// Constraint kind.
    pub kind: ConstraintKind,
    /// Constrained columns.
    #[serde(default)]
    pub columns: Vec<String>,
    /// Check expression, for [`ConstraintKind::Check`].
    #[serde(default)]
    pub check: Option<String>,
}

impl Constraint {
    /// Creates a unique constraint over `columns`.
    #[must_use]
    pub fn unique(name: impl Into<String>, columns: &[&str]) -> Self {
        Self {
            name: name.into(),
            kind: ConstraintKind::Unique,
            columns: columns.iter().map(ToString::to_string).collect(),
            check: None,
        }
    }

    /// Creates a check constraint.
    #[must_use]
    pub fn check(name: impl Into<String>, expr: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ConstraintKind::Check,
            columns: Vec::new(),
            check: Some(expr.into()),
        }
    }
}

/// Structure of a single table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Table {
    /// Table name.
    pub name: String,
    /// Columns, in declaration order.
    pub columns: Vec<Column>,
    /// Primary key, if any.
    #[serde(default)]
    pub primary_key: Option<PrimaryKey>,
    /// Foreign keys by name.
    #[serde(default)]
    pub foreign_keys: BTreeMap<String, ForeignKey>,
    /// Indexes by name.
    #[serde(default)]
    pub indexes: BTreeMap<String, Index>,
    /// Constraints by name.
    #[serde(default)]
    pub constraints: BTreeMap<String, Constraint>,
}

impl Table {
    /// Creates an empty table.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            primary_key: None,
            foreign_keys: BTreeMap::new(),
            indexes: BTreeMap::new(),
            constraints: BTreeMap::new(),
        }
    }

    /// Adds a column. A column without an explicit position is placed after
    /// the existing ones; a column with an existing name replaces it and, unless
    /// given a position, takes over the replaced column's slot.
    #[must_use]
    pub fn column(mut self, mut column: Column) -> Self {
        if let Some(existing) = self.columns.iter_mut().find(|c| c.name == column.name) {
            if column.position == 0 {
                column.position = existing.position;
            }
            *existing = column;
        } else {
            if column.position == 0 {
                column.position = self.columns.len() + 1;
            }
            self.columns.push(column);
        }
        self
    }

    /// Sets the primary key.
    #[must_use]
    pub fn primary_key(mut self, name: impl Into<String>, columns: &[&str]) -> Self {
        self.primary_key = Some(PrimaryKey::new(name, columns));
        self
    }

    /// Adds a foreign key.
    #[must_use]
    pub fn foreign_key(mut self, fk: ForeignKey) -> Self {
        self.foreign_keys.insert(fk.name.clone(), fk);
        self
    }

    /// Adds an index.
    #[must_use]
    pub fn index(mut self, index: Index) -> Self {
        self.indexes.insert(index.name.clone(), index);
        self
    }

    /// Adds a constraint.
    #[must_use]
    pub fn constraint(mut self, constraint: Constraint) -> Self {
        self.constraints.insert(constraint.name.clone(), constraint);
        self
    }

    /// Gets a column by name.
    #[must_use]
    pub fn get_column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Returns the columns ordered by position, ties kept in declaration order.
    #[must_use]
    pub fn ordered_columns(&self) -> Vec<&Column> {
        let mut columns: Vec<&Column> = self.columns.iter().collect();
        columns.sort_by_key(|c| c.position);
        columns
    }
}

/// A schema snapshot: every table, keyed by name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Tables by name.
    pub tables: BTreeMap<String, Table>,
}

impl Snapshot {
    /// Creates an empty snapshot.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a table, replacing any table with the same name.
    #[must_use]
    pub fn table(mut self, table: Table) -> Self {
        self.tables.insert(table.name.clone(), table);
        self
    }

    /// Gets a table by name.
    #[must_use]
    pub fn get_table(&self, name: &str) -> Option<&Table> {
        self.tables.get(name)
    }

    /// Returns table names in lexical order.
    pub fn table_names(&self) -> impl Iterator<Item = &str> {
        self.tables.keys().map(String::as_str)
    }

    /// Returns true if the snapshot has no tables.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Parses a snapshot from its JSON representation.
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }

    /// Serializes the snapshot to pretty-printed JSON.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_column_builder() {
        let col = Column::new("email", "varchar(255)")
            .not_null()
            .unique()
            .default_expr("''");

        assert_eq!(col.name, "email");
        assert!(!col.nullable);
        assert!(col.unique);
        assert_eq!(col.default_sql(), Some("''"));
    }

    #[test]
    fn test_empty_default_is_no_default() {
        let col = Column::new("flag", "boolean").default_expr("");
        assert_eq!(col.default_sql(), None);
    }

    #[test]
    fn test_table_assigns_positions() {
        let table = Table::new("users")
            .column(Column::new("id", "bigserial"))
            .column(Column::new("email", "text"))
            .column(Column::new("created_at", "timestamptz").position(1));

        let names: Vec<&str> = table
            .ordered_columns()
            .iter()
            .map(|c| c.name.as_str())
            .collect();
        assert_eq!(names, vec!["id", "created_at", "email"]);
    }

    #[test]
    fn test_table_replaces_same_named_column() {
        let table = Table::new("users")
            .column(Column::new("id", "integer"))
            .column(Column::new("id", "bigint"));

        assert_eq!(table.columns.len(), 1);
        assert_eq!(table.columns[0].sql_type, "bigint");
    }

    #[test]
    fn test_replaced_column_keeps_its_position() {
        let table = Table::new("users")
            .column(Column::new("id", "integer"))
            .column(Column::new("email", "text"))
            .column(Column::new("id", "uuid").not_null());

        let names: Vec<&str> = table
            .ordered_columns()
            .iter()
            .map(|c| c.name.as_str())
            .collect();
        assert_eq!(names, vec!["id", "email"]);
        assert_eq!(table.get_column("id").unwrap().sql_type, "uuid");
    }

    #[test]
    fn test_snapshot_iterates_lexically() {
        let snapshot = Snapshot::new()
            .table(Table::new("users"))
            .table(Table::new("accounts"))
            .table(Table::new("posts"));

        let names: Vec<&str> = snapshot.table_names().collect();
        assert_eq!(names, vec!["accounts", "posts", "users"]);
    }

    #[test]
    fn test_snapshot_json() {
        let snapshot = Snapshot::new().table(
            Table::new("posts")
                .column(Column::new("id", "bigint").not_null())
                .column(Column::new("author_id", "bigint"))
                .primary_key("posts_pkey", &["id"])
                .foreign_key(
                    ForeignKey::new("posts_author_fk", &["author_id"], "users", &["id"])
                        .on_delete(ForeignKeyAction::Cascade),
                ),
        );

        let json = snapshot.to_json().unwrap();
        assert!(json.contains("\"on_delete\": \"cascade\""));
        assert_eq!(Snapshot::from_json(&json).unwrap(), snapshot);
    }

    #[test]
    fn test_minimal_json_uses_defaults() {
        let json = r#"{"tables": {"tags": {"name": "tags", "columns": [
            {"name": "label", "sql_type": "text", "nullable": false}
        ]}}}"#;

        let snapshot = Snapshot::from_json(json).unwrap();
        let column = &snapshot.get_table("tags").unwrap().columns[0];
        assert!(!column.unique);
        assert_eq!(column.identity, IdentityMode::None);
        assert_eq!(column.default, None);
    }
}
