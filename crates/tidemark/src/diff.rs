//! Structural diff between two snapshots.
//!
//! [`compare`] takes the desired and the actual [`Snapshot`] and reports what
//! has to change in the actual schema to make it match the desired one. The
//! comparison is exact: SQL types are compared as strings, names are compared
//! case-sensitively, and indexes, foreign keys and constraints are matched by
//! name only. A constraint whose definition changes but whose name stays the
//! same is reported as unchanged; give it a new name to force a recreate.

use std::collections::BTreeMap;

use crate::schema::{Column, Constraint, ForeignKey, Index, PrimaryKey, Snapshot, Table};

/// A change to an existing column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnChange {
    /// Column name.
    pub name: String,
    /// Definition in the actual snapshot.
    pub old: Column,
    /// Definition in the desired snapshot.
    pub new: Column,
    /// The SQL type strings differ.
    pub type_changed: bool,
    /// The nullable flags differ.
    pub null_changed: bool,
    /// The default expressions differ.
    pub default_changed: bool,
}

/// A change to a table's primary key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrimaryKeyChange {
    /// Primary key in the actual snapshot.
    pub old: Option<PrimaryKey>,
    /// Primary key in the desired snapshot; `None` means it is removed.
    pub new: Option<PrimaryKey>,
}

impl PrimaryKeyChange {
    /// Returns true if the change removes the primary key.
    #[must_use]
    pub fn is_removal(&self) -> bool {
        self.new.is_none()
    }
}

/// Changes for a table present in both snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TableDiff {
    /// Table name.
    pub table_name: String,
    /// Columns only in the desired table.
    pub columns_added: Vec<Column>,
    /// Columns only in the actual table, with their actual definitions.
    pub columns_dropped: Vec<Column>,
    /// Columns whose type, nullability or default differ.
    pub columns_modified: Vec<ColumnChange>,
    /// Indexes only in the desired table.
    pub indexes_added: Vec<Index>,
    /// Indexes only in the actual table.
    pub indexes_dropped: Vec<Index>,
    /// Foreign keys only in the desired table.
    pub foreign_keys_added: Vec<ForeignKey>,
    /// Foreign keys only in the actual table.
    pub foreign_keys_dropped: Vec<ForeignKey>,
    /// Constraints only in the desired table.
    pub constraints_added: Vec<Constraint>,
    /// Constraints only in the actual table.
    pub constraints_dropped: Vec<Constraint>,
    /// Primary key change, if any.
    pub primary_key_changed: Option<PrimaryKeyChange>,
}

impl TableDiff {
    /// Creates an empty diff for `table_name`.
    #[must_use]
    pub fn new(table_name: impl Into<String>) -> Self {
        Self {
            table_name: table_name.into(),
            ..Self::default()
        }
    }

    /// Returns true if nothing changed in this table.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.columns_added.is_empty()
            && self.columns_dropped.is_empty()
            && self.columns_modified.is_empty()
            && self.indexes_added.is_empty()
            && self.indexes_dropped.is_empty()
            && self.foreign_keys_added.is_empty()
            && self.foreign_keys_dropped.is_empty()
            && self.constraints_added.is_empty()
            && self.constraints_dropped.is_empty()
            && self.primary_key_changed.is_none()
    }

    /// Names of the dropped columns.
    #[must_use]
    pub fn dropped_column_names(&self) -> Vec<&str> {
        self.columns_dropped.iter().map(|c| c.name.as_str()).collect()
    }
}

/// Result of comparing two snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SchemaDiff {
    /// Tables only in the desired snapshot.
    pub tables_added: Vec<Table>,
    /// Tables only in the actual snapshot, with their actual definitions.
    pub tables_dropped: Vec<Table>,
    /// Tables in both snapshots that differ.
    pub tables_modified: Vec<TableDiff>,
}

impl SchemaDiff {
    /// Returns true if any table is added, dropped or modified.
    #[must_use]
    pub fn has_changes(&self) -> bool {
        !(self.tables_added.is_empty()
            && self.tables_dropped.is_empty()
            && self.tables_modified.iter().all(TableDiff::is_empty))
    }

    /// Names of the dropped tables.
    #[must_use]
    pub fn dropped_table_names(&self) -> Vec<&str> {
        self.tables_dropped.iter().map(|t| t.name.as_str()).collect()
    }

    /// Gets the diff for a modified table.
    #[must_use]
    pub fn table(&self, name: &str) -> Option<&TableDiff> {
        self.tables_modified.iter().find(|t| t.table_name == name)
    }
}

/// Compares `desired` against `actual`.
#[must_use]
pub fn compare(desired: &Snapshot, actual: &Snapshot) -> SchemaDiff {
    let mut diff = SchemaDiff::default();

    for (name, table) in &desired.tables {
        match actual.tables.get(name) {
            None => diff.tables_added.push(table.clone()),
            Some(current) => {
                let table_diff = diff_table(table, current);
                if !table_diff.is_empty() {
                    diff.tables_modified.push(table_diff);
                }
            }
        }
    }

    for (name, table) in &actual.tables {
        if !desired.tables.contains_key(name) {
            diff.tables_dropped.push(table.clone());
        }
    }

    diff
}

fn diff_table(desired: &Table, actual: &Table) -> TableDiff {
    let mut diff = TableDiff::new(&desired.name);

    for column in &desired.columns {
        match actual.get_column(&column.name) {
            None => diff.columns_added.push(column.clone()),
            Some(current) => {
                if let Some(change) = diff_column(current, column) {
                    diff.columns_modified.push(change);
                }
            }
        }
    }
    for column in &actual.columns {
        if desired.get_column(&column.name).is_none() {
            diff.columns_dropped.push(column.clone());
        }
    }

    let (added, dropped) = diff_by_name(&desired.indexes, &actual.indexes);
    diff.indexes_added = added;
    diff.indexes_dropped = dropped;

    let (added, dropped) = diff_by_name(&desired.foreign_keys, &actual.foreign_keys);
    diff.foreign_keys_added = added;
    diff.foreign_keys_dropped = dropped;

    let (added, dropped) = diff_by_name(&desired.constraints, &actual.constraints);
    diff.constraints_added = added;
    diff.constraints_dropped = dropped;

    if desired.primary_key != actual.primary_key {
        diff.primary_key_changed = Some(PrimaryKeyChange {
            old: actual.primary_key.clone(),
            new: desired.primary_key.clone(),
        });
    }

    diff
}

fn diff_column(old: &Column, new: &Column) -> Option<ColumnChange> {
    let type_changed = old.sql_type != new.sql_type;
    let null_changed = old.nullable != new.nullable;
    let default_changed = old.default_sql() != new.default_sql();

    if !(type_changed || null_changed || default_changed) {
        return None;
    }

    Some(ColumnChange {
        name: new.name.clone(),
        old: old.clone(),
        new: new.clone(),
        type_changed,
        null_changed,
        default_changed,
    })
}

/// Splits two name-keyed maps into (only in desired, only in actual).
fn diff_by_name<T: Clone>(
    desired: &BTreeMap<String, T>,
    actual: &BTreeMap<String, T>,
) -> (Vec<T>, Vec<T>) {
    let added = desired
        .iter()
        .filter(|(name, _)| !actual.contains_key(*name))
        .map(|(_, item)| item.clone())
        .collect();
    let dropped = actual
        .iter()
        .filter(|(name, _)| !desired.contains_key(*name))
        .map(|(_, item)| item.clone())
        .collect();
    (added, dropped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ForeignKey;

    fn users() -> Table {
        Table::new("users")
            .column(Column::new("id", "bigserial").not_null())
            .column(Column::new("email", "varchar(255)").not_null().unique())
            .primary_key("users_pkey", &["id"])
    }

    #[test]
    fn test_identical_snapshots_have_no_changes() {
        let snapshot = Snapshot::new().table(users()).table(
            Table::new("posts")
                .column(Column::new("id", "bigint"))
                .index(Index::new("posts_id_idx", &["id"])),
        );

        let diff = compare(&snapshot, &snapshot);
        assert!(!diff.has_changes());
        assert_eq!(diff, SchemaDiff::default());
    }

    #[test]
    fn test_empty_snapshots_have_no_changes() {
        assert!(!compare(&Snapshot::new(), &Snapshot::new()).has_changes());
    }

    #[test]
    fn test_detect_new_table() {
        let desired = Snapshot::new().table(users());
        let diff = compare(&desired, &Snapshot::new());

        assert!(diff.has_changes());
        assert_eq!(diff.tables_added, vec![users()]);
        assert!(diff.tables_dropped.is_empty());
        assert!(diff.tables_modified.is_empty());
    }

    #[test]
    fn test_detect_dropped_table() {
        let actual = Snapshot::new().table(users()).table(Table::new("audit"));
        let diff = compare(&Snapshot::new(), &actual);

        assert_eq!(diff.dropped_table_names(), vec!["audit", "users"]);
        assert!(diff.tables_added.is_empty());
    }

    #[test]
    fn test_detect_column_changes() {
        let actual = Snapshot::new().table(
            Table::new("accounts")
                .column(Column::new("id", "integer").not_null())
                .column(Column::new("legacy_flag", "boolean"))
                .column(Column::new("balance", "numeric(10,2)").default_expr("0")),
        );
        let desired = Snapshot::new().table(
            Table::new("accounts")
                .column(Column::new("id", "bigint").not_null())
                .column(Column::new("balance", "numeric(10,2)").not_null())
                .column(Column::new("currency", "char(3)")),
        );

        let diff = compare(&desired, &actual);
        let table = diff.table("accounts").unwrap();

        assert_eq!(table.dropped_column_names(), vec!["legacy_flag"]);
        assert_eq!(table.columns_added.len(), 1);
        assert_eq!(table.columns_added[0].name, "currency");

        assert_eq!(table.columns_modified.len(), 2);
        let id = &table.columns_modified[0];
        assert_eq!(id.name, "id");
        assert!(id.type_changed && !id.null_changed && !id.default_changed);

        let balance = &table.columns_modified[1];
        assert_eq!(balance.name, "balance");
        assert!(!balance.type_changed && balance.null_changed && balance.default_changed);
        assert_eq!(balance.old.default.as_deref(), Some("0"));
    }

    #[test]
    fn test_type_comparison_is_exact() {
        let actual = Snapshot::new().table(Table::new("t").column(Column::new("n", "int4")));
        let desired = Snapshot::new().table(Table::new("t").column(Column::new("n", "integer")));
        assert!(compare(&desired, &actual).has_changes());

        let desired = Snapshot::new().table(Table::new("t").column(Column::new("n", "INT4")));
        assert!(compare(&desired, &actual).has_changes());
    }

    #[test]
    fn test_empty_default_matches_no_default() {
        let actual = Snapshot::new().table(Table::new("t").column(Column::new("n", "text")));
        let desired = Snapshot::new()
            .table(Table::new("t").column(Column::new("n", "text").default_expr("")));
        assert!(!compare(&desired, &actual).has_changes());

        let desired = Snapshot::new()
            .table(Table::new("t").column(Column::new("n", "text").default_expr("'x'")));
        assert!(compare(&desired, &actual).has_changes());
    }

    #[test]
    fn test_position_is_not_a_diff_key() {
        let actual = Snapshot::new().table(
            Table::new("t")
                .column(Column::new("a", "text"))
                .column(Column::new("b", "text")),
        );
        let desired = Snapshot::new().table(
            Table::new("t")
                .column(Column::new("b", "text"))
                .column(Column::new("a", "text")),
        );
        assert!(!compare(&desired, &actual).has_changes());
    }

    #[test]
    fn test_indexes_match_by_name_only() {
        let actual = Snapshot::new().table(
            Table::new("t")
                .column(Column::new("a", "text"))
                .column(Column::new("b", "text"))
                .index(Index::new("t_idx", &["a"])),
        );
        let same_name = Snapshot::new().table(
            Table::new("t")
                .column(Column::new("a", "text"))
                .column(Column::new("b", "text"))
                .index(Index::new("t_idx", &["b"]).unique()),
        );
        assert!(!compare(&same_name, &actual).has_changes());

        let renamed = Snapshot::new().table(
            Table::new("t")
                .column(Column::new("a", "text"))
                .column(Column::new("b", "text"))
                .index(Index::new("t_b_idx", &["b"])),
        );
        let diff = compare(&renamed, &actual);
        let table = diff.table("t").unwrap();
        assert_eq!(table.indexes_added[0].name, "t_b_idx");
        assert_eq!(table.indexes_dropped[0].name, "t_idx");
    }

    #[test]
    fn test_foreign_keys_match_by_name_only() {
        let base = Table::new("posts").column(Column::new("author_id", "bigint"));
        let actual = Snapshot::new().table(
            base.clone()
                .foreign_key(ForeignKey::new("posts_author_fk", &["author_id"], "users", &["id"])),
        );
        let desired = Snapshot::new().table(base.foreign_key(ForeignKey::new(
            "posts_author_fk_v2",
            &["author_id"],
            "users",
            &["id"],
        )));

        let diff = compare(&desired, &actual);
        let table = diff.table("posts").unwrap();
        assert_eq!(table.foreign_keys_added[0].name, "posts_author_fk_v2");
        assert_eq!(table.foreign_keys_dropped[0].name, "posts_author_fk");
    }

    #[test]
    fn test_primary_key_changes() {
        let actual = Snapshot::new().table(users());

        let reordered = Snapshot::new().table(users().primary_key("users_pkey", &["email", "id"]));
        let diff = compare(&reordered, &actual);
        let change = diff.table("users").unwrap().primary_key_changed.as_ref().unwrap();
        assert_eq!(change.old.as_ref().unwrap().columns, vec!["id"]);
        assert_eq!(change.new.as_ref().unwrap().columns, vec!["email", "id"]);

        let mut without_pk = users();
        without_pk.primary_key = None;
        let diff = compare(&Snapshot::new().table(without_pk), &actual);
        let change = diff.table("users").unwrap().primary_key_changed.as_ref().unwrap();
        assert!(change.is_removal());
    }

    #[test]
    fn test_unchanged_tables_are_omitted() {
        let actual = Snapshot::new().table(users()).table(Table::new("tags"));
        let desired = Snapshot::new()
            .table(users())
            .table(Table::new("tags").column(Column::new("label", "text")));

        let diff = compare(&desired, &actual);
        assert_eq!(diff.tables_modified.len(), 1);
        assert_eq!(diff.tables_modified[0].table_name, "tags");
    }
}
