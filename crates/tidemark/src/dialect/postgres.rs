//! PostgreSQL dialect for migrations.

use super::MigrationDialect;
use crate::schema::{Column, Constraint, ForeignKey, PrimaryKey};

/// PostgreSQL dialect for migration SQL generation.
#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresDialect;

impl PostgresDialect {
    /// Creates a new PostgreSQL dialect.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    fn alter_table(&self, table: &str, action: String) -> String {
        format!("ALTER TABLE {} {}", self.quote_identifier(table), action)
    }
}

impl MigrationDialect for PostgresDialect {
    fn name(&self) -> &'static str {
        "postgresql"
    }

    fn alter_column_type(&self, table: &str, column: &Column) -> Option<String> {
        // USING lets casts that have no implicit conversion go through.
        let name = self.quote_identifier(&column.name);
        Some(self.alter_table(
            table,
            format!(
                "ALTER COLUMN {name} TYPE {ty} USING {name}::{ty}",
                ty = column.sql_type
            ),
        ))
    }

    fn set_column_nullable(&self, table: &str, column: &str, nullable: bool) -> Option<String> {
        let action = if nullable { "DROP NOT NULL" } else { "SET NOT NULL" };
        Some(self.alter_table(
            table,
            format!("ALTER COLUMN {} {}", self.quote_identifier(column), action),
        ))
    }

    fn set_column_default(
        &self,
        table: &str,
        column: &str,
        default: Option<&str>,
    ) -> Option<String> {
        let action = match default {
            Some(expr) => format!("SET DEFAULT {}", expr),
            None => "DROP DEFAULT".to_string(),
        };
        Some(self.alter_table(
            table,
            format!("ALTER COLUMN {} {}", self.quote_identifier(column), action),
        ))
    }

    fn add_foreign_key(&self, table: &str, fk: &ForeignKey) -> Option<String> {
        Some(self.alter_table(table, format!("ADD {}", self.foreign_key_clause(fk))))
    }

    fn drop_foreign_key(&self, table: &str, name: &str) -> Option<String> {
        Some(self.alter_table(
            table,
            format!("DROP CONSTRAINT {}", self.quote_identifier(name)),
        ))
    }

    fn add_constraint(&self, table: &str, constraint: &Constraint) -> Option<String> {
        Some(self.alter_table(table, format!("ADD {}", self.constraint_clause(constraint))))
    }

    fn drop_constraint(&self, table: &str, constraint: &Constraint) -> Option<String> {
        Some(self.alter_table(
            table,
            format!("DROP CONSTRAINT {}", self.quote_identifier(&constraint.name)),
        ))
    }

    fn add_primary_key(&self, table: &str, pk: &PrimaryKey) -> Option<String> {
        Some(self.alter_table(
            table,
            format!(
                "ADD CONSTRAINT {} PRIMARY KEY ({})",
                self.quote_identifier(&pk.name),
                self.quote_list(&pk.columns)
            ),
        ))
    }

    fn drop_primary_key(&self, table: &str, pk: &PrimaryKey) -> Option<String> {
        Some(self.alter_table(
            table,
            format!("DROP CONSTRAINT {}", self.quote_identifier(&pk.name)),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ForeignKeyAction;

    #[test]
    fn test_alter_column_forms() {
        let dialect = PostgresDialect::new();

        assert_eq!(
            dialect
                .alter_column_type("users", &Column::new("age", "bigint"))
                .unwrap(),
            "ALTER TABLE \"users\" ALTER COLUMN \"age\" TYPE bigint USING \"age\"::bigint"
        );
        assert_eq!(
            dialect.set_column_nullable("users", "age", false).unwrap(),
            "ALTER TABLE \"users\" ALTER COLUMN \"age\" SET NOT NULL"
        );
        assert_eq!(
            dialect.set_column_default("users", "age", None).unwrap(),
            "ALTER TABLE \"users\" ALTER COLUMN \"age\" DROP DEFAULT"
        );
        assert_eq!(
            dialect.set_column_default("users", "age", Some("18")).unwrap(),
            "ALTER TABLE \"users\" ALTER COLUMN \"age\" SET DEFAULT 18"
        );
    }

    #[test]
    fn test_foreign_key_sql() {
        let dialect = PostgresDialect::new();
        let fk = ForeignKey::new("posts_author_fk", &["author_id"], "users", &["id"])
            .on_delete(ForeignKeyAction::SetNull);

        assert_eq!(
            dialect.add_foreign_key("posts", &fk).unwrap(),
            "ALTER TABLE \"posts\" ADD CONSTRAINT \"posts_author_fk\" FOREIGN KEY (\"author_id\") REFERENCES \"users\" (\"id\") ON DELETE SET NULL ON UPDATE NO ACTION"
        );
        assert_eq!(
            dialect.drop_foreign_key("posts", "posts_author_fk").unwrap(),
            "ALTER TABLE \"posts\" DROP CONSTRAINT \"posts_author_fk\""
        );
    }

    #[test]
    fn test_primary_key_sql() {
        let dialect = PostgresDialect::new();
        let pk = PrimaryKey::new("memberships_pkey", &["user_id", "org_id"]);

        assert_eq!(
            dialect.add_primary_key("memberships", &pk).unwrap(),
            "ALTER TABLE \"memberships\" ADD CONSTRAINT \"memberships_pkey\" PRIMARY KEY (\"user_id\", \"org_id\")"
        );
        assert_eq!(
            dialect.drop_primary_key("memberships", &pk).unwrap(),
            "ALTER TABLE \"memberships\" DROP CONSTRAINT \"memberships_pkey\""
        );
    }
}
