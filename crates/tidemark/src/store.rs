//! Migration files on disk.
//!
//! Each unit is stored as two SQL scripts in the migrations directory:
//! `<version>_<name>.up.sql` and `<version>_<name>.down.sql`. Statements are
//! terminated with `;`; manual placeholders are written as bare comments so
//! they survive a write/read cycle as their own statements.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;

use crate::error::{MigrateError, Result};
use crate::unit::{is_comment_only, is_manual_placeholder, MigrationUnit};

const UP_SUFFIX: &str = ".up.sql";
const DOWN_SUFFIX: &str = ".down.sql";

/// Reads and writes migration units in a directory.
#[derive(Debug, Clone)]
pub struct MigrationStore {
    dir: PathBuf,
}

impl MigrationStore {
    /// Creates a store rooted at `dir`. The directory is created on first
    /// write.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Returns the migrations directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Writes `unit` as a pair of scripts and returns the up script's path.
    ///
    /// Existing files are never overwritten, and a version already used by
    /// another unit is rejected.
    pub fn write(&self, unit: &MigrationUnit) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir)?;

        let up_path = self.dir.join(format!("{}{}", unit.id(), UP_SUFFIX));
        let down_path = self.dir.join(format!("{}{}", unit.id(), DOWN_SUFFIX));
        for path in [&up_path, &down_path] {
            if path.exists() {
                return Err(MigrateError::MigrationExists(path.clone()));
            }
        }

        for entry in fs::read_dir(&self.dir)? {
            let file_name = entry?.file_name();
            if let Some((version, _, _)) = parse_file_name(&file_name.to_string_lossy()) {
                if version == unit.version() {
                    return Err(MigrateError::DuplicateVersion(version.to_string()));
                }
            }
        }

        fs::write(&up_path, render_script(unit.up()))?;
        fs::write(&down_path, render_script(unit.down()))?;
        Ok(up_path)
    }

    /// Loads every unit in the directory, ascending by version.
    pub fn list(&self) -> Result<Vec<MigrationUnit>> {
        if !self.dir.is_dir() {
            return Err(MigrateError::MigrationsDirNotFound(self.dir.clone()));
        }

        let mut ups: BTreeMap<String, (String, PathBuf)> = BTreeMap::new();
        let mut downs: BTreeMap<String, (String, PathBuf)> = BTreeMap::new();

        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let Some(file_name) = path.file_name().map(|n| n.to_string_lossy().into_owned())
            else {
                continue;
            };
            let Some((version, name, is_up)) = parse_file_name(&file_name) else {
                continue;
            };

            let scripts = if is_up { &mut ups } else { &mut downs };
            if scripts
                .insert(version.to_string(), (name.to_string(), path.clone()))
                .is_some()
            {
                return Err(MigrateError::DuplicateVersion(version.to_string()));
            }
        }

        if let Some((version, (_, path))) = downs.iter().find(|(v, _)| !ups.contains_key(*v)) {
            return Err(MigrateError::ParseError {
                path: path.clone(),
                message: format!("no up script for version {}", version),
            });
        }

        let mut units = Vec::with_capacity(ups.len());
        for (version, (name, up_path)) in ups {
            let down_path = match downs.remove(&version) {
                Some((down_name, path)) if down_name == name => path,
                Some((down_name, path)) => {
                    return Err(MigrateError::ParseError {
                        path,
                        message: format!(
                            "down script is named '{}' but up script is named '{}'",
                            down_name, name
                        ),
                    });
                }
                None => {
                    return Err(MigrateError::ParseError {
                        path: up_path,
                        message: format!("missing down script for version {}", version),
                    });
                }
            };

            let up = split_statements(&fs::read_to_string(&up_path)?);
            let down = split_statements(&fs::read_to_string(&down_path)?);
            units.push(MigrationUnit::new(version, name, up, down)?);
        }

        Ok(units)
    }

    /// Loads the unit with the given version.
    pub fn read(&self, version: &str) -> Result<MigrationUnit> {
        self.list()?
            .into_iter()
            .find(|u| u.version() == version)
            .ok_or_else(|| MigrateError::MigrationNotFound(version.to_string()))
    }
}

/// Splits a file name into (version, name, is_up).
fn parse_file_name(file_name: &str) -> Option<(&str, &str, bool)> {
    let (stem, is_up) = if let Some(stem) = file_name.strip_suffix(UP_SUFFIX) {
        (stem, true)
    } else {
        (file_name.strip_suffix(DOWN_SUFFIX)?, false)
    };
    let (version, name) = stem.split_once('_')?;
    if version.is_empty() || name.is_empty() {
        return None;
    }
    Some((version, name, is_up))
}

fn render_script(statements: &[String]) -> String {
    let mut script = String::new();
    for statement in statements {
        script.push_str(statement.trim());
        if !is_comment_only(statement) {
            script.push(';');
        }
        script.push_str("\n\n");
    }
    script
}

/// Splits a SQL script into statements on top-level `;`.
///
/// Semicolons inside single- or double-quoted strings, dollar-quoted bodies
/// (`$$ ... $$`, `$tag$ ... $tag$`), `--` comments and `/* */` comments do
/// not terminate a statement. Comments preceding a statement stay attached to it; a block of
/// comments holding a manual placeholder becomes its own statement; any other
/// comment-only text is dropped.
#[must_use]
pub fn split_statements(script: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut i = 0;

    while let Some(c) = script[i..].chars().next() {
        match c {
            '\'' | '"' => {
                let end = closing_quote(script, i + 1, c);
                current.push_str(&script[i..end]);
                i = end;
                continue;
            }
            '-' if script[i..].starts_with("--") => {
                let end = script[i..].find('\n').map_or(script.len(), |n| i + n + 1);
                current.push_str(&script[i..end]);
                i = end;
                if is_manual_placeholder(&current) {
                    flush(&mut current, &mut statements);
                }
                continue;
            }
            '/' if script[i..].starts_with("/*") => {
                let end = script[i + 2..]
                    .find("*/")
                    .map_or(script.len(), |n| i + 2 + n + 2);
                current.push_str(&script[i..end]);
                i = end;
                continue;
            }
            '$' => {
                if let Some(tag) = dollar_tag(&script[i..]) {
                    let body = i + tag.len();
                    let end = script[body..]
                        .find(tag)
                        .map_or(script.len(), |n| body + n + tag.len());
                    current.push_str(&script[i..end]);
                    i = end;
                    continue;
                }
            }
            ';' => {
                flush(&mut current, &mut statements);
                i += 1;
                continue;
            }
            _ => {}
        }
        current.push(c);
        i += c.len_utf8();
    }

    flush(&mut current, &mut statements);
    statements
}

fn flush(current: &mut String, statements: &mut Vec<String>) {
    let statement = current.trim();
    if !statement.is_empty()
        && (!is_comment_only(statement) || is_manual_placeholder(statement))
    {
        statements.push(statement.to_string());
    }
    current.clear();
}

/// Returns the index just past the quote closing a string opened before
/// `start`. Doubled quotes are escapes.
fn closing_quote(script: &str, start: usize, quote: char) -> usize {
    let mut from = start;
    loop {
        match script[from..].find(quote) {
            None => return script.len(),
            Some(n) => {
                let after = from + n + 1;
                if script[after..].starts_with(quote) {
                    from = after + 1;
                } else {
                    return after;
                }
            }
        }
    }
}

/// Returns the `$tag$` opening `text`, if it starts with one.
fn dollar_tag(text: &str) -> Option<&str> {
    let rest = text.strip_prefix('$')?;
    let end = rest.find('$')?;
    let tag = &rest[..end];
    let valid = tag.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !tag.starts_with(|c: char| c.is_ascii_digit());
    valid.then(|| &text[..end + 2])
}

/// Returns a new version: the current UTC time as `YYYYMMDDHHMMSS`.
#[must_use]
pub fn generate_version() -> String {
    Utc::now().format("%Y%m%d%H%M%S").to_string()
}

/// Turns a free-form description into a file-name-safe migration name.
#[must_use]
pub fn slugify(description: &str) -> String {
    let mut slug = String::with_capacity(description.len());
    for c in description.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.is_empty() && !slug.ends_with('_') {
            slug.push('_');
        }
    }
    while slug.ends_with('_') {
        slug.pop();
    }
    slug
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn unit(version: &str, name: &str) -> MigrationUnit {
        MigrationUnit::new(
            version,
            name,
            vec![
                "CREATE TABLE \"users\" (\n  \"id\" bigint NOT NULL\n)".to_string(),
                "-- MANUAL: change type of column 'age' from integer to text".to_string(),
                "CREATE INDEX \"users_id_idx\" ON \"users\" (\"id\")".to_string(),
            ],
            vec!["DROP TABLE \"users\"".to_string()],
        )
        .unwrap()
    }

    #[test]
    fn test_write_then_list() {
        let dir = TempDir::new().unwrap();
        let store = MigrationStore::new(dir.path().join("migrations"));

        let original = unit("20240101000000", "create_users");
        let path = store.write(&original).unwrap();
        assert!(path.ends_with("20240101000000_create_users.up.sql"));

        let units = store.list().unwrap();
        assert_eq!(units, vec![original]);
    }

    #[test]
    fn test_write_refuses_overwrite() {
        let dir = TempDir::new().unwrap();
        let store = MigrationStore::new(dir.path());

        store.write(&unit("1", "a")).unwrap();
        assert!(matches!(
            store.write(&unit("1", "a")),
            Err(MigrateError::MigrationExists(_))
        ));
        assert!(matches!(
            store.write(&unit("1", "b")),
            Err(MigrateError::DuplicateVersion(v)) if v == "1"
        ));
    }

    #[test]
    fn test_list_sorted_and_read() {
        let dir = TempDir::new().unwrap();
        let store = MigrationStore::new(dir.path());
        store.write(&unit("3", "c")).unwrap();
        store.write(&unit("1", "a")).unwrap();
        store.write(&unit("2", "b")).unwrap();
        fs::write(dir.path().join("README.md"), "ignored").unwrap();

        let versions: Vec<String> = store
            .list()
            .unwrap()
            .iter()
            .map(|u| u.version().to_string())
            .collect();
        assert_eq!(versions, vec!["1", "2", "3"]);

        assert_eq!(store.read("2").unwrap().name(), "b");
        assert!(matches!(
            store.read("4"),
            Err(MigrateError::MigrationNotFound(_))
        ));
    }

    #[test]
    fn test_list_rejects_missing_down() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("1_a.up.sql"), "SELECT 1;").unwrap();

        let store = MigrationStore::new(dir.path());
        assert!(matches!(store.list(), Err(MigrateError::ParseError { .. })));
    }

    #[test]
    fn test_list_rejects_duplicate_versions() {
        let dir = TempDir::new().unwrap();
        for name in ["1_a", "1_b"] {
            fs::write(dir.path().join(format!("{name}.up.sql")), "SELECT 1;").unwrap();
            fs::write(dir.path().join(format!("{name}.down.sql")), "SELECT 1;").unwrap();
        }

        let store = MigrationStore::new(dir.path());
        assert!(matches!(
            store.list(),
            Err(MigrateError::DuplicateVersion(v)) if v == "1"
        ));
    }

    #[test]
    fn test_list_missing_dir() {
        let dir = TempDir::new().unwrap();
        let store = MigrationStore::new(dir.path().join("nope"));
        assert!(matches!(
            store.list(),
            Err(MigrateError::MigrationsDirNotFound(_))
        ));
    }

    #[test]
    fn test_split_respects_quotes_and_comments() {
        let script = "INSERT INTO t VALUES ('a;b', \"c;d\");\n\
                      -- a comment; not a split\n\
                      UPDATE t SET v = 'it''s; fine';\n";
        let statements = split_statements(script);
        assert_eq!(statements.len(), 2);
        assert_eq!(statements[0], "INSERT INTO t VALUES ('a;b', \"c;d\")");
        assert!(statements[1].starts_with("-- a comment; not a split\nUPDATE"));
        assert!(statements[1].ends_with("'it''s; fine'"));
    }

    #[test]
    fn test_split_respects_dollar_quotes() {
        let script = "CREATE FUNCTION f() RETURNS int AS $body$ BEGIN RETURN 1; END; $body$ LANGUAGE plpgsql;\n\
                      SELECT $$a;b$$;\n\
                      SELECT $1;";
        let statements = split_statements(script);
        assert_eq!(statements.len(), 3);
        assert!(statements[0].ends_with("LANGUAGE plpgsql"));
        assert_eq!(statements[1], "SELECT $$a;b$$");
        assert_eq!(statements[2], "SELECT $1");
    }

    #[test]
    fn test_split_skips_block_comments() {
        let script = "/* setup; part one */\nCREATE TABLE t (id INTEGER);\n\
                      INSERT INTO t /* inline; */ VALUES (1);\n\
                      /* trailing; note */\n";
        assert_eq!(
            split_statements(script),
            vec![
                "/* setup; part one */\nCREATE TABLE t (id INTEGER)".to_string(),
                "INSERT INTO t /* inline; */ VALUES (1)".to_string(),
            ]
        );
    }

    #[test]
    fn test_split_keeps_manual_placeholders() {
        let script = "-- MANUAL: drop foreign key 'fk'\n\nDROP TABLE t;\n\n-- trailing note\n";
        assert_eq!(
            split_statements(script),
            vec![
                "-- MANUAL: drop foreign key 'fk'".to_string(),
                "DROP TABLE t".to_string(),
            ]
        );
    }

    #[test]
    fn test_generate_version_format() {
        let version = generate_version();
        assert_eq!(version.len(), 14);
        assert!(version.chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Add users table!"), "add_users_table");
        assert_eq!(slugify("  drop--legacy  flag "), "drop_legacy_flag");
    }
}
