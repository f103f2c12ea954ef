/// SQL classification consumed by the router
use crate::error::{SqlXError, SqlXResult};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Hint key naming the node a statement must run on
pub const NODE_NAME_HINT: &str = "nodeName";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SqlType {
    Select,
    Insert,
    Update,
    Delete,
    Other,
}

impl fmt::Display for SqlType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SqlType::Select => write!(f, "SELECT"),
            SqlType::Insert => write!(f, "INSERT"),
            SqlType::Update => write!(f, "UPDATE"),
            SqlType::Delete => write!(f, "DELETE"),
            SqlType::Other => write!(f, "OTHER"),
        }
    }
}

/// Classification of one SQL statement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlAttribute {
    pub sql: String,
    /// SQL with routing hints stripped; this is what reaches the driver
    pub native_sql: String,
    pub sql_type: SqlType,
    pub read: bool,
    pub write: bool,
    pub tables: BTreeSet<String>,
    pub databases: BTreeSet<String>,
    pub hints: BTreeMap<String, String>,
    pub default_database: Option<String>,
}

impl SqlAttribute {
    pub fn is_write(&self) -> bool {
        self.write
    }

    pub fn is_read(&self) -> bool {
        self.read
    }

    pub fn hint(&self, key: &str) -> Option<&str> {
        self.hints.get(key).map(String::as_str)
    }

    pub fn set_default_database(&mut self, database: Option<String>) {
        self.default_database = database;
    }
}

/// The collaborator that decides read versus write for a statement
pub trait SqlClassifier: Send + Sync {
    fn classify(&self, sql: &str) -> SqlXResult<SqlAttribute>;
}

/// Keyword based classifier.
///
/// A leading `/*!key=value;key2=value2*/` comment is parsed as routing
/// hints and removed from the native SQL.
#[derive(Debug, Clone, Default)]
pub struct SimpleSqlClassifier;

impl SimpleSqlClassifier {
    pub fn new() -> Self {
        Self
    }
}

impl SqlClassifier for SimpleSqlClassifier {
    fn classify(&self, sql: &str) -> SqlXResult<SqlAttribute> {
        let (hints, native_sql) = extract_hints(sql)?;
        let tokens = tokenize(&native_sql);
        let keyword = tokens.first().map(|t| t.to_ascii_lowercase()).unwrap_or_default();

        let sql_type = match keyword.as_str() {
            "select" => SqlType::Select,
            "insert" | "replace" => SqlType::Insert,
            "update" => SqlType::Update,
            "delete" => SqlType::Delete,
            _ => SqlType::Other,
        };
        let locking_read = sql_type == SqlType::Select && contains_sequence(&tokens, &["for", "update"]);
        let read = sql_type == SqlType::Select && !locking_read;
        let write = matches!(sql_type, SqlType::Insert | SqlType::Update | SqlType::Delete) || locking_read;

        let mut tables = BTreeSet::new();
        let mut databases = BTreeSet::new();
        for window in tokens.windows(2) {
            let marker = window[0].to_ascii_lowercase();
            if !matches!(marker.as_str(), "from" | "join" | "into" | "update" | "table") {
                continue;
            }
            let name = window[1].trim_matches(|c| c == '`' || c == '"' || c == ',' || c == ';');
            if name.is_empty() || name.starts_with('(') {
                continue;
            }
            match name.split_once('.') {
                Some((database, table)) => {
                    databases.insert(database.to_string());
                    tables.insert(table.to_string());
                }
                None => {
                    tables.insert(name.to_string());
                }
            }
        }

        Ok(SqlAttribute {
            sql: sql.to_string(),
            native_sql,
            sql_type,
            read,
            write,
            tables,
            databases,
            hints,
            default_database: None,
        })
    }
}

/// Split off the hint comment, returning the parsed pairs and the remaining SQL
fn extract_hints(sql: &str) -> SqlXResult<(BTreeMap<String, String>, String)> {
    let mut hints = BTreeMap::new();
    let Some(start) = sql.find("/*!") else {
        return Ok((hints, sql.trim().to_string()));
    };
    let body_start = start + 3;
    let end = sql[body_start..]
        .find("*/")
        .map(|offset| body_start + offset)
        .ok_or_else(|| SqlXError::routing(format!("unterminated sql hint in: {}", sql)))?;

    for pair in sql[body_start..end].split(';').map(str::trim).filter(|p| !p.is_empty()) {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| SqlXError::routing(format!("sql hint [{}] must be key=value", pair)))?;
        hints.insert(key.trim().to_string(), value.trim().to_string());
    }

    let native = format!("{}{}", &sql[..start], &sql[end + 2..]);
    Ok((hints, native.trim().to_string()))
}

fn tokenize(sql: &str) -> Vec<&str> {
    sql.split(|c: char| c.is_whitespace() || c == '(' || c == ')')
        .filter(|t| !t.is_empty())
        .collect()
}

fn contains_sequence(tokens: &[&str], sequence: &[&str]) -> bool {
    tokens.windows(sequence.len()).any(|window| {
        window
            .iter()
            .zip(sequence)
            .all(|(token, expected)| token.eq_ignore_ascii_case(expected))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classify(sql: &str) -> SqlAttribute {
        SimpleSqlClassifier::new().classify(sql).unwrap()
    }

    #[test]
    fn test_read_and_write_detection() {
        let select = classify("SELECT * FROM orders WHERE id = ?");
        assert!(select.is_read() && !select.is_write());
        assert_eq!(select.sql_type, SqlType::Select);

        for sql in ["insert into orders values (1)", "UPDATE orders SET a = 1", "delete from orders"] {
            let attribute = classify(sql);
            assert!(attribute.is_write(), "{sql}");
            assert!(!attribute.is_read(), "{sql}");
        }
    }

    #[test]
    fn test_locking_read_is_write() {
        let attribute = classify("select * from stock where id = 1 for update");
        assert_eq!(attribute.sql_type, SqlType::Select);
        assert!(attribute.is_write());
        assert!(!attribute.is_read());
    }

    #[test]
    fn test_other_statements() {
        let attribute = classify("SET NAMES utf8mb4");
        assert_eq!(attribute.sql_type, SqlType::Other);
        assert!(!attribute.is_read() && !attribute.is_write());
    }

    #[test]
    fn test_tables_and_databases() {
        let attribute = classify("select * from shop.orders o join customers c on o.cid = c.id");
        assert!(attribute.tables.contains("orders"));
        assert!(attribute.tables.contains("customers"));
        assert!(attribute.databases.contains("shop"));
    }

    #[test]
    fn test_hint_extraction() {
        let attribute = classify("/*!nodeName=b; trace=abc */ select 1");
        assert_eq!(attribute.hint(NODE_NAME_HINT), Some("b"));
        assert_eq!(attribute.hint("trace"), Some("abc"));
        assert_eq!(attribute.native_sql, "select 1");
        assert_eq!(attribute.sql, "/*!nodeName=b; trace=abc */ select 1");
        assert!(attribute.is_read());
    }

    #[test]
    fn test_malformed_hint() {
        let classifier = SimpleSqlClassifier::new();
        assert!(classifier.classify("/*!nodeName*/ select 1").is_err());
        assert!(classifier.classify("/*!nodeName=a select 1").is_err());
    }

    #[test]
    fn test_plain_comment_is_not_a_hint() {
        let attribute = classify("/* audit */ select 1");
        assert!(attribute.hints.is_empty());
        assert_eq!(attribute.sql_type, SqlType::Other);
    }
}
