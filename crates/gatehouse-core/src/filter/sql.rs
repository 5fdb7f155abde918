//! SQL WHERE-clause rendering
//!
//! Renders a UCAST tree as a `WHERE` fragment with dialect-specific string
//! quoting: postgres `E'…'` with backslash escaping, sqlserver `N'…'` with
//! doubled quotes, mysql backslash escaping, sqlite doubled quotes.

use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use super::translate::TranslateError;
use super::ucast::UcastNode;

/// Supported SQL dialects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlDialect {
    /// PostgreSQL
    Postgresql,
    /// MySQL
    Mysql,
    /// Microsoft SQL Server
    Sqlserver,
    /// SQLite
    Sqlite,
}

impl SqlDialect {
    /// Every dialect, in multitarget output order.
    pub const ALL: [Self; 4] = [Self::Postgresql, Self::Mysql, Self::Sqlserver, Self::Sqlite];
}

impl fmt::Display for SqlDialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Postgresql => "postgresql",
            Self::Mysql => "mysql",
            Self::Sqlserver => "sqlserver",
            Self::Sqlite => "sqlite",
        };
        write!(f, "{name}")
    }
}

impl FromStr for SqlDialect {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "postgresql" | "postgres" => Ok(Self::Postgresql),
            "mysql" => Ok(Self::Mysql),
            "sqlserver" => Ok(Self::Sqlserver),
            "sqlite" => Ok(Self::Sqlite),
            other => Err(format!("unknown SQL dialect: {other}")),
        }
    }
}

/// Render a condition tree as a `WHERE` fragment.
///
/// # Errors
/// Fails on operators or values the dialect cannot express.
pub fn render_where(node: &UcastNode, dialect: SqlDialect) -> Result<String, TranslateError> {
    Ok(format!("WHERE {}", render_node(node, dialect)?))
}

fn render_node(node: &UcastNode, dialect: SqlDialect) -> Result<String, TranslateError> {
    match node {
        UcastNode::Field { op, field, value } => render_field(op, field, value, dialect),
        UcastNode::Compound { op, children } => {
            if op == "not" {
                let child = children.first().ok_or_else(|| TranslateError {
                    message: "empty negation".to_string(),
                    location: None,
                })?;
                return Ok(format!("NOT ({})", render_node(child, dialect)?));
            }
            let joiner = match op.as_str() {
                "and" => " AND ",
                "or" => " OR ",
                other => {
                    return Err(TranslateError {
                        message: format!("unknown compound operator: {other}"),
                        location: None,
                    });
                }
            };
            let rendered = children
                .iter()
                .map(|child| {
                    render_node(child, dialect).map(|s| match child {
                        UcastNode::Compound { .. } => format!("({s})"),
                        UcastNode::Field { .. } => s,
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rendered.join(joiner))
        }
    }
}

fn render_field(
    op: &str,
    field: &str,
    value: &Value,
    dialect: SqlDialect,
) -> Result<String, TranslateError> {
    let rendered = match op {
        "eq" => format!("{field} = {}", literal(value, dialect)?),
        "neq" => format!("{field} <> {}", literal(value, dialect)?),
        "lt" => format!("{field} < {}", literal(value, dialect)?),
        "lte" => format!("{field} <= {}", literal(value, dialect)?),
        "gt" => format!("{field} > {}", literal(value, dialect)?),
        "gte" => format!("{field} >= {}", literal(value, dialect)?),
        "startswith" => format!("{field} LIKE {}", like_pattern(value, dialect, false, true)?),
        "endswith" => format!("{field} LIKE {}", like_pattern(value, dialect, true, false)?),
        "contains" => format!("{field} LIKE {}", like_pattern(value, dialect, true, true)?),
        "in" => {
            let Value::Array(items) = value else {
                return Err(TranslateError {
                    message: "IN requires an array of values".to_string(),
                    location: None,
                });
            };
            let rendered = items
                .iter()
                .map(|item| literal(item, dialect))
                .collect::<Result<Vec<_>, _>>()?;
            format!("{field} IN ({})", rendered.join(", "))
        }
        other => {
            return Err(TranslateError {
                message: format!("operator {other} has no SQL rendering"),
                location: None,
            });
        }
    };
    Ok(rendered)
}

fn literal(value: &Value, dialect: SqlDialect) -> Result<String, TranslateError> {
    match value {
        Value::String(s) => Ok(quote(s, dialect)),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(match dialect {
            SqlDialect::Sqlserver => if *b { "1" } else { "0" }.to_string(),
            _ => if *b { "TRUE" } else { "FALSE" }.to_string(),
        }),
        Value::Null => Ok("NULL".to_string()),
        other => Err(TranslateError {
            message: format!("cannot render {other} as a SQL literal"),
            location: None,
        }),
    }
}

fn like_pattern(
    value: &Value,
    dialect: SqlDialect,
    leading: bool,
    trailing: bool,
) -> Result<String, TranslateError> {
    let Value::String(s) = value else {
        return Err(TranslateError {
            message: "LIKE requires a string value".to_string(),
            location: None,
        });
    };
    let escaped = s.replace('%', "\\%").replace('_', "\\_");
    let pattern = format!(
        "{}{}{}",
        if leading { "%" } else { "" },
        escaped,
        if trailing { "%" } else { "" }
    );
    Ok(quote(&pattern, dialect))
}

fn quote(s: &str, dialect: SqlDialect) -> String {
    match dialect {
        SqlDialect::Postgresql => {
            let escaped = s.replace('\\', "\\\\").replace('\'', "\\'");
            format!("E'{escaped}'")
        }
        SqlDialect::Mysql => {
            let escaped = s.replace('\\', "\\\\").replace('\'', "\\'");
            format!("'{escaped}'")
        }
        SqlDialect::Sqlserver => {
            let escaped = s.replace('\'', "''");
            format!("N'{escaped}'")
        }
        SqlDialect::Sqlite => {
            let escaped = s.replace('\'', "''");
            format!("'{escaped}'")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn field(op: &str, field: &str, value: Value) -> UcastNode {
        UcastNode::Field {
            op: op.to_string(),
            field: field.to_string(),
            value,
        }
    }

    #[test]
    fn test_postgres_equality() {
        let node = field("eq", "fruits.colour", json!("orange"));
        assert_eq!(
            render_where(&node, SqlDialect::Postgresql).unwrap(),
            "WHERE fruits.colour = E'orange'"
        );
    }

    #[test]
    fn test_sqlserver_quoting() {
        let node = field("eq", "users.name", json!("O'Brien"));
        assert_eq!(
            render_where(&node, SqlDialect::Sqlserver).unwrap(),
            "WHERE users.name = N'O''Brien'"
        );
    }

    #[test]
    fn test_mysql_backslash_escaping() {
        let node = field("eq", "t.c", json!("a\\b'c"));
        assert_eq!(
            render_where(&node, SqlDialect::Mysql).unwrap(),
            "WHERE t.c = 'a\\\\b\\'c'"
        );
    }

    #[test]
    fn test_startswith_becomes_like() {
        let node = field("startswith", "users.name", json!("al"));
        assert_eq!(
            render_where(&node, SqlDialect::Sqlite).unwrap(),
            "WHERE users.name LIKE 'al%'"
        );
    }

    #[test]
    fn test_compound_and_or_parenthesization() {
        let node = UcastNode::or(vec![
            UcastNode::and(vec![
                field("eq", "t.a", json!(1)),
                field("gt", "t.b", json!(2)),
            ]),
            field("eq", "t.c", json!("x")),
        ]);
        assert_eq!(
            render_where(&node, SqlDialect::Sqlite).unwrap(),
            "WHERE (t.a = 1 AND t.b > 2) OR t.c = 'x'"
        );
    }

    #[test]
    fn test_in_list() {
        let node = field("in", "t.c", json!(["a", "b"]));
        assert_eq!(
            render_where(&node, SqlDialect::Sqlite).unwrap(),
            "WHERE t.c IN ('a', 'b')"
        );
    }

    #[test]
    fn test_dialect_parsing() {
        assert_eq!("postgresql".parse::<SqlDialect>().unwrap(), SqlDialect::Postgresql);
        assert!("oracle".parse::<SqlDialect>().is_err());
    }
}
