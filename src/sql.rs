use sqlparser::ast::{self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;

use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    RegisterUser {
        user_id: UserId,
    },
    Claim {
        user_id: UserId,
        resource_id: ResourceId,
    },
    Release {
        user_id: UserId,
        pool_id: PoolId,
    },
    SelectClaims {
        user_id: UserId,
    },
    SelectRemaining {
        pool_id: Option<PoolId>,
    },
    SelectSlots {
        room: String,
        grid: Option<String>,
    },
    Resync {
        pool_id: Option<PoolId>,
    },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let trimmed = sql.trim().trim_end_matches(';').trim();
    if trimmed.eq_ignore_ascii_case("RESYNC") {
        return Ok(Command::Resync { pool_id: None });
    }
    if let Some(head) = trimmed.get(..7)
        && head.eq_ignore_ascii_case("RESYNC ")
    {
        let pool_id = trimmed[7..].trim().trim_matches('\'').to_string();
        if pool_id.is_empty() {
            return Err(SqlError::Parse("RESYNC: empty pool id".into()));
        }
        return Ok(Command::Resync { pool_id: Some(pool_id) });
    }

    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }

    match &stmts[0] {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = extract_insert_values(insert)?;
    let columns: Vec<String> = insert.columns.iter().map(|c| c.value.to_lowercase()).collect();

    match table.as_str() {
        "users" => {
            let user_id = column_or_position(&columns, &values, "user_id", 0)
                .ok_or(SqlError::WrongArity("users", 1, values.len()))?;
            Ok(Command::RegisterUser {
                user_id: parse_i64_expr(user_id)?,
            })
        }
        "claims" => {
            let user_id = column_or_position(&columns, &values, "user_id", 0);
            let resource_id = column_or_position(&columns, &values, "resource_id", 1);
            match (user_id, resource_id) {
                (Some(user_id), Some(resource_id)) => Ok(Command::Claim {
                    user_id: parse_i64_expr(user_id)?,
                    resource_id: parse_string_expr(resource_id)?,
                }),
                _ => Err(SqlError::WrongArity("claims", 2, values.len())),
            }
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// With an explicit column list, look the value up by name; otherwise by position.
fn column_or_position<'a>(
    columns: &[String],
    values: &'a [Expr],
    name: &str,
    position: usize,
) -> Option<&'a Expr> {
    if columns.is_empty() {
        values.get(position)
    } else {
        columns.iter().position(|c| c == name).and_then(|i| values.get(i))
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    if table != "claims" {
        return Err(SqlError::UnknownTable(table));
    }
    let mut filters = Filters::default();
    if let Some(selection) = &delete.selection {
        filters.collect(selection)?;
    }
    Ok(Command::Release {
        user_id: filters.user_id.ok_or(SqlError::MissingFilter("user_id"))?,
        pool_id: filters.pool_id.ok_or(SqlError::MissingFilter("pool_id"))?,
    })
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let table = table_factor_name(&select.from[0].relation)?;

    let mut filters = Filters::default();
    if let Some(selection) = &select.selection {
        filters.collect(selection)?;
    }

    match table.as_str() {
        "claims" => Ok(Command::SelectClaims {
            user_id: filters.user_id.ok_or(SqlError::MissingFilter("user_id"))?,
        }),
        "remaining" => Ok(Command::SelectRemaining {
            pool_id: filters.pool_id,
        }),
        "slots" => Ok(Command::SelectSlots {
            room: filters.room.ok_or(SqlError::MissingFilter("room"))?,
            grid: filters.grid,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Equality filters recognized in WHERE clauses, joined by AND.
#[derive(Default)]
struct Filters {
    user_id: Option<UserId>,
    pool_id: Option<PoolId>,
    room: Option<String>,
    grid: Option<String>,
}

impl Filters {
    fn collect(&mut self, expr: &Expr) -> Result<(), SqlError> {
        match expr {
            Expr::BinaryOp { left, op, right } => match op {
                ast::BinaryOperator::And => {
                    self.collect(left)?;
                    self.collect(right)?;
                }
                ast::BinaryOperator::Eq => match expr_column_name(left).as_deref() {
                    Some("user_id") => self.user_id = Some(parse_i64_expr(right)?),
                    Some("pool_id") => self.pool_id = Some(parse_string_expr(right)?),
                    Some("room") => self.room = Some(parse_string_expr(right)?),
                    Some("grid") => self.grid = Some(parse_string_expr(right)?),
                    Some(other) => return Err(SqlError::Unsupported(format!("filter on {other}"))),
                    None => return Err(SqlError::Unsupported(format!("filter {left}"))),
                },
                _ => return Err(SqlError::Unsupported(format!("operator {op}"))),
            },
            Expr::Nested(inner) => self.collect(inner)?,
            _ => return Err(SqlError::Unsupported(format!("filter {expr}"))),
        }
        Ok(())
    }
}

// ── Helpers ───────────────────────────────────────────────────

fn object_name_last(name: &ast::ObjectName) -> Option<String> {
    name.0.last().and_then(|part| match part {
        ObjectNamePart::Identifier(ident) => Some(ident.value.to_lowercase()),
        _ => None,
    })
}

fn insert_table_name(insert: &ast::Insert) -> Result<String, SqlError> {
    match &insert.table {
        TableObject::TableName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("unsupported table object in INSERT".into())),
    }
}

fn delete_table_name(delete: &ast::Delete) -> Result<String, SqlError> {
    let tables_with_joins = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    if let Some(first) = tables_with_joins.first() {
        table_factor_name(&first.relation)
    } else {
        Err(SqlError::Parse("DELETE without table".into()))
    }
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn extract_insert_values(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [] => Err(SqlError::Parse("empty VALUES".into())),
            [row] => Ok(row.clone()),
            _ => Err(SqlError::Unsupported("multi-row INSERT".into())),
        },
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

fn extract_value(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        _ => None,
    }
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad i64: {e}"))),
            Value::SingleQuotedString(s) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad i64: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        parse_i64_expr(expr)?
            .checked_neg()
            .ok_or_else(|| SqlError::Parse("i64 out of range".into()))
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_string_expr(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) | Some(Value::Number(s, _)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    WrongArity(&'static str, usize, usize),
    MissingFilter(&'static str),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_register_user() {
        assert_eq!(
            parse_sql("INSERT INTO users VALUES (42)").unwrap(),
            Command::RegisterUser { user_id: 42 }
        );
        assert_eq!(
            parse_sql("INSERT INTO users (user_id) VALUES ('-7')").unwrap(),
            Command::RegisterUser { user_id: -7 }
        );
    }

    #[test]
    fn negating_i64_min_is_a_parse_error() {
        assert!(matches!(
            parse_sql("INSERT INTO users VALUES (-'-9223372036854775808')"),
            Err(SqlError::Parse(_))
        ));
    }

    #[test]
    fn parse_claim() {
        let cmd = parse_sql("INSERT INTO claims (user_id, resource_id) VALUES (42, 'case2')").unwrap();
        assert_eq!(
            cmd,
            Command::Claim {
                user_id: 42,
                resource_id: "case2".into()
            }
        );
    }

    #[test]
    fn parse_claim_columns_reordered() {
        let cmd = parse_sql("INSERT INTO claims (resource_id, user_id) VALUES ('slot:vr_day1:vr1:10:00', 9)").unwrap();
        assert_eq!(
            cmd,
            Command::Claim {
                user_id: 9,
                resource_id: "slot:vr_day1:vr1:10:00".into()
            }
        );
    }

    #[test]
    fn parse_claim_missing_value() {
        assert!(matches!(
            parse_sql("INSERT INTO claims (user_id) VALUES (42)"),
            Err(SqlError::WrongArity("claims", 2, 1))
        ));
    }

    #[test]
    fn parse_release() {
        let cmd = parse_sql("DELETE FROM claims WHERE user_id = 42 AND pool_id = 'case_23'").unwrap();
        assert_eq!(
            cmd,
            Command::Release {
                user_id: 42,
                pool_id: "case_23".into()
            }
        );
    }

    #[test]
    fn parse_release_requires_pool() {
        assert!(matches!(
            parse_sql("DELETE FROM claims WHERE user_id = 42"),
            Err(SqlError::MissingFilter("pool_id"))
        ));
    }

    #[test]
    fn parse_select_claims() {
        assert_eq!(
            parse_sql("SELECT * FROM claims WHERE user_id = 42").unwrap(),
            Command::SelectClaims { user_id: 42 }
        );
    }

    #[test]
    fn parse_select_remaining() {
        assert_eq!(
            parse_sql("SELECT * FROM remaining").unwrap(),
            Command::SelectRemaining { pool_id: None }
        );
        assert_eq!(
            parse_sql("SELECT pool_id, remaining FROM remaining WHERE pool_id = 'case_23'").unwrap(),
            Command::SelectRemaining {
                pool_id: Some("case_23".into())
            }
        );
    }

    #[test]
    fn parse_select_slots() {
        assert_eq!(
            parse_sql("SELECT * FROM slots WHERE room = 'vr1' AND grid = 'vr_day1'").unwrap(),
            Command::SelectSlots {
                room: "vr1".into(),
                grid: Some("vr_day1".into())
            }
        );
        assert!(matches!(
            parse_sql("SELECT * FROM slots"),
            Err(SqlError::MissingFilter("room"))
        ));
    }

    #[test]
    fn parse_resync() {
        assert_eq!(parse_sql("RESYNC").unwrap(), Command::Resync { pool_id: None });
        assert_eq!(parse_sql("resync;").unwrap(), Command::Resync { pool_id: None });
        assert_eq!(
            parse_sql("RESYNC 'case_23'").unwrap(),
            Command::Resync {
                pool_id: Some("case_23".into())
            }
        );
    }

    #[test]
    fn parse_unsupported_filter() {
        assert!(matches!(
            parse_sql("SELECT * FROM claims WHERE user_id > 3"),
            Err(SqlError::Unsupported(_))
        ));
        assert!(matches!(
            parse_sql("SELECT * FROM claims WHERE name = 'x'"),
            Err(SqlError::Unsupported(_))
        ));
    }

    #[test]
    fn parse_unknown_table_errors() {
        assert!(matches!(
            parse_sql("INSERT INTO foobar VALUES (1)"),
            Err(SqlError::UnknownTable(_))
        ));
    }

    #[test]
    fn parse_multi_row_rejected() {
        assert!(matches!(
            parse_sql("INSERT INTO users VALUES (1), (2)"),
            Err(SqlError::Unsupported(_))
        ));
    }

    #[test]
    fn parse_empty_errors() {
        assert!(matches!(parse_sql(""), Err(SqlError::Empty)));
    }
}
