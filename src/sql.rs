use sqlparser::ast::{
    self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value,
    ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertProduct(Product),
    InsertStudio(Studio),
    InsertStaff(StaffMember),
    InsertEquipment(EquipmentUnit),
    SetEquipmentStatus {
        id: Ulid,
        status: UnitStatus,
    },
    SetStaffActive {
        id: Ulid,
        active: bool,
    },
    StockUnits {
        product_id: Ulid,
        prefix: String,
    },
    /// One row per cart line. `item_id` may name a product or an
    /// exclusive resource; the executor sorts them out.
    PlaceBooking {
        id: Ulid,
        customer: Customer,
        start: Ms,
        end: Ms,
        lines: Vec<(Ulid, u32)>,
    },
    Transition {
        booking_id: Ulid,
        status: BookingStatus,
    },
    Reschedule {
        booking_id: Ulid,
        start: Ms,
        end: Ms,
    },
    Assign {
        booking_id: Ulid,
        resource_id: Ulid,
    },
    Release {
        booking_id: Ulid,
        resource_id: Ulid,
    },
    SelectAvailability {
        product_id: Ulid,
        start: Ms,
        end: Ms,
        exclude: Option<Ulid>,
    },
    SelectConflicts {
        resource_id: Ulid,
        kind: Option<ResourceKind>,
        start: Ms,
        end: Ms,
        exclude: Option<Ulid>,
    },
    SelectSoldOut {
        product_id: Ulid,
        start: Ms,
        end: Ms,
    },
    SelectInventory {
        start: Ms,
        end: Ms,
    },
    SelectBookings {
        start: Ms,
        end: Ms,
    },
    SelectIssues {
        booking_id: Ulid,
    },
    SelectQuote {
        booking_id: Ulid,
    },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    if sql.len() > crate::limits::MAX_SQL_LEN {
        return Err(SqlError::Unsupported("statement too long".into()));
    }
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(first) = stmts.first() else {
        return Err(SqlError::Empty);
    };

    match first {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let rows = extract_all_insert_rows(insert)?;
    if table == "bookings" {
        return parse_booking_rows(&rows);
    }
    if rows.len() > 1 {
        return Err(SqlError::Unsupported(format!("multi-row insert into {table}")));
    }
    let values = &rows[0];

    match table.as_str() {
        "products" => {
            arity("products", values, 5)?;
            Ok(Command::InsertProduct(Product {
                id: parse_ulid(&values[0])?,
                name: parse_string(&values[1])?,
                category: parse_enum(&values[2])?,
                price: parse_u64(&values[3])?,
                quantity: parse_u32(&values[4])?,
                active: optional(values, 5, parse_bool)?.unwrap_or(true),
            }))
        }
        "studios" => {
            arity("studios", values, 3)?;
            Ok(Command::InsertStudio(Studio {
                id: parse_ulid(&values[0])?,
                name: parse_string(&values[1])?,
                daily_rate: parse_u64(&values[2])?,
            }))
        }
        "staff" => {
            arity("staff", values, 3)?;
            Ok(Command::InsertStaff(StaffMember {
                id: parse_ulid(&values[0])?,
                name: parse_string(&values[1])?,
                position: parse_enum(&values[2])?,
                active: optional(values, 3, parse_bool)?.unwrap_or(true),
            }))
        }
        "equipment" => {
            arity("equipment", values, 3)?;
            Ok(Command::InsertEquipment(EquipmentUnit {
                id: parse_ulid(&values[0])?,
                product_id: parse_ulid_or_null(&values[1])?,
                serial_number: parse_string(&values[2])?,
                status: optional(values, 3, parse_enum)?.unwrap_or(UnitStatus::Available),
            }))
        }
        "equipment_status" => {
            arity("equipment_status", values, 2)?;
            Ok(Command::SetEquipmentStatus {
                id: parse_ulid(&values[0])?,
                status: parse_enum(&values[1])?,
            })
        }
        "staff_status" => {
            arity("staff_status", values, 2)?;
            Ok(Command::SetStaffActive {
                id: parse_ulid(&values[0])?,
                active: parse_bool(&values[1])?,
            })
        }
        "unit_batches" => {
            arity("unit_batches", values, 2)?;
            Ok(Command::StockUnits {
                product_id: parse_ulid(&values[0])?,
                prefix: parse_string(&values[1])?,
            })
        }
        "transitions" => {
            arity("transitions", values, 2)?;
            Ok(Command::Transition {
                booking_id: parse_ulid(&values[0])?,
                status: parse_enum(&values[1])?,
            })
        }
        "reschedules" => {
            arity("reschedules", values, 3)?;
            Ok(Command::Reschedule {
                booking_id: parse_ulid(&values[0])?,
                start: parse_i64_expr(&values[1])?,
                end: parse_i64_expr(&values[2])?,
            })
        }
        "assignments" => {
            arity("assignments", values, 2)?;
            Ok(Command::Assign {
                booking_id: parse_ulid(&values[0])?,
                resource_id: parse_ulid(&values[1])?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// `(id, customer_name, start, end, item_id, quantity[, phone, email, address])`.
/// Every row repeats the booking header; rows that disagree are rejected.
fn parse_booking_rows(rows: &[Vec<Expr>]) -> Result<Command, SqlError> {
    let mut header: Option<(Ulid, Customer, Ms, Ms)> = None;
    let mut lines = Vec::with_capacity(rows.len());

    for (i, row) in rows.iter().enumerate() {
        let row_err = |e: SqlError| SqlError::Parse(format!("row {i}: {e}"));
        arity("bookings row", row, 6)?;
        let id = parse_ulid(&row[0]).map_err(row_err)?;
        let customer = Customer {
            name: parse_string(&row[1]).map_err(row_err)?,
            phone: optional(row, 6, parse_string_or_null).map_err(row_err)?.flatten(),
            email: optional(row, 7, parse_string_or_null).map_err(row_err)?.flatten(),
            address: optional(row, 8, parse_string_or_null).map_err(row_err)?.flatten(),
        };
        let start = parse_i64_expr(&row[2]).map_err(row_err)?;
        let end = parse_i64_expr(&row[3]).map_err(row_err)?;
        lines.push((
            parse_ulid(&row[4]).map_err(row_err)?,
            parse_u32(&row[5]).map_err(row_err)?,
        ));

        if let Some((hid, hcustomer, hstart, hend)) = &header {
            if (*hid, hcustomer, *hstart, *hend) != (id, &customer, start, end) {
                return Err(SqlError::Parse(format!(
                    "row {i}: booking header differs from row 0"
                )));
            }
            continue;
        }
        header = Some((id, customer, start, end));
    }

    let (id, customer, start, end) = header.ok_or(SqlError::Parse("empty VALUES".into()))?;
    Ok(Command::PlaceBooking { id, customer, start, end, lines })
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let filters = Filters::from_selection(delete.selection.as_ref())?;

    match table.as_str() {
        "assignments" => Ok(Command::Release {
            booking_id: filters.require_ulid("booking_id")?,
            resource_id: filters.require_ulid("resource_id")?,
        }),
        _ => Err(SqlError::Unsupported(format!("DELETE FROM {table}"))),
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };
    let Some(from) = select.from.first() else {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    };
    let table = table_factor_name(&from.relation)?;
    let filters = Filters::from_selection(select.selection.as_ref())?;

    match table.as_str() {
        "availability" => {
            let (start, end) = filters.window()?;
            Ok(Command::SelectAvailability {
                product_id: filters.require_ulid("product_id")?,
                start,
                end,
                exclude: filters.ulid("exclude_booking_id")?,
            })
        }
        "conflicts" => {
            let (start, end) = filters.window()?;
            let kind = match filters.get("kind") {
                Some(expr) => Some(parse_enum(expr)?),
                None => None,
            };
            Ok(Command::SelectConflicts {
                resource_id: filters.require_ulid("resource_id")?,
                kind,
                start,
                end,
                exclude: filters.ulid("exclude_booking_id")?,
            })
        }
        "sold_out" => {
            let (start, end) = filters.window()?;
            Ok(Command::SelectSoldOut {
                product_id: filters.require_ulid("product_id")?,
                start,
                end,
            })
        }
        "inventory" => {
            let (start, end) = filters.window()?;
            Ok(Command::SelectInventory { start, end })
        }
        "bookings" => {
            let (start, end) = filters.window()?;
            Ok(Command::SelectBookings { start, end })
        }
        "booking_issues" => Ok(Command::SelectIssues {
            booking_id: filters.require_ulid("booking_id")?,
        }),
        "quotes" => Ok(Command::SelectQuote {
            booking_id: filters.require_ulid("booking_id")?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── WHERE clauses ─────────────────────────────────────────────

/// Conjunction of `col = value`, `start >= t` and `"end" <= t` terms.
/// Other predicates are ignored.
#[derive(Default)]
struct Filters<'a> {
    eq: Vec<(String, &'a Expr)>,
    start: Option<Ms>,
    end: Option<Ms>,
}

impl<'a> Filters<'a> {
    fn from_selection(selection: Option<&'a Expr>) -> Result<Self, SqlError> {
        let mut filters = Filters::default();
        if let Some(expr) = selection {
            filters.collect(expr)?;
        }
        Ok(filters)
    }

    fn collect(&mut self, expr: &'a Expr) -> Result<(), SqlError> {
        match expr {
            Expr::Nested(inner) => self.collect(inner)?,
            Expr::BinaryOp { left, op, right } => match op {
                ast::BinaryOperator::And => {
                    self.collect(left)?;
                    self.collect(right)?;
                }
                ast::BinaryOperator::Eq => {
                    if let Some(col) = expr_column_name(left) {
                        self.eq.push((col, right.as_ref()));
                    }
                }
                ast::BinaryOperator::GtEq => {
                    if expr_column_name(left).as_deref() == Some("start") {
                        self.start = Some(parse_i64_expr(right)?);
                    }
                }
                ast::BinaryOperator::LtEq => {
                    if expr_column_name(left).as_deref() == Some("end") {
                        self.end = Some(parse_i64_expr(right)?);
                    }
                }
                _ => {}
            },
            _ => {}
        }
        Ok(())
    }

    fn get(&self, col: &str) -> Option<&'a Expr> {
        self.eq.iter().find(|(c, _)| c == col).map(|(_, e)| *e)
    }

    fn ulid(&self, col: &str) -> Result<Option<Ulid>, SqlError> {
        match self.get(col) {
            Some(expr) => parse_ulid_or_null(expr),
            None => Ok(None),
        }
    }

    fn require_ulid(&self, col: &'static str) -> Result<Ulid, SqlError> {
        let expr = self.get(col).ok_or(SqlError::MissingFilter(col))?;
        parse_ulid(expr)
    }

    fn window(&self) -> Result<(Ms, Ms), SqlError> {
        Ok((
            self.start.ok_or(SqlError::MissingFilter("start"))?,
            self.end.ok_or(SqlError::MissingFilter("end"))?,
        ))
    }
}

// ── Helpers ───────────────────────────────────────────────────

fn arity(table: &'static str, values: &[Expr], min: usize) -> Result<(), SqlError> {
    if values.len() < min {
        return Err(SqlError::WrongArity(table, min, values.len()));
    }
    Ok(())
}

/// Parse column `idx` when present.
fn optional<T>(
    values: &[Expr],
    idx: usize,
    parse: impl Fn(&Expr) -> Result<T, SqlError>,
) -> Result<Option<T>, SqlError> {
    values.get(idx).map(parse).transpose()
}

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
    match tables_with_joins.first() {
        Some(first) => table_factor_name(&first.relation),
        None => Err(SqlError::Parse("DELETE without table".into())),
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

fn extract_all_insert_rows(insert: &ast::Insert) -> Result<Vec<Vec<Expr>>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) if !values.rows.is_empty() => Ok(values.rows.clone()),
        SetExpr::Values(_) => Err(SqlError::Parse("empty VALUES".into())),
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

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s) | Value::Number(s, _)) => {
            Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
        }
        Some(value) => Err(SqlError::Parse(format!("expected ULID string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_ulid_or_null(expr: &Expr) -> Result<Option<Ulid>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        _ => parse_ulid(expr).map(Some),
    }
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        _ => parse_string(expr).map(Some),
    }
}

/// Any `FromStr` enum written as a string literal, e.g. `'maintenance'`.
fn parse_enum<T>(expr: &Expr) -> Result<T, SqlError>
where
    T: std::str::FromStr<Err = ParseEnumError>,
{
    parse_string(expr)?
        .parse()
        .map_err(|e: ParseEnumError| SqlError::Parse(e.to_string()))
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Expr::UnaryOp { op: ast::UnaryOperator::Minus, expr } = expr {
        return Ok(-parse_i64_expr(expr)?);
    }
    match extract_value(expr) {
        Some(Value::Number(s, _) | Value::SingleQuotedString(s)) => s
            .parse()
            .map_err(|e| SqlError::Parse(format!("bad integer {s}: {e}"))),
        Some(value) => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64_expr(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
}

fn parse_u64(expr: &Expr) -> Result<u64, SqlError> {
    let v = parse_i64_expr(expr)?;
    u64::try_from(v).map_err(|_| SqlError::Parse(format!("{v} must not be negative")))
}

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    match extract_value(expr) {
        Some(Value::Boolean(b)) => Ok(*b),
        Some(Value::SingleQuotedString(s)) => match s.to_lowercase().as_str() {
            "true" | "t" | "1" => Ok(true),
            "false" | "f" | "0" => Ok(false),
            _ => Err(SqlError::Parse(format!("bad bool: {s}"))),
        },
        Some(Value::Number(n, _)) => Ok(n != "0"),
        Some(value) => Err(SqlError::Parse(format!("expected bool, got {value:?}"))),
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
                write!(f, "{t}: expected at least {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
