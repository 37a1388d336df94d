use std::ops::ControlFlow;
use std::sync::Arc;

use rusqlite::types::Value;
use rusqlite::{Batch, Connection, Row, Statement};

use crate::error::ComposerError;
use crate::query_spec::{QueryKind, QuerySpec};
use crate::results::{CustomDbRow, ResultSet, index_columns};
use crate::types::{RowValues, SqlType};

/// Native value for a bound parameter. An explicit hint wins over the runtime type.
#[allow(clippy::cast_precision_loss)]
pub(crate) fn to_native(value: RowValues, hint: Option<&SqlType>) -> Result<Value, ComposerError> {
    Ok(match (hint, value) {
        (Some(SqlType::Structured(name)), _) => {
            return Err(ComposerError::Unimplemented(format!(
                "structured parameter type {name} is not supported by SQLite"
            )));
        }
        (_, RowValues::Null) => Value::Null,
        (Some(SqlType::Float), RowValues::Int(i)) => Value::Real(i as f64),
        (Some(SqlType::Bit), RowValues::Int(i)) => Value::Integer(i64::from(i != 0)),
        (Some(SqlType::NVarChar | SqlType::Json), RowValues::Int(i)) => Value::Text(i.to_string()),
        (Some(SqlType::NVarChar | SqlType::Json), RowValues::Float(f)) => Value::Text(f.to_string()),
        (_, value) => runtime_native(value),
    })
}

fn runtime_native(value: RowValues) -> Value {
    match value {
        RowValues::Int(i) => Value::Integer(i),
        RowValues::Float(f) => Value::Real(f),
        RowValues::Text(s) => Value::Text(s),
        RowValues::Bool(b) => Value::Integer(i64::from(b)),
        RowValues::Timestamp(dt) => Value::Text(dt.format("%F %T%.f").to_string()),
        RowValues::Null => Value::Null,
        RowValues::JSON(json) => Value::Text(json.to_string()),
        RowValues::Blob(bytes) => Value::Blob(bytes),
    }
}

fn from_native(row: &Row<'_>, idx: usize) -> rusqlite::Result<RowValues> {
    Ok(match row.get::<usize, Value>(idx)? {
        Value::Null => RowValues::Null,
        Value::Integer(i) => RowValues::Int(i),
        Value::Real(f) => RowValues::Float(f),
        Value::Text(s) => RowValues::Text(s),
        Value::Blob(b) => RowValues::Blob(b),
    })
}

pub(crate) fn extract_row(row: &Row<'_>, width: usize) -> rusqlite::Result<Vec<RowValues>> {
    (0..width).map(|idx| from_native(row, idx)).collect()
}

/// Bind every named marker of `stmt` from the spec's parameter set.
///
/// Each value is read once here, so dynamic parameters are evaluated once per statement.
fn bind(stmt: &mut Statement<'_>, spec: &QuerySpec) -> Result<(), ComposerError> {
    for idx in 1..=stmt.parameter_count() {
        let Some(name) = stmt.parameter_name(idx).map(str::to_owned) else {
            return Err(ComposerError::ParameterError(format!(
                "anonymous parameter {idx} cannot be bound by name in: {}",
                spec.text()
            )));
        };
        let param = spec.params().get(&name).ok_or_else(|| {
            ComposerError::ParameterError(format!("no value bound for {name} in: {}", spec.text()))
        })?;
        let value = to_native(param.value(), param.sql_type().as_ref())?;
        stmt.raw_bind_parameter(idx, value)
            .map_err(|e| ComposerError::provider(spec.text(), e))?;
    }
    Ok(())
}

fn column_names(stmt: &Statement<'_>) -> Vec<String> {
    stmt.column_names()
        .iter()
        .map(ToString::to_string)
        .collect()
}

/// Prepare, bind and hand over each statement of the spec's text in order.
fn run_batch<F>(conn: &Connection, spec: &QuerySpec, mut each: F) -> Result<(), ComposerError>
where
    F: FnMut(&mut Statement<'_>) -> Result<ControlFlow<()>, ComposerError>,
{
    if spec.kind() == QueryKind::StoredProcedure {
        return Err(ComposerError::Unimplemented(format!(
            "stored procedure {} cannot be called on SQLite",
            spec.text()
        )));
    }
    let mut batch = Batch::new(conn, spec.text());
    while let Some(mut stmt) = batch
        .next()
        .map_err(|e| ComposerError::provider(spec.text(), e))?
    {
        bind(&mut stmt, spec)?;
        if each(&mut stmt)?.is_break() {
            break;
        }
    }
    Ok(())
}

fn execute_statement(stmt: &mut Statement<'_>, spec: &QuerySpec) -> Result<usize, ComposerError> {
    if stmt.column_count() == 0 {
        return stmt
            .raw_execute()
            .map_err(|e| ComposerError::provider(spec.text(), e));
    }
    let mut rows = stmt.raw_query();
    while rows
        .next()
        .map_err(|e| ComposerError::provider(spec.text(), e))?
        .is_some()
    {}
    Ok(0)
}

pub(crate) fn non_query(conn: &Connection, spec: &QuerySpec) -> Result<usize, ComposerError> {
    let mut affected = 0;
    run_batch(conn, spec, |stmt| {
        affected += execute_statement(stmt, spec)?;
        Ok(ControlFlow::Continue(()))
    })?;
    Ok(affected)
}

/// Stream rows to `visitor` until it breaks; returns the number of rows visited.
pub(crate) fn read(
    conn: &Connection,
    spec: &QuerySpec,
    visitor: &mut dyn FnMut(CustomDbRow) -> ControlFlow<()>,
) -> Result<usize, ComposerError> {
    let mut visited = 0;
    run_batch(conn, spec, |stmt| {
        if stmt.column_count() == 0 {
            execute_statement(stmt, spec)?;
            return Ok(ControlFlow::Continue(()));
        }
        let names = Arc::new(column_names(stmt));
        let index = index_columns(&names);
        let width = names.len();
        let mut rows = stmt.raw_query();
        while let Some(row) = rows
            .next()
            .map_err(|e| ComposerError::provider(spec.text(), e))?
        {
            let values =
                extract_row(row, width).map_err(|e| ComposerError::provider(spec.text(), e))?;
            visited += 1;
            let flow = visitor(CustomDbRow::from_parts(
                Arc::clone(&names),
                Arc::clone(&index),
                values,
            ));
            if flow.is_break() {
                return Ok(ControlFlow::Break(()));
            }
        }
        Ok(ControlFlow::Continue(()))
    })?;
    Ok(visited)
}

/// Append every returned row to `out`; returns the number of rows added.
pub(crate) fn fill(conn: &Connection, spec: &QuerySpec, out: &mut ResultSet) -> Result<usize, ComposerError> {
    let mut added = 0;
    run_batch(conn, spec, |stmt| {
        if stmt.column_count() == 0 {
            execute_statement(stmt, spec)?;
            return Ok(ControlFlow::Continue(()));
        }
        out.ensure_columns(column_names(stmt))?;
        let width = stmt.column_count();
        let mut rows = stmt.raw_query();
        while let Some(row) = rows
            .next()
            .map_err(|e| ComposerError::provider(spec.text(), e))?
        {
            let values =
                extract_row(row, width).map_err(|e| ComposerError::provider(spec.text(), e))?;
            out.add_row_values(values);
            added += 1;
        }
        Ok(ControlFlow::Continue(()))
    })?;
    Ok(added)
}

/// First column of the first returned row. Every statement of the batch still runs.
pub(crate) fn scalar(conn: &Connection, spec: &QuerySpec) -> Result<RowValues, ComposerError> {
    let mut first: Option<RowValues> = None;
    run_batch(conn, spec, |stmt| {
        if stmt.column_count() == 0 || first.is_some() {
            execute_statement(stmt, spec)?;
            return Ok(ControlFlow::Continue(()));
        }
        let mut rows = stmt.raw_query();
        while let Some(row) = rows
            .next()
            .map_err(|e| ComposerError::provider(spec.text(), e))?
        {
            if first.is_none() {
                first = Some(from_native(row, 0).map_err(|e| ComposerError::provider(spec.text(), e))?);
            }
        }
        Ok(ControlFlow::Continue(()))
    })?;
    Ok(first.unwrap_or(RowValues::Null))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parameter_set::ParameterSet;

    fn memory() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t (id INTEGER, name TEXT); INSERT INTO t VALUES (1, 'a'), (2, 'b');")
            .unwrap();
        conn
    }

    #[test]
    fn hints_override_runtime_types() {
        assert_eq!(to_native(RowValues::Int(3), Some(&SqlType::Float)).unwrap(), Value::Real(3.0));
        assert_eq!(to_native(RowValues::Int(9), Some(&SqlType::Bit)).unwrap(), Value::Integer(1));
        assert_eq!(
            to_native(RowValues::Int(9), Some(&SqlType::NVarChar)).unwrap(),
            Value::Text("9".into())
        );
        assert_eq!(to_native(RowValues::Bool(true), None).unwrap(), Value::Integer(1));
        assert_eq!(to_native(RowValues::Null, Some(&SqlType::Int)).unwrap(), Value::Null);
        assert!(to_native(RowValues::Int(1), Some(&SqlType::Structured("dbo.Ids".into()))).is_err());
    }

    #[test]
    fn binds_by_name_case_insensitively() {
        let conn = memory();
        let mut params = ParameterSet::new();
        params.add("@ID", 2).unwrap();
        let spec = QuerySpec::new("SELECT name FROM t WHERE id = @id").with_params(params);
        assert_eq!(scalar(&conn, &spec).unwrap(), RowValues::Text("b".into()));
    }

    #[test]
    fn unbound_marker_is_a_parameter_error() {
        let conn = memory();
        let spec = QuerySpec::new("SELECT name FROM t WHERE id = @missing");
        assert!(matches!(
            scalar(&conn, &spec).unwrap_err(),
            ComposerError::ParameterError(_)
        ));
    }

    #[test]
    fn runs_every_statement_of_a_batch() {
        let conn = memory();
        let spec = QuerySpec::new("UPDATE t SET name = 'x' WHERE id = 1; DELETE FROM t WHERE id = 2;");
        assert_eq!(non_query(&conn, &spec).unwrap(), 2);

        let mut out = ResultSet::default();
        let spec = QuerySpec::new("INSERT INTO t VALUES (3, 'c'); SELECT id, name FROM t ORDER BY id");
        assert_eq!(fill(&conn, &spec, &mut out).unwrap(), 2);
        assert_eq!(out.results[1].get("name"), Some(&RowValues::Text("c".into())));
    }

    #[test]
    fn scalar_runs_the_whole_batch() {
        let conn = memory();
        let spec = QuerySpec::new("SELECT 7; INSERT INTO t VALUES (3, 'c'); SELECT 8;");
        assert_eq!(scalar(&conn, &spec).unwrap(), RowValues::Int(7));
        let count = QuerySpec::new("SELECT COUNT(*) FROM t");
        assert_eq!(scalar(&conn, &count).unwrap(), RowValues::Int(3));
        assert_eq!(scalar(&conn, &QuerySpec::new("SELECT id FROM t WHERE id < 0")).unwrap(), RowValues::Null);
    }

    #[test]
    fn reader_stops_on_break() {
        let conn = memory();
        let spec = QuerySpec::new("SELECT id FROM t ORDER BY id");
        let mut seen = Vec::new();
        let visited = read(&conn, &spec, &mut |row| {
            seen.push(row.rows[0].clone());
            ControlFlow::Break(())
        })
        .unwrap();
        assert_eq!(visited, 1);
        assert_eq!(seen, vec![RowValues::Int(1)]);
    }
}
