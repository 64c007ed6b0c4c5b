//! Row cursors returned by `row()` and `rows()`.

use crate::client::Lease;
use crate::error::{OrmError, OrmResult};
use crate::model::Destination;
use crate::value::{Record, from_record, record_from_row};
use futures_util::StreamExt;
use serde::de::DeserializeOwned;
use std::collections::VecDeque;
use std::pin::Pin;
use tokio_postgres::RowStream;

/// Result of `row()`: the first row of a query, or why there is none.
#[derive(Debug, Clone)]
pub struct Row {
    result: OrmResult<Option<Record>>,
}

impl Row {
    pub(crate) fn new(result: OrmResult<Option<Record>>) -> Self {
        Self { result }
    }

    /// A row holding `record`.
    pub fn from_record(record: Record) -> Self {
        Self::new(Ok(Some(record)))
    }

    /// A row carrying an error.
    pub fn from_error(err: OrmError) -> Self {
        Self::new(Err(err))
    }

    /// Deserialise the row. No row gives `RecordNotFound`.
    pub fn scan<T: DeserializeOwned>(&self) -> OrmResult<T> {
        from_record(self.record()?)
    }

    pub fn record(&self) -> OrmResult<Record> {
        match &self.result {
            Ok(Some(record)) => Ok(record.clone()),
            Ok(None) => Err(OrmError::RecordNotFound),
            Err(e) => Err(e.clone()),
        }
    }
}

/// Name and PostgreSQL type of a result column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnType {
    pub name: String,
    pub type_name: String,
}

enum Source {
    /// A live row stream; the lease keeps its connection checked out.
    Stream {
        stream: Pin<Box<RowStream>>,
        _lease: Lease,
    },
    Buffered(VecDeque<Record>),
}

/// A lazy, single-pass cursor over query results.
///
/// ```ignore
/// let mut rows = db.table("users").select("name, age").rows().await?;
/// while rows.next().await {
///     let user: NameAge = rows.scan()?;
/// }
/// rows.err()?;
/// rows.close();
/// ```
pub struct Rows {
    columns: Vec<ColumnType>,
    source: Option<Source>,
    current: Option<Record>,
    err: Option<OrmError>,
}

impl std::fmt::Debug for Rows {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rows")
            .field("columns", &self.columns)
            .field("open", &self.source.is_some())
            .field("err", &self.err)
            .finish()
    }
}

impl Rows {
    pub(crate) fn streaming(columns: Vec<ColumnType>, stream: RowStream, lease: Lease) -> Self {
        Self {
            columns,
            source: Some(Source::Stream {
                stream: Box::pin(stream),
                _lease: lease,
            }),
            current: None,
            err: None,
        }
    }

    /// A cursor over records already in memory.
    pub fn from_records(columns: Vec<ColumnType>, records: Vec<Record>) -> Self {
        Self {
            columns,
            source: Some(Source::Buffered(records.into())),
            current: None,
            err: None,
        }
    }

    /// Advance to the next row. Returns `false` once exhausted, after an
    /// error, or after `close()`; the cursor closes itself at the end.
    pub async fn next(&mut self) -> bool {
        self.current = None;
        let next = match &mut self.source {
            None => return false,
            Some(Source::Buffered(records)) => records.pop_front().map(Ok),
            Some(Source::Stream { stream, .. }) => match stream.next().await {
                Some(Ok(row)) => Some(record_from_row(&row)),
                Some(Err(e)) => Some(Err(OrmError::from_db_error(e))),
                None => None,
            },
        };
        match next {
            Some(Ok(record)) => {
                self.current = Some(record);
                true
            }
            Some(Err(e)) => {
                self.err = Some(e);
                self.close();
                false
            }
            None => {
                self.close();
                false
            }
        }
    }

    /// Deserialise the current row.
    pub fn scan<T: DeserializeOwned>(&self) -> OrmResult<T> {
        from_record(self.record()?)
    }

    /// The current row as a record.
    pub fn record(&self) -> OrmResult<Record> {
        self.current
            .clone()
            .ok_or_else(|| OrmError::Other("no current row; call next() first".into()))
    }

    /// Fill a destination from the current row.
    pub fn scan_into<D: Destination>(&self, dest: &mut D) -> OrmResult<()> {
        dest.fill(vec![self.record()?])
    }

    /// The error that ended iteration, if any.
    pub fn err(&self) -> OrmResult<()> {
        match &self.err {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }

    pub fn columns(&self) -> OrmResult<Vec<String>> {
        self.ensure_open()?;
        Ok(self.columns.iter().map(|c| c.name.clone()).collect())
    }

    pub fn column_types(&self) -> OrmResult<Vec<ColumnType>> {
        self.ensure_open()?;
        Ok(self.columns.clone())
    }

    /// PostgreSQL statements yield a single result set.
    pub fn next_result_set(&mut self) -> bool {
        false
    }

    /// Release the cursor and its connection. Safe to call repeatedly.
    pub fn close(&mut self) {
        self.source = None;
    }

    pub fn is_closed(&self) -> bool {
        self.source.is_none()
    }

    fn ensure_open(&self) -> OrmResult<()> {
        if self.is_closed() {
            return Err(OrmError::Other("rows are closed".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Deserialize, PartialEq)]
    struct User {
        id: i64,
        name: String,
    }

    fn record(id: i64, name: &str) -> Record {
        match json!({ "id": id, "name": name }) {
            serde_json::Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    fn columns() -> Vec<ColumnType> {
        vec![
            ColumnType { name: "id".into(), type_name: "int8".into() },
            ColumnType { name: "name".into(), type_name: "text".into() },
        ]
    }

    #[tokio::test]
    async fn iterates_then_stays_exhausted() {
        let mut rows = Rows::from_records(columns(), vec![record(1, "a"), record(2, "b")]);
        assert_eq!(rows.columns().unwrap(), vec!["id", "name"]);

        let mut seen = Vec::new();
        while rows.next().await {
            seen.push(rows.scan::<User>().unwrap());
        }
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[1], User { id: 2, name: "b".into() });

        assert!(!rows.next().await);
        assert!(rows.err().is_ok());
        assert!(rows.record().is_err());

        rows.close();
        rows.close();
        assert!(rows.columns().is_err());
        assert!(!rows.next_result_set());
    }

    #[tokio::test]
    async fn close_stops_iteration() {
        let mut rows = Rows::from_records(columns(), vec![record(1, "a"), record(2, "b")]);
        assert!(rows.next().await);
        rows.close();
        assert!(!rows.next().await);
    }

    #[test]
    fn row_scan_reports_not_found() {
        let row = Row::new(Ok(None));
        assert!(row.scan::<User>().unwrap_err().is_not_found());
        let row = Row::from_record(record(3, "c"));
        assert_eq!(row.scan::<User>().unwrap().id, 3);
    }
}
