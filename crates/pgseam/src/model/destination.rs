use super::{Model, TableSchema, schema_of};
use crate::error::OrmResult;
use crate::value::{Record, from_record};

/// Something a terminal reader can fill from result records.
///
/// Implemented for derived models, `Vec<T>`, `Option<T>` and [`Record`].
pub trait Destination: Send {
    /// Single-valued destinations report `RecordNotFound` on zero rows and are
    /// left untouched.
    const SINGLE: bool;

    /// Schema of the rows held, used to infer the table when none was named.
    fn schema() -> Option<TableSchema> {
        None
    }

    /// Replace the destination contents with `records`.
    fn fill(&mut self, records: Vec<Record>) -> OrmResult<()>;
}

/// `Destination::fill` for a single model value: the first record wins.
pub fn fill_model<T: Model>(target: &mut T, records: Vec<Record>) -> OrmResult<()> {
    if let Some(record) = records.into_iter().next() {
        *target = from_record(record)?;
    }
    Ok(())
}

impl<T: Model> Destination for Vec<T> {
    const SINGLE: bool = false;

    fn schema() -> Option<TableSchema> {
        schema_of::<T>()
    }

    fn fill(&mut self, records: Vec<Record>) -> OrmResult<()> {
        *self = records
            .into_iter()
            .map(from_record)
            .collect::<OrmResult<Vec<T>>>()?;
        Ok(())
    }
}

impl<T: Model> Destination for Option<T> {
    const SINGLE: bool = false;

    fn schema() -> Option<TableSchema> {
        schema_of::<T>()
    }

    fn fill(&mut self, records: Vec<Record>) -> OrmResult<()> {
        *self = records.into_iter().next().map(from_record).transpose()?;
        Ok(())
    }
}

impl Destination for Record {
    const SINGLE: bool = true;

    fn fill(&mut self, records: Vec<Record>) -> OrmResult<()> {
        if let Some(record) = records.into_iter().next() {
            *self = record;
        }
        Ok(())
    }
}
