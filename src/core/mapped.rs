// Column mapping decorator: positional rows become key/value rows.
use std::collections::HashMap;
use std::hash::Hash;

use serde::Serialize;

use crate::core::error::Error;
use crate::core::reader::RowReader;
use crate::core::tokenizer::TabularRow;

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct MappedRow<K: Eq + Hash> {
    line: u64,
    values: HashMap<K, String>,
    field_count: usize,
}

impl<K: Eq + Hash> MappedRow<K> {
    pub fn new(line: u64, values: HashMap<K, String>, field_count: usize) -> Self {
        Self {
            line,
            values,
            field_count,
        }
    }

    /// 1-based count of rows mapped by the producing reader.
    pub fn line(&self) -> u64 {
        self.line
    }

    /// Number of fields the source row had before mapping.
    pub fn field_count(&self) -> usize {
        self.field_count
    }

    pub fn get(&self, key: &K) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn values(&self) -> &HashMap<K, String> {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn set(&mut self, key: K, value: impl Into<String>) {
        self.values.insert(key, value.into());
    }

    pub fn into_values(self) -> HashMap<K, String> {
        self.values
    }
}

/// Maps field `i` of each row to `columns[i]`; surplus fields or keys are left out.
pub struct MappedReader<R, K> {
    inner: R,
    columns: Vec<K>,
    line: u64,
}

impl<R, K> MappedReader<R, K>
where
    R: RowReader<Row = TabularRow>,
    K: Clone + Eq + Hash,
{
    pub fn new(inner: R, columns: Vec<K>) -> Self {
        Self {
            inner,
            columns,
            line: 0,
        }
    }

    pub fn columns(&self) -> &[K] {
        &self.columns
    }

    pub fn inner(&self) -> &R {
        &self.inner
    }
}

impl<R, K> RowReader for MappedReader<R, K>
where
    R: RowReader<Row = TabularRow>,
    K: Clone + Eq + Hash,
{
    type Row = MappedRow<K>;

    fn header(&self) -> Option<&[String]> {
        self.inner.header()
    }

    fn read(&mut self) -> Result<Option<MappedRow<K>>, Error> {
        let Some(row) = self.inner.read()? else {
            return Ok(None);
        };
        let field_count = row.field_count();
        let values = self
            .columns
            .iter()
            .cloned()
            .zip(row.fields)
            .collect::<HashMap<_, _>>();
        self.line += 1;
        Ok(Some(MappedRow::new(self.line, values, field_count)))
    }

    fn close(&mut self) -> Result<(), Error> {
        self.inner.close()
    }
}
