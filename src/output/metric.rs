//! Tab-delimited metric tables.
//!
//! The writer renders any [`Metric`] row through its serde representation,
//! so a row struct's fields and the emitted columns cannot drift apart.
//! Optional columns serialize as blanks. The reader is header-indexed: it
//! looks fields up by column name so tables remain readable if columns are
//! ever appended.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::str::FromStr;

use anyhow::{Context, Result, anyhow, bail};
use serde::Serialize;
use serde_json::Value;

/// A row type with a fixed column set.
pub trait Metric: Serialize {
    /// Column names, in emission order. Must match the serialized field
    /// names of the implementing struct.
    fn column_names() -> &'static [&'static str];
}

fn format_value(value: &Value) -> Result<String> {
    match value {
        Value::Null => Ok(String::new()),
        Value::Bool(b) => Ok(b.to_string()),
        Value::Number(n) => Ok(n.to_string()),
        Value::String(s) => Ok(s.clone()),
        Value::Array(_) | Value::Object(_) => {
            Err(anyhow!("Metric fields must be scalar, got: {}", value))
        }
    }
}

/// Writes a header line plus one tab-delimited line per row.
pub fn write_metrics<T: Metric>(path: &str, rows: &[T]) -> Result<()> {
    let file = File::create(path).with_context(|| format!("Failed to create {}", path))?;
    let mut writer = BufWriter::new(file);
    writeln!(writer, "{}", T::column_names().join("\t"))?;
    for row in rows {
        let value = serde_json::to_value(row)?;
        let object = value.as_object().ok_or_else(|| anyhow!("Metric row is not a struct"))?;
        let fields: Vec<String> = T::column_names()
            .iter()
            .map(|&name| {
                object
                    .get(name)
                    .map(format_value)
                    .unwrap_or_else(|| Err(anyhow!("Metric row missing column '{}'", name)))
            })
            .collect::<Result<_>>()?;
        writeln!(writer, "{}", fields.join("\t"))?;
    }
    writer.flush()?;
    Ok(())
}

/// An in-memory tab-delimited table with a header line.
pub struct TableReader {
    columns: HashMap<String, usize>,
    rows: Vec<Vec<String>>,
}

impl TableReader {
    pub fn open(path: &str) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("Failed to open {}", path))?;
        Self::from_reader(BufReader::new(file))
            .with_context(|| format!("Failed to parse {}", path))
    }

    pub fn from_reader<R: BufRead>(reader: R) -> Result<Self> {
        let mut lines = reader.lines();
        let header = match lines.next() {
            Some(line) => line?,
            None => bail!("Empty table: missing header line"),
        };
        let names: Vec<&str> = header.split('\t').collect();
        let mut columns = HashMap::new();
        for (i, name) in names.iter().enumerate() {
            columns.insert(name.to_string(), i);
        }

        let mut rows = Vec::new();
        for (i, line) in lines.enumerate() {
            let line = line?;
            if line.is_empty() {
                continue;
            }
            let fields: Vec<String> = line.split('\t').map(str::to_string).collect();
            if fields.len() != names.len() {
                bail!(
                    "Row {} has {} fields but the header has {} columns",
                    i + 2,
                    fields.len(),
                    names.len()
                );
            }
            rows.push(fields);
        }
        Ok(TableReader { columns, rows })
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn rows(&self) -> impl Iterator<Item = RowView<'_>> {
        self.rows.iter().map(|fields| RowView { columns: &self.columns, fields })
    }
}

/// One row of a [`TableReader`], with typed field access by column name.
pub struct RowView<'a> {
    columns: &'a HashMap<String, usize>,
    fields: &'a [String],
}

impl RowView<'_> {
    pub fn get(&self, column: &str) -> Result<&str> {
        self.columns
            .get(column)
            .map(|&i| self.fields[i].as_str())
            .ok_or_else(|| anyhow!("Missing column '{}'", column))
    }

    pub fn parse<T>(&self, column: &str) -> Result<T>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        let raw = self.get(column)?;
        raw.parse::<T>()
            .map_err(|e| anyhow!("Invalid value '{}' in column '{}': {}", raw, column, e))
    }

    /// Parses an optional column: absent columns and blank fields are None.
    pub fn parse_opt<T>(&self, column: &str) -> Result<Option<T>>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.columns.get(column) {
            None => Ok(None),
            Some(&i) if self.fields[i].is_empty() => Ok(None),
            Some(&i) => self.fields[i]
                .parse::<T>()
                .map(Some)
                .map_err(|e| anyhow!("Invalid value '{}' in column '{}': {}", self.fields[i], column, e)),
        }
    }
}
