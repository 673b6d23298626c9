use std::cmp::Ordering;
use std::io::{self, Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use thiserror::Error;

mod check;

pub use check::{CellMismatch, Checker, DiffError, ValueAssertion};

/// Column metadata as reported by the driver. Each `has_*` flag says whether
/// the driver reported the corresponding attribute; the value is meaningful
/// only when its flag is set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    #[serde(rename = "type")]
    pub type_name: String,
    pub length: i64,
    pub precision: i64,
    pub scale: i64,
    pub nullable: bool,
    pub has_nullable: bool,
    pub has_length: bool,
    pub has_precision_scale: bool,
}

/// Summary of a non-query statement.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecResult {
    pub rows_affected: i64,
    pub last_insert_id: i64,
    pub has_rows_affected: bool,
    pub has_last_insert_id: bool,
}

/// One table cell: `None` is SQL NULL, distinct from empty bytes.
pub type RawCell = Option<Vec<u8>>;
pub type Row = Vec<RawCell>;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("compressed stream: {0}")]
    Stream(#[from] io::Error),
    #[error("malformed record: {0}")]
    Record(#[from] serde_json::Error),
}

/// Captured output of one statement: either an exec summary (no columns) or
/// an ordered table of raw cells. Every row has exactly `cols.len()` cells.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultSet {
    cols: Vec<ColumnDef>,
    data: Vec<Row>,
    exec: ExecResult,
}

#[derive(Serialize)]
struct RecordRef<'a> {
    cols: &'a [ColumnDef],
    data: &'a [Row],
    exec: &'a ExecResult,
}

#[derive(Deserialize)]
struct Record {
    #[serde(default)]
    cols: Vec<ColumnDef>,
    #[serde(default)]
    data: Vec<Row>,
    #[serde(default)]
    exec: ExecResult,
}

impl ResultSet {
    pub fn new(schema: Vec<ColumnDef>) -> Self {
        ResultSet {
            cols: schema,
            ..Default::default()
        }
    }

    pub fn from_exec(exec: ExecResult) -> Self {
        ResultSet {
            exec,
            ..Default::default()
        }
    }

    /// A result set is an exec result iff it has no columns.
    pub fn is_exec_result(&self) -> bool {
        self.cols.is_empty()
    }

    pub fn exec_result(&self) -> ExecResult {
        self.exec
    }

    pub fn n_rows(&self) -> usize {
        self.data.len()
    }

    pub fn n_cols(&self) -> usize {
        self.cols.len()
    }

    /// Column definition at `i`; negative indices count from the end.
    /// Out of range yields the default definition.
    pub fn column_def(&self, i: isize) -> ColumnDef {
        match wrap_index(i, self.cols.len()) {
            Some(i) => self.cols[i].clone(),
            None => ColumnDef::default(),
        }
    }

    pub fn columns(&self) -> &[ColumnDef] {
        &self.cols
    }

    /// Raw cell at `(i, j)`; negative indices count from the end. The outer
    /// `Option` is range membership, the inner one NULL-ness.
    pub fn raw_value(&self, i: isize, j: isize) -> Option<Option<&[u8]>> {
        let i = wrap_index(i, self.data.len())?;
        let row = &self.data[i];
        let j = wrap_index(j, row.len())?;
        Some(row[j].as_deref())
    }

    pub fn push_row(&mut self, row: Row) {
        debug_assert_eq!(row.len(), self.cols.len());
        self.data.push(row);
    }

    /// Stable in-place sort of the rows.
    pub fn sort_rows_by<F>(&mut self, cmp: F)
    where
        F: FnMut(&Row, &Row) -> Ordering,
    {
        self.data.sort_by(cmp);
    }

    /// Hex-encoded sha1 over all cells in row-major order; each cell
    /// contributes its big-endian `(row, col)` indices followed by its raw
    /// bytes (nothing for NULL). Exec results digest to the empty string.
    pub fn data_digest(&self) -> String {
        self.data_digest_filtered(&[])
    }

    /// Like [`data_digest`](Self::data_digest), but cells for which any
    /// filter returns false are left out.
    pub fn data_digest_filtered(&self, filters: &[&dyn Fn(usize, usize, Option<&[u8]>) -> bool]) -> String {
        if self.is_exec_result() {
            return String::new();
        }
        let mut h = Sha1::new();
        for (i, row) in self.data.iter().enumerate() {
            'cell: for (j, v) in row.iter().enumerate() {
                for filter in filters {
                    if !filter(i, j, v.as_deref()) {
                        continue 'cell;
                    }
                }
                h.update((i as u32).to_be_bytes());
                h.update((j as u32).to_be_bytes());
                if let Some(v) = v {
                    h.update(v);
                }
            }
        }
        hex::encode(h.finalize())
    }

    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let mut buf = Vec::new();
        self.encode_to(&mut buf)?;
        Ok(buf)
    }

    pub fn encode_to<W: Write>(&self, w: W) -> Result<(), CodecError> {
        let mut zw = GzEncoder::new(w, Compression::default());
        serde_json::to_writer(
            &mut zw,
            &RecordRef {
                cols: &self.cols,
                data: &self.data,
                exec: &self.exec,
            },
        )?;
        zw.finish()?;
        Ok(())
    }

    pub fn decode(raw: &[u8]) -> Result<Self, CodecError> {
        Self::decode_from(raw)
    }

    pub fn decode_from<R: Read>(r: R) -> Result<Self, CodecError> {
        let zr = GzDecoder::new(r);
        let rec: Record = serde_json::from_reader(zr)?;
        Ok(ResultSet {
            cols: rec.cols,
            data: rec.data,
            exec: rec.exec,
        })
    }

    /// Writes a plain-text table for human inspection; NULL cells and
    /// unreported exec attributes render as `NULL`.
    pub fn render<W: Write>(&self, out: &mut W) -> io::Result<()> {
        if self.is_exec_result() {
            let rows_affected = self
                .exec
                .has_rows_affected
                .then(|| self.exec.rows_affected.to_string())
                .unwrap_or_else(|| "NULL".into());
            let last_insert_id = self
                .exec
                .has_last_insert_id
                .then(|| self.exec.last_insert_id.to_string())
                .unwrap_or_else(|| "NULL".into());
            writeln!(out, "RowsAffected | LastInsertId")?;
            writeln!(out, "{rows_affected} | {last_insert_id}")?;
            return Ok(());
        }
        let mut widths: Vec<usize> = self.cols.iter().map(|c| c.name.len()).collect();
        let mut rendered: Vec<Vec<String>> = Vec::with_capacity(self.data.len());
        for row in &self.data {
            let mut cells = Vec::with_capacity(row.len());
            for (j, v) in row.iter().enumerate() {
                let s = match v {
                    Some(v) => String::from_utf8_lossy(v).into_owned(),
                    None => "NULL".into(),
                };
                widths[j] = widths[j].max(s.len());
                cells.push(s);
            }
            rendered.push(cells);
        }
        let line = |out: &mut W, cells: &[String]| -> io::Result<()> {
            let mut first = true;
            for (j, s) in cells.iter().enumerate() {
                if !first {
                    write!(out, " | ")?;
                }
                write!(out, "{s:<width$}", width = widths[j])?;
                first = false;
            }
            writeln!(out)
        };
        let header: Vec<String> = self.cols.iter().map(|c| c.name.clone()).collect();
        line(out, &header)?;
        for cells in &rendered {
            line(out, cells)?;
        }
        Ok(())
    }
}

fn wrap_index(i: isize, len: usize) -> Option<usize> {
    let i = if i < 0 { i + len as isize } else { i };
    (0..len as isize).contains(&i).then_some(i as usize)
}
