use thiserror::Error;

use super::{ColumnDef, ResultSet};

/// Per-cell equality predicate with an availability filter. Assertions are
/// tried in the configured order; an assertion that reports itself not
/// applicable for a pair of values contributes no opinion on the cell.
#[derive(Debug, Clone, PartialEq)]
pub enum ValueAssertion {
    /// Bytewise comparison. Always available, always applicable.
    RawBytes,
    /// Compares both sides as 64-bit floats within `delta`. Available for
    /// listed column indices or columns whose reported type name matches;
    /// not applicable when either side fails to parse.
    FloatTolerance {
        columns: Vec<usize>,
        type_names: Vec<String>,
        delta: f64,
    },
}

impl ValueAssertion {
    pub fn available(&self, i: usize, col: &ColumnDef) -> bool {
        match self {
            ValueAssertion::RawBytes => true,
            ValueAssertion::FloatTolerance {
                columns,
                type_names,
                ..
            } => columns.contains(&i) || type_names.iter().any(|t| *t == col.type_name),
        }
    }

    /// Returns `(equal, applicable)`.
    pub fn equal(&self, v1: Option<&[u8]>, v2: Option<&[u8]>) -> (bool, bool) {
        match self {
            ValueAssertion::RawBytes => {
                (v1.unwrap_or_default() == v2.unwrap_or_default(), true)
            }
            ValueAssertion::FloatTolerance { delta, .. } => {
                let (Some(f1), Some(f2)) = (parse_f64(v1), parse_f64(v2)) else {
                    return (false, false);
                };
                ((f1 - f2).abs() < *delta, true)
            }
        }
    }

    fn describe(&self) -> &'static str {
        match self {
            ValueAssertion::RawBytes => "RawBytes",
            ValueAssertion::FloatTolerance { .. } => "FloatTolerance",
        }
    }
}

fn parse_f64(v: Option<&[u8]>) -> Option<f64> {
    std::str::from_utf8(v?).ok()?.parse().ok()
}

/// One cell on which an applicable assertion disagreed.
#[derive(Debug, Clone, PartialEq)]
pub struct CellMismatch {
    pub pos: (usize, usize),
    pub v1: Option<Vec<u8>>,
    pub v2: Option<Vec<u8>>,
    pub assertion: ValueAssertion,
}

impl std::fmt::Display for CellMismatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{}:{}] {} <> {} by {}",
            self.pos.0,
            self.pos.1,
            fmt_cell(&self.v1),
            fmt_cell(&self.v2),
            self.assertion.describe()
        )
    }
}

fn fmt_cell(v: &Option<Vec<u8>>) -> String {
    match v {
        Some(v) => format!("{:?}", String::from_utf8_lossy(v)),
        None => "NULL".into(),
    }
}

/// Structured diff outcome. These carry enough detail for reporters: both
/// schemas and row counts for shape failures, indices and both raw values
/// for cell failures.
#[derive(Debug, Error)]
pub enum DiffError {
    #[error("{reason}")]
    Shape {
        n_rows1: usize,
        n_rows2: usize,
        schema1: Vec<ColumnDef>,
        schema2: Vec<ColumnDef>,
        reason: String,
    },
    #[error("{0}")]
    Cell(CellMismatch),
    #[error("{} cells mismatch", .0.len())]
    Data(Vec<CellMismatch>),
}

/// Configured rule set for diffing two result sets.
#[derive(Debug, Clone)]
pub struct Checker {
    pub check_schema: bool,
    pub check_precision: bool,
    pub fail_fast: bool,
    pub assertions: Vec<ValueAssertion>,
}

impl Default for Checker {
    fn default() -> Self {
        Checker {
            check_schema: false,
            check_precision: false,
            fail_fast: true,
            assertions: vec![ValueAssertion::RawBytes],
        }
    }
}

impl Checker {
    fn diff_cols(&self, cols1: &[ColumnDef], cols2: &[ColumnDef]) -> Option<String> {
        for (i, (t1, t2)) in cols1.iter().zip(cols2).enumerate() {
            if t1.name != t2.name {
                return Some(format!("cols[{i}].name: {} <> {}", t1.name, t2.name));
            }
            if t1.type_name != t2.type_name {
                return Some(format!(
                    "cols[{i}].type: {} <> {}",
                    t1.type_name, t2.type_name
                ));
            }
            if t1.has_nullable != t2.has_nullable || t1.nullable != t2.nullable {
                return Some(format!(
                    "cols[{i}].nullable: {} <> {}",
                    t1.nullable, t2.nullable
                ));
            }
            if t1.has_length != t2.has_length || t1.length != t2.length {
                return Some(format!(
                    "cols[{i}].type: {}({}) <> {}({})",
                    t1.type_name, t1.length, t2.type_name, t2.length
                ));
            }
            if self.check_precision
                && (t1.has_precision_scale != t2.has_precision_scale
                    || t1.precision != t2.precision
                    || t1.scale != t2.scale)
            {
                return Some(format!(
                    "cols[{i}].type: {}({},{}) <> {}({},{})",
                    t1.type_name, t1.precision, t1.scale, t2.type_name, t2.precision, t2.scale
                ));
            }
        }
        None
    }

    /// Pairwise diff: shape first (row count, then column count), then the
    /// optional schema pass, then a row-major cell pass under the configured
    /// assertions. With `fail_fast` the first cell mismatch is returned
    /// alone; otherwise all mismatches accumulate into one error.
    pub fn diff(&self, rs1: &ResultSet, rs2: &ResultSet) -> Result<(), DiffError> {
        let shape = |reason: String| DiffError::Shape {
            n_rows1: rs1.n_rows(),
            n_rows2: rs2.n_rows(),
            schema1: rs1.cols.clone(),
            schema2: rs2.cols.clone(),
            reason,
        };
        if rs1.n_rows() != rs2.n_rows() {
            return Err(shape(format!(
                "len(rows): {} <> {}",
                rs1.n_rows(),
                rs2.n_rows()
            )));
        }
        if rs1.n_cols() != rs2.n_cols() {
            return Err(shape(format!(
                "len(cols): {} <> {}",
                rs1.n_cols(),
                rs2.n_cols()
            )));
        }
        if self.check_schema {
            if let Some(reason) = self.diff_cols(&rs1.cols, &rs2.cols) {
                return Err(shape(reason));
            }
        }
        let mut mismatches = Vec::new();
        for (i, (row1, row2)) in rs1.data.iter().zip(&rs2.data).enumerate() {
            for (j, (v1, v2)) in row1.iter().zip(row2).enumerate() {
                for assertion in &self.assertions {
                    if !assertion.available(j, &rs1.cols[j]) {
                        continue;
                    }
                    let (eq, applicable) = assertion.equal(v1.as_deref(), v2.as_deref());
                    if applicable && !eq {
                        let mismatch = CellMismatch {
                            pos: (i, j),
                            v1: v1.clone(),
                            v2: v2.clone(),
                            assertion: assertion.clone(),
                        };
                        if self.fail_fast {
                            return Err(DiffError::Cell(mismatch));
                        }
                        mismatches.push(mismatch);
                    }
                }
            }
        }
        if !mismatches.is_empty() {
            return Err(DiffError::Data(mismatches));
        }
        Ok(())
    }
}
