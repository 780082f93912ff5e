//! Prepared statements
//!
//! A `Statement` owns the compiled program plus the cursor of results
//! the caller is reading. Stepping is cooperative: `Row` hands the
//! caller one row, `Busy` asks it to retry, and a `Schema` error asks
//! it to re-prepare against the new schema.

use crate::error::{Error, ErrorCode, Result};
use crate::types::{StepResult, Value};
use crate::vdbe::{vdbe_exec, Exec, Magic, Vdbe};

use super::connection::Connection;

// ============================================================================
// Statement
// ============================================================================

pub struct Statement {
    pub(crate) vdbe: Vdbe,
    sql: String,
    done: bool,
    /// Listing cursor for EXPLAIN statements
    explain_pos: usize,
}

impl Statement {
    pub(crate) fn new(vdbe: Vdbe, sql: &str) -> Self {
        Self {
            vdbe,
            sql: sql.to_string(),
            done: false,
            explain_pos: 0,
        }
    }

    /// The SQL text this statement was compiled from.
    pub fn sql(&self) -> &str {
        &self.sql
    }

    // ========================================================================
    // Stepping
    // ========================================================================

    pub(crate) fn step_inner(&mut self, conn: &mut Connection) -> Result<StepResult> {
        if self.done {
            return Err(Error::new(ErrorCode::Misuse));
        }
        if self.vdbe.explain {
            return Ok(self.step_explain());
        }
        if self.vdbe.magic != Magic::Run {
            return Err(Error::new(ErrorCode::Misuse));
        }
        match vdbe_exec(conn, &mut self.vdbe)? {
            Exec::Row => Ok(StepResult::Row),
            Exec::Busy => Ok(StepResult::Busy),
            Exec::Done => {
                self.done = true;
                Ok(StepResult::Done)
            }
        }
    }

    /// EXPLAIN mode surfaces the program listing instead of running it.
    fn step_explain(&mut self) -> StepResult {
        let listing = self.vdbe.listing();
        if self.explain_pos >= listing.len() {
            self.done = true;
            return StepResult::Done;
        }
        let (addr, opcode, p1, p2, p3) = listing[self.explain_pos].clone();
        self.explain_pos += 1;
        self.vdbe.result_row = vec![
            Value::Int(addr as i64),
            Value::Text(opcode),
            Value::Int(p1 as i64),
            Value::Int(p2 as i64),
            Value::Text(p3),
        ];
        StepResult::Row
    }

    /// Rewind for re-execution, keeping parameter bindings.
    pub fn reset(&mut self) {
        self.vdbe.reset();
        self.done = false;
        self.explain_pos = 0;
    }

    /// Release the statement, reporting any execution error.
    pub fn finalize(self) -> Result<()> {
        match self.vdbe.error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    // ========================================================================
    // Bindings
    // ========================================================================

    /// Bind a value to the 1-based `?` parameter `idx`. Values are
    /// always copied into the statement; Rust ownership subsumes the
    /// static/copy distinction of the original binding modes.
    pub fn bind(&mut self, idx: usize, value: Value) -> Result<()> {
        if idx == 0 || idx > self.vdbe.vars.len() {
            return Err(Error::with_message(
                ErrorCode::Error,
                format!("bind index {} out of range", idx),
            ));
        }
        self.vdbe.vars[idx - 1] = value;
        Ok(())
    }

    /// Number of `?` parameters.
    pub fn bind_parameter_count(&self) -> usize {
        self.vdbe.vars.len()
    }

    // ========================================================================
    // Result Access
    // ========================================================================

    pub fn column_count(&self) -> usize {
        if self.vdbe.explain {
            5
        } else {
            self.vdbe.result_columns
        }
    }

    pub fn column_name(&self, idx: usize) -> &str {
        if self.vdbe.explain {
            ["addr", "opcode", "p1", "p2", "p3"]
                .get(idx)
                .copied()
                .unwrap_or("")
        } else {
            self.vdbe
                .col_names
                .get(idx)
                .map(String::as_str)
                .unwrap_or("")
        }
    }

    /// Declared type of a result column, when known.
    pub fn column_decltype(&self, idx: usize) -> &str {
        self.vdbe
            .col_names
            .get(self.column_count() + idx)
            .map(String::as_str)
            .unwrap_or("")
    }

    /// The current row, valid after a `Row` step result.
    pub fn row(&self) -> &[Value] {
        &self.vdbe.result_row
    }

    /// Column names followed by declared types (2n entries).
    pub fn names(&self) -> &[String] {
        &self.vdbe.col_names
    }

    pub fn column_value(&self, idx: usize) -> Value {
        self.vdbe.result_row.get(idx).cloned().unwrap_or(Value::Null)
    }

    pub fn column_int(&self, idx: usize) -> i64 {
        self.column_value(idx).to_int()
    }

    pub fn column_real(&self, idx: usize) -> f64 {
        self.column_value(idx).to_real()
    }

    pub fn column_text(&self, idx: usize) -> String {
        self.column_value(idx).to_text()
    }

    pub fn is_null(&self, idx: usize) -> bool {
        self.column_value(idx).is_null()
    }
}
