//! Typed column vectors and data chunks.
//!
//! A [`ColumnVector`] is one typed buffer plus a validity mask; a
//! [`DataChunk`] is an ordered set of equally-long vectors and is the unit
//! of bulk data movement between the executor, the table store and the WAL.

use crate::error::{Error, Result};
use crate::types::LogicalType;
use crate::value::Value;
use serde::{Deserialize, Serialize};

/// Validity bitmap: one bit per row, set = non-NULL.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ValidityMask {
    bits: Vec<u64>,
    len: usize,
}

impl ValidityMask {
    /// Empty mask.
    pub fn new() -> Self {
        ValidityMask::default()
    }

    /// Number of rows covered.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether no rows are covered.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Append one row's validity.
    pub fn push(&mut self, valid: bool) {
        let slot = self.len / 64;
        if slot == self.bits.len() {
            self.bits.push(0);
        }
        if valid {
            self.bits[slot] |= 1u64 << (self.len % 64);
        }
        self.len += 1;
    }

    /// Validity of one row; rows past the end read as invalid.
    pub fn get(&self, row: usize) -> bool {
        if row >= self.len {
            return false;
        }
        self.bits[row / 64] & (1u64 << (row % 64)) != 0
    }

    /// Overwrite one row's validity.
    pub fn set(&mut self, row: usize, valid: bool) {
        debug_assert!(row < self.len);
        let mask = 1u64 << (row % 64);
        if valid {
            self.bits[row / 64] |= mask;
        } else {
            self.bits[row / 64] &= !mask;
        }
    }
}

/// Physical buffer for one column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ColumnData {
    /// Booleans
    Bool(Vec<bool>),
    /// 8-bit signed integers
    Int8(Vec<i8>),
    /// 16-bit signed integers
    Int16(Vec<i16>),
    /// 32-bit signed integers
    Int32(Vec<i32>),
    /// 64-bit signed integers
    Int64(Vec<i64>),
    /// 8-bit unsigned integers
    UInt8(Vec<u8>),
    /// 16-bit unsigned integers
    UInt16(Vec<u16>),
    /// 32-bit unsigned integers
    UInt32(Vec<u32>),
    /// 64-bit unsigned integers
    UInt64(Vec<u64>),
    /// 32-bit floats
    Float(Vec<f32>),
    /// 64-bit floats
    Double(Vec<f64>),
    /// UTF-8 strings (also carries ENUM labels)
    Utf8(Vec<String>),
    /// Fixed arrays and structs, stored as whole values
    Nested(Vec<Value>),
}

impl ColumnData {
    fn for_type(ty: &LogicalType) -> ColumnData {
        match ty {
            LogicalType::Boolean => ColumnData::Bool(Vec::new()),
            LogicalType::TinyInt => ColumnData::Int8(Vec::new()),
            LogicalType::SmallInt => ColumnData::Int16(Vec::new()),
            LogicalType::Integer => ColumnData::Int32(Vec::new()),
            LogicalType::BigInt => ColumnData::Int64(Vec::new()),
            LogicalType::UTinyInt => ColumnData::UInt8(Vec::new()),
            LogicalType::USmallInt => ColumnData::UInt16(Vec::new()),
            LogicalType::UInteger => ColumnData::UInt32(Vec::new()),
            LogicalType::UBigInt => ColumnData::UInt64(Vec::new()),
            LogicalType::Float => ColumnData::Float(Vec::new()),
            LogicalType::Double => ColumnData::Double(Vec::new()),
            LogicalType::String | LogicalType::Enum(_) => ColumnData::Utf8(Vec::new()),
            LogicalType::FixedArray(_, _) | LogicalType::Struct(_) => {
                ColumnData::Nested(Vec::new())
            }
        }
    }

    fn len(&self) -> usize {
        match self {
            ColumnData::Bool(v) => v.len(),
            ColumnData::Int8(v) => v.len(),
            ColumnData::Int16(v) => v.len(),
            ColumnData::Int32(v) => v.len(),
            ColumnData::Int64(v) => v.len(),
            ColumnData::UInt8(v) => v.len(),
            ColumnData::UInt16(v) => v.len(),
            ColumnData::UInt32(v) => v.len(),
            ColumnData::UInt64(v) => v.len(),
            ColumnData::Float(v) => v.len(),
            ColumnData::Double(v) => v.len(),
            ColumnData::Utf8(v) => v.len(),
            ColumnData::Nested(v) => v.len(),
        }
    }

    fn push_value(&mut self, value: &Value) -> bool {
        match (self, value) {
            (ColumnData::Bool(v), Value::Bool(x)) => v.push(*x),
            (ColumnData::Int8(v), Value::Int8(x)) => v.push(*x),
            (ColumnData::Int16(v), Value::Int16(x)) => v.push(*x),
            (ColumnData::Int32(v), Value::Int32(x)) => v.push(*x),
            (ColumnData::Int64(v), Value::Int64(x)) => v.push(*x),
            (ColumnData::UInt8(v), Value::UInt8(x)) => v.push(*x),
            (ColumnData::UInt16(v), Value::UInt16(x)) => v.push(*x),
            (ColumnData::UInt32(v), Value::UInt32(x)) => v.push(*x),
            (ColumnData::UInt64(v), Value::UInt64(x)) => v.push(*x),
            (ColumnData::Float(v), Value::Float(x)) => v.push(*x),
            (ColumnData::Double(v), Value::Double(x)) => v.push(*x),
            (ColumnData::Utf8(v), Value::String(x)) => v.push(x.clone()),
            (ColumnData::Nested(v), x @ (Value::FixedArray(_) | Value::Struct(_))) => {
                v.push(x.clone())
            }
            _ => return false,
        }
        true
    }

    fn push_placeholder(&mut self) {
        match self {
            ColumnData::Bool(v) => v.push(false),
            ColumnData::Int8(v) => v.push(0),
            ColumnData::Int16(v) => v.push(0),
            ColumnData::Int32(v) => v.push(0),
            ColumnData::Int64(v) => v.push(0),
            ColumnData::UInt8(v) => v.push(0),
            ColumnData::UInt16(v) => v.push(0),
            ColumnData::UInt32(v) => v.push(0),
            ColumnData::UInt64(v) => v.push(0),
            ColumnData::Float(v) => v.push(0.0),
            ColumnData::Double(v) => v.push(0.0),
            ColumnData::Utf8(v) => v.push(String::new()),
            ColumnData::Nested(v) => v.push(Value::Null),
        }
    }

    fn get(&self, row: usize) -> Value {
        match self {
            ColumnData::Bool(v) => Value::Bool(v[row]),
            ColumnData::Int8(v) => Value::Int8(v[row]),
            ColumnData::Int16(v) => Value::Int16(v[row]),
            ColumnData::Int32(v) => Value::Int32(v[row]),
            ColumnData::Int64(v) => Value::Int64(v[row]),
            ColumnData::UInt8(v) => Value::UInt8(v[row]),
            ColumnData::UInt16(v) => Value::UInt16(v[row]),
            ColumnData::UInt32(v) => Value::UInt32(v[row]),
            ColumnData::UInt64(v) => Value::UInt64(v[row]),
            ColumnData::Float(v) => Value::Float(v[row]),
            ColumnData::Double(v) => Value::Double(v[row]),
            ColumnData::Utf8(v) => Value::String(v[row].clone()),
            ColumnData::Nested(v) => v[row].clone(),
        }
    }

    fn set(&mut self, row: usize, value: &Value) -> bool {
        match (self, value) {
            (ColumnData::Bool(v), Value::Bool(x)) => v[row] = *x,
            (ColumnData::Int8(v), Value::Int8(x)) => v[row] = *x,
            (ColumnData::Int16(v), Value::Int16(x)) => v[row] = *x,
            (ColumnData::Int32(v), Value::Int32(x)) => v[row] = *x,
            (ColumnData::Int64(v), Value::Int64(x)) => v[row] = *x,
            (ColumnData::UInt8(v), Value::UInt8(x)) => v[row] = *x,
            (ColumnData::UInt16(v), Value::UInt16(x)) => v[row] = *x,
            (ColumnData::UInt32(v), Value::UInt32(x)) => v[row] = *x,
            (ColumnData::UInt64(v), Value::UInt64(x)) => v[row] = *x,
            (ColumnData::Float(v), Value::Float(x)) => v[row] = *x,
            (ColumnData::Double(v), Value::Double(x)) => v[row] = *x,
            (ColumnData::Utf8(v), Value::String(x)) => v[row] = x.clone(),
            (ColumnData::Nested(v), x @ (Value::FixedArray(_) | Value::Struct(_))) => {
                v[row] = x.clone()
            }
            _ => return false,
        }
        true
    }
}

/// One typed column: buffer plus validity mask.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnVector {
    ty: LogicalType,
    validity: ValidityMask,
    data: ColumnData,
}

impl ColumnVector {
    /// Empty vector of the given type.
    pub fn new(ty: LogicalType) -> Self {
        let data = ColumnData::for_type(&ty);
        ColumnVector {
            ty,
            validity: ValidityMask::new(),
            data,
        }
    }

    /// Logical type of the column.
    pub fn logical_type(&self) -> &LogicalType {
        &self.ty
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the vector holds no rows.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append a value. The value must already be coerced to the column's
    /// type; NULL appends an invalid placeholder.
    pub fn push(&mut self, value: &Value) -> Result<()> {
        if value.is_null() {
            self.data.push_placeholder();
            self.validity.push(false);
            return Ok(());
        }
        if !self.data.push_value(value) {
            return Err(Error::TypeMismatch {
                expected: self.ty.to_string(),
                got: value.type_name().to_string(),
            });
        }
        self.validity.push(true);
        Ok(())
    }

    /// Read one row; invalid rows read as NULL.
    pub fn value(&self, row: usize) -> Value {
        if !self.validity.get(row) {
            return Value::Null;
        }
        self.data.get(row)
    }

    /// Overwrite one row.
    pub fn set_value(&mut self, row: usize, value: &Value) -> Result<()> {
        if row >= self.len() {
            return Err(Error::Invalid(format!(
                "row {} out of bounds for vector of {}",
                row,
                self.len()
            )));
        }
        if value.is_null() {
            self.validity.set(row, false);
            return Ok(());
        }
        if !self.data.set(row, value) {
            return Err(Error::TypeMismatch {
                expected: self.ty.to_string(),
                got: value.type_name().to_string(),
            });
        }
        self.validity.set(row, true);
        Ok(())
    }
}

/// An ordered set of equally-long column vectors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataChunk {
    columns: Vec<ColumnVector>,
}

impl DataChunk {
    /// Empty chunk with the given column types.
    pub fn new(types: Vec<LogicalType>) -> Self {
        DataChunk {
            columns: types.into_iter().map(ColumnVector::new).collect(),
        }
    }

    /// Build a chunk from row-major values. Each row must match the column
    /// count and already be coerced.
    pub fn from_rows(types: Vec<LogicalType>, rows: &[Vec<Value>]) -> Result<Self> {
        let mut chunk = DataChunk::new(types);
        for row in rows {
            chunk.push_row(row)?;
        }
        Ok(chunk)
    }

    /// Append one row.
    pub fn push_row(&mut self, row: &[Value]) -> Result<()> {
        if row.len() != self.columns.len() {
            return Err(Error::Invalid(format!(
                "row width {} does not match chunk width {}",
                row.len(),
                self.columns.len()
            )));
        }
        for (column, value) in self.columns.iter_mut().zip(row) {
            column.push(value)?;
        }
        Ok(())
    }

    /// Number of rows.
    pub fn cardinality(&self) -> usize {
        self.columns.first().map(|c| c.len()).unwrap_or(0)
    }

    /// Number of columns.
    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    /// Column vectors in order.
    pub fn columns(&self) -> &[ColumnVector] {
        &self.columns
    }

    /// Logical column types in order.
    pub fn types(&self) -> Vec<LogicalType> {
        self.columns.iter().map(|c| c.logical_type().clone()).collect()
    }

    /// Read one row as values.
    pub fn row(&self, row: usize) -> Vec<Value> {
        self.columns.iter().map(|c| c.value(row)).collect()
    }

    /// Copy out `len` rows starting at `offset`.
    pub fn slice(&self, offset: usize, len: usize) -> Result<DataChunk> {
        let end = (offset + len).min(self.cardinality());
        let mut out = DataChunk::new(self.types());
        for row in offset..end {
            out.push_row(&self.row(row))?;
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bigint_string_chunk() -> DataChunk {
        let types = vec![LogicalType::BigInt, LogicalType::String];
        DataChunk::from_rows(
            types,
            &[
                vec![Value::Int64(1), Value::String("x".to_string())],
                vec![Value::Int64(2), Value::Null],
                vec![Value::Int64(3), Value::String("z".to_string())],
            ],
        )
        .unwrap()
    }

    #[test]
    fn validity_mask_bits() {
        let mut mask = ValidityMask::new();
        for i in 0..130 {
            mask.push(i % 3 == 0);
        }
        assert_eq!(mask.len(), 130);
        assert!(mask.get(0));
        assert!(!mask.get(1));
        assert!(mask.get(129));
        assert!(!mask.get(500));

        mask.set(1, true);
        assert!(mask.get(1));
        mask.set(0, false);
        assert!(!mask.get(0));
    }

    #[test]
    fn push_and_read_back() {
        let chunk = bigint_string_chunk();
        assert_eq!(chunk.cardinality(), 3);
        assert_eq!(chunk.column_count(), 2);
        assert_eq!(
            chunk.row(0),
            vec![Value::Int64(1), Value::String("x".to_string())]
        );
        assert_eq!(chunk.row(1), vec![Value::Int64(2), Value::Null]);
    }

    #[test]
    fn push_rejects_wrong_type() {
        let mut col = ColumnVector::new(LogicalType::BigInt);
        let err = col.push(&Value::String("no".to_string())).unwrap_err();
        assert!(err.to_string().contains("BIGINT"));
    }

    #[test]
    fn set_value_overwrites_and_nulls() {
        let mut chunk = bigint_string_chunk();
        let col = &mut chunk.columns[0];
        col.set_value(1, &Value::Int64(42)).unwrap();
        assert_eq!(col.value(1), Value::Int64(42));
        col.set_value(1, &Value::Null).unwrap();
        assert_eq!(col.value(1), Value::Null);
    }

    #[test]
    fn slice_copies_rows() {
        let chunk = bigint_string_chunk();
        let tail = chunk.slice(1, 10).unwrap();
        assert_eq!(tail.cardinality(), 2);
        assert_eq!(tail.row(0)[0], Value::Int64(2));
        assert_eq!(tail.row(1)[0], Value::Int64(3));
    }

    #[test]
    fn chunk_serde_roundtrip() {
        let chunk = bigint_string_chunk();
        let bytes = rmp_serde::to_vec(&chunk).unwrap();
        let back: DataChunk = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(back, chunk);
    }
}
