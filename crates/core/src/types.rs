//! Logical types, column definitions and schemas.

use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Logical column types.
///
/// The physical value representation for each type is defined by
/// [`crate::value::Value`]; nested types carry their element layout here.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LogicalType {
    /// Boolean
    Boolean,
    /// 8-bit signed integer
    TinyInt,
    /// 16-bit signed integer
    SmallInt,
    /// 32-bit signed integer
    Integer,
    /// 64-bit signed integer
    BigInt,
    /// 8-bit unsigned integer
    UTinyInt,
    /// 16-bit unsigned integer
    USmallInt,
    /// 32-bit unsigned integer
    UInteger,
    /// 64-bit unsigned integer
    UBigInt,
    /// 32-bit float
    Float,
    /// 64-bit float
    Double,
    /// UTF-8 string
    String,
    /// Fixed-size array: element type and length
    FixedArray(Box<LogicalType>, usize),
    /// Struct of named fields
    Struct(Vec<(String, LogicalType)>),
    /// Enumeration over a closed set of labels
    Enum(Vec<String>),
}

impl LogicalType {
    /// Whether values of this type have a total order usable as an index
    /// key or a min/max pruning hint.
    pub fn is_orderable(&self) -> bool {
        !matches!(
            self,
            LogicalType::FixedArray(_, _) | LogicalType::Struct(_)
        )
    }

    /// Whether this is one of the integer types.
    pub fn is_integer(&self) -> bool {
        matches!(
            self,
            LogicalType::TinyInt
                | LogicalType::SmallInt
                | LogicalType::Integer
                | LogicalType::BigInt
                | LogicalType::UTinyInt
                | LogicalType::USmallInt
                | LogicalType::UInteger
                | LogicalType::UBigInt
        )
    }

    /// Whether this is a floating-point type.
    pub fn is_float(&self) -> bool {
        matches!(self, LogicalType::Float | LogicalType::Double)
    }
}

impl fmt::Display for LogicalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogicalType::Boolean => write!(f, "BOOLEAN"),
            LogicalType::TinyInt => write!(f, "TINYINT"),
            LogicalType::SmallInt => write!(f, "SMALLINT"),
            LogicalType::Integer => write!(f, "INTEGER"),
            LogicalType::BigInt => write!(f, "BIGINT"),
            LogicalType::UTinyInt => write!(f, "UTINYINT"),
            LogicalType::USmallInt => write!(f, "USMALLINT"),
            LogicalType::UInteger => write!(f, "UINTEGER"),
            LogicalType::UBigInt => write!(f, "UBIGINT"),
            LogicalType::Float => write!(f, "FLOAT"),
            LogicalType::Double => write!(f, "DOUBLE"),
            LogicalType::String => write!(f, "STRING"),
            LogicalType::FixedArray(elem, len) => write!(f, "{}[{}]", elem, len),
            LogicalType::Struct(fields) => {
                write!(f, "STRUCT(")?;
                for (i, (name, ty)) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{} {}", name, ty)?;
                }
                write!(f, ")")
            }
            LogicalType::Enum(labels) => write!(f, "ENUM({})", labels.join(", ")),
        }
    }
}

/// Comparison operator shared by predicates and index searches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CompareOp {
    /// Equal
    Eq,
    /// Not equal
    Ne,
    /// Less than
    Lt,
    /// Less than or equal
    Le,
    /// Greater than
    Gt,
    /// Greater than or equal
    Ge,
}

/// Where a collection's durable state lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageKind {
    /// WAL-only durability; rebuilt entirely by replay
    Memory,
    /// WAL plus periodic checkpoint file
    Disk,
}

/// One column of a collection schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDefinition {
    /// Column name
    pub name: String,
    /// Logical type
    pub logical_type: LogicalType,
    /// NOT NULL constraint
    pub not_null: bool,
    /// Default value substituted for missing input at bind time
    pub default: Option<Value>,
}

impl ColumnDefinition {
    /// Plain nullable column without a default.
    pub fn new(name: impl Into<String>, logical_type: LogicalType) -> Self {
        ColumnDefinition {
            name: name.into(),
            logical_type,
            not_null: false,
            default: None,
        }
    }

    /// Add a NOT NULL constraint.
    pub fn not_null(mut self) -> Self {
        self.not_null = true;
        self
    }

    /// Attach a default value.
    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }
}

/// Ordered list of column definitions.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Schema {
    columns: Vec<ColumnDefinition>,
}

impl Schema {
    /// Build a schema from column definitions.
    pub fn new(columns: Vec<ColumnDefinition>) -> Self {
        Schema { columns }
    }

    /// Column definitions in declaration order.
    pub fn columns(&self) -> &[ColumnDefinition] {
        &self.columns
    }

    /// Number of columns.
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    /// Whether the schema has no columns.
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Position of a column by name.
    pub fn position(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    /// Column definition by name.
    pub fn column(&self, name: &str) -> Option<&ColumnDefinition> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Logical types in declaration order.
    pub fn types(&self) -> Vec<LogicalType> {
        self.columns.iter().map(|c| c.logical_type.clone()).collect()
    }
}

/// Qualified collection name: (database, collection).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CollectionName {
    /// Database name
    pub database: String,
    /// Collection name
    pub collection: String,
}

impl CollectionName {
    /// Build a qualified name.
    pub fn new(database: impl Into<String>, collection: impl Into<String>) -> Self {
        CollectionName {
            database: database.into(),
            collection: collection.into(),
        }
    }
}

impl fmt::Display for CollectionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.database, self.collection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_lookup() {
        let schema = Schema::new(vec![
            ColumnDefinition::new("a", LogicalType::BigInt).not_null(),
            ColumnDefinition::new("b", LogicalType::String),
        ]);
        assert_eq!(schema.len(), 2);
        assert_eq!(schema.position("b"), Some(1));
        assert_eq!(schema.position("missing"), None);
        assert!(schema.column("a").unwrap().not_null);
    }

    #[test]
    fn display_nested_types() {
        let ty = LogicalType::FixedArray(Box::new(LogicalType::Double), 3);
        assert_eq!(ty.to_string(), "DOUBLE[3]");

        let ty = LogicalType::Struct(vec![
            ("x".to_string(), LogicalType::BigInt),
            ("y".to_string(), LogicalType::String),
        ]);
        assert_eq!(ty.to_string(), "STRUCT(x BIGINT, y STRING)");
    }

    #[test]
    fn orderability() {
        assert!(LogicalType::BigInt.is_orderable());
        assert!(LogicalType::String.is_orderable());
        assert!(LogicalType::Enum(vec!["a".to_string()]).is_orderable());
        assert!(!LogicalType::FixedArray(Box::new(LogicalType::BigInt), 2).is_orderable());
        assert!(!LogicalType::Struct(vec![]).is_orderable());
    }

    #[test]
    fn collection_name_display() {
        let name = CollectionName::new("db", "users");
        assert_eq!(name.to_string(), "db.users");
    }
}
