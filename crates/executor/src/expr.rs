//! Scalar expressions and predicates.

use crate::udf;
use otterbrix_core::{CompareOp, Error, Result, Value};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Binary arithmetic operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArithOp {
    /// Addition
    Add,
    /// Subtraction
    Sub,
    /// Multiplication
    Mul,
    /// Division
    Div,
    /// Remainder
    Mod,
}

/// A scalar expression evaluated one row at a time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ScalarExpr {
    /// Column reference by name
    Column(String),
    /// Literal value
    Literal(Value),
    /// Binary arithmetic
    Arith {
        /// Operator
        op: ArithOp,
        /// Left operand
        left: Box<ScalarExpr>,
        /// Right operand
        right: Box<ScalarExpr>,
    },
    /// Unary minus
    Neg(Box<ScalarExpr>),
    /// First non-NULL argument
    Coalesce(Vec<ScalarExpr>),
    /// `CASE WHEN ... THEN ... [ELSE ...] END`
    Case {
        /// (condition, result) arms in order
        arms: Vec<(Predicate, ScalarExpr)>,
        /// Result when no arm matches
        otherwise: Option<Box<ScalarExpr>>,
    },
    /// Struct field access `(expr).field`
    Field {
        /// Struct-valued base
        base: Box<ScalarExpr>,
        /// Field name
        field: String,
    },
    /// Array subscript `arr[i]`
    Subscript {
        /// Array-valued base
        base: Box<ScalarExpr>,
        /// Zero-based element index
        index: usize,
    },
    /// Row UDF invocation
    UdfCall {
        /// Registered function name
        name: String,
        /// Argument expressions
        args: Vec<ScalarExpr>,
    },
}

impl ScalarExpr {
    /// Shorthand for a column reference.
    pub fn column(name: impl Into<String>) -> Self {
        ScalarExpr::Column(name.into())
    }

    /// Shorthand for a literal.
    pub fn literal(value: Value) -> Self {
        ScalarExpr::Literal(value)
    }

    /// Evaluate against one row.
    pub fn evaluate(&self, row: &RowContext<'_>) -> Result<Value> {
        match self {
            ScalarExpr::Column(name) => row.get(name),
            ScalarExpr::Literal(value) => Ok(value.clone()),
            ScalarExpr::Arith { op, left, right } => {
                arith(*op, &left.evaluate(row)?, &right.evaluate(row)?)
            }
            ScalarExpr::Neg(inner) => match inner.evaluate(row)? {
                Value::Null => Ok(Value::Null),
                v => match v.as_i64() {
                    Some(i) => Ok(Value::Int64(-i)),
                    None => match v.as_f64() {
                        Some(f) => Ok(Value::Double(-f)),
                        None => Err(Error::Invalid(format!(
                            "cannot negate {}",
                            v.type_name()
                        ))),
                    },
                },
            },
            ScalarExpr::Coalesce(items) => {
                for item in items {
                    let value = item.evaluate(row)?;
                    if !value.is_null() {
                        return Ok(value);
                    }
                }
                Ok(Value::Null)
            }
            ScalarExpr::Case { arms, otherwise } => {
                for (condition, result) in arms {
                    if condition.matches(row)? {
                        return result.evaluate(row);
                    }
                }
                match otherwise {
                    Some(expr) => expr.evaluate(row),
                    None => Ok(Value::Null),
                }
            }
            ScalarExpr::Field { base, field } => {
                let value = base.evaluate(row)?;
                Ok(value.field(field).cloned().unwrap_or(Value::Null))
            }
            ScalarExpr::Subscript { base, index } => {
                let value = base.evaluate(row)?;
                Ok(value.element(*index).cloned().unwrap_or(Value::Null))
            }
            ScalarExpr::UdfCall { name, args } => {
                let mut values = Vec::with_capacity(args.len());
                for arg in args {
                    values.push(arg.evaluate(row)?);
                }
                udf::global().invoke_row(name, &values)
            }
        }
    }

    /// The column name this expression references, when it is a bare
    /// column. Used for index candidate extraction.
    pub fn as_column(&self) -> Option<&str> {
        match self {
            ScalarExpr::Column(name) => Some(name),
            _ => None,
        }
    }

    /// The literal value, when this is a bare literal.
    pub fn as_literal(&self) -> Option<&Value> {
        match self {
            ScalarExpr::Literal(value) => Some(value),
            _ => None,
        }
    }
}

fn arith(op: ArithOp, left: &Value, right: &Value) -> Result<Value> {
    if left.is_null() || right.is_null() {
        return Ok(Value::Null);
    }
    // Exact integer arithmetic when both sides are integral, doubles
    // otherwise.
    if let (Some(a), Some(b)) = (left.as_i64(), right.as_i64()) {
        return match op {
            ArithOp::Add => Ok(Value::Int64(a.wrapping_add(b))),
            ArithOp::Sub => Ok(Value::Int64(a.wrapping_sub(b))),
            ArithOp::Mul => Ok(Value::Int64(a.wrapping_mul(b))),
            ArithOp::Div => {
                if b == 0 {
                    Err(Error::Invalid("division by zero".to_string()))
                } else {
                    Ok(Value::Int64(a / b))
                }
            }
            ArithOp::Mod => {
                if b == 0 {
                    Err(Error::Invalid("division by zero".to_string()))
                } else {
                    Ok(Value::Int64(a % b))
                }
            }
        };
    }
    let (Some(a), Some(b)) = (left.as_f64(), right.as_f64()) else {
        return Err(Error::Invalid(format!(
            "arithmetic over {} and {}",
            left.type_name(),
            right.type_name()
        )));
    };
    match op {
        ArithOp::Add => Ok(Value::Double(a + b)),
        ArithOp::Sub => Ok(Value::Double(a - b)),
        ArithOp::Mul => Ok(Value::Double(a * b)),
        ArithOp::Div => {
            if b == 0.0 {
                Err(Error::Invalid("division by zero".to_string()))
            } else {
                Ok(Value::Double(a / b))
            }
        }
        ArithOp::Mod => {
            if b == 0.0 {
                Err(Error::Invalid("division by zero".to_string()))
            } else {
                Ok(Value::Double(a % b))
            }
        }
    }
}

/// A boolean predicate over one row. NULL comparisons collapse to false.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Predicate {
    /// `left op right`
    Compare {
        /// Left operand
        left: ScalarExpr,
        /// Comparison operator
        op: CompareOp,
        /// Right operand
        right: ScalarExpr,
    },
    /// `expr IS [NOT] NULL`
    IsNull {
        /// Tested expression
        expr: ScalarExpr,
        /// IS NOT NULL when true
        negated: bool,
    },
    /// `expr IN (values...)`
    In {
        /// Tested expression
        expr: ScalarExpr,
        /// Candidate values
        list: Vec<Value>,
        /// NOT IN when true
        negated: bool,
    },
    /// `expr [NOT] LIKE pattern` with `%` and `_` wildcards
    Like {
        /// Tested expression
        expr: ScalarExpr,
        /// Pattern
        pattern: String,
        /// NOT LIKE when true
        negated: bool,
    },
    /// Conjunction
    And(Vec<Predicate>),
    /// Disjunction
    Or(Vec<Predicate>),
    /// Negation
    Not(Box<Predicate>),
}

impl Predicate {
    /// Shorthand for `column op literal`.
    pub fn compare(column: impl Into<String>, op: CompareOp, value: Value) -> Self {
        Predicate::Compare {
            left: ScalarExpr::Column(column.into()),
            op,
            right: ScalarExpr::Literal(value),
        }
    }

    /// Evaluate against one row.
    pub fn matches(&self, row: &RowContext<'_>) -> Result<bool> {
        match self {
            Predicate::Compare { left, op, right } => {
                let l = left.evaluate(row)?;
                let r = right.evaluate(row)?;
                if l.is_null() || r.is_null() {
                    return Ok(false);
                }
                let ord = l.sort_cmp(&r);
                Ok(match op {
                    CompareOp::Eq => ord == Ordering::Equal,
                    CompareOp::Ne => ord != Ordering::Equal,
                    CompareOp::Lt => ord == Ordering::Less,
                    CompareOp::Le => ord != Ordering::Greater,
                    CompareOp::Gt => ord == Ordering::Greater,
                    CompareOp::Ge => ord != Ordering::Less,
                })
            }
            Predicate::IsNull { expr, negated } => {
                let is_null = expr.evaluate(row)?.is_null();
                Ok(is_null != *negated)
            }
            Predicate::In {
                expr,
                list,
                negated,
            } => {
                let value = expr.evaluate(row)?;
                if value.is_null() {
                    return Ok(false);
                }
                let found = list
                    .iter()
                    .any(|candidate| value.sort_cmp(candidate) == Ordering::Equal);
                Ok(found != *negated)
            }
            Predicate::Like {
                expr,
                pattern,
                negated,
            } => {
                let value = expr.evaluate(row)?;
                let Some(text) = value.as_str() else {
                    return Ok(false);
                };
                Ok(like_match(text, pattern) != *negated)
            }
            Predicate::And(items) => {
                for item in items {
                    if !item.matches(row)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Predicate::Or(items) => {
                for item in items {
                    if item.matches(row)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Predicate::Not(inner) => Ok(!inner.matches(row)?),
        }
    }

    /// Extract `(column, op, literal)` candidates from the top-level
    /// conjunction, for index selection and row-group pruning.
    pub fn index_candidates(&self) -> Vec<(&str, CompareOp, &Value)> {
        let mut out = Vec::new();
        self.collect_candidates(&mut out);
        out
    }

    fn collect_candidates<'a>(&'a self, out: &mut Vec<(&'a str, CompareOp, &'a Value)>) {
        match self {
            Predicate::Compare { left, op, right } => {
                if let (Some(column), Some(value)) = (left.as_column(), right.as_literal()) {
                    out.push((column, *op, value));
                }
            }
            Predicate::And(items) => {
                for item in items {
                    item.collect_candidates(out);
                }
            }
            _ => {}
        }
    }
}

/// SQL LIKE with `%` (any run) and `_` (one char), case sensitive.
fn like_match(text: &str, pattern: &str) -> bool {
    fn inner(t: &[char], p: &[char]) -> bool {
        match p.first().copied() {
            None => t.is_empty(),
            Some('%') => (0..=t.len()).any(|skip| inner(&t[skip..], &p[1..])),
            Some('_') => !t.is_empty() && inner(&t[1..], &p[1..]),
            Some(c) => !t.is_empty() && t[0] == c && inner(&t[1..], &p[1..]),
        }
    }
    let t: Vec<char> = text.chars().collect();
    let p: Vec<char> = pattern.chars().collect();
    inner(&t, &p)
}

/// Column name to value binding for one row.
pub struct RowContext<'a> {
    columns: &'a [String],
    values: &'a [Value],
}

impl<'a> RowContext<'a> {
    /// Bind column names to a row of values.
    pub fn new(columns: &'a [String], values: &'a [Value]) -> Self {
        debug_assert_eq!(columns.len(), values.len());
        RowContext { columns, values }
    }

    /// Value of a column by name. Unqualified names match the suffix of a
    /// qualified one (`a` matches `t.a`) so join outputs stay addressable.
    pub fn get(&self, name: &str) -> Result<Value> {
        if let Some(position) = self.columns.iter().position(|c| c == name) {
            return Ok(self.values[position].clone());
        }
        if let Some(position) = self
            .columns
            .iter()
            .position(|c| c.rsplit('.').next() == Some(name))
        {
            return Ok(self.values[position].clone());
        }
        Err(Error::Invalid(format!("unknown column {}", name)))
    }

    /// All column names.
    pub fn columns(&self) -> &[String] {
        self.columns
    }
}
