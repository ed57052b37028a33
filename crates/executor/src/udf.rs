//! Process-wide registry of user-supplied kernels.

use dashmap::DashMap;
use once_cell::sync::Lazy;
use otterbrix_core::{Error, LogicalType, Result, Value};
use std::sync::Arc;

/// A stateless row kernel: input values to one output value.
pub type RowKernel = Arc<dyn Fn(&[Value]) -> Result<Value> + Send + Sync>;

/// An aggregate kernel: four callbacks over an opaque per-group state
/// carried as a [`Value`].
#[derive(Clone)]
pub struct AggregateUdf {
    /// Fresh per-group state
    pub init: Arc<dyn Fn() -> Value + Send + Sync>,
    /// Fold a batch of argument values into the state
    pub consume: Arc<dyn Fn(&mut Value, &[Value]) -> Result<()> + Send + Sync>,
    /// Merge another state into this one
    pub merge: Arc<dyn Fn(&mut Value, Value) -> Result<()> + Send + Sync>,
    /// Produce the group result
    pub finalize: Arc<dyn Fn(Value) -> Result<Value> + Send + Sync>,
}

/// Best-effort logical type of an argument value, for signature matching.
/// NULL matches any declared type.
fn value_type(value: &Value) -> Option<LogicalType> {
    Some(match value {
        Value::Null => return None,
        Value::Bool(_) => LogicalType::Boolean,
        Value::Int8(_) => LogicalType::TinyInt,
        Value::Int16(_) => LogicalType::SmallInt,
        Value::Int32(_) => LogicalType::Integer,
        Value::Int64(_) => LogicalType::BigInt,
        Value::UInt8(_) => LogicalType::UTinyInt,
        Value::UInt16(_) => LogicalType::USmallInt,
        Value::UInt32(_) => LogicalType::UInteger,
        Value::UInt64(_) => LogicalType::UBigInt,
        Value::Float(_) => LogicalType::Float,
        Value::Double(_) => LogicalType::Double,
        Value::String(_) => LogicalType::String,
        Value::FixedArray(_) | Value::Struct(_) => return None,
    })
}

fn signature_matches(signature: &[LogicalType], args: &[Value]) -> bool {
    signature.len() == args.len()
        && signature.iter().zip(args).all(|(declared, value)| {
            match value_type(value) {
                Some(actual) => {
                    actual == *declared
                        // Integer literals are accepted by wider integer
                        // and float parameters.
                        || (declared.is_integer() && actual.is_integer())
                        || (declared.is_float() && (actual.is_integer() || actual.is_float()))
                }
                None => true,
            }
        })
}

enum Kernel {
    Row(RowKernel),
    Aggregate(AggregateUdf),
}

/// Registry keyed by `(function name, argument type signature)`.
#[derive(Default)]
pub struct UdfRegistry {
    kernels: DashMap<String, Vec<(Vec<LogicalType>, Kernel)>>,
}

impl UdfRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        UdfRegistry::default()
    }

    /// Register a row kernel under a signature. A later registration with
    /// the same name and signature replaces the earlier one.
    pub fn register_row(
        &self,
        name: impl Into<String>,
        signature: Vec<LogicalType>,
        kernel: RowKernel,
    ) {
        self.register(name.into(), signature, Kernel::Row(kernel));
    }

    /// Register an aggregate kernel under a signature.
    pub fn register_aggregate(
        &self,
        name: impl Into<String>,
        signature: Vec<LogicalType>,
        kernel: AggregateUdf,
    ) {
        self.register(name.into(), signature, Kernel::Aggregate(kernel));
    }

    fn register(&self, name: String, signature: Vec<LogicalType>, kernel: Kernel) {
        let mut entry = self.kernels.entry(name).or_default();
        entry.retain(|(existing, _)| existing != &signature);
        entry.push((signature, kernel));
    }

    /// Remove every kernel registered under a name.
    pub fn unregister(&self, name: &str) -> bool {
        self.kernels.remove(name).is_some()
    }

    /// Invoke a row kernel on evaluated arguments.
    pub fn invoke_row(&self, name: &str, args: &[Value]) -> Result<Value> {
        let entry = self
            .kernels
            .get(name)
            .ok_or_else(|| Error::UnrecognizedFunction {
                name: name.to_string(),
            })?;
        for (signature, kernel) in entry.iter() {
            if let Kernel::Row(row) = kernel {
                if signature_matches(signature, args) {
                    return row(args);
                }
            }
        }
        Err(Error::IncorrectFunctionArgument {
            what: format!(
                "{} has no row overload for ({})",
                name,
                args.iter()
                    .map(Value::type_name)
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
        })
    }

    /// Resolve an aggregate kernel by name and argument types.
    pub fn aggregate(&self, name: &str, args: &[Value]) -> Result<AggregateUdf> {
        let entry = self
            .kernels
            .get(name)
            .ok_or_else(|| Error::UnrecognizedFunction {
                name: name.to_string(),
            })?;
        for (signature, kernel) in entry.iter() {
            if let Kernel::Aggregate(aggregate) = kernel {
                if signature_matches(signature, args) {
                    return Ok(aggregate.clone());
                }
            }
        }
        Err(Error::IncorrectFunctionArgument {
            what: format!("{} has no aggregate overload", name),
        })
    }

    /// Whether any kernel is registered under a name.
    pub fn contains(&self, name: &str) -> bool {
        self.kernels.contains_key(name)
    }
}

static GLOBAL: Lazy<UdfRegistry> = Lazy::new(UdfRegistry::new);

/// The process-wide registry used by expression evaluation.
pub fn global() -> &'static UdfRegistry {
    &GLOBAL
}
