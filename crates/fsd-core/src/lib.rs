#![forbid(unsafe_code)]

pub mod env;
#[cfg(test)]
pub mod proptest_strategies;

pub use env::{EnvSnapshot, parse_flag, vars};

use serde::{Deserialize, Serialize};

/// Element types produced by the baseline and accelerated executions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DType {
    F16,
    BF16,
    F32,
    F64,
    I8,
    I16,
    I32,
    I64,
    U8,
    Bool,
}

/// Comparison family of a dtype. Integer and bool families are compared bit-exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DTypeFamily {
    Integer,
    Float,
    Bool,
}

impl DType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::F16 => "float16",
            Self::BF16 => "bfloat16",
            Self::F32 => "float32",
            Self::F64 => "float64",
            Self::I8 => "int8",
            Self::I16 => "int16",
            Self::I32 => "int32",
            Self::I64 => "int64",
            Self::U8 => "uint8",
            Self::Bool => "bool",
        }
    }

    #[must_use]
    pub fn family(self) -> DTypeFamily {
        match self {
            Self::F16 | Self::BF16 | Self::F32 | Self::F64 => DTypeFamily::Float,
            Self::I8 | Self::I16 | Self::I32 | Self::I64 | Self::U8 => DTypeFamily::Integer,
            Self::Bool => DTypeFamily::Bool,
        }
    }

    #[must_use]
    pub fn is_float(self) -> bool {
        self.family() == DTypeFamily::Float
    }

    #[must_use]
    pub fn is_exact(self) -> bool {
        !self.is_float()
    }

    /// Storage width in bits.
    #[must_use]
    pub fn bit_width(self) -> u32 {
        match self {
            Self::Bool | Self::I8 | Self::U8 => 8,
            Self::F16 | Self::BF16 | Self::I16 => 16,
            Self::F32 | Self::I32 => 32,
            Self::F64 | Self::I64 => 64,
        }
    }
}

impl std::fmt::Display for DType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Shape {
    pub dims: Vec<u32>,
}

impl Shape {
    #[must_use]
    pub fn scalar() -> Self {
        Self { dims: Vec::new() }
    }

    #[must_use]
    pub fn vector(len: u32) -> Self {
        Self { dims: vec![len] }
    }

    #[must_use]
    pub fn new(dims: &[u32]) -> Self {
        Self {
            dims: dims.to_vec(),
        }
    }

    #[must_use]
    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    #[must_use]
    pub fn element_count(&self) -> Option<u64> {
        self.dims
            .iter()
            .try_fold(1_u64, |acc, dim| acc.checked_mul(u64::from(*dim)))
    }
}

/// A single element. Floats of every width are stored as f64 bits; the owning
/// tensor's dtype records the original precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Literal {
    I64(i64),
    Bool(bool),
    F64Bits(u64),
}

impl Literal {
    #[must_use]
    pub fn from_f64(value: f64) -> Self {
        Self::F64Bits(value.to_bits())
    }

    #[must_use]
    pub fn as_f64(self) -> Option<f64> {
        match self {
            Self::F64Bits(bits) => Some(f64::from_bits(bits)),
            Self::I64(value) => Some(value as f64),
            Self::Bool(_) => None,
        }
    }

    #[must_use]
    pub fn as_i64(self) -> Option<i64> {
        match self {
            Self::I64(value) => Some(value),
            Self::Bool(_) | Self::F64Bits(_) => None,
        }
    }

    #[must_use]
    pub fn as_bool(self) -> Option<bool> {
        match self {
            Self::Bool(value) => Some(value),
            Self::I64(_) | Self::F64Bits(_) => None,
        }
    }

    /// The dtype a bare scalar of this literal reports.
    #[must_use]
    pub fn natural_dtype(self) -> DType {
        match self {
            Self::I64(_) => DType::I64,
            Self::Bool(_) => DType::Bool,
            Self::F64Bits(_) => DType::F64,
        }
    }

    /// Numeric value equality across literal kinds, so `1`, `1.0` and `true`
    /// are all equal. Floats compare by value, not by bit pattern.
    #[must_use]
    pub fn value_eq(self, other: Self) -> bool {
        match (self, other) {
            (Self::F64Bits(a), Self::F64Bits(b)) => f64::from_bits(a) == f64::from_bits(b),
            (Self::F64Bits(bits), other) | (other, Self::F64Bits(bits)) => other
                .integer_view()
                .is_some_and(|int| float_eq_int(f64::from_bits(bits), int)),
            (a, b) => a.integer_view() == b.integer_view(),
        }
    }

    fn integer_view(self) -> Option<i64> {
        match self {
            Self::I64(value) => Some(value),
            Self::Bool(value) => Some(i64::from(value)),
            Self::F64Bits(_) => None,
        }
    }
}

/// Exact comparison; `int as f64` would round large integers.
fn float_eq_int(float: f64, int: i64) -> bool {
    // 2^63, the first float past i64::MAX.
    const UPPER: f64 = 9_223_372_036_854_775_808.0;
    float.fract() == 0.0 && (-UPPER..UPPER).contains(&float) && float as i64 == int
}

impl std::fmt::Display for Literal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::I64(value) => write!(f, "{value}"),
            Self::Bool(value) => write!(f, "{value}"),
            Self::F64Bits(bits) => write!(f, "{}", f64::from_bits(*bits)),
        }
    }
}

/// Opaque output of one execution. Only dtype and elements are interpreted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Value {
    Scalar(Literal),
    Tensor(TensorValue),
    List(Vec<Value>),
}

impl Value {
    #[must_use]
    pub fn scalar_i64(value: i64) -> Self {
        Self::Scalar(Literal::I64(value))
    }

    #[must_use]
    pub fn scalar_f64(value: f64) -> Self {
        Self::Scalar(Literal::from_f64(value))
    }

    #[must_use]
    pub fn scalar_bool(value: bool) -> Self {
        Self::Scalar(Literal::Bool(value))
    }

    pub fn vector_i64(values: &[i64]) -> Result<Self, ValueError> {
        Self::tensor_i64(DType::I64, Shape::vector(values.len() as u32), values)
    }

    pub fn vector_f64(values: &[f64]) -> Result<Self, ValueError> {
        Self::tensor_f64(DType::F64, Shape::vector(values.len() as u32), values)
    }

    pub fn tensor_f64(dtype: DType, shape: Shape, values: &[f64]) -> Result<Self, ValueError> {
        if !dtype.is_float() {
            return Err(ValueError::ElementKindMismatch {
                dtype,
                detail: "float elements supplied",
            });
        }
        let elements = values.iter().copied().map(Literal::from_f64).collect();
        Ok(Self::Tensor(TensorValue::new(dtype, shape, elements)?))
    }

    pub fn tensor_i64(dtype: DType, shape: Shape, values: &[i64]) -> Result<Self, ValueError> {
        if dtype.family() != DTypeFamily::Integer {
            return Err(ValueError::ElementKindMismatch {
                dtype,
                detail: "integer elements supplied",
            });
        }
        let elements = values.iter().copied().map(Literal::I64).collect();
        Ok(Self::Tensor(TensorValue::new(dtype, shape, elements)?))
    }

    pub fn tensor_bool(shape: Shape, values: &[bool]) -> Result<Self, ValueError> {
        let elements = values.iter().copied().map(Literal::Bool).collect();
        Ok(Self::Tensor(TensorValue::new(DType::Bool, shape, elements)?))
    }

    #[must_use]
    pub fn as_scalar_literal(&self) -> Option<Literal> {
        match self {
            Self::Scalar(lit) => Some(*lit),
            Self::Tensor(tensor) if tensor.rank() == 0 => tensor.elements.first().copied(),
            Self::Tensor(_) | Self::List(_) => None,
        }
    }

    #[must_use]
    pub fn as_f64_scalar(&self) -> Option<f64> {
        self.as_scalar_literal().and_then(Literal::as_f64)
    }

    #[must_use]
    pub fn as_i64_scalar(&self) -> Option<i64> {
        self.as_scalar_literal().and_then(Literal::as_i64)
    }

    /// Truth value of a bool scalar or rank-0 bool tensor.
    #[must_use]
    pub fn as_bool_scalar(&self) -> Option<bool> {
        self.as_scalar_literal().and_then(Literal::as_bool)
    }

    #[must_use]
    pub fn as_tensor(&self) -> Option<&TensorValue> {
        match self {
            Self::Tensor(tensor) => Some(tensor),
            Self::Scalar(_) | Self::List(_) => None,
        }
    }

    #[must_use]
    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Self::List(items) => Some(items),
            Self::Scalar(_) | Self::Tensor(_) => None,
        }
    }

    /// Dtype of a scalar or tensor; lists have none.
    #[must_use]
    pub fn dtype(&self) -> Option<DType> {
        match self {
            Self::Scalar(lit) => Some(lit.natural_dtype()),
            Self::Tensor(tensor) => Some(tensor.dtype),
            Self::List(_) => None,
        }
    }

    #[must_use]
    pub fn rank(&self) -> Option<usize> {
        match self {
            Self::Scalar(_) => Some(0),
            Self::Tensor(tensor) => Some(tensor.rank()),
            Self::List(_) => None,
        }
    }

    #[must_use]
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Scalar(_) => "scalar",
            Self::Tensor(_) => "tensor",
            Self::List(_) => "list",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorValue {
    pub dtype: DType,
    pub shape: Shape,
    pub elements: Vec<Literal>,
}

impl TensorValue {
    pub fn new(dtype: DType, shape: Shape, elements: Vec<Literal>) -> Result<Self, ValueError> {
        let expected_count = shape.element_count().ok_or(ValueError::ShapeOverflow {
            shape: shape.clone(),
        })?;

        if expected_count as usize != elements.len() {
            return Err(ValueError::ElementCountMismatch {
                shape,
                expected_count,
                actual_count: elements.len(),
            });
        }

        Ok(Self {
            dtype,
            shape,
            elements,
        })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.elements.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    #[must_use]
    pub fn rank(&self) -> usize {
        self.shape.rank()
    }

    pub fn to_f64_vec(&self) -> Option<Vec<f64>> {
        self.elements.iter().copied().map(Literal::as_f64).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValueError {
    ShapeOverflow {
        shape: Shape,
    },
    ElementCountMismatch {
        shape: Shape,
        expected_count: u64,
        actual_count: usize,
    },
    ElementKindMismatch {
        dtype: DType,
        detail: &'static str,
    },
}

impl std::fmt::Display for ValueError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ShapeOverflow { shape } => {
                write!(f, "shape element count overflowed: {:?}", shape.dims)
            }
            Self::ElementCountMismatch {
                shape,
                expected_count,
                actual_count,
            } => {
                write!(
                    f,
                    "tensor element count mismatch for shape {:?}: expected {}, got {}",
                    shape.dims, expected_count, actual_count
                )
            }
            Self::ElementKindMismatch { dtype, detail } => {
                write!(f, "element kind mismatch for {dtype}: {detail}")
            }
        }
    }
}

impl std::error::Error for ValueError {}
