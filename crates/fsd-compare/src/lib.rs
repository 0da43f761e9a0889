#![forbid(unsafe_code)]

use fsd_core::{DType, DTypeFamily, EnvSnapshot, Literal, Shape, TensorValue, Value, vars};
use serde::{Deserialize, Serialize};
use tracing::debug;

pub const DEFAULT_HALF_TOLERANCE: f64 = 1e-3;
pub const DEFAULT_SINGLE_TOLERANCE: f64 = 1e-6;
pub const DEFAULT_DOUBLE_TOLERANCE: f64 = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ToleranceSpec {
    pub atol: f64,
    pub rtol: f64,
}

impl ToleranceSpec {
    #[must_use]
    pub fn uniform(tol: f64) -> Self {
        Self {
            atol: tol,
            rtol: tol,
        }
    }

    /// `|accelerated - baseline| <= atol + rtol * |baseline|`, with NaN matching
    /// NaN and infinities matching only themselves.
    #[must_use]
    pub fn accepts(&self, baseline: f64, accelerated: f64) -> bool {
        if baseline.is_nan() || accelerated.is_nan() {
            return baseline.is_nan() && accelerated.is_nan();
        }
        if baseline.is_infinite() || accelerated.is_infinite() {
            return baseline == accelerated;
        }
        let tolerance = self.atol + self.rtol * baseline.abs();
        (accelerated - baseline).abs() <= tolerance
    }
}

/// Per-precision float tolerances. Integer and bool families never consult it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TolerancePolicy {
    pub half: ToleranceSpec,
    pub single: ToleranceSpec,
    pub double: ToleranceSpec,
}

impl Default for TolerancePolicy {
    fn default() -> Self {
        Self {
            half: ToleranceSpec::uniform(DEFAULT_HALF_TOLERANCE),
            single: ToleranceSpec::uniform(DEFAULT_SINGLE_TOLERANCE),
            double: ToleranceSpec::uniform(DEFAULT_DOUBLE_TOLERANCE),
        }
    }
}

impl TolerancePolicy {
    /// Defaults overridden by `FLOAT16_TOLERANCE` / `FLOAT32_TOLERANCE` when they
    /// parse as floats. Malformed overrides are ignored.
    #[must_use]
    pub fn from_env(env: &EnvSnapshot) -> Self {
        let mut policy = Self::default();
        if let Some(tol) = env.float(vars::FLOAT16_TOLERANCE) {
            policy.half = ToleranceSpec::uniform(tol);
        }
        if let Some(tol) = env.float(vars::FLOAT32_TOLERANCE) {
            policy.single = ToleranceSpec::uniform(tol);
        }
        debug!(
            half = policy.half.atol,
            single = policy.single.atol,
            "tolerance policy resolved"
        );
        policy
    }

    /// Tolerance for a float dtype; `None` means the dtype is compared exactly.
    #[must_use]
    pub fn for_dtype(&self, dtype: DType) -> Option<ToleranceSpec> {
        match dtype {
            DType::F16 | DType::BF16 => Some(self.half),
            DType::F32 => Some(self.single),
            DType::F64 => Some(self.double),
            DType::I8 | DType::I16 | DType::I32 | DType::I64 | DType::U8 | DType::Bool => None,
        }
    }
}

/// Position of a compared value: top-level output index, then index inside a
/// nested list output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputPath {
    pub output: usize,
    pub item: Option<usize>,
}

impl std::fmt::Display for OutputPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.item {
            Some(item) => write!(f, "output[{}][{}]", self.output, item),
            None => write!(f, "output[{}]", self.output),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MismatchKind {
    OutputCount {
        baseline: usize,
        accelerated: usize,
    },
    ListLength {
        baseline: usize,
        accelerated: usize,
    },
    ValueKind {
        baseline: &'static str,
        accelerated: &'static str,
    },
    DType {
        baseline: DType,
        accelerated: DType,
    },
    Shape {
        baseline: Shape,
        accelerated: Shape,
    },
    Element {
        index: usize,
        baseline: Literal,
        accelerated: Literal,
        tolerance: Option<ToleranceSpec>,
        mismatched_elements: usize,
        total_elements: usize,
    },
    NotEqual,
}

/// First divergence between the two executions, carrying both operands.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Mismatch {
    pub path: Option<OutputPath>,
    pub kind: MismatchKind,
    pub baseline: String,
    pub accelerated: String,
}

impl std::fmt::Display for MismatchKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OutputCount {
                baseline,
                accelerated,
            } => write!(
                f,
                "output count differs: baseline {baseline}, accelerated {accelerated}"
            ),
            Self::ListLength {
                baseline,
                accelerated,
            } => write!(
                f,
                "list length differs: baseline {baseline}, accelerated {accelerated}"
            ),
            Self::ValueKind {
                baseline,
                accelerated,
            } => write!(
                f,
                "value kind differs: baseline {baseline}, accelerated {accelerated}"
            ),
            Self::DType {
                baseline,
                accelerated,
            } => write!(
                f,
                "dtype differs: baseline {baseline}, accelerated {accelerated}"
            ),
            Self::Shape {
                baseline,
                accelerated,
            } => write!(
                f,
                "shape differs: baseline {:?}, accelerated {:?}",
                baseline.dims, accelerated.dims
            ),
            Self::Element {
                index,
                baseline,
                accelerated,
                tolerance,
                mismatched_elements,
                total_elements,
            } => {
                write!(
                    f,
                    "element {index} differs: baseline {baseline}, accelerated {accelerated} \
                     ({mismatched_elements}/{total_elements} elements mismatched"
                )?;
                match tolerance {
                    Some(tol) => write!(f, ", atol={}, rtol={})", tol.atol, tol.rtol),
                    None => write!(f, ", exact comparison)"),
                }
            }
            Self::NotEqual => write!(f, "values are not equal"),
        }
    }
}

impl std::fmt::Display for Mismatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.path {
            Some(path) => write!(f, "{path}: {}", self.kind)?,
            None => write!(f, "{}", self.kind)?,
        }
        write!(
            f,
            "\n  baseline:    {}\n  accelerated: {}",
            self.baseline, self.accelerated
        )
    }
}

impl std::error::Error for Mismatch {}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComparisonSummary {
    pub outputs: usize,
    pub tensors: usize,
    pub elements: usize,
}

fn render<T: Serialize + ?Sized>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|err| format!("<unrenderable: {err}>"))
}

/// Compare every output of the baseline run against the accelerated run.
///
/// Top-level outputs are paired positionally; when both sides of a pair are
/// lists, their items are paired positionally as well. Deeper nesting is
/// compared by plain equality.
pub fn compare_outputs(
    baseline: &[Value],
    accelerated: &[Value],
    policy: &TolerancePolicy,
) -> Result<ComparisonSummary, Mismatch> {
    if baseline.len() != accelerated.len() {
        return Err(Mismatch {
            path: None,
            kind: MismatchKind::OutputCount {
                baseline: baseline.len(),
                accelerated: accelerated.len(),
            },
            baseline: render(baseline),
            accelerated: render(accelerated),
        });
    }

    let mut summary = ComparisonSummary {
        outputs: baseline.len(),
        ..ComparisonSummary::default()
    };

    for (output, (base, accel)) in baseline.iter().zip(accelerated).enumerate() {
        match (base, accel) {
            (Value::List(base_items), Value::List(accel_items)) => {
                if base_items.len() != accel_items.len() {
                    return Err(Mismatch {
                        path: Some(OutputPath { output, item: None }),
                        kind: MismatchKind::ListLength {
                            baseline: base_items.len(),
                            accelerated: accel_items.len(),
                        },
                        baseline: render(base),
                        accelerated: render(accel),
                    });
                }
                for (item, (base_item, accel_item)) in
                    base_items.iter().zip(accel_items).enumerate()
                {
                    let path = OutputPath {
                        output,
                        item: Some(item),
                    };
                    compare_leaf(base_item, accel_item, policy, path, &mut summary)?;
                }
            }
            _ => compare_leaf(
                base,
                accel,
                policy,
                OutputPath { output, item: None },
                &mut summary,
            )?,
        }
    }

    debug!(
        outputs = summary.outputs,
        tensors = summary.tensors,
        elements = summary.elements,
        "differential comparison passed"
    );
    Ok(summary)
}

/// Compare a single pair of values with the same rules as one output slot.
pub fn compare_values(
    baseline: &Value,
    accelerated: &Value,
    policy: &TolerancePolicy,
) -> Result<ComparisonSummary, Mismatch> {
    compare_outputs(
        std::slice::from_ref(baseline),
        std::slice::from_ref(accelerated),
        policy,
    )
}

fn compare_leaf(
    baseline: &Value,
    accelerated: &Value,
    policy: &TolerancePolicy,
    path: OutputPath,
    summary: &mut ComparisonSummary,
) -> Result<(), Mismatch> {
    let mismatch = |kind| Mismatch {
        path: Some(path),
        kind,
        baseline: render(baseline),
        accelerated: render(accelerated),
    };

    match (baseline, accelerated) {
        (Value::Tensor(base), Value::Tensor(accel)) => {
            compare_tensors(base, accel, policy).map_err(mismatch)?;
            summary.tensors += 1;
            summary.elements += base.len();
            Ok(())
        }
        (Value::Tensor(_), _) | (_, Value::Tensor(_)) => Err(mismatch(MismatchKind::ValueKind {
            baseline: baseline.kind_name(),
            accelerated: accelerated.kind_name(),
        })),
        (Value::Scalar(base), Value::Scalar(accel)) => {
            if base.value_eq(*accel) {
                Ok(())
            } else {
                Err(mismatch(MismatchKind::NotEqual))
            }
        }
        _ => {
            if baseline == accelerated {
                Ok(())
            } else {
                Err(mismatch(MismatchKind::NotEqual))
            }
        }
    }
}

fn compare_tensors(
    baseline: &TensorValue,
    accelerated: &TensorValue,
    policy: &TolerancePolicy,
) -> Result<(), MismatchKind> {
    if baseline.dtype != accelerated.dtype {
        return Err(MismatchKind::DType {
            baseline: baseline.dtype,
            accelerated: accelerated.dtype,
        });
    }
    if baseline.shape != accelerated.shape {
        return Err(MismatchKind::Shape {
            baseline: baseline.shape.clone(),
            accelerated: accelerated.shape.clone(),
        });
    }

    let tolerance = policy.for_dtype(baseline.dtype);
    let mut first_bad = None;
    let mut mismatched_elements = 0_usize;
    for (index, (base, accel)) in baseline
        .elements
        .iter()
        .zip(&accelerated.elements)
        .enumerate()
    {
        if !elements_match(baseline.dtype.family(), *base, *accel, tolerance) {
            mismatched_elements += 1;
            first_bad.get_or_insert((index, *base, *accel));
        }
    }

    match first_bad {
        None => Ok(()),
        Some((index, base, accel)) => Err(MismatchKind::Element {
            index,
            baseline: base,
            accelerated: accel,
            tolerance,
            mismatched_elements,
            total_elements: baseline.len(),
        }),
    }
}

fn elements_match(
    family: DTypeFamily,
    baseline: Literal,
    accelerated: Literal,
    tolerance: Option<ToleranceSpec>,
) -> bool {
    match (family, tolerance) {
        (DTypeFamily::Float, Some(tol)) => match (baseline.as_f64(), accelerated.as_f64()) {
            (Some(base), Some(accel)) => tol.accepts(base, accel),
            _ => false,
        },
        _ => baseline == accelerated,
    }
}
