#![forbid(unsafe_code)]

//! Traced control flow as fixed-signature state transitions.
//!
//! Every block maps an ordered tuple of values to another ordered tuple. The
//! tuple's arity and per-position types are declared up front and checked when
//! the block is built, so a loop body or a branch pair that disagrees with its
//! own declaration is rejected before anything executes.

pub mod cond;
pub mod while_loop;

pub use cond::CondBlock;
pub use while_loop::{
    DEFAULT_LOOP_CAP, LoopBlock, LoopOutcome, LoopPhase, LoopState, loop_cap_from_env,
};

use fsd_core::{DType, Value};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

/// Carried state threaded into and out of a block.
pub type State = Vec<Value>;

/// Body of a block. Errors come from the compute engine and are opaque here.
pub type BodyFn = dyn Fn(&[Value]) -> Result<State, String> + Send + Sync;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockId(pub String);

impl BlockId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for BlockId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Declared type of one state position. `rank: None` accepts any rank, which
/// is how dynamically shaped traced values are declared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SlotType {
    pub dtype: DType,
    pub rank: Option<usize>,
}

impl SlotType {
    #[must_use]
    pub fn scalar(dtype: DType) -> Self {
        Self {
            dtype,
            rank: Some(0),
        }
    }

    #[must_use]
    pub fn ranked(dtype: DType, rank: usize) -> Self {
        Self {
            dtype,
            rank: Some(rank),
        }
    }

    #[must_use]
    pub fn any_rank(dtype: DType) -> Self {
        Self { dtype, rank: None }
    }

    #[must_use]
    pub fn predicate() -> Self {
        Self::scalar(DType::Bool)
    }

    #[must_use]
    pub fn accepts(&self, value: &Value) -> bool {
        let dtype_ok = value.dtype() == Some(self.dtype);
        let rank_ok = match self.rank {
            Some(rank) => value.rank() == Some(rank),
            None => value.rank().is_some(),
        };
        dtype_ok && rank_ok
    }
}

impl std::fmt::Display for SlotType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.rank {
            Some(rank) => write!(f, "{}[rank {}]", self.dtype, rank),
            None => write!(f, "{}[any rank]", self.dtype),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Signature {
    slots: SmallVec<[SlotType; 4]>,
}

impl Signature {
    #[must_use]
    pub fn new(slots: &[SlotType]) -> Self {
        Self {
            slots: SmallVec::from_slice(slots),
        }
    }

    #[must_use]
    pub fn arity(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub fn slots(&self) -> &[SlotType] {
        &self.slots
    }

    #[must_use]
    pub fn first(&self) -> Option<&SlotType> {
        self.slots.first()
    }

    /// Signature with `slot` prepended.
    #[must_use]
    pub fn prepend(&self, slot: SlotType) -> Self {
        let mut slots = SmallVec::with_capacity(self.slots.len() + 1);
        slots.push(slot);
        slots.extend_from_slice(&self.slots);
        Self { slots }
    }

    pub fn check(&self, state: &[Value]) -> Result<(), SignatureViolation> {
        if state.len() != self.slots.len() {
            return Err(SignatureViolation::Arity {
                expected: self.slots.len(),
                actual: state.len(),
            });
        }
        for (index, (slot, value)) in self.slots.iter().zip(state).enumerate() {
            if !slot.accepts(value) {
                return Err(SignatureViolation::Slot {
                    index,
                    expected: *slot,
                    actual_dtype: value.dtype(),
                    actual_rank: value.rank(),
                });
            }
        }
        Ok(())
    }
}

impl std::fmt::Display for Signature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("(")?;
        for (index, slot) in self.slots.iter().enumerate() {
            if index > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{slot}")?;
        }
        f.write_str(")")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignatureViolation {
    Arity {
        expected: usize,
        actual: usize,
    },
    Slot {
        index: usize,
        expected: SlotType,
        actual_dtype: Option<DType>,
        actual_rank: Option<usize>,
    },
}

impl std::fmt::Display for SignatureViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Arity { expected, actual } => {
                write!(f, "arity mismatch: expected {expected}, got {actual}")
            }
            Self::Slot {
                index,
                expected,
                actual_dtype,
                actual_rank,
            } => {
                write!(f, "slot {index} expected {expected}, got ")?;
                match (actual_dtype, actual_rank) {
                    (Some(dtype), Some(rank)) => write!(f, "{dtype}[rank {rank}]"),
                    _ => write!(f, "a list"),
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BranchSide {
    Inputs,
    Outputs,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockError {
    LoopNotClosed {
        block: BlockId,
        input: Signature,
        output: Signature,
    },
    PredicateSlot {
        block: BlockId,
        found: Option<SlotType>,
    },
    BranchMismatch {
        block: BlockId,
        side: BranchSide,
        then_branch: Signature,
        else_branch: Signature,
    },
    Input {
        block: BlockId,
        violation: SignatureViolation,
    },
    Output {
        block: BlockId,
        violation: SignatureViolation,
    },
    Body {
        block: BlockId,
        detail: String,
    },
    LoopCapped {
        block: BlockId,
        cap: usize,
    },
}

impl std::fmt::Display for BlockError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LoopNotClosed {
                block,
                input,
                output,
            } => write!(
                f,
                "loop `{block}` body must map its carried state onto itself: \
                 inputs {input}, outputs {output}"
            ),
            Self::PredicateSlot { block, found } => match found {
                Some(slot) => write!(
                    f,
                    "loop `{block}` slot 0 must be a bool scalar predicate, found {slot}"
                ),
                None => write!(f, "loop `{block}` carries no predicate slot"),
            },
            Self::BranchMismatch {
                block,
                side,
                then_branch,
                else_branch,
            } => {
                let side = match side {
                    BranchSide::Inputs => "input",
                    BranchSide::Outputs => "output",
                };
                write!(
                    f,
                    "conditional `{block}` branches disagree on {side} signature: \
                     then {then_branch}, else {else_branch}"
                )
            }
            Self::Input { block, violation } => {
                write!(f, "block `{block}` received invalid state: {violation}")
            }
            Self::Output { block, violation } => {
                write!(f, "block `{block}` produced invalid state: {violation}")
            }
            Self::Body { block, detail } => write!(f, "block `{block}` body failed: {detail}"),
            Self::LoopCapped { block, cap } => {
                write!(f, "loop `{block}` did not converge within {cap} iterations")
            }
        }
    }
}

impl std::error::Error for BlockError {}

/// A pure state transition with a declared signature.
pub trait Block {
    fn id(&self) -> &BlockId;

    fn input_signature(&self) -> &Signature;

    fn output_signature(&self) -> &Signature;

    fn apply(&self, state: State) -> Result<State, BlockError>;
}

/// Leaf block wrapping a traced body function.
pub struct FnBlock {
    id: BlockId,
    input: Signature,
    output: Signature,
    body: Box<BodyFn>,
}

impl std::fmt::Debug for FnBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnBlock")
            .field("id", &self.id)
            .field("input", &self.input)
            .field("output", &self.output)
            .finish_non_exhaustive()
    }
}

impl FnBlock {
    pub fn new<F>(id: impl Into<String>, input: Signature, output: Signature, body: F) -> Self
    where
        F: Fn(&[Value]) -> Result<State, String> + Send + Sync + 'static,
    {
        Self {
            id: BlockId::new(id),
            input,
            output,
            body: Box::new(body),
        }
    }
}

impl Block for FnBlock {
    fn id(&self) -> &BlockId {
        &self.id
    }

    fn input_signature(&self) -> &Signature {
        &self.input
    }

    fn output_signature(&self) -> &Signature {
        &self.output
    }

    fn apply(&self, state: State) -> Result<State, BlockError> {
        self.input
            .check(&state)
            .map_err(|violation| BlockError::Input {
                block: self.id.clone(),
                violation,
            })?;
        let next = (self.body)(&state).map_err(|detail| BlockError::Body {
            block: self.id.clone(),
            detail,
        })?;
        self.output
            .check(&next)
            .map_err(|violation| BlockError::Output {
                block: self.id.clone(),
                violation,
            })?;
        Ok(next)
    }
}
