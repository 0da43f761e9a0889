use crate::{Block, BlockError, BlockId, BranchSide, FnBlock, Signature, SlotType, State};
use fsd_core::Value;
use tracing::trace;

/// Two-way conditional over a shared operand tuple.
///
/// Both branches receive the same operands and must agree on input and output
/// signatures. Through [`Block::apply`] the gate travels as a bool scalar in
/// slot 0 ahead of the operands.
#[derive(Debug)]
pub struct CondBlock {
    id: BlockId,
    then_branch: FnBlock,
    else_branch: FnBlock,
    input: Signature,
}

impl CondBlock {
    pub fn new(
        id: impl Into<String>,
        then_branch: FnBlock,
        else_branch: FnBlock,
    ) -> Result<Self, BlockError> {
        let id = BlockId::new(id);
        if then_branch.input_signature() != else_branch.input_signature() {
            return Err(BlockError::BranchMismatch {
                block: id,
                side: BranchSide::Inputs,
                then_branch: then_branch.input_signature().clone(),
                else_branch: else_branch.input_signature().clone(),
            });
        }
        if then_branch.output_signature() != else_branch.output_signature() {
            return Err(BlockError::BranchMismatch {
                block: id,
                side: BranchSide::Outputs,
                then_branch: then_branch.output_signature().clone(),
                else_branch: else_branch.output_signature().clone(),
            });
        }
        let input = then_branch
            .input_signature()
            .prepend(SlotType::predicate());
        Ok(Self {
            id,
            then_branch,
            else_branch,
            input,
        })
    }

    /// Operand signature shared by both branches, without the gate.
    #[must_use]
    pub fn operand_signature(&self) -> &Signature {
        self.then_branch.input_signature()
    }

    pub fn select(&self, gate: bool, operands: State) -> Result<State, BlockError> {
        let branch = if gate {
            &self.then_branch
        } else {
            &self.else_branch
        };
        trace!(block = %self.id, gate, branch = %branch.id(), "conditional selected");
        branch.apply(operands)
    }
}

impl Block for CondBlock {
    fn id(&self) -> &BlockId {
        &self.id
    }

    fn input_signature(&self) -> &Signature {
        &self.input
    }

    fn output_signature(&self) -> &Signature {
        self.then_branch.output_signature()
    }

    fn apply(&self, state: State) -> Result<State, BlockError> {
        self.input
            .check(&state)
            .map_err(|violation| BlockError::Input {
                block: self.id.clone(),
                violation,
            })?;
        let mut operands = state;
        let gate = operands.remove(0);
        let gate = gate
            .as_bool_scalar()
            .ok_or_else(|| BlockError::PredicateSlot {
                block: self.id.clone(),
                found: None,
            })?;
        self.select(gate, operands)
    }
}
