//! Bounded replay of a traced while loop.
//!
//! The carried state holds the loop predicate in slot 0. The body maps the
//! state onto a state of the identical signature, so the predicate it leaves in
//! slot 0 decides whether another iteration runs.

use crate::{Block, BlockError, BlockId, FnBlock, Signature, SlotType, State};
use fsd_core::{EnvSnapshot, Value, vars};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

pub const DEFAULT_LOOP_CAP: usize = 128;

/// Iteration cap from `WHILE_LOOP_LIMIT`; absent or malformed values use the default.
#[must_use]
pub fn loop_cap_from_env(env: &EnvSnapshot) -> usize {
    env.unsigned(vars::WHILE_LOOP_LIMIT)
        .and_then(|cap| usize::try_from(cap).ok())
        .unwrap_or(DEFAULT_LOOP_CAP)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopPhase {
    Init,
    Running,
    Terminated,
    Capped,
}

impl LoopPhase {
    #[must_use]
    pub fn is_final(self) -> bool {
        matches!(self, Self::Terminated | Self::Capped)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoopState {
    pub carried: State,
    pub iterations: usize,
    pub cap: usize,
    pub phase: LoopPhase,
}

impl LoopState {
    #[must_use]
    pub fn new(carried: State, cap: usize) -> Self {
        Self {
            carried,
            iterations: 0,
            cap,
            phase: LoopPhase::Init,
        }
    }

    fn predicate(&self, block: &BlockId) -> Result<bool, BlockError> {
        self.carried
            .first()
            .and_then(Value::as_bool_scalar)
            .ok_or_else(|| BlockError::PredicateSlot {
                block: block.clone(),
                found: None,
            })
    }

    /// Advance one transition. Final phases are absorbing.
    pub fn step(&mut self, body: &FnBlock) -> Result<LoopPhase, BlockError> {
        if self.phase.is_final() {
            return Ok(self.phase);
        }
        if !self.predicate(body.id())? {
            self.phase = LoopPhase::Terminated;
        } else if self.iterations >= self.cap {
            self.phase = LoopPhase::Capped;
        } else {
            // A failing body leaves the carried state as it was.
            self.carried = body.apply(self.carried.clone())?;
            self.iterations += 1;
            self.phase = LoopPhase::Running;
        }
        Ok(self.phase)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoopOutcome {
    pub block: BlockId,
    pub state: State,
    pub iterations: usize,
    pub phase: LoopPhase,
    pub cap: usize,
}

impl LoopOutcome {
    #[must_use]
    pub fn capped(&self) -> bool {
        self.phase == LoopPhase::Capped
    }

    /// Final state, or an error if the loop stopped on the cap.
    pub fn expect_converged(self) -> Result<State, BlockError> {
        if self.capped() {
            return Err(BlockError::LoopCapped {
                block: self.block,
                cap: self.cap,
            });
        }
        Ok(self.state)
    }
}

#[derive(Debug)]
pub struct LoopBlock {
    body: FnBlock,
    cap: usize,
}

impl LoopBlock {
    pub fn new(body: FnBlock, cap: usize) -> Result<Self, BlockError> {
        if body.input_signature() != body.output_signature() {
            return Err(BlockError::LoopNotClosed {
                block: body.id().clone(),
                input: body.input_signature().clone(),
                output: body.output_signature().clone(),
            });
        }
        let first = body.input_signature().first().copied();
        if first != Some(SlotType::predicate()) {
            return Err(BlockError::PredicateSlot {
                block: body.id().clone(),
                found: first,
            });
        }
        Ok(Self { body, cap })
    }

    pub fn from_env(body: FnBlock, env: &EnvSnapshot) -> Result<Self, BlockError> {
        Self::new(body, loop_cap_from_env(env))
    }

    #[must_use]
    pub fn cap(&self) -> usize {
        self.cap
    }

    pub fn run(&self, init: State) -> Result<LoopOutcome, BlockError> {
        self.body
            .input_signature()
            .check(&init)
            .map_err(|violation| BlockError::Input {
                block: self.body.id().clone(),
                violation,
            })?;
        let mut state = LoopState::new(init, self.cap);
        while !state.step(&self.body)?.is_final() {}

        if state.phase == LoopPhase::Capped {
            warn!(
                block = %self.body.id(),
                cap = self.cap,
                "loop stopped on iteration cap"
            );
        } else {
            debug!(
                block = %self.body.id(),
                iterations = state.iterations,
                "loop terminated"
            );
        }
        Ok(LoopOutcome {
            block: self.body.id().clone(),
            state: state.carried,
            iterations: state.iterations,
            phase: state.phase,
            cap: self.cap,
        })
    }
}

impl Block for LoopBlock {
    fn id(&self) -> &BlockId {
        self.body.id()
    }

    fn input_signature(&self) -> &Signature {
        self.body.input_signature()
    }

    fn output_signature(&self) -> &Signature {
        self.body.output_signature()
    }

    /// Runs to a final phase. A capped loop still yields its last state; use
    /// [`LoopBlock::run`] to observe the phase.
    fn apply(&self, state: State) -> Result<State, BlockError> {
        self.run(state).map(|outcome| outcome.state)
    }
}
