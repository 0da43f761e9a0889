#![forbid(unsafe_code)]

//! Ordered compilation stages.
//!
//! A stage is a named bundle of environment settings consumed by the compiler
//! under test. Stages are registered once, in order, and never mutated; the
//! harness only ever asks which stage is active and which stage precedes it.

use fsd_core::{EnvSnapshot, vars};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

/// A single stage configuration value. `Null` entries are never exported.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StageValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Null,
}

impl StageValue {
    /// Environment rendering, or `None` for null entries.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        match self {
            Self::Bool(value) => Some(if *value { "true" } else { "false" }.to_owned()),
            Self::Int(value) => Some(value.to_string()),
            Self::Float(value) => Some(value.to_string()),
            Self::Str(value) => Some(value.clone()),
            Self::Null => None,
        }
    }
}

impl From<bool> for StageValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for StageValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<&str> for StageValue {
    fn from(value: &str) -> Self {
        Self::Str(value.to_owned())
    }
}

impl<T: Into<StageValue>> From<Option<T>> for StageValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stage {
    name: String,
    config: BTreeMap<String, StageValue>,
}

impl Stage {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            config: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<StageValue>) -> Self {
        self.config.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn config(&self) -> &BTreeMap<String, StageValue> {
        &self.config
    }

    /// The stage's configuration as environment entries, null entries dropped.
    #[must_use]
    pub fn exported_env(&self) -> BTreeMap<String, String> {
        self.config
            .iter()
            .filter_map(|(key, value)| value.render().map(|rendered| (key.clone(), rendered)))
            .collect()
    }

    /// Environment seen while this stage is active: `parent` with the
    /// exported config layered on and `STAGE_NAME` pointing at this stage.
    #[must_use]
    pub fn active_env(&self, parent: &EnvSnapshot) -> EnvSnapshot {
        let mut env = parent.clone();
        for (key, value) in self.exported_env() {
            env.set(key, value);
        }
        env.set(vars::STAGE_NAME, self.name());
        env
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageError {
    EmptyPipeline,
    EmptyName { index: usize },
    DuplicateName { name: String },
    NotFound { name: String, known: Vec<String> },
}

impl std::fmt::Display for StageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyPipeline => write!(f, "stage pipeline must contain at least one stage"),
            Self::EmptyName { index } => write!(f, "stage at index {index} has an empty name"),
            Self::DuplicateName { name } => {
                write!(f, "stage `{name}` is registered more than once")
            }
            Self::NotFound { name, known } => {
                write!(
                    f,
                    "unknown stage `{name}`; {} should be one of [{}]",
                    vars::STAGE_NAME,
                    known.join(", ")
                )
            }
        }
    }
}

impl std::error::Error for StageError {}

/// Registration-ordered, immutable list of stages.
#[derive(Debug, Clone, PartialEq)]
pub struct StageSequence {
    stages: Vec<Stage>,
}

impl StageSequence {
    pub fn register(stages: Vec<Stage>) -> Result<Self, StageError> {
        if stages.is_empty() {
            return Err(StageError::EmptyPipeline);
        }
        for (index, stage) in stages.iter().enumerate() {
            if stage.name.trim().is_empty() {
                return Err(StageError::EmptyName { index });
            }
            if stages[..index].iter().any(|prior| prior.name == stage.name) {
                return Err(StageError::DuplicateName {
                    name: stage.name.clone(),
                });
            }
        }
        Ok(Self { stages })
    }

    pub fn by_name(&self, name: &str) -> Result<&Stage, StageError> {
        self.stages
            .iter()
            .find(|stage| stage.name == name)
            .ok_or_else(|| StageError::NotFound {
                name: name.to_owned(),
                known: self.names(),
            })
    }

    #[must_use]
    pub fn index_of(&self, stage: &Stage) -> Option<usize> {
        self.stages.iter().position(|candidate| candidate.name == stage.name)
    }

    /// The stage registered immediately before `stage`; `None` for the first
    /// stage or a stage that is not part of this sequence.
    #[must_use]
    pub fn previous(&self, stage: &Stage) -> Option<&Stage> {
        let index = self.index_of(stage)?;
        index.checked_sub(1).map(|prev| &self.stages[prev])
    }

    /// Resolve the active stage from `STAGE_NAME`. Unset means no stage; a set
    /// but unknown name is a configuration error.
    pub fn current(&self, env: &EnvSnapshot) -> Result<Option<&Stage>, StageError> {
        let Some(name) = env.get(vars::STAGE_NAME) else {
            debug!("no active stage");
            return Ok(None);
        };
        let stage = self.by_name(name)?;
        debug!(stage = stage.name(), "resolved active stage");
        Ok(Some(stage))
    }

    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.stages.iter().map(|stage| stage.name.clone()).collect()
    }

    #[must_use]
    pub fn first(&self) -> &Stage {
        &self.stages[0]
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Stage> {
        self.stages.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

impl<'a> IntoIterator for &'a StageSequence {
    type Item = &'a Stage;
    type IntoIter = std::slice::Iter<'a, Stage>;

    fn into_iter(self) -> Self::IntoIter {
        self.stages.iter()
    }
}

pub const ENABLE_ACCELERATION_COMPILER: &str = "ENABLE_ACCELERATION_COMPILER";
pub const ENABLE_PRIMITIVE_DECOMPOSITION: &str = "ENABLE_PRIMITIVE_DECOMPOSITION";
pub const ENABLE_DYNAMIC_DECOMPOSITION: &str = "ENABLE_DYNAMIC_DECOMPOSITION";
pub const USE_ACCELERATED_BACKEND: &str = "USE_ACCELERATED_BACKEND";
pub const CHECK_SYMBOLIC_SHAPE_INFERENCE: &str = "CHECK_SYMBOLIC_SHAPE_INFERENCE";
pub const ENABLE_FUSION_FALLBACK: &str = "ENABLE_FUSION_FALLBACK";

/// The standard five-step pipeline, from plain static-graph conversion up to
/// full backend code generation without fusion fallback.
#[must_use]
pub fn default_stages() -> Vec<Stage> {
    vec![
        Stage::new("dynamic_to_static")
            .with(ENABLE_ACCELERATION_COMPILER, false)
            .with(ENABLE_PRIMITIVE_DECOMPOSITION, false)
            .with(ENABLE_DYNAMIC_DECOMPOSITION, false),
        Stage::new("prim")
            .with(ENABLE_ACCELERATION_COMPILER, false)
            .with(ENABLE_PRIMITIVE_DECOMPOSITION, true)
            .with(ENABLE_DYNAMIC_DECOMPOSITION, true),
        Stage::new("infer_symbolic")
            .with(ENABLE_ACCELERATION_COMPILER, false)
            .with(ENABLE_PRIMITIVE_DECOMPOSITION, true)
            .with(ENABLE_DYNAMIC_DECOMPOSITION, true)
            .with(USE_ACCELERATED_BACKEND, false)
            .with(CHECK_SYMBOLIC_SHAPE_INFERENCE, true),
        Stage::new("frontend")
            .with(ENABLE_ACCELERATION_COMPILER, true)
            .with(ENABLE_PRIMITIVE_DECOMPOSITION, true)
            .with(ENABLE_DYNAMIC_DECOMPOSITION, true)
            .with(USE_ACCELERATED_BACKEND, true)
            .with(CHECK_SYMBOLIC_SHAPE_INFERENCE, false)
            .with(ENABLE_FUSION_FALLBACK, true),
        Stage::new("backend")
            .with(ENABLE_ACCELERATION_COMPILER, true)
            .with(ENABLE_PRIMITIVE_DECOMPOSITION, true)
            .with(ENABLE_DYNAMIC_DECOMPOSITION, true)
            .with(USE_ACCELERATED_BACKEND, true)
            .with(CHECK_SYMBOLIC_SHAPE_INFERENCE, false)
            .with(ENABLE_FUSION_FALLBACK, false),
    ]
}

#[must_use]
pub fn default_pipeline() -> StageSequence {
    StageSequence {
        stages: default_stages(),
    }
}
