use std::collections::VecDeque;
use std::path::Path;

use anyhow::{anyhow, Context, Result};

use crate::detect::backend::InferenceBackend;

/// One scripted inference cycle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReplayStep {
    Tensor(Vec<u8>),
    PreprocessingFailure,
    InferenceFailure,
}

/// Backend that replays recorded output tensors.
///
/// Used for offline runs against tensor dumps and for driving the pipeline in
/// tests, including scripted job failures.
#[derive(Debug, Default)]
pub struct ReplayBackend {
    steps: VecDeque<ReplayStep>,
    staged: Option<ReplayStep>,
    output: Vec<u8>,
}

impl ReplayBackend {
    pub fn new(steps: impl IntoIterator<Item = ReplayStep>) -> Self {
        Self {
            steps: steps.into_iter().collect(),
            staged: None,
            output: Vec::new(),
        }
    }

    pub fn from_tensors(tensors: impl IntoIterator<Item = Vec<u8>>) -> Self {
        Self::new(tensors.into_iter().map(ReplayStep::Tensor))
    }

    /// Load every `*.bin` file in `dir`, in file name order.
    pub fn from_dir<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref();
        let mut paths: Vec<_> = std::fs::read_dir(dir)
            .with_context(|| format!("failed to read tensor directory {}", dir.display()))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.extension().is_some_and(|ext| ext == "bin"))
            .collect();
        paths.sort();

        let mut tensors = Vec::with_capacity(paths.len());
        for path in paths {
            let bytes = std::fs::read(&path)
                .with_context(|| format!("failed to read tensor dump {}", path.display()))?;
            tensors.push(bytes);
        }
        Ok(Self::from_tensors(tensors))
    }

    pub fn push(&mut self, step: ReplayStep) {
        self.steps.push_back(step);
    }

    /// True once every scripted step has been consumed.
    pub fn is_exhausted(&self) -> bool {
        self.steps.is_empty() && self.staged.is_none()
    }

    pub fn remaining(&self) -> usize {
        self.steps.len()
    }
}

impl InferenceBackend for ReplayBackend {
    fn name(&self) -> &'static str {
        "replay"
    }

    fn run_preprocessing(&mut self) -> Result<()> {
        let step = self
            .steps
            .pop_front()
            .ok_or_else(|| anyhow!("replay exhausted"))?;
        if step == ReplayStep::PreprocessingFailure {
            return Err(anyhow!("scripted preprocessing failure"));
        }
        self.staged = Some(step);
        Ok(())
    }

    fn run_inference(&mut self) -> Result<()> {
        match self.staged.take() {
            Some(ReplayStep::Tensor(tensor)) => {
                self.output = tensor;
                Ok(())
            }
            Some(ReplayStep::InferenceFailure) => Err(anyhow!("scripted inference failure")),
            Some(ReplayStep::PreprocessingFailure) | None => {
                Err(anyhow!("inference requested without preprocessed input"))
            }
        }
    }

    fn output_tensor(&self) -> &[u8] {
        &self.output
    }
}
