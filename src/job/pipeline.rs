//! Inference capability handles.
//!
//! Model loading happens outside this crate; whatever loads the models hands
//! one `Generator` per (mode, safety checker) combination to `Pipelines`,
//! which the runner picks from per job.

use crate::job::codec::Image;
use crate::job::request::{GenerationMode, GenerationParams};
use std::sync::Arc;

/// Runs one inference call. May block for seconds; it is always called off the
/// async executor.
pub trait Generator: Send + Sync {
    fn generate(&self, params: &GenerationParams) -> anyhow::Result<Vec<Image>>;
}

impl<F> Generator for F
where
    F: Fn(&GenerationParams) -> anyhow::Result<Vec<Image>> + Send + Sync,
{
    fn generate(&self, params: &GenerationParams) -> anyhow::Result<Vec<Image>> {
        self(params)
    }
}

/// The checked and unchecked variant of one mode
#[derive(Clone)]
pub struct PipelinePair {
    pub checked: Arc<dyn Generator>,
    pub unchecked: Arc<dyn Generator>,
}

impl PipelinePair {
    pub fn new(checked: Arc<dyn Generator>, unchecked: Arc<dyn Generator>) -> Self {
        Self { checked, unchecked }
    }

    /// Same generator regardless of the safety toggle
    pub fn same(generator: Arc<dyn Generator>) -> Self {
        Self {
            checked: generator.clone(),
            unchecked: generator,
        }
    }
}

#[derive(Clone)]
pub struct Pipelines {
    txt2img: PipelinePair,
    img2img: PipelinePair,
    controlnet: PipelinePair,
}

impl Pipelines {
    pub fn new(txt2img: PipelinePair, img2img: PipelinePair, controlnet: PipelinePair) -> Self {
        Self {
            txt2img,
            img2img,
            controlnet,
        }
    }

    /// One generator serving every mode
    pub fn uniform(generator: Arc<dyn Generator>) -> Self {
        let pair = PipelinePair::same(generator);
        Self::new(pair.clone(), pair.clone(), pair)
    }

    pub fn select(&self, mode: GenerationMode, safety_checker: bool) -> Arc<dyn Generator> {
        let pair = match mode {
            GenerationMode::Txt2Img => &self.txt2img,
            GenerationMode::Img2Img => &self.img2img,
            GenerationMode::ControlNet => &self.controlnet,
        };
        if safety_checker {
            pair.checked.clone()
        } else {
            pair.unchecked.clone()
        }
    }

    pub fn for_params(&self, params: &GenerationParams) -> Arc<dyn Generator> {
        self.select(params.mode(), !params.disable_safety_checker)
    }
}
