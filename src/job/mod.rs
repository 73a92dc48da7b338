pub mod codec;
pub mod pipeline;
pub mod preview;
pub mod request;
pub mod runner;

pub use codec::{FormatEncoder, Image, ImageEncoder, ImageFormat, OutputMode};
pub use pipeline::{Generator, PipelinePair, Pipelines};
pub use preview::PreviewGenerator;
pub use request::{GenerationMode, GenerationParams, JobRequest, RequestError};
pub use runner::{JobResult, JobRunner};
