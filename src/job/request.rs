//! Job submissions received on the data channel.

use crate::job::codec::{data_uri_bytes, encoded_dimensions};
use rand::Rng;
use serde::{Deserialize, Deserializer};
use serde_json::{Map, Value};
use thiserror::Error;

pub const DEFAULT_PROMPT: &str =
    "Self-portrait oil painting, a beautiful cyborg with golden hair, 8k";

/// Upper bound on `prompts x num_images` for one job
pub const MAX_IMAGES_PER_JOB: usize = 50;
pub const MAX_DIMENSION: u32 = 1024;

// grid that sizes taken from an input image are snapped to
const SNAP_MIN: u32 = 512;
const SNAP_MAX: u32 = 1024;
const SNAP_STEP: usize = 64;
const SNAP_OPTIMUM: u32 = 768;

#[derive(Debug, Error)]
pub enum RequestError {
    #[error("not a JSON object: {0}")]
    NotAnObject(serde_json::Error),

    #[error("invalid job parameters: {0}")]
    Params(serde_json::Error),

    #[error("job asks for {requested} images, at most {max} are allowed")]
    TooManyImages { requested: usize, max: usize },

    #[error("{field} = {value} is outside {min}..={max}")]
    OutOfRange {
        field: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub enum SizingStrategy {
    #[default]
    #[serde(rename = "width/height")]
    WidthHeight,
    #[serde(rename = "input_image")]
    InputImage,
    #[serde(rename = "control_image")]
    ControlImage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationMode {
    Txt2Img,
    Img2Img,
    ControlNet,
}

/// Arguments for one inference call. Missing fields take the service defaults.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GenerationParams {
    /// One prompt per non-empty line
    pub prompt: String,
    pub width: u32,
    pub height: u32,
    pub sizing_strategy: SizingStrategy,
    /// Input image for img2img, as sent by the client (URL or data URI)
    pub image: Option<String>,
    pub prompt_strength: f32,
    pub num_images: u32,
    pub num_inference_steps: u32,
    pub guidance_scale: f32,
    pub lcm_origin_steps: u32,
    #[serde(deserialize_with = "seed_from_any")]
    pub seed: Option<u64>,
    /// Controlnet conditioning image, as sent by the client
    pub control_image: Option<String>,
    pub controlnet_conditioning_scale: f32,
    pub control_guidance_start: f32,
    pub control_guidance_end: f32,
    pub canny_low_threshold: f32,
    pub canny_high_threshold: f32,
    pub disable_safety_checker: bool,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            prompt: DEFAULT_PROMPT.to_string(),
            width: 768,
            height: 768,
            sizing_strategy: SizingStrategy::WidthHeight,
            image: None,
            prompt_strength: 0.8,
            num_images: 1,
            num_inference_steps: 8,
            guidance_scale: 8.0,
            lcm_origin_steps: 50,
            seed: None,
            control_image: None,
            controlnet_conditioning_scale: 2.0,
            control_guidance_start: 0.0,
            control_guidance_end: 1.0,
            canny_low_threshold: 100.0,
            canny_high_threshold: 200.0,
            disable_safety_checker: false,
        }
    }
}

/// Browsers send the seed straight from a text input, so `"42"` and `""` show up.
fn seed_from_any<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;

    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_u64()
            .map(Some)
            .ok_or_else(|| D::Error::custom(format!("seed must be a non-negative integer, got {n}"))),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(Value::String(s)) => s
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| D::Error::custom(format!("seed must be numeric, got {s:?}"))),
        Some(other) => Err(D::Error::custom(format!("invalid seed {other}"))),
    }
}

fn check_range(field: &'static str, value: f64, min: f64, max: f64) -> Result<(), RequestError> {
    if value.is_nan() || value < min || value > max {
        return Err(RequestError::OutOfRange {
            field,
            value,
            min,
            max,
        });
    }
    Ok(())
}

impl GenerationParams {
    pub fn validate(&self) -> Result<(), RequestError> {
        check_range("width", self.width.into(), 1.0, MAX_DIMENSION.into())?;
        check_range("height", self.height.into(), 1.0, MAX_DIMENSION.into())?;
        check_range("prompt_strength", self.prompt_strength.into(), 0.0, 1.0)?;
        check_range("num_images", self.num_images.into(), 1.0, 50.0)?;
        check_range("num_inference_steps", self.num_inference_steps.into(), 1.0, 50.0)?;
        check_range("guidance_scale", self.guidance_scale.into(), 1.0, 20.0)?;
        check_range("lcm_origin_steps", self.lcm_origin_steps.into(), 1.0, f64::MAX)?;
        check_range(
            "controlnet_conditioning_scale",
            self.controlnet_conditioning_scale.into(),
            0.1,
            4.0,
        )?;
        check_range("control_guidance_start", self.control_guidance_start.into(), 0.0, 1.0)?;
        check_range("control_guidance_end", self.control_guidance_end.into(), 0.0, 1.0)?;
        check_range("canny_low_threshold", self.canny_low_threshold.into(), 1.0, 255.0)?;
        check_range("canny_high_threshold", self.canny_high_threshold.into(), 1.0, 255.0)?;

        let requested = self.expected_images();
        if requested > MAX_IMAGES_PER_JOB {
            return Err(RequestError::TooManyImages {
                requested,
                max: MAX_IMAGES_PER_JOB,
            });
        }
        Ok(())
    }

    /// Sets `width`/`height` from the image named by `sizing_strategy`, snapped
    /// to the supported grid. Only inline `data:` images can be measured here;
    /// for anything else the requested size stands.
    pub fn apply_sizing_strategy(&mut self) {
        let source = match self.sizing_strategy {
            SizingStrategy::WidthHeight => return,
            SizingStrategy::InputImage => self.image.as_deref(),
            SizingStrategy::ControlImage => self.control_image.as_deref(),
        };
        let measured = source
            .and_then(data_uri_bytes)
            .and_then(|bytes| encoded_dimensions(&bytes).ok());
        if let Some((width, height)) = measured {
            (self.width, self.height) = resized_dimensions(width, height);
        }
    }

    pub fn prompts(&self) -> Vec<&str> {
        let prompts: Vec<&str> = self
            .prompt
            .lines()
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .collect();
        if prompts.is_empty() {
            vec![DEFAULT_PROMPT]
        } else {
            prompts
        }
    }

    /// Number of images a well-behaved generator returns for these params
    pub fn expected_images(&self) -> usize {
        self.prompts().len() * self.num_images as usize
    }

    pub fn mode(&self) -> GenerationMode {
        if self.control_image.is_some() {
            GenerationMode::ControlNet
        } else if self.image.is_some() {
            GenerationMode::Img2Img
        } else {
            GenerationMode::Txt2Img
        }
    }
}

/// Picks the grid size closest in aspect ratio to `width x height`, preferring
/// widths near 768.
pub fn resized_dimensions(width: u32, height: u32) -> (u32, u32) {
    let aspect = f64::from(width) / f64::from(height.max(1));
    let grid = || (SNAP_MIN..=SNAP_MAX).step_by(SNAP_STEP);

    let mut best = (SNAP_OPTIMUM, SNAP_OPTIMUM);
    let mut best_score = f64::INFINITY;
    for w in grid() {
        for h in grid() {
            let score = (f64::from(w) / f64::from(h) - aspect).abs()
                + (f64::from(w) - f64::from(SNAP_OPTIMUM)).abs();
            if score < best_score {
                best_score = score;
                best = (w, h);
            }
        }
    }
    best
}

/// One job: the client's correlation id plus validated parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRequest {
    /// Echoed verbatim in every result; 0 when the client sent none
    pub id: Value,
    pub params: GenerationParams,
}

impl JobRequest {
    /// Parses and validates one channel payload. A missing seed is drawn here so
    /// the value a job ran with is known before it runs.
    pub fn parse(data: &[u8]) -> Result<Self, RequestError> {
        let mut fields: Map<String, Value> =
            serde_json::from_slice(data).map_err(RequestError::NotAnObject)?;
        let id = fields.remove("id").unwrap_or_else(|| Value::from(0));

        let mut params: GenerationParams =
            serde_json::from_value(Value::Object(fields)).map_err(RequestError::Params)?;
        params.validate()?;
        params.apply_sizing_strategy();
        if params.seed.is_none() {
            params.seed = Some(rand::rng().random::<u16>().into());
        }

        Ok(Self { id, params })
    }
}
