use crate::job::codec::Image;
use crate::job::pipeline::Generator;
use crate::job::request::GenerationParams;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Stand-in backend: seeded horizontal colour bands per requested image.
///
/// Lets the service run end to end without a model. Same seed and prompt give
/// the same pixels, so it also behaves like a real pipeline in tests. Every row
/// is a single colour, so frames compress to a few kilobytes in any format.
#[derive(Debug, Default, Clone, Copy)]
pub struct PreviewGenerator;

const BANDS: u32 = 8;

fn prompt_hash(prompt: &str) -> u64 {
    // FNV-1a
    prompt.bytes().fold(0xcbf29ce484222325, |h, b| {
        (h ^ b as u64).wrapping_mul(0x100000001b3)
    })
}

fn banded(width: u32, height: u32, rng: &mut StdRng) -> anyhow::Result<Image> {
    let from: [u8; 3] = rng.random();
    let to: [u8; 3] = rng.random();
    let mut rgb = Vec::with_capacity(width as usize * height as usize * 3);

    for y in 0..height {
        let band = (y * BANDS / height) as f32;
        let t = band / (BANDS - 1) as f32;
        let px: Vec<u8> = (0..3)
            .map(|c| (from[c] as f32 + (to[c] as f32 - from[c] as f32) * t).round() as u8)
            .collect();
        for _ in 0..width {
            rgb.extend_from_slice(&px);
        }
    }
    Image::new(width, height, rgb)
}

impl Generator for PreviewGenerator {
    fn generate(&self, params: &GenerationParams) -> anyhow::Result<Vec<Image>> {
        let seed = params.seed.unwrap_or_default();
        let mut images = Vec::with_capacity(params.expected_images());

        for prompt in params.prompts() {
            let mut rng = StdRng::seed_from_u64(seed ^ prompt_hash(prompt));
            for _ in 0..params.num_images {
                images.push(banded(params.width, params.height, &mut rng)?);
            }
        }
        Ok(images)
    }
}
