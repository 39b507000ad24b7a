pub mod canny;
pub mod device_map;
pub mod loader;
mod util;

mod sd;

pub use canny::CannyDetector;
pub use device_map::*;
use image::DynamicImage;
pub use loader::*;
pub use sd::{
    SdControlNetLoader, SdControlNetModel, AVATAR_PROMPT, BASE_MODEL_ID, CONTROLNET_MODEL_ID,
    NEGATIVE_PROMPT,
};
use serde::{Deserialize, Serialize};
pub(crate) use util::*;

// Define the request parameters accepted alongside an uploaded image.
#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
pub struct GenerationParams {
    pub prompt: Option<String>,
    pub steps: Option<usize>,
    pub guidance: Option<f64>,
    pub seed: Option<u64>,
}

/// A loaded pipeline that turns an edge map and parameters into an image.
pub trait ModelLike: Send + Sync {
    fn run(&self, control_image: &DynamicImage, params: &GenerationParams)
        -> anyhow::Result<DynamicImage>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn params_default_when_absent() {
        let params: GenerationParams = serde_json::from_str("{}").unwrap();
        assert_eq!(params, GenerationParams::default());
    }

    #[test]
    fn params_accept_partial_overrides() {
        let params: GenerationParams =
            serde_json::from_str(r#"{"prompt": "watercolor portrait", "seed": 7}"#).unwrap();
        assert_eq!(params.prompt.as_deref(), Some("watercolor portrait"));
        assert_eq!(params.seed, Some(7));
        assert_eq!(params.steps, None);
    }
}
