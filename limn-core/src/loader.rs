use std::future::Future;

use anyhow::Result;
use hf_hub::api::tokio::Api;

use crate::{DeviceMap, ModelLike};

/// Fetches pretrained weights and assembles a ready-to-serve pipeline.
///
/// Loading runs once at process startup; a failure here is fatal and must
/// propagate to `main` rather than be retried.
pub trait Loader {
    type Model: ModelLike;

    fn load(api: Api, device_map: DeviceMap) -> impl Future<Output = Result<Self::Model>>
    where
        Self: Sized;
}
