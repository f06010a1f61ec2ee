//! Local image catalog answering candidate lookups

use std::sync::Arc;

use log::{debug, warn};
use ota_provider::{CandidateLookup, CandidateRequest, CandidateResult, CandidateSink, LookupError};
use serde::{Deserialize, Serialize};

/// One firmware image the provider can offer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogImage {
    pub vendor_id: u16,
    pub product_id: u16,
    pub software_version: u32,
    pub software_version_string: String,
    /// Where the BDX sender fetches the image from
    pub url: String,
    pub size: u64,
    /// Oldest running version that may install this image
    #[serde(default)]
    pub min_applicable_version: Option<u32>,
    #[serde(default)]
    pub max_applicable_version: Option<u32>,
}

impl CatalogImage {
    fn applies_to(&self, request: &CandidateRequest) -> bool {
        self.vendor_id == request.vendor_id
            && self.product_id == request.product_id
            && self.software_version > request.software_version
            && self.min_applicable_version.is_none_or(|min| request.software_version >= min)
            && self.max_applicable_version.is_none_or(|max| request.software_version <= max)
    }
}

/// Newest applicable image, if any
pub fn best_candidate(images: &[CatalogImage], request: &CandidateRequest) -> CandidateResult {
    images
        .iter()
        .filter(|image| image.applies_to(request))
        .max_by_key(|image| image.software_version)
        .map(|image| {
            CandidateResult::available(
                image.url.clone(),
                image.size,
                image.software_version,
                image.software_version_string.clone(),
            )
        })
        .unwrap_or_else(CandidateResult::not_available)
}

/// Answers each lookup from a spawned task, never inline
pub struct CatalogLookup {
    images: Arc<Vec<CatalogImage>>,
    sink: CandidateSink,
}

impl CatalogLookup {
    pub fn new(images: Vec<CatalogImage>, sink: CandidateSink) -> Self {
        Self { images: Arc::new(images), sink }
    }
}

impl CandidateLookup for CatalogLookup {
    fn fetch(&mut self, request: &CandidateRequest) -> Result<(), LookupError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|e| LookupError::Unavailable(e.to_string()))?;
        let images = self.images.clone();
        let sink = self.sink.clone();
        let request = *request;

        runtime.spawn(async move {
            let result = best_candidate(&images, &request);
            debug!(
                "catalog: 0x{:04X}/0x{:04X} v{} -> {}",
                request.vendor_id,
                request.product_id,
                request.software_version,
                result.status.as_str()
            );
            if let Err(e) = sink.deliver(result).await {
                warn!("catalog result not delivered: {e}");
            }
        });
        Ok(())
    }
}
