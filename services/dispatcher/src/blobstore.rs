//! Blobstore URL generation seam.
//!
//! URL generation itself belongs to the surrounding system; the scheduler
//! only needs locators to embed in dispatch messages. Any of them may be
//! absent (bits not yet uploaded), and the codec passes that absence
//! through rather than inventing URLs.

use std::collections::BTreeSet;

/// Source of download/upload locators for packages, droplets, and buildpacks.
pub trait BlobstoreUrls: Send + Sync {
    /// Where a staging worker downloads the app package from.
    fn app_package_download_url(&self, app_guid: &str) -> Option<String>;

    /// Where a staging worker uploads the finished droplet to.
    fn droplet_upload_url(&self, app_guid: &str) -> Option<String>;

    /// Buildpack-cache locators for incremental staging.
    fn buildpack_cache_download_url(&self, app_guid: &str) -> Option<String>;
    fn buildpack_cache_upload_url(&self, app_guid: &str) -> Option<String>;

    /// Download locator for an admin buildpack's bits. `None` when the bits
    /// are missing from the blobstore.
    fn buildpack_download_url(&self, key: &str) -> Option<String>;

    /// Long-lived droplet download locator for the declarative backend.
    fn perma_droplet_download_url(&self, app_guid: &str) -> Option<String>;
}

/// Template-based implementation for tests and single-process deployments.
pub struct StaticBlobstore {
    base_url: String,
    buildpack_keys: BTreeSet<String>,
}

impl StaticBlobstore {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            buildpack_keys: BTreeSet::new(),
        }
    }

    /// Declare an admin buildpack key as having bits in the store.
    pub fn with_buildpack_key(mut self, key: impl Into<String>) -> Self {
        self.buildpack_keys.insert(key.into());
        self
    }
}

impl BlobstoreUrls for StaticBlobstore {
    fn app_package_download_url(&self, app_guid: &str) -> Option<String> {
        Some(format!("{}/packages/{}", self.base_url, app_guid))
    }

    fn droplet_upload_url(&self, app_guid: &str) -> Option<String> {
        Some(format!("{}/droplets/{}/upload", self.base_url, app_guid))
    }

    fn buildpack_cache_download_url(&self, app_guid: &str) -> Option<String> {
        Some(format!("{}/buildpack_cache/{}", self.base_url, app_guid))
    }

    fn buildpack_cache_upload_url(&self, app_guid: &str) -> Option<String> {
        Some(format!("{}/buildpack_cache/{}/upload", self.base_url, app_guid))
    }

    fn buildpack_download_url(&self, key: &str) -> Option<String> {
        if self.buildpack_keys.contains(key) {
            Some(format!("{}/buildpacks/{}", self.base_url, key))
        } else {
            None
        }
    }

    fn perma_droplet_download_url(&self, app_guid: &str) -> Option<String> {
        Some(format!("{}/droplets/{}/download", self.base_url, app_guid))
    }
}
