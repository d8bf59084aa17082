//! Admin buildpack registry.
//!
//! Staging workers receive the full list of admin buildpacks with every
//! request, even when the app pinned a specific one, so a worker never
//! concludes a buildpack has disappeared. The registry also resolves a
//! worker-reported buildpack key back to the buildpack's guid when a
//! completion reply is committed.

use serde::Serialize;

use crate::blobstore::BlobstoreUrls;

/// An admin-curated buildpack.
#[derive(Debug, Clone)]
pub struct AdminBuildpack {
    pub guid: String,
    pub name: String,
    /// Blobstore key of the buildpack's bits.
    pub key: String,
    /// Detection order; lower runs first.
    pub position: u32,
    pub enabled: bool,
}

/// Wire entry for one admin buildpack in a staging request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BuildpackEntry {
    pub url: String,
    pub key: String,
}

/// Registry of admin buildpacks, ordered by detection position.
#[derive(Default)]
pub struct BuildpackRegistry {
    buildpacks: Vec<AdminBuildpack>,
}

impl BuildpackRegistry {
    pub fn new(mut buildpacks: Vec<AdminBuildpack>) -> Self {
        buildpacks.sort_by(|a, b| a.position.cmp(&b.position).then_with(|| a.name.cmp(&b.name)));
        Self { buildpacks }
    }

    pub fn find_by_name(&self, name: &str) -> Option<&AdminBuildpack> {
        self.buildpacks.iter().find(|b| b.name == name)
    }

    pub fn find_by_key(&self, key: &str) -> Option<&AdminBuildpack> {
        self.buildpacks.iter().find(|b| b.key == key)
    }

    /// Entries for the wire request: enabled buildpacks whose bits exist in
    /// the blobstore, in detection order.
    pub fn wire_entries(&self, urls: &dyn BlobstoreUrls) -> Vec<BuildpackEntry> {
        self.buildpacks
            .iter()
            .filter(|b| b.enabled)
            .filter_map(|b| {
                urls.buildpack_download_url(&b.key).map(|url| BuildpackEntry {
                    url,
                    key: b.key.clone(),
                })
            })
            .collect()
    }
}
