//! Client for the declarative placement backend.
//!
//! Instead of picking a worker itself, the dispatcher hands the backend a
//! desired-state descriptor and lets it converge the fleet. Desired state
//! goes out over the bus; instance status comes back over HTTP from
//! whichever backend address the registry currently knows about. Every
//! transport or decode failure on the query path collapses to
//! `BackendUnavailable`; callers cannot do anything more granular than
//! retry or degrade.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use stagehand_bus::{BusError, MessageBus};
use stagehand_id::TaskToken;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::app::AppHandle;
use crate::blobstore::BlobstoreUrls;
use crate::buildpacks::BuildpackRegistry;
use crate::codec::{self, StagingDefaults};
use crate::config::Config;
use crate::staging::staging_resources;

/// Subject the backend consumes desired-state descriptors on.
pub const DESIRE_SUBJECT: &str = "placement.desire.app";

/// Subject the backend consumes staging jobs on.
pub const PLACEMENT_STAGING_SUBJECT: &str = "placement.staging.start";

const QUERY_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum PlacementError {
    /// No backend address is known, or the backend could not be reached or
    /// did not answer sensibly.
    #[error("placement backend unavailable")]
    BackendUnavailable,

    #[error(transparent)]
    Bus(#[from] BusError),
}

/// Addresses of the placement backend, refreshed by service discovery.
pub struct ServiceRegistry {
    addrs: Mutex<Vec<String>>,
}

impl ServiceRegistry {
    pub fn new(seed: Vec<String>) -> Self {
        Self {
            addrs: Mutex::new(seed),
        }
    }

    pub fn addrs(&self) -> Vec<String> {
        self.addrs.lock().expect("registry lock poisoned").clone()
    }

    /// Replace the known addresses with a fresh discovery result.
    pub fn set_addrs(&self, addrs: Vec<String>) {
        *self.addrs.lock().expect("registry lock poisoned") = addrs;
    }
}

/// Desired state for one app, as the backend consumes it.
#[derive(Debug, Clone, Serialize)]
pub struct DesiredPlacementDescriptor {
    pub process_guid: String,
    pub memory_mb: u64,
    pub disk_mb: u64,
    pub file_descriptors: u32,
    pub droplet_uri: Option<String>,
    pub stack: String,
    pub start_command: String,
    pub environment: Vec<String>,
    pub num_instances: u32,
    pub routes: Vec<String>,
    pub log_guid: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health_check_timeout_in_seconds: Option<u32>,
}

/// One running instance, as reported back to callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceStatus {
    pub process_guid: String,
    pub instance_guid: String,
    pub index: u32,
    /// Uppercased lifecycle state, e.g. `RUNNING`.
    pub state: String,
    /// Whole seconds since the instance entered its state.
    pub since: i64,
}

#[derive(Debug, Deserialize)]
struct InstanceStatusWire {
    process_guid: String,
    instance_guid: String,
    index: u32,
    state: String,
    since_in_ns: i64,
}

impl From<InstanceStatusWire> for InstanceStatus {
    fn from(wire: InstanceStatusWire) -> Self {
        Self {
            process_guid: wire.process_guid,
            instance_guid: wire.instance_guid,
            index: wire.index,
            state: wire.state.to_uppercase(),
            since: wire.since_in_ns / 1_000_000_000,
        }
    }
}

/// Client for dispatching desired state and querying instance status.
pub struct PlacementClient {
    bus: Arc<dyn MessageBus>,
    registry: Arc<ServiceRegistry>,
    blobstore: Arc<dyn BlobstoreUrls>,
    buildpacks: Arc<BuildpackRegistry>,
    defaults: Arc<StagingDefaults>,
    config: Config,
    http: reqwest::Client,
}

impl PlacementClient {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        registry: Arc<ServiceRegistry>,
        blobstore: Arc<dyn BlobstoreUrls>,
        buildpacks: Arc<BuildpackRegistry>,
        defaults: Arc<StagingDefaults>,
        config: Config,
    ) -> Self {
        let http = reqwest::Client::builder()
            .timeout(QUERY_TIMEOUT)
            .build()
            .expect("Failed to build HTTP client");
        Self {
            bus,
            registry,
            blobstore,
            buildpacks,
            defaults,
            config,
            http,
        }
    }

    /// Project an app record into the descriptor the backend converges on.
    pub fn build_desired_state(&self, app: &crate::app::App) -> DesiredPlacementDescriptor {
        DesiredPlacementDescriptor {
            process_guid: app.process_guid(),
            memory_mb: app.memory_mb,
            disk_mb: app.disk_quota_mb,
            file_descriptors: app.file_descriptors,
            droplet_uri: self.blobstore.perma_droplet_download_url(&app.guid),
            stack: app.stack.clone(),
            start_command: app.detected_start_command.clone(),
            environment: codec::merged_environment(app, &self.defaults),
            num_instances: app.desired_instances(),
            routes: app.routes.clone(),
            log_guid: app.guid.clone(),
            health_check_timeout_in_seconds: app.health_check_timeout_secs,
        }
    }

    /// Publish the app's desired state for the backend to converge on.
    pub async fn dispatch(&self, app: &AppHandle) -> Result<(), PlacementError> {
        let snapshot = app.snapshot();
        let descriptor = self.build_desired_state(&snapshot);
        info!(
            process_guid = %descriptor.process_guid,
            num_instances = descriptor.num_instances,
            "Dispatching desired state"
        );
        self.bus
            .publish(
                DESIRE_SUBJECT,
                serde_json::to_value(&descriptor).map_err(BusError::from)?,
            )
            .await?;
        Ok(())
    }

    /// Publish a staging job for the backend to place.
    ///
    /// The token is stamped on the app before the job leaves, so a
    /// completion arriving through any path can be checked against it.
    pub async fn dispatch_staging(&self, app: &AppHandle) -> Result<TaskToken, PlacementError> {
        let token = TaskToken::new();
        app.set_staging_token(token);

        let snapshot = app.snapshot();
        let resources = staging_resources(&snapshot, &self.config);
        let request = codec::build_staging_request(
            &snapshot,
            token,
            resources,
            &self.defaults,
            &self.buildpacks,
            self.blobstore.as_ref(),
        );

        info!(
            app_guid = %snapshot.guid,
            task_id = %token,
            "Dispatching staging job to placement backend"
        );
        self.bus
            .publish(
                PLACEMENT_STAGING_SUBJECT,
                serde_json::to_value(&request).map_err(BusError::from)?,
            )
            .await?;
        Ok(token)
    }

    /// Fetch the running instances for a process from the backend.
    pub async fn query_instances(
        &self,
        process_guid: &str,
    ) -> Result<Vec<InstanceStatus>, PlacementError> {
        let addrs = self.registry.addrs();
        let Some(addr) = addrs.first() else {
            warn!(process_guid, "No placement backend address known");
            return Err(PlacementError::BackendUnavailable);
        };

        let url = format!("{}/instances/{}", addr, process_guid);
        debug!(process_guid, url = %url, "Querying instance status");

        let response = self.http.get(&url).send().await.map_err(|e| {
            warn!(process_guid, error = %e, "Placement backend request failed");
            PlacementError::BackendUnavailable
        })?;

        if !response.status().is_success() {
            warn!(
                process_guid,
                status = %response.status(),
                "Placement backend returned error status"
            );
            return Err(PlacementError::BackendUnavailable);
        }

        let wire: Vec<InstanceStatusWire> = response.json().await.map_err(|e| {
            warn!(process_guid, error = %e, "Malformed instance status response");
            PlacementError::BackendUnavailable
        })?;

        Ok(wire.into_iter().map(InstanceStatus::from).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_status_normalizes() {
        let status: InstanceStatus = InstanceStatusWire {
            process_guid: "app-1-v1".to_string(),
            instance_guid: "i-1".to_string(),
            index: 0,
            state: "running".to_string(),
            since_in_ns: 1_999_999_999,
        }
        .into();
        assert_eq!(status.state, "RUNNING");
        // Truncating division, not rounding.
        assert_eq!(status.since, 1);
    }

    #[test]
    fn test_registry_replaces_addrs() {
        let registry = ServiceRegistry::new(vec!["http://a:7777".to_string()]);
        assert_eq!(registry.addrs(), vec!["http://a:7777"]);
        registry.set_addrs(vec!["http://b:7777".to_string()]);
        assert_eq!(registry.addrs(), vec!["http://b:7777"]);
    }
}
