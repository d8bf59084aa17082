//! The staging task: one attempt to stage one app on one worker.
//!
//! The protocol is two-phase over a single reply inbox. The worker sends a
//! setup reply as soon as it has accepted (or refused) the job; setup errors
//! surface synchronously to the caller. Much later it sends a completion
//! reply with the staging outcome; completion failures are recorded on the
//! app record and logged, never raised, since by then there is nobody left
//! to raise to.
//!
//! The staging token stamped on the app at dispatch time is re-read before
//! committing a completion reply. A mismatch means a newer attempt has
//! superseded this one, and the stale reply is dropped without touching the
//! record.

use std::sync::Arc;

use serde::Deserialize;
use stagehand_bus::bridge;
use stagehand_bus::{BusError, MessageBus};
use stagehand_id::{TaskToken, WorkerId};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::app::{App, AppHandle, StagingCommit};
use crate::blobstore::BlobstoreUrls;
use crate::buildpacks::BuildpackRegistry;
use crate::codec::{self, ResourceLimits, StagingDefaults};
use crate::config::Config;
use crate::pool::CapacityPool;

/// Subject that tells every staging worker to abort work for an app.
pub const STAGING_STOP_SUBJECT: &str = "staging.stop";

/// Reason recorded when a completion reply fails without a structured error.
pub const GENERIC_FAILURE_REASON: &str = "StagingError";

/// Per-worker staging-start subject.
pub fn staging_start_subject(worker_id: &WorkerId) -> String {
    format!("staging.{}.start", worker_id)
}

#[derive(Debug, Error)]
pub enum StagingError {
    #[error("no available staging worker for stack {stack} ({memory_mb} MB memory, {disk_mb} MB disk)")]
    NoCapacityAvailable {
        stack: String,
        memory_mb: u64,
        disk_mb: u64,
    },

    /// The worker refused the job, the setup reply was malformed, or the
    /// reply channel died before setup completed.
    #[error("staging setup failed: {0}")]
    SetupFailed(String),

    #[error(transparent)]
    Bus(#[from] BusError),
}

/// Structured error detail inside a staging reply.
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorInfo {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub message: String,
}

/// A reply from a staging worker, setup phase or completion phase.
///
/// Every field is optional on the wire; which ones are populated depends on
/// the phase and the outcome.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StagingReply {
    #[serde(default)]
    pub task_id: Option<TaskToken>,
    #[serde(default)]
    pub task_streaming_log_url: Option<String>,
    #[serde(default)]
    pub detected_buildpack: Option<String>,
    #[serde(default)]
    pub buildpack_key: Option<String>,
    #[serde(default)]
    pub detected_start_command: Option<String>,
    #[serde(default)]
    pub droplet_hash: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub error_info: Option<ErrorInfo>,
}

impl StagingReply {
    /// The reason to record for a failed reply: the structured error type
    /// when the worker sent one, otherwise the generic reason.
    pub fn failure_reason(&self) -> String {
        self.error_info
            .as_ref()
            .map(|info| info.kind.clone())
            .unwrap_or_else(|| GENERIC_FAILURE_REASON.to_string())
    }
}

/// Handed to the completion callback when an attempt commits successfully.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagingComplete {
    /// Instance count the fleet should be brought to, read from the app
    /// record at completion time.
    pub started_instances: u32,
}

/// Invoked exactly once if and when the attempt's completion reply commits.
pub type CompletionCallback = Box<dyn FnOnce(StagingComplete) + Send>;

/// Returned to the caller once the setup phase succeeds.
#[derive(Debug, Clone)]
pub struct StagingResponse {
    pub streaming_log_url: Option<String>,
}

/// Everything a staging task needs from the surrounding process.
#[derive(Clone)]
pub struct StagingDeps {
    pub bus: Arc<dyn MessageBus>,
    pub staging_pool: Arc<CapacityPool>,
    pub run_pool: Arc<CapacityPool>,
    pub blobstore: Arc<dyn BlobstoreUrls>,
    pub buildpacks: Arc<BuildpackRegistry>,
    pub defaults: Arc<StagingDefaults>,
    pub config: Config,
}

/// Resource sizing for an attempt: the app's declared requirement or the
/// configured floor, whichever is larger.
pub fn staging_resources(app: &App, config: &Config) -> ResourceLimits {
    ResourceLimits {
        memory_mb: app.memory_mb.max(config.staging_memory_floor_mb()),
        disk_mb: app.disk_quota_mb.max(config.staging_disk_floor_mb()),
        file_descriptors: app.file_descriptors,
    }
}

/// One staging attempt. Consumed by [`StagingTask::stage`].
pub struct StagingTask {
    deps: StagingDeps,
    app: AppHandle,
}

impl StagingTask {
    pub fn new(deps: StagingDeps, app: AppHandle) -> Self {
        Self { deps, app }
    }

    /// Run the attempt: place, dispatch, and wait for the setup reply.
    ///
    /// Returns once the worker has accepted the job. The completion reply is
    /// handled in the background; `callback` fires exactly once if the
    /// attempt commits.
    pub async fn stage(self, callback: CompletionCallback) -> Result<StagingResponse, StagingError> {
        let snapshot = self.app.snapshot();
        let resources = staging_resources(&snapshot, &self.deps.config);

        let worker_id = self
            .deps
            .staging_pool
            .find_worker(&snapshot.stack, resources.memory_mb, resources.disk_mb)
            .ok_or_else(|| StagingError::NoCapacityAvailable {
                stack: snapshot.stack.clone(),
                memory_mb: resources.memory_mb,
                disk_mb: resources.disk_mb,
            })?;

        // Tell every worker to abort any older attempt for this app. Best
        // effort: a lost stop only wastes worker cycles, the token check
        // keeps the stale result out.
        if let Err(e) = self
            .deps
            .bus
            .publish(
                STAGING_STOP_SUBJECT,
                serde_json::json!({ "app_id": snapshot.guid }),
            )
            .await
        {
            warn!(app_guid = %snapshot.guid, error = %e, "Failed to publish staging stop");
        }

        // The staging container consumes capacity a running instance would
        // otherwise get, so both pools take the reservation.
        self.deps.staging_pool.reserve(&worker_id, resources.memory_mb);
        self.deps.run_pool.reserve(&worker_id, resources.memory_mb);

        let token = TaskToken::new();
        self.app.set_staging_token(token);

        let request = codec::build_staging_request(
            &snapshot,
            token,
            resources,
            &self.deps.defaults,
            &self.deps.buildpacks,
            self.deps.blobstore.as_ref(),
        );

        info!(
            app_guid = %snapshot.guid,
            worker_id = %worker_id,
            task_id = %token,
            memory_mb = resources.memory_mb,
            disk_mb = resources.disk_mb,
            "Dispatching staging task"
        );

        let mut sub = self
            .deps
            .bus
            .request(
                &staging_start_subject(&worker_id),
                serde_json::to_value(&request).map_err(BusError::from)?,
            )
            .await?;

        let (setup_promise, setup_completion) = bridge::promise();
        let deps = self.deps.clone();
        let app = self.app.clone();

        // The reader owns the inbox for the life of the attempt: it hands the
        // setup reply back to the suspended caller, then stays on for the
        // completion reply.
        tokio::spawn(async move {
            let app_guid = app.guid();
            // If the inbox closes before the first reply, the promise drops
            // unresolved and the caller observes an abandoned setup phase.
            if let Some(first) = sub.next().await {
                setup_promise.deliver(first);
                match sub.next().await {
                    Some(second) => {
                        handle_completion(&deps, &app, token, &worker_id, callback, &second.payload);
                    }
                    None => {
                        warn!(
                            app_guid = %app_guid,
                            task_id = %token,
                            "Reply inbox closed before completion reply"
                        );
                    }
                }
            }
        });

        let first = setup_completion.wait().await.map_err(|e| {
            self.app.mark_staging_failed(GENERIC_FAILURE_REASON);
            StagingError::SetupFailed(e.to_string())
        })?;

        let reply: StagingReply = first.decode().map_err(|e| {
            self.app.mark_staging_failed(GENERIC_FAILURE_REASON);
            StagingError::SetupFailed(format!("malformed setup reply: {}", e))
        })?;

        if let Some(error) = reply.error {
            let reason = reply
                .error_info
                .as_ref()
                .map(|info| info.kind.clone())
                .unwrap_or_else(|| GENERIC_FAILURE_REASON.to_string());
            self.app.mark_staging_failed(reason);
            return Err(StagingError::SetupFailed(error));
        }

        Ok(StagingResponse {
            streaming_log_url: reply.task_streaming_log_url,
        })
    }
}

/// Handle the completion-phase reply. Outcomes are recorded on the app
/// record and logged; nothing here propagates an error.
fn handle_completion(
    deps: &StagingDeps,
    app: &AppHandle,
    token: TaskToken,
    worker_id: &WorkerId,
    callback: CompletionCallback,
    payload: &serde_json::Value,
) {
    let app_guid = app.guid();

    // Staleness is checked before anything else, even before parsing: once
    // a newer attempt owns the record, a stale reply (well-formed or not)
    // must leave it untouched.
    if app.staging_token() != Some(token) {
        warn!(
            app_guid = %app_guid,
            task_id = %token,
            "Dropping completion reply from superseded staging task"
        );
        return;
    }

    if app.staging_failed() {
        warn!(
            app_guid = %app_guid,
            task_id = %token,
            "Dropping completion reply for already-failed staging task"
        );
        return;
    }

    let reply: StagingReply = match serde_json::from_value(payload.clone()) {
        Ok(reply) => reply,
        Err(e) => {
            error!(app_guid = %app_guid, task_id = %token, error = %e, "Malformed staging completion reply");
            app.mark_staging_failed(GENERIC_FAILURE_REASON);
            return;
        }
    };

    if let Some(error) = &reply.error {
        let reason = reply.failure_reason();
        error!(
            app_guid = %app_guid,
            task_id = %token,
            reason = %reason,
            error = %error,
            "Staging task failed"
        );
        app.mark_staging_failed(reason);
        return;
    }

    // The worker reports the buildpack it detected by blobstore key; resolve
    // it back to a guid, but only when the app did not pin a custom
    // buildpack (a custom URL has no admin registry entry).
    let snapshot = app.snapshot();
    let detected_buildpack_guid = if snapshot.uses_custom_buildpack() {
        None
    } else {
        reply
            .buildpack_key
            .as_deref()
            .and_then(|key| deps.buildpacks.find_by_key(key))
            .map(|b| b.guid.clone())
    };

    app.record_staging_success(StagingCommit {
        detected_buildpack: reply.detected_buildpack,
        detected_buildpack_guid,
        detected_start_command: reply.detected_start_command,
        droplet_hash: reply.droplet_hash,
    });
    deps.run_pool.mark_app_started(worker_id, &app_guid);

    let started_instances = app.snapshot().desired_instances();
    info!(
        app_guid = %app_guid,
        task_id = %token,
        worker_id = %worker_id,
        started_instances,
        "Staging task completed"
    );

    callback(StagingComplete { started_instances });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::AppState;
    use rstest::rstest;

    fn make_app(memory_mb: u64, disk_quota_mb: u64) -> App {
        App {
            guid: "app-guid".to_string(),
            version: "v1".to_string(),
            stack: "lucid64".to_string(),
            state: AppState::Started,
            instances: 1,
            memory_mb,
            disk_quota_mb,
            file_descriptors: 16384,
            environment: Vec::new(),
            buildpack: None,
            service_bindings: Vec::new(),
            routes: Vec::new(),
            health_check_timeout_secs: None,
            staging_token: None,
            staged: false,
            staging_failed: false,
            staging_failed_reason: None,
            detected_start_command: String::new(),
            detected_buildpack: None,
            detected_buildpack_guid: None,
            droplet_hash: None,
        }
    }

    #[rstest]
    #[case::floor_wins(1024, 2048, 2048)]
    #[case::app_wins(4096, 2048, 4096)]
    #[case::no_floor(1024, 0, 1024)]
    fn test_staging_memory_sizing(
        #[case] app_mb: u64,
        #[case] floor_mb: u64,
        #[case] expected_mb: u64,
    ) {
        let config = Config {
            min_staging_memory_mb: floor_mb,
            ..Config::default()
        };
        let resources = staging_resources(&make_app(app_mb, 1024), &config);
        assert_eq!(resources.memory_mb, expected_mb);
    }

    #[rstest]
    #[case::builtin_floor(12, None, 4096)]
    #[case::app_above_floor(123, Some(122), 123)]
    #[case::floor_above_app(64, Some(122), 122)]
    fn test_staging_disk_sizing(
        #[case] app_mb: u64,
        #[case] floor_mb: Option<u64>,
        #[case] expected_mb: u64,
    ) {
        let config = Config {
            min_staging_disk_mb: floor_mb,
            ..Config::default()
        };
        let resources = staging_resources(&make_app(1024, app_mb), &config);
        assert_eq!(resources.disk_mb, expected_mb);
    }

    #[test]
    fn test_failure_reason_prefers_structured_type() {
        let reply = StagingReply {
            error: Some("staging blew up".to_string()),
            error_info: Some(ErrorInfo {
                kind: "NoAppDetectedError".to_string(),
                message: "no buildpack detected".to_string(),
            }),
            ..StagingReply::default()
        };
        assert_eq!(reply.failure_reason(), "NoAppDetectedError");

        let bare = StagingReply {
            error: Some("staging blew up".to_string()),
            ..StagingReply::default()
        };
        assert_eq!(bare.failure_reason(), GENERIC_FAILURE_REASON);
    }

    #[test]
    fn test_reply_tolerates_sparse_payloads() {
        let reply: StagingReply = serde_json::from_value(serde_json::json!({})).unwrap();
        assert!(reply.error.is_none());
        assert!(reply.task_id.is_none());

        let reply: StagingReply = serde_json::from_value(serde_json::json!({
            "task_streaming_log_url": "http://worker/logs/1",
        }))
        .unwrap();
        assert_eq!(reply.task_streaming_log_url.as_deref(), Some("http://worker/logs/1"));
    }

    #[test]
    fn test_staging_start_subject_embeds_worker() {
        assert_eq!(
            staging_start_subject(&WorkerId::new("worker-7")),
            "staging.worker-7.start"
        );
    }
}
