//! The application desired-state record.
//!
//! Owned by the surrounding resource model; the scheduler reads the app's
//! declared requirements and writes only the staging bookkeeping fields.
//! The staging token is the optimistic-concurrency guard: a task captures it
//! at dispatch time, and a newer dispatch overwrites it, which silently
//! invalidates the older task's eventual completion reply.

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use stagehand_id::TaskToken;

/// Lifecycle state the operator has requested for the app.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppState {
    Stopped,
    Started,
}

/// Buildpack selection declared on the app.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildpackSelection {
    /// A custom buildpack fetched straight from a URL.
    Custom(String),
    /// An admin-curated buildpack, referenced by name.
    Admin(String),
}

/// A bound service instance, carried into the staging environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceBinding {
    pub label: String,
    pub name: String,
    pub credentials: Value,
    pub options: Value,
}

/// One egress rule from a security group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EgressRule {
    pub protocol: String,
    pub ports: String,
    pub destination: String,
}

/// A named group of egress rules. Groups flagged `staging_default` apply to
/// every staging container.
#[derive(Debug, Clone)]
pub struct SecurityGroup {
    pub name: String,
    pub staging_default: bool,
    pub rules: Vec<EgressRule>,
}

/// Application desired state.
#[derive(Debug, Clone)]
pub struct App {
    // Identity
    pub guid: String,
    pub version: String,

    // Declared requirements
    pub stack: String,
    pub state: AppState,
    pub instances: u32,
    pub memory_mb: u64,
    pub disk_quota_mb: u64,
    pub file_descriptors: u32,

    // Runtime descriptors
    pub environment: Vec<(String, String)>,
    pub buildpack: Option<BuildpackSelection>,
    pub service_bindings: Vec<ServiceBinding>,
    pub routes: Vec<String>,
    pub health_check_timeout_secs: Option<u32>,

    // Staging bookkeeping (written by the scheduler)
    pub staging_token: Option<TaskToken>,
    pub staged: bool,
    pub staging_failed: bool,
    pub staging_failed_reason: Option<String>,
    pub detected_start_command: String,
    pub detected_buildpack: Option<String>,
    pub detected_buildpack_guid: Option<String>,
    pub droplet_hash: Option<String>,
}

impl App {
    /// Process identity used by the declarative backend.
    pub fn process_guid(&self) -> String {
        format!("{}-{}", self.guid, self.version)
    }

    pub fn started(&self) -> bool {
        self.state == AppState::Started
    }

    /// Instance count the fleet should converge on: zero unless started.
    pub fn desired_instances(&self) -> u32 {
        if self.started() {
            self.instances
        } else {
            0
        }
    }

    /// Whether the app asked for a custom (URL) buildpack.
    pub fn uses_custom_buildpack(&self) -> bool {
        matches!(self.buildpack, Some(BuildpackSelection::Custom(_)))
    }
}

/// Fields committed onto the app when a staging attempt succeeds.
#[derive(Debug, Clone, Default)]
pub struct StagingCommit {
    pub detected_buildpack: Option<String>,
    pub detected_buildpack_guid: Option<String>,
    pub detected_start_command: Option<String>,
    pub droplet_hash: Option<String>,
}

/// Shared, mutable handle to an application record.
///
/// The lock is never held across an await point; the token compare is the
/// only cross-attempt coordination device.
#[derive(Clone)]
pub struct AppHandle {
    inner: Arc<Mutex<App>>,
}

impl AppHandle {
    pub fn new(app: App) -> Self {
        Self {
            inner: Arc::new(Mutex::new(app)),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, App> {
        self.inner.lock().expect("app record lock poisoned")
    }

    /// Copy of the full record, for building immutable dispatch snapshots.
    pub fn snapshot(&self) -> App {
        self.lock().clone()
    }

    pub fn guid(&self) -> String {
        self.lock().guid.clone()
    }

    /// Current in-flight staging token, if any.
    pub fn staging_token(&self) -> Option<TaskToken> {
        self.lock().staging_token
    }

    /// Stamp a new attempt's token, invalidating any older in-flight attempt.
    pub fn set_staging_token(&self, token: TaskToken) {
        self.lock().staging_token = Some(token);
    }

    pub fn staging_failed(&self) -> bool {
        self.lock().staging_failed
    }

    /// Record a failed attempt. Result fields are left untouched.
    pub fn mark_staging_failed(&self, reason: impl Into<String>) {
        let mut app = self.lock();
        app.staged = false;
        app.staging_failed = true;
        app.staging_failed_reason = Some(reason.into());
    }

    /// Commit a successful staging outcome.
    ///
    /// The detected start command is only written when the reply carried a
    /// droplet hash: without an artifact the command would point at nothing,
    /// and must not clobber a previously good value.
    pub fn record_staging_success(&self, commit: StagingCommit) {
        let mut app = self.lock();

        if let Some(hash) = commit.droplet_hash {
            if let Some(command) = commit.detected_start_command {
                app.detected_start_command = command;
            }
            app.droplet_hash = Some(hash);
        }

        if let Some(buildpack) = commit.detected_buildpack {
            app.detected_buildpack = Some(buildpack);
        }
        if let Some(guid) = commit.detected_buildpack_guid {
            app.detected_buildpack_guid = Some(guid);
        }

        app.staged = true;
        app.staging_failed = false;
        app.staging_failed_reason = None;
    }
}
