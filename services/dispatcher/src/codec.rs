//! Wire-level dispatch message construction.
//!
//! A staging request is an immutable, fully-resolved snapshot built once per
//! attempt: everything the worker needs is resolved here (locators,
//! credentials, merged environment, egress rules) so the message never has
//! to be re-derived or mutated after dispatch.

use serde::Serialize;
use serde_json::Value;
use stagehand_id::TaskToken;

use crate::app::{App, BuildpackSelection, EgressRule};
use crate::blobstore::BlobstoreUrls;
use crate::buildpacks::{BuildpackEntry, BuildpackRegistry};

/// Staging-wide defaults owned by the surrounding process: the default
/// environment variable group and the global security groups.
#[derive(Default)]
pub struct StagingDefaults {
    pub environment: Vec<(String, String)>,
    pub security_groups: Vec<crate::app::SecurityGroup>,
}

/// Resource sizing carried in a dispatch message, in MB.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ResourceLimits {
    pub memory_mb: u64,
    pub disk_mb: u64,
    pub file_descriptors: u32,
}

/// Service-binding material exposed to the staging environment.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceBindingProperties {
    pub label: String,
    pub name: String,
    pub credentials: Value,
    pub options: Value,
}

/// App-level staging properties.
#[derive(Debug, Clone, Serialize)]
pub struct StagingProperties {
    pub services: Vec<ServiceBindingProperties>,

    /// Merged `KEY=value` pairs; app pairs override the default group.
    pub environment: Vec<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub buildpack: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub buildpack_git_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub buildpack_key: Option<String>,
}

/// The embedded run descriptor a worker starts the app with after staging.
///
/// Artifact fields are zeroed at staging time; the worker fills them in once
/// the droplet exists.
#[derive(Debug, Clone, Serialize)]
pub struct StartMessage {
    pub droplet: String,
    pub version: String,
    pub sha1: Option<String>,
    pub executable_uri: Option<String>,
    pub index: u32,
    pub uris: Vec<String>,
    pub limits: ResourceLimits,
    pub env: Vec<String>,
}

/// The staging job sent to a worker's staging-start subject.
#[derive(Debug, Clone, Serialize)]
pub struct StagingRequest {
    pub app_id: String,
    pub task_id: TaskToken,
    pub download_uri: Option<String>,
    pub upload_uri: Option<String>,
    pub buildpack_cache_download_uri: Option<String>,
    pub buildpack_cache_upload_uri: Option<String>,
    pub resources: ResourceLimits,
    pub properties: StagingProperties,
    pub admin_buildpacks: Vec<BuildpackEntry>,
    pub egress_network_rules: Vec<EgressRule>,
    pub start_message: StartMessage,
}

/// Build the wire request for one staging attempt.
pub fn build_staging_request(
    app: &App,
    token: TaskToken,
    resources: ResourceLimits,
    defaults: &StagingDefaults,
    registry: &BuildpackRegistry,
    urls: &dyn BlobstoreUrls,
) -> StagingRequest {
    let environment = merged_environment(app, defaults);

    let (buildpack, buildpack_git_url, buildpack_key) = match &app.buildpack {
        Some(BuildpackSelection::Custom(url)) => (Some(url.clone()), Some(url.clone()), None),
        Some(BuildpackSelection::Admin(name)) => (
            None,
            None,
            registry.find_by_name(name).map(|b| b.key.clone()),
        ),
        None => (None, None, None),
    };

    StagingRequest {
        app_id: app.guid.clone(),
        task_id: token,
        download_uri: urls.app_package_download_url(&app.guid),
        upload_uri: urls.droplet_upload_url(&app.guid),
        buildpack_cache_download_uri: urls.buildpack_cache_download_url(&app.guid),
        buildpack_cache_upload_uri: urls.buildpack_cache_upload_url(&app.guid),
        resources,
        properties: StagingProperties {
            services: app
                .service_bindings
                .iter()
                .map(|b| ServiceBindingProperties {
                    label: b.label.clone(),
                    name: b.name.clone(),
                    credentials: b.credentials.clone(),
                    options: b.options.clone(),
                })
                .collect(),
            environment: environment.clone(),
            buildpack,
            buildpack_git_url,
            buildpack_key,
        },
        admin_buildpacks: registry.wire_entries(urls),
        egress_network_rules: staging_egress_rules(defaults),
        start_message: StartMessage {
            droplet: app.guid.clone(),
            version: app.version.clone(),
            sha1: None,
            executable_uri: None,
            index: 0,
            uris: app.routes.clone(),
            limits: ResourceLimits {
                memory_mb: app.memory_mb,
                disk_mb: app.disk_quota_mb,
                file_descriptors: app.file_descriptors,
            },
            env: environment,
        },
    }
}

/// Merge the staging-wide default environment with the app's: app pairs win
/// on name conflicts. App pairs first in declaration order, then the
/// remaining defaults in their declaration order.
pub fn merged_environment(app: &App, defaults: &StagingDefaults) -> Vec<String> {
    let mut pairs: Vec<String> = app
        .environment
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect();

    for (key, value) in &defaults.environment {
        if app.environment.iter().any(|(k, _)| k == key) {
            continue;
        }
        pairs.push(format!("{}={}", key, value));
    }

    pairs
}

/// Union of egress rules from all security groups flagged as staging
/// defaults, in group declaration order.
pub fn staging_egress_rules(defaults: &StagingDefaults) -> Vec<EgressRule> {
    defaults
        .security_groups
        .iter()
        .filter(|g| g.staging_default)
        .flat_map(|g| g.rules.iter().cloned())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::{AppState, SecurityGroup, ServiceBinding};
    use crate::blobstore::StaticBlobstore;
    use crate::buildpacks::AdminBuildpack;
    use serde_json::json;

    fn make_app() -> App {
        App {
            guid: "app-guid".to_string(),
            version: "v1".to_string(),
            stack: "lucid64".to_string(),
            state: AppState::Started,
            instances: 2,
            memory_mb: 512,
            disk_quota_mb: 1024,
            file_descriptors: 16384,
            environment: vec![("KEY".to_string(), "value".to_string())],
            buildpack: None,
            service_bindings: vec![ServiceBinding {
                label: "postgres".to_string(),
                name: "mydb".to_string(),
                credentials: json!({"uri": "postgres://u:p@h/db"}),
                options: json!({}),
            }],
            routes: vec!["app.example.com".to_string()],
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

    fn make_defaults() -> StagingDefaults {
        StagingDefaults {
            environment: vec![("STAGINGKEY".to_string(), "staging_value".to_string())],
            security_groups: vec![
                SecurityGroup {
                    name: "dns".to_string(),
                    staging_default: true,
                    rules: vec![EgressRule {
                        protocol: "udp".to_string(),
                        ports: "53".to_string(),
                        destination: "0.0.0.0/0".to_string(),
                    }],
                },
                SecurityGroup {
                    name: "internal".to_string(),
                    staging_default: false,
                    rules: vec![EgressRule {
                        protocol: "tcp".to_string(),
                        ports: "80".to_string(),
                        destination: "10.0.0.0/8".to_string(),
                    }],
                },
            ],
        }
    }

    fn make_registry() -> BuildpackRegistry {
        BuildpackRegistry::new(vec![AdminBuildpack {
            guid: "bp-guid".to_string(),
            name: "ruby".to_string(),
            key: "ruby key".to_string(),
            position: 1,
            enabled: true,
        }])
    }

    fn store() -> StaticBlobstore {
        StaticBlobstore::new("http://blobs.example.com").with_buildpack_key("ruby key")
    }

    fn build(app: &App) -> StagingRequest {
        build_staging_request(
            app,
            TaskToken::new(),
            ResourceLimits {
                memory_mb: 1024,
                disk_mb: 4096,
                file_descriptors: 16384,
            },
            &make_defaults(),
            &make_registry(),
            &store(),
        )
    }

    #[test]
    fn test_request_includes_locators() {
        let request = build(&make_app());
        assert_eq!(
            request.download_uri.as_deref(),
            Some("http://blobs.example.com/packages/app-guid")
        );
        assert_eq!(
            request.upload_uri.as_deref(),
            Some("http://blobs.example.com/droplets/app-guid/upload")
        );
        assert!(request.buildpack_cache_download_uri.is_some());
        assert!(request.buildpack_cache_upload_uri.is_some());
    }

    #[test]
    fn test_environment_merge_prefers_app_pairs() {
        let mut app = make_app();
        app.environment = vec![("KEY".to_string(), "value".to_string())];
        let defaults = StagingDefaults {
            environment: vec![
                ("KEY".to_string(), "staging_value".to_string()),
                ("STAGINGKEY".to_string(), "staging_value".to_string()),
            ],
            security_groups: Vec::new(),
        };
        let merged = merged_environment(&app, &defaults);
        assert_eq!(merged, vec!["KEY=value", "STAGINGKEY=staging_value"]);
    }

    #[test]
    fn test_egress_rules_union_staging_defaults_only() {
        let rules = staging_egress_rules(&make_defaults());
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].protocol, "udp");
    }

    #[test]
    fn test_start_message_artifact_fields_zeroed() {
        let request = build(&make_app());
        assert!(request.start_message.sha1.is_none());
        assert!(request.start_message.executable_uri.is_none());
        assert_eq!(request.start_message.index, 0);
        // The start descriptor carries the app-declared limits, not the
        // staging-sized ones.
        assert_eq!(request.start_message.limits.memory_mb, 512);
        assert_eq!(request.resources.memory_mb, 1024);
    }

    #[test]
    fn test_custom_buildpack_has_url_and_no_key() {
        let mut app = make_app();
        app.buildpack = Some(BuildpackSelection::Custom(
            "git://example.com/foo.git".to_string(),
        ));
        let request = build(&app);
        assert_eq!(
            request.properties.buildpack.as_deref(),
            Some("git://example.com/foo.git")
        );
        assert_eq!(
            request.properties.buildpack_git_url.as_deref(),
            Some("git://example.com/foo.git")
        );
        assert!(request.properties.buildpack_key.is_none());

        let wire = serde_json::to_value(&request).unwrap();
        assert!(wire["properties"].get("buildpack_key").is_none());
    }

    #[test]
    fn test_admin_buildpack_has_key_and_no_url() {
        let mut app = make_app();
        app.buildpack = Some(BuildpackSelection::Admin("ruby".to_string()));
        let request = build(&app);
        assert!(request.properties.buildpack.is_none());
        assert!(request.properties.buildpack_git_url.is_none());
        assert_eq!(request.properties.buildpack_key.as_deref(), Some("ruby key"));
        // The admin list still rides along so workers never think the
        // buildpacks are gone.
        assert_eq!(request.admin_buildpacks.len(), 1);
    }

    #[test]
    fn test_service_bindings_carry_credentials() {
        let request = build(&make_app());
        assert_eq!(request.properties.services.len(), 1);
        assert_eq!(request.properties.services[0].label, "postgres");
        assert!(request.properties.services[0].credentials.is_object());
    }
}
