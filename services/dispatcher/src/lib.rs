//! Stagehand Dispatcher Library
//!
//! The dispatcher owns staging and placement for the app fleet. It tracks
//! worker capacity from bus advertisements, sizes and dispatches staging
//! tasks, commits their two-phase replies onto the application record, and
//! hands desired state to the declarative placement backend.
//!
//! ## Architecture
//!
//! - **Capacity Pools**: Staging and run capacity tracked per worker
//! - **Staging Task**: One attempt to stage one app on one worker
//! - **Placement Client**: Desired-state dispatch and instance queries
//! - **Codec**: Wire-level staging request construction
//!
//! ## Modules
//!
//! - `app`: Application desired-state record and staging bookkeeping
//! - `staging`: The staging task state machine
//! - `placement`: Declarative placement backend client
//! - `pool`: Worker capacity pools and advertisement listeners

pub mod app;
pub mod blobstore;
pub mod buildpacks;
pub mod codec;
pub mod config;
pub mod placement;
pub mod pool;
pub mod staging;

// Re-export commonly used types
pub use app::{App, AppHandle, AppState};
pub use placement::{PlacementClient, ServiceRegistry};
pub use pool::{AdvertisementListener, CapacityPool};
pub use staging::{StagingDeps, StagingTask};
