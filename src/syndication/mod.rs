//! # Syndication
//!
//! Moves local rows of every source environment into the shared target
//! database and republishes the result to the analytical warehouse.
//!
//! - [`tables`]: the syndicated tables in export order
//! - [`naming`]: projects, buckets, objects and tables of one deployment
//! - [`partition`]: collision-free id ranges per source environment
//! - [`migration`]: staging schemas and the offset-shifting merge
//! - [`warehouse_export`]: the denormalised responses export
//! - [`steps`]: the handler behind every pipeline step

pub mod migration;
pub mod naming;
pub mod partition;
pub mod steps;
pub mod tables;
pub mod warehouse_export;

pub use migration::{MigrationEngine, MigrationReport, PgStagingMigrator, StagingMigrator};
pub use naming::SyndicationNaming;
pub use partition::IdSpacePartition;
pub use steps::{CloudServices, SyndicationSteps};
pub use tables::SyndicatedTable;
