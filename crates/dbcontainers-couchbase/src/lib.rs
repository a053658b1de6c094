//! # Couchbase test instances
//!
//! Starts a real Couchbase Server in Docker for integration tests and runs
//! administrative commands (`couchbase-cli`) inside it.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use dbcontainers_couchbase::{BucketSpec, CouchbaseConfig, CouchbaseContainer};
//! use dbcontainers_executor::bollard::Docker;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let docker = Arc::new(Docker::connect_with_defaults()?);
//!     let config = CouchbaseConfig::from_env()?.with_default_bucket(BucketSpec::new("Customer"));
//!     let couchbase = CouchbaseContainer::start(docker, config).await?;
//!
//!     let created = couchbase.create_bucket_with_quota("orders", 128).await?;
//!     assert_eq!(created.exit_code, 0);
//!     println!("connect to {}", couchbase.connection_string());
//!
//!     couchbase.stop().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Admin operations without Docker
//!
//! [`CouchbaseAdmin`] works against any [`InstanceHandle`], so the same
//! operations can be pointed at an instance started some other way:
//!
//! ```rust,ignore
//! let admin = CouchbaseAdmin::new(my_handle);
//! let result = admin.flush_bucket("Example").await?;
//! if !result.is_success() {
//!     // the bucket is missing, or the credentials are wrong
//! }
//! ```
//!
//! Exit codes are reported, not interpreted. A flush that returns `0` has
//! been accepted by the node; the bucket empties shortly after.

pub mod admin;
pub mod command;
pub mod config;
pub mod container;

pub use admin::{CouchbaseAdmin, CONNECTION_SCHEME};
pub use command::{
    AdminOperation, CommandRenderer, CredentialStrategy, Invocation, COUCHBASE_CLI,
    DEFAULT_BUCKET_RAM_QUOTA_MB,
};
pub use config::{BucketSpec, CouchbaseConfig};
pub use container::CouchbaseContainer;
pub use dbcontainers_common::{ExecCommand, ExecResult, InstanceHandle, InstanceIdentity};
