//! Common types for tidepool: errors, settings, polling and retry utilities

#![deny(missing_docs)]

pub mod error;
pub mod kube_utils;
pub mod retry;
pub mod settings;
pub mod telemetry;

pub use error::{BoxError, Error};
pub use settings::Settings;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Label carrying the generated cluster name of an instance (also the pod selector)
pub const LABEL_APP: &str = "app";

/// Label carrying the human-readable instance name
pub const LABEL_NAME: &str = "tidepool.dev/name";

/// Label carrying the instance type (basic, executor)
pub const LABEL_TYPE: &str = "tidepool.dev/type";

/// Label marking resources created by tidepool
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";

/// Value of [`LABEL_MANAGED_BY`] for tidepool resources
pub const LABEL_MANAGED_BY_TIDEPOOL: &str = "tidepool";

/// Field manager used for server-side apply
pub const FIELD_MANAGER: &str = "tidepool";
