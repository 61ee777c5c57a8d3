//! Session configuration.

use serde::{Deserialize, Serialize};

use crate::correlation::IdScope;
use crate::error::DebugError;
use crate::logging_handler;
use crate::SharedSink;

/// Configuration for a [`DebugSession`](crate::DebugSession).
///
/// Deserializes from camelCase keys; every field has a default.
///
/// # Examples
///
/// ```rust
/// use request_debug::{DebugConfig, IdScope};
///
/// // Default configuration
/// let config = DebugConfig::default();
/// assert!(config.capture);
///
/// // From a JSON document
/// let config: DebugConfig =
///     serde_json::from_str(r#"{ "idScope": "global", "logger": "tracing" }"#).unwrap();
/// assert_eq!(config.id_scope, IdScope::Global);
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DebugConfig {
    /// Which counter correlation ids are drawn from
    pub id_scope: IdScope,
    /// Whether the session starts capturing
    pub capture: bool,
    /// Name of the built-in sink to log to
    pub logger: String,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            id_scope: IdScope::PerInstance,
            capture: true,
            logger: "stderr".to_owned(),
        }
    }
}

impl DebugConfig {
    /// Resolve the configured sink.
    pub fn sink(&self) -> Result<SharedSink, DebugError> {
        logging_handler::named(&self.logger)
    }
}
