use schemars::schema::RootSchema;
use schemars::schema_for;

use crate::ReclaimConfig;

/// JSON schema for `reclaim.toml`, for editor integration and CI checks.
#[must_use]
pub fn json_schema() -> RootSchema {
    schema_for!(ReclaimConfig)
}
