//! JSON Schema helpers for MCP-compliant schemas.
//!
//! Generates standard JSON Schema without Rust-specific formats like "uint"
//! that LLMs may not understand correctly.

use schemars::Schema;
use schemars::json_schema;

/// Unsigned integer schema: `{"type": "integer", "minimum": 0}`
///
/// Use with `#[schemars(schema_with = "crate::fleet::schema::uint")]` on unsigned fields.
pub fn uint(_generator: &mut schemars::SchemaGenerator) -> Schema {
    json_schema!({
        "type": "integer",
        "minimum": 0
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use schemars::SchemaGenerator;

    fn schema_json<T: schemars::JsonSchema>() -> String {
        let schema = SchemaGenerator::default().into_root_schema_for::<T>();
        serde_json::to_string(&schema).expect("Failed to serialize schema")
    }

    #[test]
    fn test_uint_schema_structure() {
        let mut generator = SchemaGenerator::default();
        let json = serde_json::to_value(uint(&mut generator)).expect("Failed to serialize schema");

        assert_eq!(json.get("type"), Some(&serde_json::json!("integer")));
        assert_eq!(json.get("minimum"), Some(&serde_json::json!(0)));
        assert!(json.get("format").is_none(), "Should not have format field");
    }

    #[test]
    fn test_refresh_status_schema_no_uint() {
        use crate::fleet::types::RefreshStatus;

        let json_str = schema_json::<RefreshStatus>();
        assert!(
            !json_str.contains("\"uint"),
            "RefreshStatus schema should not contain 'uint' format: {}",
            json_str
        );
    }

    #[test]
    fn test_directory_listing_schema_no_uint() {
        use crate::fleet::types::DirectoryListing;

        let json_str = schema_json::<DirectoryListing>();
        assert!(
            !json_str.contains("\"uint"),
            "DirectoryListing schema should not contain 'uint' format: {}",
            json_str
        );
    }

    #[test]
    fn test_system_view_schema_no_uint() {
        use crate::fleet::types::{SystemSnapshot, TelemetryView};

        let json_str = schema_json::<TelemetryView<SystemSnapshot>>();
        assert!(
            !json_str.contains("\"uint"),
            "System telemetry schema should not contain 'uint' format: {}",
            json_str
        );
    }
}
