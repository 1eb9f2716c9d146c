//! Element type → (library, cell) table

use labrelay_config::CatalogPolicy;

use crate::error::{PlanError, Result};

/// Library used for any type without an explicit mapping
pub const DEFAULT_LIBRARY: &str = "ads_rflib";

/// Component libraries are read-only sources, never a plan target
pub const COMPONENT_LIBRARIES: &[&str] = &["ads_rflib", "ads_sources", "ads_simulation"];

/// Types recognized by the strict catalog
const KNOWN: &[&str] = &[
    "R", "C", "L", "MLIN", "MSub", "V_DC", "V_AC", "I_DC", "Ground", "GND", "GROUND", "Term",
    "S_Param", "DC", "HB",
];

/// Library and cell for an element type; unknown types fall through to the
/// default library with the type as the cell name
pub fn resolve(element: &str) -> (&'static str, String) {
    match element {
        "V_DC" | "V_AC" | "I_DC" => ("ads_sources", element.to_string()),
        "Ground" | "GND" | "GROUND" => (DEFAULT_LIBRARY, "GROUND".to_string()),
        "Term" | "S_Param" | "DC" | "HB" => ("ads_simulation", element.to_string()),
        "MLIN" | "MSub" => (DEFAULT_LIBRARY, element.to_string()),
        other => (DEFAULT_LIBRARY, other.to_string()),
    }
}

/// Element types the strict catalog accepts
pub fn known_types() -> &'static [&'static str] {
    KNOWN
}

pub fn is_known(element: &str) -> bool {
    KNOWN.contains(&element)
}

fn is_identifier(element: &str) -> bool {
    let mut chars = element.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    }
}

/// Check a step's element type against the configured policy
pub fn validate(element: &str, policy: CatalogPolicy) -> Result<()> {
    let accepted = match policy {
        CatalogPolicy::Strict => is_known(element),
        CatalogPolicy::Permissive => is_identifier(element),
    };
    if accepted {
        Ok(())
    } else {
        Err(PlanError::UnknownElement(element.to_string()))
    }
}

pub fn is_component_library(library: &str) -> bool {
    COMPONENT_LIBRARIES.contains(&library)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_table() {
        assert_eq!(resolve("R"), ("ads_rflib", "R".to_string()));
        assert_eq!(resolve("V_DC"), ("ads_sources", "V_DC".to_string()));
        assert_eq!(resolve("GND"), ("ads_rflib", "GROUND".to_string()));
        assert_eq!(resolve("S_Param"), ("ads_simulation", "S_Param".to_string()));
        assert_eq!(resolve("MLIN"), ("ads_rflib", "MLIN".to_string()));
        assert_eq!(resolve("UNKNOWN_X"), ("ads_rflib", "UNKNOWN_X".to_string()));
    }

    #[test]
    fn test_policies() {
        assert!(validate("R", CatalogPolicy::Strict).is_ok());
        assert!(validate("MLIN", CatalogPolicy::Strict).is_ok());
        assert!(validate("MSub", CatalogPolicy::Strict).is_ok());
        assert!(matches!(
            validate("UNKNOWN_X", CatalogPolicy::Strict),
            Err(PlanError::UnknownElement(t)) if t == "UNKNOWN_X"
        ));
        assert!(validate("UNKNOWN_X", CatalogPolicy::Permissive).is_ok());
        assert!(validate("9lives", CatalogPolicy::Permissive).is_err());
        assert!(validate("has space", CatalogPolicy::Permissive).is_err());
        assert!(validate("", CatalogPolicy::Permissive).is_err());
    }

    #[test]
    fn test_component_libraries() {
        assert!(is_component_library("ads_sources"));
        assert!(!is_component_library("demo_lib"));
    }
}
