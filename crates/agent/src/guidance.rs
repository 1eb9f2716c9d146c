//! Usage guidance folded into tool descriptions

use std::collections::BTreeMap;

use labrelay_config::{GuidanceEntry, GuidanceKind};

const WORKFLOW_DECISION: &str = "1) Call get_current_design first. 2) If a design is open, \
work on it directly. 3) If none is open, ask the user whether to create a new cell or use an \
existing one.";

fn rank(kind: GuidanceKind) -> u8 {
    match kind {
        GuidanceKind::Decision => 0,
        GuidanceKind::Recommendation => 1,
        GuidanceKind::Warning => 2,
        GuidanceKind::Precondition => 3,
        GuidanceKind::Completion => 4,
    }
}

fn label(kind: GuidanceKind) -> &'static str {
    match kind {
        GuidanceKind::Decision => "WORKFLOW DECISION",
        GuidanceKind::Recommendation => "RECOMMENDATION",
        GuidanceKind::Warning => "WARNING",
        GuidanceKind::Precondition => "PRECONDITION",
        GuidanceKind::Completion => "COMPLETION",
    }
}

/// Guidance text per tool name
///
/// `Warning` entries mark single-use tools and `Completion` entries mark tools
/// that finish a task; both also produce a follow-up instruction after the call.
#[derive(Debug, Clone, Default)]
pub struct Guidance {
    entries: BTreeMap<String, Vec<(GuidanceKind, String)>>,
}

impl Guidance {
    pub fn new() -> Self {
        Self::default()
    }

    /// Built-in table for the design workflow tools
    pub fn builtin() -> Self {
        let mut guidance = Self::new();
        for tool in ["plan_circuit", "execute_circuit_plan", "add_component"] {
            guidance.add(tool, GuidanceKind::Decision, WORKFLOW_DECISION);
        }

        guidance.add(
            "get_project_structure",
            GuidanceKind::Recommendation,
            "Call this first to learn which libraries and cells exist.",
        );
        guidance.add(
            "get_current_design",
            GuidanceKind::Recommendation,
            "Call this to see whether the user already has a schematic open. If one is open, \
             design on it directly without creating new cells.",
        );
        guidance.add(
            "list_cells",
            GuidanceKind::Recommendation,
            "Call after get_project_structure to list the cells of one library.",
        );

        guidance.add(
            "plan_circuit",
            GuidanceKind::Warning,
            "Call once per design, and only when creating a NEW schematic.",
        );
        guidance.add(
            "execute_circuit_plan",
            GuidanceKind::Warning,
            "Call once per plan, and only after the user confirmed it.",
        );
        guidance.add(
            "add_components_from_plan",
            GuidanceKind::Warning,
            "Call once per plan. The task is complete once components are added.",
        );

        guidance.add(
            "add_component",
            GuidanceKind::Precondition,
            "Only when the user asks for a single component. Use add_components_from_plan for \
             a whole plan.",
        );
        guidance.add(
            "add_components_from_plan",
            GuidanceKind::Precondition,
            "Only after execute_circuit_plan succeeded and the user confirmed the design is open.",
        );
        guidance.add(
            "check_cell_exists",
            GuidanceKind::Precondition,
            "Only after get_project_structure. Never guess library names.",
        );

        guidance.add(
            "add_components_from_plan",
            GuidanceKind::Completion,
            "This completes the circuit design task. Stop after calling it.",
        );
        guidance.add(
            "save_current_design",
            GuidanceKind::Completion,
            "This completes the save. Stop after calling it.",
        );
        guidance
    }

    /// Append configured entries
    pub fn with_entries(mut self, entries: &[GuidanceEntry]) -> Self {
        for entry in entries {
            self.add(&entry.tool, entry.kind, &entry.text);
        }
        self
    }

    pub fn add(&mut self, tool: &str, kind: GuidanceKind, text: &str) {
        let list = self.entries.entry(tool.to_string()).or_default();
        list.push((kind, text.to_string()));
        list.sort_by_key(|(kind, _)| rank(*kind));
    }

    pub fn entries_for(&self, tool: &str) -> &[(GuidanceKind, String)] {
        self.entries.get(tool).map(Vec::as_slice).unwrap_or_default()
    }

    fn has(&self, tool: &str, kind: GuidanceKind) -> bool {
        self.entries_for(tool).iter().any(|(k, _)| *k == kind)
    }

    /// Description with this tool's guidance appended
    pub fn inject(&self, tool: &str, description: &str) -> String {
        let entries = self.entries_for(tool);
        if entries.is_empty() {
            return description.to_string();
        }

        let mut enhanced = format!("{}\n\nIMPORTANT CONSTRAINTS:", description.trim_end());
        for (kind, text) in entries {
            enhanced.push_str(&format!("\n- {}: {}", label(*kind), text));
        }
        enhanced
    }

    /// System instruction to add after `tool` has been called
    pub fn post_call_instruction(&self, tool: &str) -> Option<String> {
        if self.has(tool, GuidanceKind::Warning) {
            return Some(format!(
                "Tool '{}' has been called. Do NOT call it again in this conversation.",
                tool
            ));
        }
        if self.has(tool, GuidanceKind::Completion) {
            return Some(format!(
                "TASK COMPLETED: '{}' finished the current task. Wait for the user's next \
                 instruction before calling more tools.",
                tool
            ));
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inject_orders_by_kind() {
        let guidance = Guidance::builtin();
        let text = guidance.inject("add_components_from_plan", "Place every planned element.");
        let warning = text.find("WARNING").unwrap();
        let precondition = text.find("PRECONDITION").unwrap();
        let completion = text.find("COMPLETION").unwrap();
        assert!(text.starts_with("Place every planned element.\n\nIMPORTANT CONSTRAINTS:"));
        assert!(warning < precondition && precondition < completion);
    }

    #[test]
    fn test_no_guidance_leaves_description() {
        let guidance = Guidance::builtin();
        assert_eq!(guidance.inject("sweep", "Run a sweep"), "Run a sweep");
        assert!(guidance.post_call_instruction("sweep").is_none());
    }

    #[test]
    fn test_post_call_instructions() {
        let guidance = Guidance::builtin();
        assert!(guidance
            .post_call_instruction("plan_circuit")
            .unwrap()
            .contains("Do NOT call it again"));
        assert!(guidance
            .post_call_instruction("save_current_design")
            .unwrap()
            .starts_with("TASK COMPLETED"));
    }

    #[test]
    fn test_configured_entries_append() {
        let guidance = Guidance::new().with_entries(&[GuidanceEntry {
            tool: "vna_sweep".to_string(),
            kind: GuidanceKind::Precondition,
            text: "Calibrate first.".to_string(),
        }]);
        assert_eq!(guidance.entries_for("vna_sweep").len(), 1);
        assert!(guidance
            .inject("vna_sweep", "Sweep")
            .ends_with("- PRECONDITION: Calibrate first."));
    }
}
