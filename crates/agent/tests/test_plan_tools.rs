//! Plan workflow tools called directly

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use labrelay_agent::tools::{ExecutePlanTool, PlanCircuitTool, PopulatePlanTool, WorkflowStatusTool};
use labrelay_agent::{LocalTool, ResultWrapper};
use labrelay_mcp::EnvelopeStatus;
use labrelay_plan::{BackendError, DesignBackend, DesignOp, ElementPlacement, PlanStore, Workflow};
use serde_json::json;
use tempfile::TempDir;

#[derive(Default)]
struct FakeBackend {
    saves: AtomicUsize,
    refuse_create: bool,
}

#[async_trait]
impl DesignBackend for FakeBackend {
    async fn list_libraries(&self) -> Result<Vec<String>, BackendError> {
        Ok(vec!["demo_lib".to_string()])
    }

    async fn current_design(&self) -> Result<Option<String>, BackendError> {
        Ok(None)
    }

    async fn create_design(&self, library: &str, cell: &str) -> Result<String, BackendError> {
        if self.refuse_create {
            return Err(BackendError::Rejected {
                op: DesignOp::CreateDesign,
                message: format!("library '{}' is not open", library),
            });
        }
        Ok(format!("{}:{}:schematic", library, cell))
    }

    async fn add_element(&self, _uri: &str, element: &ElementPlacement) -> Result<(), BackendError> {
        if element.cell == "UNKNOWN_X" {
            return Err(BackendError::Rejected {
                op: DesignOp::AddElement,
                message: "cell 'UNKNOWN_X' not found".to_string(),
            });
        }
        Ok(())
    }

    async fn add_wire(&self, _uri: &str, _points: &[[f64; 2]]) -> Result<(), BackendError> {
        Ok(())
    }

    async fn save_design(&self, _uri: &str) -> Result<(), BackendError> {
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn workflow(dir: &TempDir, backend: Arc<FakeBackend>) -> Arc<Workflow> {
    Arc::new(
        Workflow::new(Arc::new(PlanStore::new(dir.path().join("plans.json"))), backend)
            .with_policy(labrelay_config::CatalogPolicy::Permissive),
    )
}

// ===== plan_circuit =====

#[tokio::test]
async fn test_plan_circuit_stores_plan() {
    let dir = TempDir::new().unwrap();
    let tool = PlanCircuitTool::new(workflow(&dir, Arc::new(FakeBackend::default())));

    let envelope = tool
        .execute(json!({
            "circuit_name": "low pass",
            "circuit_type": "filter",
            "components": [
                {"type": "L", "name": "L1", "x": 0, "y": 0, "L": "10 nH"},
                {"type": "C", "name": "C1", "x": 50, "y": -25}
            ],
            "wires": [[[0, 0], [50, 0]]]
        }))
        .await;

    assert_eq!(envelope.status, EnvelopeStatus::Success);
    assert_eq!(envelope.payload["status"], "pending_confirmation");
    assert_eq!(envelope.payload["step_count"], 3);
    assert_eq!(envelope.payload["library"], "demo_lib");
    assert_eq!(envelope.payload["steps"].as_array().unwrap().len(), 3);
}

#[tokio::test]
async fn test_plan_circuit_bad_step_is_an_error_envelope() {
    let dir = TempDir::new().unwrap();
    let tool = PlanCircuitTool::new(workflow(&dir, Arc::new(FakeBackend::default())));

    let envelope = tool
        .execute(json!({
            "circuit_name": "broken",
            "components": [{"type": "R", "x": "left"}]
        }))
        .await;
    assert_eq!(envelope.status, EnvelopeStatus::Error);
    assert_eq!(envelope.payload["plan_error"], "invalid");
}

// ===== execute / populate =====

#[tokio::test]
async fn test_unknown_plan_lists_available_ids() {
    let dir = TempDir::new().unwrap();
    let wf = workflow(&dir, Arc::new(FakeBackend::default()));
    let planned = PlanCircuitTool::new(Arc::clone(&wf))
        .execute(json!({"circuit_name": "tank", "components": [{"type": "L"}]}))
        .await;
    let id = planned.payload["plan_id"].as_str().unwrap().to_string();

    let envelope = ExecutePlanTool::new(wf).execute(json!({"plan_id": "nope1234"})).await;
    assert_eq!(envelope.status, EnvelopeStatus::Error);
    assert_eq!(envelope.payload["available"], json!([id]));
    assert!(envelope.instruction.unwrap().contains(&id));
}

#[tokio::test]
async fn test_partial_population_through_wrapper() {
    let dir = TempDir::new().unwrap();
    let backend = Arc::new(FakeBackend::default());
    let wf = workflow(&dir, backend.clone());

    PlanCircuitTool::new(Arc::clone(&wf))
        .execute(json!({
            "circuit_name": "divider",
            "components": [
                {"type": "R", "name": "R1", "x": 0, "y": 0},
                {"type": "UNKNOWN_X", "name": "X1", "x": 50, "y": 0}
            ]
        }))
        .await;
    let executed = ExecutePlanTool::new(Arc::clone(&wf)).execute(json!({})).await;
    assert_eq!(executed.payload["created"], true);

    let raw = PopulatePlanTool::new(Arc::clone(&wf)).execute(json!({"plan_id": "latest"})).await;
    assert_eq!(raw.payload["placed"], 1);
    assert_eq!(raw.payload["failed"], 1);
    assert_eq!(raw.payload["success"], false);
    assert_eq!(raw.payload["failures"][0]["step"], "X1 (UNKNOWN_X)");

    let wrapped = ResultWrapper::new().wrap("add_components_from_plan", &json!({}), raw);
    assert_eq!(wrapped.status, EnvelopeStatus::Partial);
    // one save from execute, one from populate
    assert_eq!(backend.saves.load(Ordering::SeqCst), 2);

    let status = WorkflowStatusTool::new(wf).execute(json!({})).await;
    assert_eq!(status.payload["status"], "components_added");
}

#[tokio::test]
async fn test_failed_execute_is_a_structured_result() {
    let dir = TempDir::new().unwrap();
    let backend = Arc::new(FakeBackend {
        refuse_create: true,
        ..FakeBackend::default()
    });
    let wf = workflow(&dir, backend);
    PlanCircuitTool::new(Arc::clone(&wf))
        .execute(json!({"circuit_name": "tank", "components": [{"type": "L"}]}))
        .await;

    let raw = ExecutePlanTool::new(Arc::clone(&wf)).execute(json!({})).await;
    assert_eq!(raw.status, EnvelopeStatus::Error);
    assert_eq!(raw.payload["success"], false);
    assert_eq!(raw.payload["created"], false);
    assert_eq!(raw.payload["status"], "pending_confirmation");

    let wrapped = ResultWrapper::new().wrap("execute_circuit_plan", &json!({}), raw);
    assert_eq!(wrapped.status, EnvelopeStatus::Error);
    assert!(wrapped.summary.contains("demo_lib"));
    assert!(wrapped.instruction.is_some());
}

#[tokio::test]
async fn test_populate_before_execute_is_refused() {
    let dir = TempDir::new().unwrap();
    let wf = workflow(&dir, Arc::new(FakeBackend::default()));
    PlanCircuitTool::new(Arc::clone(&wf))
        .execute(json!({"circuit_name": "early", "components": [{"type": "C"}]}))
        .await;

    let envelope = PopulatePlanTool::new(wf).execute(json!({})).await;
    assert_eq!(envelope.status, EnvelopeStatus::Error);
    assert_eq!(envelope.payload["plan_error"], "invalid_transition");
}

// ===== Strict catalog =====

#[tokio::test]
async fn test_unknown_element_instruction_lists_accepted_types() {
    let dir = TempDir::new().unwrap();
    let strict = Arc::new(Workflow::new(
        Arc::new(PlanStore::new(dir.path().join("plans.json"))),
        Arc::new(FakeBackend::default()),
    ));
    let tool = PlanCircuitTool::new(Arc::clone(&strict));

    let refused = tool
        .execute(json!({"circuit_name": "line", "components": [{"type": "WAVEGUIDE"}]}))
        .await;
    assert_eq!(refused.payload["plan_error"], "unknown_element");
    let instruction = refused.instruction.unwrap();
    assert!(instruction.contains("MLIN"));
    assert!(instruction.contains("MSub"));

    // every type the instruction suggests is accepted
    let accepted = tool
        .execute(json!({
            "circuit_name": "line",
            "components": [
                {"type": "MSub", "name": "MSub1", "x": -200, "y": 200},
                {"type": "MLIN", "name": "TL1", "x": 0, "y": 0},
                {"type": "Term", "name": "Term1", "x": -100, "y": 0}
            ]
        }))
        .await;
    assert_eq!(accepted.status, EnvelopeStatus::Success);
    assert_eq!(accepted.payload["step_count"], 3);
}
