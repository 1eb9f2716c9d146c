//! Propose → execute → populate

use std::sync::Arc;

use chrono::Local;
use labrelay_config::CatalogPolicy;
use serde::Serialize;
use tracing::{info, warn};

use crate::backend::{DesignBackend, ElementPlacement};
use crate::catalog;
use crate::error::{PlanError, Result};
use crate::model::{Plan, PlanStatus, Step, StepResult, Target};
use crate::store::{PlanBook, PlanStore};

/// Inputs for a new plan
#[derive(Debug, Clone, Default)]
pub struct ProposeRequest {
    pub name: String,
    pub kind: String,
    pub description: String,
    pub steps: Vec<Step>,
    /// Target library; the first writable library when absent
    pub library: Option<String>,
    /// Target cell; derived from the name when absent
    pub cell: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecuteReport {
    pub plan: Plan,
    /// False when the plan had already been executed or creation failed
    pub created: bool,
    pub saved: bool,
    /// False when the design tool refused or failed to create the design
    pub success: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PopulateReport {
    pub plan: Plan,
    pub placed: usize,
    pub failed: usize,
    pub saved: bool,
    pub success: bool,
}

impl PopulateReport {
    pub fn failures(&self) -> impl Iterator<Item = &StepResult> {
        self.plan.step_results.iter().filter(|r| !r.success)
    }
}

pub struct Workflow {
    store: Arc<PlanStore>,
    backend: Arc<dyn DesignBackend>,
    policy: CatalogPolicy,
}

impl Workflow {
    pub fn new(store: Arc<PlanStore>, backend: Arc<dyn DesignBackend>) -> Self {
        Self {
            store,
            backend,
            policy: CatalogPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: CatalogPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn store(&self) -> &PlanStore {
        &self.store
    }

    pub fn backend(&self) -> &Arc<dyn DesignBackend> {
        &self.backend
    }

    /// Validate and persist a new plan awaiting confirmation
    pub async fn propose(&self, request: ProposeRequest) -> Result<Plan> {
        let name = request.name.trim();
        if name.is_empty() {
            return Err(PlanError::Invalid("a plan needs a name".to_string()));
        }
        if request.steps.is_empty() {
            return Err(PlanError::Invalid(format!("plan '{}' has no steps", name)));
        }
        for step in &request.steps {
            if let Step::Instance { element, .. } = step {
                catalog::validate(element, self.policy)?;
            }
        }

        let library = self.resolve_library(request.library.as_deref()).await?;
        let cell = request
            .cell
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| cell_name(name));
        let target = Target::new(library, cell);

        let now = Local::now();
        let mut plan = Plan {
            id: String::new(),
            name: name.to_string(),
            kind: request.kind,
            description: request.description,
            status: PlanStatus::PendingConfirmation,
            target,
            steps: request.steps,
            step_results: Vec::new(),
            sequence: 0,
            created_at: now,
            updated_at: now,
            last_error: None,
            metadata: Default::default(),
        };

        let plan = self
            .store
            .update(move |book| {
                plan.id = fresh_id(book);
                plan.sequence = book.next_sequence();
                book.insert(plan.clone());
                Ok(plan)
            })
            .await?;

        info!(
            "◆ PLAN {} PROPOSED: {} steps → {}",
            plan.id,
            plan.steps.len(),
            plan.target.uri
        );
        Ok(plan)
    }

    async fn resolve_library(&self, hint: Option<&str>) -> Result<String> {
        if let Some(hint) = hint.map(str::trim).filter(|h| !h.is_empty()) {
            if catalog::is_component_library(hint) {
                return Err(PlanError::NoWritableTarget(format!(
                    "{} is a component library",
                    hint
                )));
            }
            return Ok(hint.to_string());
        }

        let libraries = self
            .backend
            .list_libraries()
            .await
            .map_err(|e| PlanError::NoWritableTarget(e.to_string()))?;
        libraries
            .into_iter()
            .find(|lib| !catalog::is_component_library(lib))
            .ok_or_else(|| {
                PlanError::NoWritableTarget("no writable library is open".to_string())
            })
    }

    /// Create the empty design for a plan; repeat calls are no-ops
    pub async fn execute(&self, plan_id: Option<&str>) -> Result<ExecuteReport> {
        let mut locked = self.store.lock().await?;
        let id = locked.book.resolve_id(plan_id)?;
        let mut plan = fetch(&locked.book, &id)?;

        if plan.status.is_executed() {
            info!("◆ PLAN {} ALREADY EXECUTED ({})", plan.id, plan.status);
            return Ok(ExecuteReport {
                plan,
                created: false,
                saved: false,
                success: true,
                error: None,
            });
        }
        if !plan.status.can_move_to(PlanStatus::SchematicCreated) {
            return Err(PlanError::InvalidTransition {
                id: plan.id,
                from: plan.status,
                to: PlanStatus::SchematicCreated,
            });
        }

        let created = self
            .backend
            .create_design(&plan.target.library, &plan.target.cell)
            .await;
        let uri = match created {
            Ok(uri) => uri,
            Err(e) => {
                warn!("◆ PLAN {} EXECUTION FAILED: {}", plan.id, e);
                plan.last_error = Some(e.to_string());
                plan.updated_at = Local::now();
                locked.book.insert(plan.clone());
                locked.commit().await?;
                return Ok(ExecuteReport {
                    plan,
                    created: false,
                    saved: false,
                    success: false,
                    error: Some(e.to_string()),
                });
            }
        };

        plan.target.uri = uri;
        plan.last_error = None;
        plan.transition(PlanStatus::SchematicCreated)?;
        locked.book.insert(plan.clone());
        locked.commit().await?;

        let saved = match self.backend.save_design(&plan.target.uri).await {
            Ok(()) => true,
            Err(e) => {
                warn!("◆ SAVE AFTER CREATE FAILED FOR {}: {}", plan.target.uri, e);
                false
            }
        };

        info!("◆ PLAN {} EXECUTED → {}", plan.id, plan.target.uri);
        Ok(ExecuteReport {
            plan,
            created: true,
            saved,
            success: true,
            error: None,
        })
    }

    /// Place every step into the executed design, then save once
    pub async fn populate(&self, plan_id: Option<&str>) -> Result<PopulateReport> {
        let mut locked = self.store.lock().await?;
        let id = locked.book.resolve_id(plan_id)?;
        let mut plan = fetch(&locked.book, &id)?;

        if !plan.status.is_executed() {
            return Err(PlanError::InvalidTransition {
                id: plan.id,
                from: plan.status,
                to: PlanStatus::ComponentsAdded,
            });
        }

        let uri = plan.target.uri.clone();
        let mut results = Vec::with_capacity(plan.steps.len());
        for (index, step) in plan.steps.iter().enumerate() {
            results.push(self.place(index, step, &uri).await);
        }

        let saved = match self.backend.save_design(&uri).await {
            Ok(()) => true,
            Err(e) => {
                warn!("◆ SAVE FAILED FOR {}: {}", uri, e);
                false
            }
        };

        let placed = results.iter().filter(|r| r.success).count();
        let failed = results.len() - placed;
        plan.step_results = results;
        plan.last_error = (failed > 0).then(|| format!("{} of {} steps failed", failed, plan.steps.len()));
        let next = if placed == 0 {
            PlanStatus::Failed
        } else {
            PlanStatus::ComponentsAdded
        };
        plan.transition(next)?;
        locked.book.insert(plan.clone());
        locked.commit().await?;

        info!(
            "◆ PLAN {} POPULATED: {} placed, {} failed, saved={}",
            plan.id, placed, failed, saved
        );
        Ok(PopulateReport {
            plan,
            placed,
            failed,
            saved,
            success: failed == 0,
        })
    }

    async fn place(&self, index: usize, step: &Step, uri: &str) -> StepResult {
        let label = step.label();
        match step {
            Step::Instance {
                element,
                name,
                x,
                y,
                angle,
                params,
            } => {
                let (library, cell) = catalog::resolve(element);
                let placement = ElementPlacement {
                    library: library.to_string(),
                    cell: cell.clone(),
                    name: name.clone(),
                    x: *x,
                    y: *y,
                    angle: *angle,
                    params: params.clone(),
                };
                let outcome = self.backend.add_element(uri, &placement).await;
                StepResult {
                    index,
                    label,
                    success: outcome.is_ok(),
                    message: outcome.err().map_or_else(|| "placed".to_string(), |e| e.to_string()),
                    library: Some(library.to_string()),
                    cell: Some(cell),
                }
            }
            Step::Wire { points } => {
                let outcome = self.backend.add_wire(uri, points).await;
                StepResult {
                    index,
                    label,
                    success: outcome.is_ok(),
                    message: outcome.err().map_or_else(|| "wired".to_string(), |e| e.to_string()),
                    library: None,
                    cell: None,
                }
            }
        }
    }

    pub async fn status(&self, plan_id: Option<&str>) -> Result<Plan> {
        let book = self.store.load().await?;
        let id = book.resolve_id(plan_id)?;
        fetch(&book, &id)
    }

    /// All plans in creation order
    pub async fn list(&self) -> Result<Vec<Plan>> {
        let book = self.store.load().await?;
        Ok(book.list().into_iter().cloned().collect())
    }

    /// System prompt fragment describing the latest plan
    pub async fn state_prompt(&self) -> Result<Option<String>> {
        let book = self.store.load().await?;
        Ok(book.latest().map(state_prompt))
    }
}

fn fetch(book: &PlanBook, id: &str) -> Result<Plan> {
    book.get(id).cloned().ok_or_else(|| PlanError::NotFound {
        requested: id.to_string(),
        available: book.list().iter().map(|p| p.id.clone()).collect(),
    })
}

fn fresh_id(book: &PlanBook) -> String {
    loop {
        let id: String = uuid::Uuid::new_v4().simple().to_string()[..8].to_string();
        if !book.contains(&id) {
            return id;
        }
    }
}

/// Cell names are identifiers
fn cell_name(name: &str) -> String {
    let cell: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    match cell.chars().next() {
        Some(c) if c.is_ascii_alphabetic() => cell,
        _ => format!("cell_{}", cell),
    }
}

pub fn state_prompt(plan: &Plan) -> String {
    let headline = match plan.status {
        PlanStatus::PendingConfirmation => {
            "### Current plan: PENDING CONFIRMATION\n\
             The plan is waiting for the user. Show it and ask for confirmation \
             before calling `execute_circuit_plan`."
        }
        PlanStatus::SchematicCreated => {
            "### Current plan: SCHEMATIC CREATED\n\
             The empty schematic exists. Ask the user to open it, then call \
             `add_components_from_plan` once they confirm."
        }
        PlanStatus::ComponentsAdded => {
            "### Current plan: COMPONENTS ADDED\n\
             The design is populated and saved. Start a new plan with `plan_circuit` \
             if the user wants another circuit."
        }
        PlanStatus::Failed => {
            "### Current plan: FAILED\n\
             No step could be placed. Report the failures and propose a corrected plan."
        }
    };

    let mut prompt = format!(
        "{}\n\n**Context:**\n- Plan ID: `{}`\n- Design URI: `{}`",
        headline, plan.id, plan.target.uri
    );
    if !plan.step_results.is_empty() {
        prompt.push_str(&format!(
            "\n- Progress: {}/{} steps",
            plan.succeeded_steps(),
            plan.steps.len()
        ));
    }
    if let Some(error) = &plan.last_error {
        prompt.push_str(&format!("\n- Last error: {}", error));
    }
    prompt
}
