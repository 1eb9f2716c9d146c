//! LabRelay command implementations

use anyhow::{bail, Context, Result};
use serde_json::Value;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use labrelay_agent::{from_model_call, register_plan_tools, AgentLoop, ResultWrapper, ToolRegistry};
use labrelay_config::{self, paths, Config};
use labrelay_mcp::{ClientManager, EnvelopeStatus, ProviderState, ToolCaller};
use labrelay_plan::{state_prompt, DesignOp, DesignOpTable, Plan, PlanStore, ToolDesignBackend, Workflow};
use labrelay_provider::{OpenAiCompatProvider, ToolCall};
use labrelay_session::ConversationStore;

/// Load the configuration with environment overrides applied, then validate it
async fn load_config() -> Result<Config> {
    let mut config = Config::load()
        .await
        .context("Cannot read the configuration")?;
    config.apply_env_overrides();
    config.validate().context("Configuration rejected")?;
    Ok(config)
}

fn plan_store(config: &Config) -> PlanStore {
    PlanStore::new(config.plans_path())
        .with_lock_timeout(Duration::from_millis(config.plan.lock_timeout_ms))
}

/// Connected tool servers plus the plan workflow, when the design tools are all present
struct Bench {
    manager: Arc<ClientManager>,
    workflow: Option<Arc<Workflow>>,
    missing: Vec<(DesignOp, String)>,
}

impl Bench {
    async fn connect(config: &Config) -> Result<Self> {
        let manager = Arc::new(
            ClientManager::from_config(&config.active_tool_servers())
                .context("No usable tool servers configured")?,
        );
        let report = manager.connect_all().await?;
        for (name, reason) in &report.degraded {
            warn!("◆ {} unavailable: {}", name, reason);
        }
        for collision in &report.collisions {
            warn!(
                "◆ '{}' from {} ignored; {} serves it",
                collision.tool, collision.dropped, collision.kept
            );
        }

        let table = DesignOpTable::from_overrides(&config.plan.design_tools)
            .context("Invalid plan.design_tools override")?;
        let mut missing = table.verify(manager.as_ref());
        if let Some(server) = config.plan.design_server.as_deref() {
            for op in DesignOp::ALL {
                let tool = table.tool(op);
                if let Some(provider) = manager.provider_for(tool) {
                    if provider != server {
                        missing.push((op, format!("{} (served by {})", tool, provider)));
                    }
                }
            }
        }

        let workflow = if missing.is_empty() {
            let caller: Arc<dyn ToolCaller> = manager.clone();
            let backend = Arc::new(ToolDesignBackend::new(caller, table));
            let workflow = Workflow::new(Arc::new(plan_store(config)), backend)
                .with_policy(config.plan.catalog_policy);
            Some(Arc::new(workflow))
        } else {
            warn!(
                "◆ Plan tools disabled; missing design operations: {}",
                describe_missing(&missing)
            );
            None
        };

        Ok(Self {
            manager,
            workflow,
            missing,
        })
    }

    fn registry(&self) -> ToolRegistry {
        let tools = self
            .manager
            .list_all_tools()
            .into_iter()
            .map(|routed| routed.descriptor)
            .collect();
        let mut registry = ToolRegistry::new().with_remote(self.manager.clone(), tools);
        if let Some(workflow) = &self.workflow {
            register_plan_tools(&mut registry, Arc::clone(workflow));
        }
        registry
    }

    fn require_workflow(&self) -> Result<Arc<Workflow>> {
        match &self.workflow {
            Some(workflow) => Ok(Arc::clone(workflow)),
            None => bail!(
                "Design tools incomplete; missing: {}",
                describe_missing(&self.missing)
            ),
        }
    }
}

fn describe_missing(missing: &[(DesignOp, String)]) -> String {
    missing
        .iter()
        .map(|(op, tool)| format!("{} → {}", op.key(), tool))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Initialize config and workspace
pub async fn init_command() -> Result<()> {
    println!("◆ Initializing LabRelay...");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let config = labrelay_config::init().await?;
    let workspace = config.workspace_path();
    create_template(&workspace, "LAB.md", LAB_MD).await?;

    println!("\n◆ LabRelay initialized");
    println!("\nNext steps:");
    println!(
        "  1. Add tool servers and a model endpoint to {}",
        paths::config_path().display()
    );
    println!("  2. Check them: labrelay tools");
    println!("  3. Start chatting: labrelay chat -m \"What is open right now?\"");

    Ok(())
}

async fn create_template(dir: &std::path::Path, filename: &str, content: &str) -> Result<()> {
    let path = dir.join(filename);
    if !path.exists() {
        tokio::fs::write(&path, content).await?;
        info!("◆ Created {}", path.display());
    }
    Ok(())
}

/// Chat with the agent
pub async fn chat_command(message: Option<String>, session: String) -> Result<()> {
    let config = load_config().await?;
    if !config.has_model_endpoint() {
        bail!(
            "No model endpoint configured. Set model.api_key or model.api_base in {}",
            paths::config_path().display()
        );
    }

    let provider = OpenAiCompatProvider::new(
        config.api_key().unwrap_or_default(),
        config.api_base(),
        Some(config.default_model()),
    );
    let bench = Bench::connect(&config).await?;
    let sessions = ConversationStore::new(paths::sessions_dir())
        .with_max_messages(config.session_max_messages())
        .with_idle_expiry(config.agent.session_idle_minutes)
        .with_max_sessions(config.agent.max_sessions);

    let mut agent = AgentLoop::new(provider, bench.registry(), sessions, &config);
    if let Some(workflow) = &bench.workflow {
        agent = agent.with_workflow(Arc::clone(workflow));
    }

    if let Some(msg) = message {
        let response = agent.process_direct(&msg, &session).await;
        println!("\n◆ {}", response);
    } else {
        println!("◆ Interactive mode (type 'exit' to quit)");
        println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

        loop {
            print!("◆ ");
            std::io::stdout().flush()?;

            let mut input = String::new();
            if std::io::stdin().read_line(&mut input)? == 0 {
                break;
            }

            let input = input.trim();
            if input.is_empty() {
                continue;
            }
            if input == "exit" || input == "quit" {
                break;
            }

            let response = agent.process_direct(input, &session).await;
            println!("\n◆ {}\n", response);
        }
    }

    bench.manager.shutdown().await;
    Ok(())
}

/// List tools from every reachable tool server
pub async fn tools_command() -> Result<()> {
    let config = load_config().await?;
    let bench = Bench::connect(&config).await?;

    println!("◆ Tool Servers");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    for status in bench.manager.provider_status() {
        let state = match &status.state {
            ProviderState::Connected => format!("[OK] {} tools", status.tool_count),
            ProviderState::Degraded(reason) => format!("[Degraded] {}", reason),
            ProviderState::Pending => "[Pending]".to_string(),
            ProviderState::Closed => "[Closed]".to_string(),
        };
        println!("{} ({}): {}", status.name, status.kind, state);
    }

    let registry = bench.registry();
    println!("\n◆ Tools");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    for descriptor in registry.descriptors() {
        let origin = bench
            .manager
            .provider_for(&descriptor.name)
            .filter(|_| !is_local(&bench, &descriptor.name))
            .unwrap_or_else(|| "local".to_string());
        let summary = descriptor.description.lines().next().unwrap_or_default();
        println!("  {} [{}] {}", descriptor.name, origin, summary);
    }

    if !bench.missing.is_empty() {
        println!(
            "\nPlan tools disabled; missing design operations: {}",
            describe_missing(&bench.missing)
        );
    }

    bench.manager.shutdown().await;
    Ok(())
}

fn is_local(bench: &Bench, tool: &str) -> bool {
    bench.workflow.is_some()
        && matches!(
            tool,
            "plan_circuit" | "execute_circuit_plan" | "add_components_from_plan" | "get_workflow_status"
        )
}

/// Call one tool directly and print its wrapped result
pub async fn call_command(tool: String, args: String) -> Result<()> {
    let args: Value = serde_json::from_str(&args).context("--args must be valid JSON")?;
    if !args.is_object() {
        bail!("--args must be a JSON object");
    }

    let config = load_config().await?;
    let bench = Bench::connect(&config).await?;
    let registry = bench.registry();

    let descriptor = registry
        .descriptor(&tool)
        .with_context(|| format!("Unknown tool '{}'", tool))?;
    let call = ToolCall {
        id: "cli".to_string(),
        name: tool.clone(),
        arguments: args,
    };
    let args = from_model_call(descriptor, &call)?;

    let raw = registry.execute(&tool, args.clone()).await;
    let envelope = ResultWrapper::new().wrap(&tool, &args, raw);
    println!("{}", serde_json::to_string_pretty(&envelope)?);

    bench.manager.shutdown().await;
    if envelope.status == EnvelopeStatus::Error {
        bail!("{}", envelope.summary);
    }
    Ok(())
}

/// List stored plans
pub async fn plan_list_command() -> Result<()> {
    let config = load_config().await?;
    let book = plan_store(&config).load().await?;

    if book.is_empty() {
        println!("No plans stored");
        return Ok(());
    }

    println!("Plans:");
    for plan in book.list() {
        println!(
            "  {}  {:<22} {:<20} {}",
            plan.id,
            plan.status.as_str(),
            plan.name,
            plan.target.uri
        );
    }
    Ok(())
}

fn print_plan(plan: &Plan) {
    println!("{}", state_prompt(plan));
    println!("\nSteps:");
    for (index, step) in plan.steps.iter().enumerate() {
        let outcome = plan
            .step_results
            .iter()
            .find(|r| r.index == index)
            .map(|r| {
                if r.success {
                    "[OK]".to_string()
                } else {
                    format!("[Failed] {}", r.message)
                }
            })
            .unwrap_or_default();
        println!("  {:>2}. {} {}", index + 1, step.label(), outcome);
    }
}

/// Show one plan
pub async fn plan_show_command(id: Option<String>) -> Result<()> {
    let config = load_config().await?;
    let book = plan_store(&config).load().await?;
    let id = book.resolve_id(id.as_deref())?;
    let plan = book
        .get(&id)
        .with_context(|| format!("Plan {} vanished from the store", id))?;
    print_plan(plan);
    Ok(())
}

/// Create the plan's empty schematic
pub async fn plan_execute_command(id: Option<String>) -> Result<()> {
    let config = load_config().await?;
    let bench = Bench::connect(&config).await?;
    let workflow = bench.require_workflow()?;

    let outcome = workflow.execute(id.as_deref()).await;
    bench.manager.shutdown().await;
    let report = outcome?;
    if !report.success {
        bail!(
            "Plan {} was not executed: {}",
            report.plan.id,
            report.error.unwrap_or_default()
        );
    }

    if report.created {
        println!("✓ Schematic created: {}", report.plan.target.uri);
    } else {
        println!("✓ Schematic already created: {}", report.plan.target.uri);
    }
    if !report.saved {
        println!("✗ Design was not saved");
    }
    println!("Open it in the design tool, then run: labrelay plan populate {}", report.plan.id);
    Ok(())
}

/// Place the plan's elements into its schematic
pub async fn plan_populate_command(id: Option<String>) -> Result<()> {
    let config = load_config().await?;
    let bench = Bench::connect(&config).await?;
    let workflow = bench.require_workflow()?;

    let outcome = workflow.populate(id.as_deref()).await;
    bench.manager.shutdown().await;
    let report = outcome?;

    print_plan(&report.plan);
    println!(
        "\n{} placed, {} failed{}",
        report.placed,
        report.failed,
        if report.saved { "" } else { " (not saved)" }
    );
    if !report.success {
        bail!("{} of {} steps failed", report.failed, report.plan.steps.len());
    }
    Ok(())
}

/// Show configuration and store status
pub async fn status_command() -> Result<()> {
    let config_path = paths::config_path();

    println!("◆ LabRelay Status");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!(
        "Config:    {} {}",
        config_path.display(),
        if config_path.exists() { "[OK]" } else { "[Missing]" }
    );

    let config = load_config().await?;
    let workspace = config.workspace_path();
    println!(
        "Workspace: {} {}",
        workspace.display(),
        if workspace.exists() { "[OK]" } else { "[Missing]" }
    );
    println!("Model:     {}", config.default_model());
    println!(
        "Endpoint:  {}",
        match (config.api_base(), config.api_key()) {
            (Some(base), _) => base,
            (None, Some(_)) => "[API key set]".to_string(),
            (None, None) => "[Missing]".to_string(),
        }
    );

    let servers = config.active_tool_servers();
    if servers.is_empty() {
        println!("Tool servers: [None configured]");
    } else {
        println!("Tool servers:");
        for server in &servers {
            let target = server
                .url
                .clone()
                .or_else(|| server.command.clone())
                .unwrap_or_default();
            println!("  {} ({}) {}", server.name, server.transport, target);
        }
    }

    let plans_path = config.plans_path();
    match plan_store(&config).load().await {
        Ok(book) => println!("Plans:     {} ({} stored)", plans_path.display(), book.len()),
        Err(e) => println!("Plans:     {} [Unreadable: {}]", plans_path.display(), e),
    }
    println!(
        "Control:   {} calls total, {} per tool, loop after {} repeats",
        config.control.max_total_calls, config.control.max_calls_per_tool, config.control.loop_threshold
    );

    println!("\n◆ Ready");
    Ok(())
}

// Template content
const LAB_MD: &str = r#"# Lab Notes

Describe the bench here: which instruments and design libraries are in use,
naming conventions for cells, and anything the agent should always respect.
"#;
