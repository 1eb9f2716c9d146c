//! LabRelay - tool-calling agent for lab and design instruments

use clap::{Parser, Subcommand};
use tracing::error;
use tracing_subscriber::EnvFilter;

mod commands;

use commands::{
    call_command, chat_command, init_command, plan_execute_command, plan_list_command,
    plan_populate_command, plan_show_command, status_command, tools_command,
};

/// LabRelay - drive instruments and design tools through an agent
#[derive(Parser)]
#[command(name = "labrelay")]
#[command(about = "◆ Tool-calling agent for lab and design instruments")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Debug logging on stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize config and workspace
    Init,
    /// Chat with the agent
    Chat {
        /// Message to send; omit for interactive mode
        #[arg(short, long)]
        message: Option<String>,
        /// Conversation key
        #[arg(short, long, default_value = "default")]
        session: String,
    },
    /// List tools from every reachable tool server
    Tools,
    /// Call one tool directly
    Call {
        /// Tool name
        tool: String,
        /// Arguments as a JSON object
        #[arg(short, long, default_value = "{}")]
        args: String,
    },
    /// Inspect and drive circuit plans
    Plan {
        #[command(subcommand)]
        command: PlanCommands,
    },
    /// Show configuration and store status
    Status,
}

#[derive(Subcommand)]
enum PlanCommands {
    /// List stored plans, oldest first
    List,
    /// Show one plan (default: most recent)
    Show { id: Option<String> },
    /// Create the plan's empty schematic
    Execute { id: Option<String> },
    /// Place the plan's elements into its schematic
    Populate { id: Option<String> },
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let (label, outcome) = match cli.command {
        Commands::Init => ("Init", init_command().await),
        Commands::Chat { message, session } => ("Chat", chat_command(message, session).await),
        Commands::Tools => ("Tools", tools_command().await),
        Commands::Call { tool, args } => ("Call", call_command(tool, args).await),
        Commands::Plan { command } => match command {
            PlanCommands::List => ("Plan list", plan_list_command().await),
            PlanCommands::Show { id } => ("Plan show", plan_show_command(id).await),
            PlanCommands::Execute { id } => ("Plan execute", plan_execute_command(id).await),
            PlanCommands::Populate { id } => ("Plan populate", plan_populate_command(id).await),
        },
        Commands::Status => ("Status", status_command().await),
    };

    if let Err(e) = outcome {
        error!("{} failed: {:#}", label, e);
        std::process::exit(1);
    }
}
