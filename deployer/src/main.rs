use clap::{Parser, Subcommand};
use deployer::{
    define_stack, detect_runtime, Deployment, DockerProvider, Engine, StackContext, StateStore,
};
use resources::{Provider, StackConfig};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "deployer")]
#[command(about = "Deploy the cart services stack to a local container runtime")]
struct Cli {
    /// Stack to operate on
    #[arg(short, long, env = "STACK", default_value = "dev")]
    stack: String,
    /// Directory holding Stack.<stack>.toml and the state directory
    #[arg(long, default_value = ".")]
    config_dir: PathBuf,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show what `up` would change
    Preview,
    /// Create or update the stack
    Up,
    /// Remove every resource of the stack
    Destroy,
    /// Print the outputs of the last update
    Outputs,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let store = StateStore::new(&cli.config_dir);

    match cli.command {
        Commands::Preview => {
            let deployment = load_deployment(&cli)?;
            let engine = connect(store).await?;
            println!("Previewing update of stack '{}':", cli.stack);
            println!("{}", engine.preview(&deployment)?);
        }
        Commands::Up => {
            let deployment = load_deployment(&cli)?;
            let engine = connect(store).await?;
            println!("Updating stack '{}':", cli.stack);
            let result = engine.up(&deployment).await?;
            println!("{}", result.plan);
            print_outputs(&result.outputs);
        }
        Commands::Destroy => {
            let engine = connect(store).await?;
            println!("Destroying stack '{}':", cli.stack);
            let plan = engine.destroy(&cli.stack).await?;
            println!("{}", plan);
        }
        Commands::Outputs => {
            print_outputs(&store.load(&cli.stack)?.outputs);
        }
    }

    Ok(())
}

/// Configuration is read before anything touches the container runtime
fn load_deployment(cli: &Cli) -> Result<Deployment, Box<dyn std::error::Error>> {
    let config = StackConfig::load(&cli.config_dir, &cli.stack)?;
    let ctx = StackContext::from_current_dir(&cli.stack)?;
    Ok(define_stack(&config, &ctx)?)
}

async fn connect(store: StateStore) -> Result<Engine, Box<dyn std::error::Error>> {
    let runtime = detect_runtime();
    let provider = DockerProvider::new(runtime)?;

    if let Err(e) = provider.health_check().await {
        error!("Health check failed: {}", e);
        return Err(e.into());
    }
    info!(runtime = provider.provider_name(), "Container runtime ready");

    Ok(Engine::new(Box::new(provider), store))
}

fn print_outputs(outputs: &BTreeMap<String, String>) {
    if outputs.is_empty() {
        println!("No outputs recorded. Run `deployer up` first.");
        return;
    }
    println!("Outputs:");
    for (name, value) in outputs {
        println!("  {}: {}", name, value);
    }
}
