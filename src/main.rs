mod cli;

use clap::Parser;
use cli::tail::TailOptions;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "eventlink")]
#[command(about = "Live surveillance event client", long_about = None)]
struct Cli {
    #[arg(long = "dev")]
    dev: bool,

    #[arg(long = "config", default_value = "config.json")]
    config: String,

    /// Access token of the console session
    #[arg(long = "token")]
    token: String,

    #[arg(long = "user")]
    user: String,

    #[arg(long = "tenant")]
    tenant: String,

    #[arg(long = "role", default_value = "admin")]
    role: String,

    /// Comma separated event types, defaults to every console event type
    #[arg(long = "events", value_delimiter = ',')]
    events: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Dev mode traces everything, otherwise RUST_LOG or info
    let filter = if cli.dev {
        EnvFilter::new("trace")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    cli::tail::run(TailOptions {
        config_path: cli.config,
        token: cli.token,
        user_id: cli.user,
        tenant_id: cli.tenant,
        role: cli.role,
        events: cli.events,
    })
    .await
}
