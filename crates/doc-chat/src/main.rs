// doc-chat/crates/doc-chat/src/main.rs

#[cfg(feature = "cli")]
use clap::{Parser, Subcommand};
#[cfg(feature = "cli")]
use doc_chat::{auth::JwtVerifier, config::Config, run_server, telemetry};

#[cfg(feature = "cli")]
#[derive(Parser)]
#[command(name = "doc-chat", version, about = "Document-aware chat server")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[cfg(feature = "cli")]
#[derive(Subcommand)]
enum Command {
    /// Run the HTTP server (default)
    Serve,
    /// Print a bearer token for OWNER signed with JWT_SECRET
    IssueToken {
        owner: String,
        #[arg(long, default_value_t = 3600)]
        ttl_secs: u64,
    },
}

#[cfg(feature = "cli")]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init_tracing();
    let cli = Cli::parse();
    let cfg = Config::from_env()?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => {
            println!("Starting doc-chat on {}:{}", cfg.api_host, cfg.api_port);
            run_server(cfg).await
        }
        Command::IssueToken { owner, ttl_secs } => {
            let token = JwtVerifier::new(&cfg.jwt_secret).issue_token(&owner, ttl_secs)?;
            println!("{}", token);
            Ok(())
        }
    }
}

#[cfg(not(feature = "cli"))]
fn main() {
    println!("CLI feature not enabled. Enable with --features cli");
}
