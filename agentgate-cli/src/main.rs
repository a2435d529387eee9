use clap::Parser;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = agentgate_cli::Cli::parse();
    agentgate_cli::run(cli).await
}
