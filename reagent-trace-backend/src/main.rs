use clap::Parser;
use reagent_trace_backend::{config::Cli, run};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().unwrap_or_default();

    run(Cli::parse()).await
}
