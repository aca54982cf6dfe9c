use anyhow::Result;
use clap::Parser;
use spark_print::cli::{run, Cli};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt::init();
    tracing::info!("spark-print startup: tracing initialised, environment loaded");

    let cli = Cli::parse();
    let result = run(cli).await;
    match &result {
        Ok(_) => tracing::info!("spark-print completed successfully"),
        Err(e) => tracing::error!(error = %e, "spark-print exited with error"),
    }
    result
}
