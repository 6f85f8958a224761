use clap::Parser;
use miette::Result;

use kontrakt::cli::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    kontrakt::run(cli).await?;

    Ok(())
}
