use clap::Parser;

/// Runs a contract suite against a live HTTP API
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to the suite file
    #[arg(short, long, default_value = "kontrakt.toml")]
    pub path: String,

    /// Emit one JSON record per scenario instead of styled output
    #[arg(long)]
    pub json: bool,
}
