use clap::{Parser, Subcommand};
use provider_resolver::ClientConfig;

#[derive(Parser, Debug)]
#[command(name = "site-backend")]
#[command(about = "Provider resolution and follow-up suggestion API", long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub cmd: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Serve the HTTP API.
    Serve(ServeArgs),
}

#[derive(clap::Args, Debug, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub config: ClientConfig,

    #[arg(long, env = "HOST", default_value = "127.0.0.1")]
    pub host: String,

    #[arg(long, env = "PORT", default_value_t = 8787)]
    pub port: u16,
}
