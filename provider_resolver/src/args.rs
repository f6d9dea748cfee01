use clap::{Parser, Subcommand};
use std::path::PathBuf;

use provider_resolver::ClientConfig;

#[derive(Debug, Parser)]
#[command(name = "provider_resolver")]
#[command(
    about = "Resolve extracted provider identities against the local directory and the NPI registry"
)]
pub struct Args {
    #[command(flatten)]
    pub config: ClientConfig,

    #[command(subcommand)]
    pub cmd: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Create the database schema and optionally seed the specialty vocabulary.
    Init(InitArgs),
    /// Resolve every row of an extracted-providers CSV.
    ResolveBatch(ResolveBatchArgs),
    /// Re-run queued resolutions that may succeed now.
    RetryPending(RetryPendingArgs),
    /// Query the NPI registry directly, applying the fallback order.
    LookupNpi(LookupNpiArgs),
    /// Record insurance plans accepted by a provider.
    LinkInsurance(LinkInsuranceArgs),
    /// Classify follow-up tasks and list nearby in-network providers.
    FollowUps(FollowUpsArgs),
}

#[derive(clap::Args, Debug, Clone)]
pub struct InitArgs {
    /// CSV with `code,description` columns loaded into the specialty vocabulary.
    #[arg(long)]
    pub specialties_csv: Option<PathBuf>,
}

#[derive(clap::Args, Debug, Clone)]
pub struct ResolveBatchArgs {
    /// Input CSV. Columns: first_name,last_name,degree,email,phone_number,npi,
    /// specialty,street,city,state,zip_code (all optional).
    #[arg(long)]
    pub input: PathBuf,

    /// Result CSV. Defaults to <input>.resolved.csv.
    #[arg(long)]
    pub output: Option<PathBuf>,

    /// Max concurrent resolutions.
    #[arg(long, default_value_t = 2)]
    pub concurrency: usize,
}

#[derive(clap::Args, Debug, Clone)]
pub struct RetryPendingArgs {
    #[arg(long, default_value_t = 100)]
    pub limit: usize,

    /// Entries that already failed this many times are left alone.
    #[arg(long, default_value_t = 5)]
    pub max_attempts: u32,
}

#[derive(clap::Args, Debug, Clone)]
pub struct LookupNpiArgs {
    #[arg(long)]
    pub first_name: String,

    #[arg(long)]
    pub last_name: String,

    #[arg(long)]
    pub city: Option<String>,

    #[arg(long)]
    pub state: Option<String>,
}

#[derive(clap::Args, Debug, Clone)]
pub struct LinkInsuranceArgs {
    #[arg(long)]
    pub npi: String,

    /// Insurance plan id; repeat for several.
    #[arg(long = "insurance-id", required = true)]
    pub insurance_ids: Vec<i64>,
}

#[derive(clap::Args, Debug, Clone)]
pub struct FollowUpsArgs {
    #[arg(long, allow_negative_numbers = true)]
    pub lat: f64,

    #[arg(long, allow_negative_numbers = true)]
    pub lng: f64,

    #[arg(long)]
    pub insurance_id: i64,

    /// Follow-up task text; repeat for several.
    #[arg(long = "task", required = true)]
    pub tasks: Vec<String>,

    /// Overrides the configured suggestion radius, in metres.
    #[arg(long)]
    pub max_distance_m: Option<f64>,
}
