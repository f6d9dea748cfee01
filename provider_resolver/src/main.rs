mod args;

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use csv::Reader;
use serde::Deserialize;
use std::{collections::BTreeSet, path::Path};

use args::{Args, Command};
use provider_resolver::batch::resolve_batch;
use provider_resolver::constants::NPPES_API_DOC_URL;
use provider_resolver::registry::ProviderRegistry;
use provider_resolver::vocabulary::upsert_specialties;
use provider_resolver::{Database, GeoPoint, PatientContext, SpecialtyVocabulary};

#[derive(Debug, Deserialize)]
struct SpecialtySeedRow {
    code: String,
    #[serde(default)]
    description: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = Args::parse();
    let config = args.config;

    match args.cmd {
        Command::Init(cmd) => {
            let db = Database::open(&config.db_path)?;
            println!("Initialized database {}", config.db_path.display());
            if let Some(path) = cmd.specialties_csv {
                let vocabulary = read_specialties(&path)?;
                let written = upsert_specialties(&db, &vocabulary)
                    .await
                    .context("Failed seeding specialty vocabulary")?;
                println!("Loaded {written} specialties from {}", path.display());
            }
            let vocabulary = SpecialtyVocabulary::load(&db).await?;
            println!("Specialty vocabulary holds {} codes.", vocabulary.len());
        }
        Command::ResolveBatch(cmd) => {
            println!("NPI API reference: {NPPES_API_DOC_URL}");
            let services = config.connect().await?;
            let output = cmd
                .output
                .clone()
                .unwrap_or_else(|| cmd.input.with_extension("resolved.csv"));
            let summary =
                resolve_batch(&services.deferred, &cmd.input, &output, cmd.concurrency).await?;
            println!(
                "Wrote {} results to {} (resolved={} pending={} invalid={} failed={})",
                summary.processed,
                output.display(),
                summary.resolved,
                summary.pending,
                summary.invalid,
                summary.failed
            );
            println!(
                "Directory now holds {} providers; {} resolutions pending.",
                services.directory.count().await?,
                services.deferred.queue().count().await?
            );
        }
        Command::RetryPending(cmd) => {
            let services = config.connect().await?;
            let summary = services
                .deferred
                .retry_pending(cmd.limit, cmd.max_attempts)
                .await
                .context("Failed retrying pending resolutions")?;
            println!(
                "Retried {} pending resolutions: resolved={} still_pending={} discarded={}",
                summary.attempted, summary.resolved, summary.still_pending, summary.discarded
            );
        }
        Command::LookupNpi(cmd) => {
            println!("NPI API reference: {NPPES_API_DOC_URL}");
            let registry = config.registry(config.http_client()?);
            let found = registry
                .lookup(
                    &cmd.first_name,
                    &cmd.last_name,
                    cmd.city.as_deref(),
                    cmd.state.as_deref(),
                )
                .await
                .context("NPI registry lookup failed")?;
            match found {
                Some(m) => println!("{}", serde_json::to_string_pretty(&m)?),
                None => println!(
                    "No registry match for {} {}.",
                    cmd.first_name, cmd.last_name
                ),
            }
        }
        Command::LinkInsurance(cmd) => {
            let db = Database::open(&config.db_path)?;
            let directory = provider_resolver::ProviderDirectory::new(db);
            let ids: BTreeSet<i64> = cmd.insurance_ids.iter().copied().collect();
            if !directory.add_insurances(&cmd.npi, &ids).await? {
                return Err(anyhow!("No provider {} in the directory", cmd.npi));
            }
            println!("Linked {} insurance plans to {}", ids.len(), cmd.npi);
        }
        Command::FollowUps(cmd) => {
            let services = config.connect().await?;
            let planner = services.planner.ok_or_else(|| {
                anyhow!("Follow-up suggestions need OPENAI_API_KEY (or --openai-api-key)")
            })?;
            let patient = PatientContext {
                location: GeoPoint {
                    lat: cmd.lat,
                    lng: cmd.lng,
                },
                insurance_id: cmd.insurance_id,
            };
            let suggestions = planner
                .suggest(&cmd.tasks, patient, cmd.max_distance_m)
                .await
                .context("Failed building follow-up suggestions")?;
            println!("{}", serde_json::to_string_pretty(&suggestions)?);
        }
    }
    Ok(())
}

fn read_specialties(path: &Path) -> Result<SpecialtyVocabulary> {
    let mut reader = Reader::from_path(path)
        .with_context(|| format!("Failed opening specialties CSV {}", path.display()))?;
    let mut entries = Vec::new();
    for (idx, row) in reader.deserialize::<SpecialtySeedRow>().enumerate() {
        let row = row.with_context(|| format!("Failed parsing specialties CSV row {}", idx + 1))?;
        entries.push((row.code, row.description));
    }
    Ok(SpecialtyVocabulary::new(entries))
}
