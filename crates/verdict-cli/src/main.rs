use anyhow::Context;
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;
use verdict_core::prelude::*;
use verdict_core::{CompletionBarrier, ScopeRef};

mod simulate;

use simulate::{run_simulator, SimulatorConfig};

fn cli() -> Command {
    Command::new("verdict")
        .version(verdict_core::VERSION)
        .about("Hierarchical evidence collection and validation orchestrator")
        .arg(
            Arg::new("config")
                .long("config")
                .global(true)
                .value_parser(value_parser!(PathBuf))
                .help("Orchestrator configuration file (TOML)"),
        )
        .arg(
            Arg::new("json-logs")
                .long("json-logs")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Emit logs as JSON lines"),
        )
        .subcommand_required(true)
        .subcommand(
            Command::new("simulate")
                .about("Run one session over a synthetic hierarchy")
                .arg(
                    Arg::new("pages")
                        .long("pages")
                        .default_value("10")
                        .value_parser(value_parser!(usize))
                        .help("Pages to generate"),
                )
                .arg(
                    Arg::new("tabs")
                        .long("tabs")
                        .default_value("5")
                        .value_parser(value_parser!(usize))
                        .help("Tabs per page"),
                )
                .arg(
                    Arg::new("params")
                        .long("params")
                        .default_value("10")
                        .value_parser(value_parser!(usize))
                        .help("Parameters per tab"),
                )
                .arg(
                    Arg::new("deferred")
                        .long("deferred")
                        .default_value("20")
                        .value_parser(value_parser!(u32).range(0..=100))
                        .help("Percentage of parameters answered out-of-band"),
                )
                .arg(
                    Arg::new("failures")
                        .long("failures")
                        .default_value("0")
                        .value_parser(value_parser!(u32).range(0..=100))
                        .help("Percentage of connector calls that fail"),
                )
                .arg(
                    Arg::new("lost")
                        .long("lost")
                        .default_value("0")
                        .value_parser(value_parser!(u32).range(0..=100))
                        .help("Percentage of deferred searches never answered"),
                )
                .arg(
                    Arg::new("max-delay-ms")
                        .long("max-delay-ms")
                        .default_value("50")
                        .value_parser(value_parser!(u64))
                        .help("Upper bound of simulated source latency"),
                )
                .arg(
                    Arg::new("seed")
                        .long("seed")
                        .default_value("42")
                        .value_parser(value_parser!(u64))
                        .help("Random seed for reproducibility"),
                ),
        )
        .subcommand(
            Command::new("stress")
                .about("Hammer completion barriers from concurrent tasks")
                .arg(
                    Arg::new("barriers")
                        .long("barriers")
                        .default_value("1000")
                        .value_parser(value_parser!(usize))
                        .help("Number of barriers"),
                )
                .arg(
                    Arg::new("children")
                        .long("children")
                        .default_value("64")
                        .value_parser(value_parser!(usize))
                        .help("Decrements per barrier"),
                ),
        )
        .subcommand(
            Command::new("run")
                .about("Resolve the preconfigured values of a project folder")
                .arg(
                    Arg::new("root")
                        .long("root")
                        .required(true)
                        .value_parser(value_parser!(PathBuf))
                        .help("Configuration root directory"),
                )
                .arg(
                    Arg::new("folder")
                        .long("folder")
                        .required(true)
                        .help("Project folder under the root"),
                )
                .arg(
                    Arg::new("key")
                        .long("key")
                        .action(ArgAction::Append)
                        .help("Key parameter as name=value"),
                )
                .arg(
                    Arg::new("page")
                        .long("page")
                        .action(ArgAction::Append)
                        .help("Restrict to these pages"),
                ),
        )
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(args: &ArgMatches) -> anyhow::Result<OrchestratorConfig> {
    match args.get_one::<PathBuf>("config") {
        Some(path) => OrchestratorConfig::load(path)
            .with_context(|| format!("loading configuration from {}", path.display())),
        None => Ok(OrchestratorConfig::new()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let matches = cli().get_matches();
    init_tracing(matches.get_flag("json-logs"));
    let config = load_config(&matches)?;

    let ok = match matches.subcommand() {
        Some(("simulate", args)) => simulate(config, args).await?,
        Some(("stress", args)) => stress(args).await?,
        Some(("run", args)) => run(config, args).await?,
        _ => unreachable!("subcommand is required"),
    };
    std::process::exit(if ok { 0 } else { 1 });
}

async fn simulate(config: OrchestratorConfig, args: &ArgMatches) -> anyhow::Result<bool> {
    let sim = SimulatorConfig {
        seed: *args.get_one::<u64>("seed").context("seed")?,
        pages: *args.get_one::<usize>("pages").context("pages")?,
        tabs: *args.get_one::<usize>("tabs").context("tabs")?,
        params: *args.get_one::<usize>("params").context("params")?,
        deferred_percent: *args.get_one::<u32>("deferred").context("deferred")?,
        failure_percent: *args.get_one::<u32>("failures").context("failures")?,
        lost_percent: *args.get_one::<u32>("lost").context("lost")?,
        max_delay: Duration::from_millis(*args.get_one::<u64>("max-delay-ms").context("delay")?),
    };

    println!("Running simulation...");
    println!("Hierarchy: {} pages x {} tabs x {} parameters", sim.pages, sim.tabs, sim.params);
    println!("Seed: {}", sim.seed);
    println!();

    let report = run_simulator(config, sim).await?;
    println!("{}", report.generate_text());
    Ok(report.settled())
}

async fn stress(args: &ArgMatches) -> anyhow::Result<bool> {
    let barriers = *args.get_one::<usize>("barriers").context("barriers")?;
    let children = *args.get_one::<usize>("children").context("children")?;

    println!("Running barrier stress test...");
    println!("Barriers: {barriers}");
    println!("Decrements per barrier: {children}");
    println!();

    let start = Instant::now();
    let fired = Arc::new(AtomicUsize::new(0));
    let mut tasks = Vec::with_capacity(barriers * children);
    for _ in 0..barriers {
        let barrier = Arc::new(CompletionBarrier::new(ScopeRef::Session, children));
        for _ in 0..children {
            let barrier = barrier.clone();
            let fired = fired.clone();
            tasks.push(tokio::spawn(async move {
                if barrier.decrement().fired() {
                    fired.fetch_add(1, Ordering::SeqCst);
                }
            }));
        }
    }
    for task in tasks {
        task.await?;
    }

    let fired = fired.load(Ordering::SeqCst);
    let expected = if children == 0 { 0 } else { barriers };
    println!("Barrier Stress Report:");
    println!("  Decrements: {}", barriers * children);
    println!("  Fired: {fired} (expected {expected})");
    println!("  Time: {}ms", start.elapsed().as_millis());
    Ok(fired == expected)
}

async fn run(config: OrchestratorConfig, args: &ArgMatches) -> anyhow::Result<bool> {
    let root = args.get_one::<PathBuf>("root").context("root")?;
    let folder = args.get_one::<String>("folder").context("folder")?;

    let mut request = SessionRequest::new(folder.as_str());
    for pair in args.get_many::<String>("key").unwrap_or_default() {
        let (name, value) = pair
            .split_once('=')
            .with_context(|| format!("key `{pair}` is not name=value"))?;
        request = request.with_key(name, value);
    }
    let pages: Vec<String> = args
        .get_many::<String>("page")
        .unwrap_or_default()
        .cloned()
        .collect();

    let store = Arc::new(FsConfigStore::new(root));
    let orchestrator = Orchestrator::new(config, Collaborators::new(store))?;
    let session = orchestrator.create_session(request).await?;
    orchestrator
        .execute(session, ExecutionConfig::new().with_pages(pages).preconfigured_only())
        .await?;

    let settled = orchestrator
        .wait_until_settled(session, orchestrator.config().connector_timeout())
        .await?;
    orchestrator.shutdown().await;

    match settled {
        Some(snapshot) => {
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
            Ok(snapshot.status != Some(ValidationStatus::Failed))
        }
        None => {
            tracing::error!(%session, "session did not settle");
            Ok(false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        cli().debug_assert();
    }

    #[test]
    fn parses_run_arguments() {
        let matches = cli()
            .try_get_matches_from([
                "verdict", "run", "--root", "/srv", "--folder", "billing", "--key", "account=42",
                "--page", "Orders", "--page", "Invoices",
            ])
            .unwrap();
        let (name, args) = matches.subcommand().unwrap();
        assert_eq!(name, "run");
        let pages: Vec<&String> = args.get_many::<String>("page").unwrap().collect();
        assert_eq!(pages, ["Orders", "Invoices"]);
    }

    #[tokio::test]
    async fn barrier_stress_fires_once_per_barrier() {
        let matches = cli()
            .try_get_matches_from(["verdict", "stress", "--barriers", "20", "--children", "16"])
            .unwrap();
        let (_, args) = matches.subcommand().unwrap();
        assert!(stress(args).await.unwrap());
    }
}
