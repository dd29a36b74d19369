use clap::Parser;
use engine::{EngineError, QueryConfig, QueryDriver, QueryEngine, TargetSpec};
use log::info;
use protocol::codecs;
use std::time::{Duration, Instant};

#[derive(Parser, Debug)]
#[command(author, version, about = "Query game servers and print the results as JSON", long_about = None)]
struct Args {
    /// Servers to query, as PROTOCOL:HOST[:PORT]
    targets: Vec<String>,

    /// Also fetch server rules
    #[arg(short = 'R', long)]
    rules: bool,

    /// Also fetch the player list
    #[arg(short = 'P', long)]
    players: bool,

    /// Re-sends per phase after the first attempt
    #[arg(long, default_value = "3")]
    retries: u32,

    /// Milliseconds to wait for a reply before re-sending
    #[arg(long, default_value = "500")]
    interval_ms: u64,

    /// Log codec errors for each target
    #[arg(long)]
    show_errors: bool,

    /// Protocol parameter passed to every target, as KEY=VALUE
    #[arg(long = "param", value_parser = parse_param)]
    params: Vec<(String, String)>,

    /// Treat targets as broadcast addresses and report every host that answers
    #[arg(short = 'b', long)]
    broadcast: bool,

    /// Local address to bind
    #[arg(long, default_value = "0.0.0.0:0")]
    bind: String,

    /// Print the supported protocols and exit
    #[arg(long)]
    list_protocols: bool,
}

fn parse_param(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .ok_or_else(|| format!("expected KEY=VALUE, got {:?}", raw))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    if args.list_protocols {
        for codec in codecs::all() {
            println!("{:<10} {:>5}  {}", codec.id(), codec.default_port(), codec.description());
        }
        return Ok(());
    }

    if args.targets.is_empty() {
        return Err("no targets given (see --help)".into());
    }

    let mut config = QueryConfig::new()
        .with_rules(args.rules)
        .with_players(args.players)
        .with_retries(args.retries)
        .with_retry_interval(Duration::from_millis(args.interval_ms))
        .with_show_errors(args.show_errors);
    for (key, value) in args.params {
        config = config.with_param(key, value);
    }

    let mut engine = QueryEngine::new();
    for raw in &args.targets {
        let spec = TargetSpec::parse(raw)?;
        let addr = tokio::net::lookup_host((spec.host.as_str(), spec.port))
            .await?
            .next()
            .ok_or_else(|| EngineError::Unresolved(spec.host.clone()))?;

        let now = Instant::now();
        if args.broadcast {
            engine.add_broadcast(spec.protocol, addr, &config, now)?;
        } else {
            engine.add_target(spec.protocol, addr, &config, now)?;
        }
    }

    info!("Querying {} targets", engine.active_targets());

    let mut driver = QueryDriver::bind(&args.bind, engine).await?;
    let reports = driver.run().await?;

    for report in &reports {
        println!("{}", serde_json::to_string_pretty(report)?);
    }

    Ok(())
}
