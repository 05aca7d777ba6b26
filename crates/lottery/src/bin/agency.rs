use clap::Parser;
use lottery::client::read_bets_csv;
use lottery::{AgencyClient, AgencyId, RetryPolicy, WireFormat};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Submit an agency's bets and fetch its winners", long_about = None)]
struct Args {
    /// Lottery server address
    #[arg(short, long, default_value = "127.0.0.1:12345")]
    server: String,

    /// Agency id (1-based)
    #[arg(short, long)]
    agency: AgencyId,

    /// CSV file with first_name,last_name,document,birthdate,number per line
    #[arg(short, long)]
    bets: PathBuf,

    /// Maximum bets per batch
    #[arg(long, default_value = "100")]
    batch_size: usize,

    /// Batch and winners encoding: json or text
    #[arg(long, default_value = "json")]
    format: WireFormat,

    /// Delay between winners queries while the draw is pending
    #[arg(long, default_value = "1000")]
    retry_delay_ms: u64,

    /// Winners queries before giving up
    #[arg(long, default_value = "30")]
    max_attempts: u32,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = Args::parse();

    let bets = read_bets_csv(&args.bets, args.agency)?;
    info!(agency = %args.agency, "Loaded {} bets from {:?}", bets.len(), args.bets);

    let client = AgencyClient::new(args.server, args.agency, args.format);
    client.submit(&bets, args.batch_size).await?;

    let winners = client
        .wait_for_winners(RetryPolicy {
            attempts: args.max_attempts,
            delay: Duration::from_millis(args.retry_delay_ms),
        })
        .await?;

    info!(
        action = "consulta_ganadores",
        result = "success",
        agency = %args.agency,
        cant_ganadores = winners.len()
    );
    for document in &winners {
        println!("{}", document);
    }
    Ok(())
}
