use std::time::Duration;

use casession::{Context, dbr::DbrType};
use clap::Parser;
use tracing::level_filters::LevelFilter;

#[derive(Parser)]
struct Options {
    /// PV names to read
    #[clap(required = true, id = "PV_NAME")]
    names: Vec<String>,
    /// Request this DBR type instead of the native one, e.g. DBR_TIME_DOUBLE
    #[clap(short = 'd', long = "type")]
    data_type: Option<String>,
    /// Seconds to wait for each PV
    #[clap(short = 'w', default_value_t = 1.0)]
    wait: f64,
    /// Show debug output
    #[clap(short, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main(flavor = "multi_thread", worker_threads = 1)]
async fn main() {
    let opts = Options::parse();

    tracing_subscriber::fmt()
        .with_max_level(match opts.verbose {
            0 => LevelFilter::WARN,
            1 => LevelFilter::DEBUG,
            2.. => LevelFilter::TRACE,
        })
        .init();

    let data_type = match opts.data_type.as_deref().map(str::parse::<DbrType>) {
        None => None,
        Some(Ok(data_type)) => Some(data_type),
        Some(Err(_)) => {
            eprintln!("Unknown DBR type: {}", opts.data_type.unwrap_or_default());
            std::process::exit(2);
        }
    };
    let timeout = Duration::from_secs_f64(opts.wait.max(0.0));

    let context = match Context::builder().default_timeout(timeout).start().await {
        Ok(context) => context,
        Err(e) => {
            eprintln!("Could not start client: {e}");
            std::process::exit(1);
        }
    };

    let mut failed = false;
    for name in &opts.names {
        let result = match context.get_channel(name).await {
            Ok(channel) => channel.read(data_type, None).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(dbr) => println!("{name:<30} {}", dbr.value()),
            Err(e) => {
                failed = true;
                println!("{name:<30} *** {e}");
            }
        }
    }
    context.shutdown();
    if failed {
        std::process::exit(1);
    }
}
