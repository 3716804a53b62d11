use casession::{Context, DeliveryMode, client::ConnectionEvent, messages::MonitorMask};
use clap::Parser;
use tracing::{info, level_filters::LevelFilter};
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
struct Options {
    /// PV names to monitor
    #[clap(required = true, id = "PV_NAME")]
    names: Vec<String>,
    /// Deliver every update, instead of coalescing when output falls behind
    #[clap(long)]
    lossless: bool,
    /// Show debug output
    #[clap(short, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main(flavor = "multi_thread", worker_threads = 1)]
async fn main() {
    // Make sure panics from threads cause the whole process to terminate
    let default_panic = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        default_panic(info);
        std::process::exit(1);
    }));
    let opts = Options::parse();

    let filter = EnvFilter::default().add_directive(
        match opts.verbose {
            0 => LevelFilter::INFO,
            1 => LevelFilter::DEBUG,
            2.. => LevelFilter::TRACE,
        }
        .into(),
    );
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_level(true)
        .with_filter(filter);
    tracing_subscriber::registry().with(fmt_layer).init();

    let context = match Context::start().await {
        Ok(context) => context,
        Err(e) => {
            eprintln!("Could not start client: {e}");
            std::process::exit(1);
        }
    };
    let mode = if opts.lossless {
        DeliveryMode::Lossless
    } else {
        DeliveryMode::Coalesce
    };

    let mut subscriptions = Vec::new();
    for name in opts.names {
        let channel = match context.get_channel(&name).await {
            Ok(channel) => channel,
            Err(e) => {
                eprintln!("{name}: {e}");
                continue;
            }
        };
        let mut events = channel.connection_events();
        let watched = name.clone();
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                match event {
                    ConnectionEvent::Connected(info) => {
                        info!("{watched} connected to {} as {:?}", info.server, info.native_type)
                    }
                    ConnectionEvent::Disconnected => println!("{watched} *** disconnected"),
                    ConnectionEvent::AccessRights(access) => info!("{watched} access: {access}"),
                    ConnectionEvent::Closed => break,
                }
            }
        });
        let printed = name.clone();
        let subscription = channel
            .subscribe(None, MonitorMask::default(), mode, move |batch| {
                for event in batch {
                    let stamp = event
                        .timestamp()
                        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                        .map(|d| format!("{}.{:06}", d.as_secs(), d.subsec_micros()))
                        .unwrap_or_default();
                    println!("{printed:<30} {stamp} {}", event.value());
                }
            })
            .await;
        match subscription {
            Ok(subscription) => subscriptions.push(subscription),
            Err(e) => eprintln!("{name}: {e}"),
        }
    }

    let _ = tokio::signal::ctrl_c().await;
    for subscription in subscriptions {
        let _ = subscription.unsubscribe().await;
    }
    context.shutdown();
    info!("Disconnected.");
}
