mod config;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use config::Config;
use log::{debug, info};
use tokio::sync::Mutex;

use upnp_control_point::iface::{AddressMode, InterfaceBinding};
use upnp_control_point::location::is_invalid_location;
use upnp_control_point::message::SsdpMessage;
use upnp_control_point::search::{ResponseSink, SearchResponder};
use upnp_control_point::Executors;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Discover UPnP devices on the local network and print the LOCATION of
/// every response that passes datagram-source validation.
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct CommandLineConf {
    /// TOML config file.
    #[clap(short, long, value_name = "/path/to/config.conf")]
    config: Option<std::path::PathBuf>,

    /// Network interface to search on (e.g. `eth0`).
    #[clap(short, long, value_name = "IFACE")]
    iface: Option<String>,

    /// SSDP search target (`ST` header). Defaults to `ssdp:all`.
    #[clap(short = 't', long, value_name = "ST")]
    search_target: Option<String>,

    /// `MX` header value: how long devices should randomize their reply
    /// delay over, in seconds.
    #[clap(short, long, value_name = "SECONDS")]
    mx: Option<u8>,

    /// How long to collect responses before exiting, in seconds.
    #[clap(long, value_name = "SECONDS")]
    timeout: Option<u64>,

    /// Verbosity level. The more v, the more verbose.
    #[clap(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

struct PrintingSink {
    seen: Arc<Mutex<Vec<String>>>,
}

impl ResponseSink for PrintingSink {
    fn on_response(&self, message: SsdpMessage) {
        let source = message.source;
        let location = message.location.clone().unwrap_or_default();
        let seen = self.seen.clone();
        tokio::spawn(async move {
            if is_invalid_location(&message, source).await {
                debug!(target: "upnp", "Discarding response from {source}: invalid LOCATION ({location})");
                return;
            }
            let mut seen = seen.lock().await;
            if !seen.contains(&location) {
                println!("{source}  uuid={}  {location}", message.uuid);
                seen.push(location);
            }
        });
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CommandLineConf::parse();
    let config = Config::try_from(args)?;

    init_logging(config.verbose);

    println!("control-point-demo v{VERSION}");

    let binding = InterfaceBinding::resolve(&config.iface, AddressMode::Ipv4)
        .with_context(|| format!("no IPv4 address on interface '{}'", config.iface))?;

    let executors = Arc::new(Executors::new());
    let sink = Arc::new(PrintingSink {
        seen: Arc::new(Mutex::new(Vec::new())),
    });

    let mut responder = SearchResponder::new(binding, sink, executors.clone());
    responder.open().await?;
    responder.start().await?;

    info!(target: "upnp", "Searching for '{}' on {} (MX={})...", config.search_target, config.iface, config.mx);
    responder.search(&config.search_target, config.mx);

    let signal_name = tokio::select! {
        _ = tokio::time::sleep(config.timeout) => "timeout",
        name = wait_for_shutdown_signal() => name?,
    };
    debug!(target: "upnp", "Stopping ({signal_name}).");

    responder.stop().await;
    responder.close().await;
    executors.terminate();

    Ok(())
}

/// Waits for a shutdown signal (SIGINT or SIGTERM on Unix, Ctrl+C on
/// Windows), racing it against the fixed collection window in `main`.
async fn wait_for_shutdown_signal() -> Result<&'static str> {
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .context("Failed to install SIGTERM handler")?;

        let signal_name = tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("Failed to wait for SIGINT")?;
                "SIGINT"
            }
            _ = sigterm.recv() => "SIGTERM",
        };
        Ok(signal_name)
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("Failed to install Ctrl+C handler")?;
        Ok("Ctrl+C")
    }
}

fn init_logging(verbosity: log::LevelFilter) -> log::LevelFilter {
    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{}[{}][{}] {}",
                chrono::Local::now().format("[%Y-%m-%d][%H:%M:%S]"),
                record.target(),
                record.level(),
                message
            ))
        })
        // by default only accept warning messages from libraries so we don't spam
        .level(log::LevelFilter::Warn)
        // but accept Info and Debug and Trace for our own searches
        .level_for("upnp", verbosity)
        .chain(std::io::stdout())
        .apply()
        .expect("Failed to configure logging.");

    verbosity
}
