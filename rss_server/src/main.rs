//! In-memory remote shuffle stream server executable.

use std::net::{Ipv4Addr, SocketAddr};
use std::process::ExitCode;

use clap::Parser;
use log::{self, LevelFilter};
use rss_writer::server::{StreamServer, StreamServerConfig};
use rss_writer::{logger_init, pf_error, pf_info, RssError};
use tokio::runtime::Builder;
use tokio::sync::watch;

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// Local IP to use for binding the listening socket.
    #[arg(short, long, default_value_t = Ipv4Addr::UNSPECIFIED)]
    bind_ip: Ipv4Addr,

    /// Stream session port open to writers and readers.
    /// This port must be available at process launch.
    #[arg(short, long, default_value_t = 19190)]
    port: u16,

    /// Server config in TOML format (e.g., "server_id = 'rss1'").
    #[arg(short, long, default_value_t = String::from(""))]
    config: String,

    /// Number of tokio worker threads.
    #[arg(long, default_value_t = 8)]
    threads: usize,
}

impl CliArgs {
    /// Sanitize command line arguments, return `Ok(config)` on success
    /// or `Err(RssError)` on any error.
    fn sanitize(&self) -> Result<StreamServerConfig, RssError> {
        if self.port <= 1024 {
            Err(RssError::msg(format!("invalid port {}", self.port)))
        } else if self.threads < 2 {
            Err(RssError::msg(format!(
                "invalid number of threads {}",
                self.threads
            )))
        } else if self.config.is_empty() {
            StreamServerConfig::from_toml(None)
        } else {
            StreamServerConfig::from_toml(Some(&self.config))
        }
    }
}

/// Actual main function of the stream server.
fn server_main() -> Result<(), RssError> {
    // read in and parse command line arguments
    let args = CliArgs::parse();
    let config = args.sanitize()?;

    let bind_addr: SocketAddr = format!("{}:{}", args.bind_ip, args.port)
        .parse()
        .map_err(|e| {
            RssError::msg(format!(
                "failed to parse bind_addr: bind_ip {} port {}: {}",
                args.bind_ip, args.port, e
            ))
        })?;

    // set up termination signals handler
    let (tx_term, mut rx_term) = watch::channel(false);
    ctrlc::set_handler(move || {
        if let Err(e) = tx_term.send(true) {
            pf_error!("main"; "error sending to term channel: {}", e);
        }
    })
    .map_err(RssError::msg)?;

    let log_level = log::max_level();
    {
        // create tokio multi-threaded runtime
        let runtime = Builder::new_multi_thread()
            .enable_all()
            .worker_threads(args.threads)
            .thread_name("tokio-worker-rss")
            .build()
            .map_err(RssError::msg)?;

        runtime.block_on(async move {
            let mut server = StreamServer::start(bind_addr, config).await?;
            pf_info!(
                "main";
                "server {} ready",
                server.server_detail()
            );

            // serve until terminated
            while !*rx_term.borrow() {
                if rx_term.changed().await.is_err() {
                    break;
                }
            }
            server.shutdown().await;

            // suppress logging before dropping the runtime to avoid spurious
            // error messages
            log::set_max_level(LevelFilter::Off);

            Ok::<(), RssError>(()) // give type hint for this async closure
        })?;
    } // drop the runtime here

    log::set_max_level(log_level);
    Ok(())
}

/// Main function of the stream server.
fn main() -> ExitCode {
    logger_init();

    if let Err(ref e) = server_main() {
        pf_error!("main"; "server_main exited: {}", e);
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
