use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use poster::{Node, NodeConfig, PosterServer, Wait};
use tracing_subscriber::EnvFilter;

/// Serve the posters of this host's node to other hosts.
///
/// Attaches to the segment handed down in `LISTEN_FDS` when there is one, otherwise the node is
/// private to the server and only reachable through it.
#[derive(Parser)]
struct ServeCommand {
    #[arg(long, default_value = "0.0.0.0:2507", help = "Address to listen on")]
    listen: String,

    #[arg(long, default_value_t = 1 << 20, help = "Bytes of a node created by the server")]
    arena_size: usize,

    #[arg(long, default_value_t = 64, help = "Posters of a node created by the server")]
    max_posters: u32,

    /// Milliseconds a request waits for a contended poster, waits forever if not given.
    #[arg(long)]
    timeout_ms: Option<u64>,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let command = ServeCommand::parse();
    match serve(command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = %err, "posterd failed");
            eprintln!("posterd: {err}");
            ExitCode::FAILURE
        }
    }
}

fn serve(command: ServeCommand) -> poster::Result<()> {
    let wait = match command.timeout_ms {
        Some(millis) => Wait::Timeout(Duration::from_millis(millis)),
        None => Wait::Forever,
    };

    let config = NodeConfig {
        arena_size: command.arena_size,
        max_posters: command.max_posters,
        ..NodeConfig::default()
    };

    let node = match Node::from_env(&config)? {
        Some(node) => node,
        None => {
            tracing::info!(
                arena_size = config.arena_size,
                max_posters = config.max_posters,
                "no segment handed down, serving a private node"
            );
            Node::anonymous(&config)?
        }
    };

    let server = PosterServer::bind(node, command.listen.as_str(), wait)?;
    let addr = server.local_addr()?;
    // Scripts wait for this line to learn the port.
    println!("listening on {addr}");
    server.serve()
}
