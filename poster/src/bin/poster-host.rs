use std::ffi::OsString;
use std::os::unix::process::CommandExt;
use std::process::{Command, ExitCode};

use clap::Parser;
use memfile::MemFile;
use poster::{Node, NodeConfig};
use poster_arena::Region;
use poster_fd::{Handoff, ListenFd, ARENA_FD_NAME};
use tracing_subscriber::EnvFilter;

/// Run a command with a poster node segment.
///
/// Creates and formats the segment unless the environment already lists one, then executes the
/// command with the segment passed in `LISTEN_FDS`. All processes the command starts with the
/// same environment share the node.
#[derive(Parser)]
struct HostCommand {
    #[arg(long, default_value_t = 1 << 20, help = "Bytes of the segment")]
    size: usize,

    #[arg(long, default_value_t = 64, help = "Posters that may exist at the same time")]
    max_posters: u32,

    #[arg(help = "The command to execute with the segment in its environment")]
    command: OsString,

    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<OsString>,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let HostCommand {
        size,
        max_posters,
        command,
        args,
    } = HostCommand::parse();

    let listen = match ListenFd::from_env().transpose() {
        Ok(listen) => listen,
        Err(err) => {
            eprintln!("poster-host: {err}");
            return ExitCode::FAILURE;
        }
    };

    let config = NodeConfig {
        arena_size: size,
        max_posters,
        ..NodeConfig::default()
    };

    let handoff = Handoff::<MemFile>::named_or_try_create(listen, ARENA_FD_NAME, || {
        create_segment(&config)
    });

    let handoff = match handoff {
        Ok(handoff) => handoff,
        Err(err) => {
            eprintln!("poster-host: {err}");
            return ExitCode::FAILURE;
        }
    };

    if handoff.file.is_none() {
        tracing::info!(fd = handoff.target, "reusing the segment of the environment");
    }

    let mut proc = Command::new(&command);
    proc.args(&args);
    // Safety: `handoff` and its file outlive the exec below, the file is not closed before.
    unsafe { handoff.prepare(&mut proc) };

    let error = proc.exec();
    eprintln!("poster-host: failed to execute {command:?}: {error}");
    ExitCode::FAILURE
}

fn create_segment(config: &NodeConfig) -> poster::Result<MemFile> {
    let file = MemFile::create_sealable("poster-arena").map_err(poster::Error::Segment)?;
    file.set_len(config.arena_size as u64)
        .map_err(poster::Error::Segment)?;

    let region = Region::from_fd(&file).map_err(poster::Error::Segment)?;
    let node = Node::format(region, config)?;
    tracing::info!(stats = ?node.stats()?, "formatted a new segment");
    Ok(file)
}
