//! `fa-archiver` — the archiving daemon.
//!
//! Opens a prepared archive, starts the capture pipeline (sniffer →
//! ring buffer → transform → disk writer) and the query server, then
//! runs until SIGINT/SIGTERM.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{ensure, Context};
use clap::Parser;
use tracing::info;

use fa_bin::{logging, settings, signals};
use fa_core::timestamp::now_micros;
use fa_sniffer::{
    DeviceSource, EmptySource, SimulationConfig, SimulationSource, SnifferConfig, SnifferSource,
    SnifferThread,
};
use fa_server::{Server, ServerConfig};
use fa_storage::{Archive, OpenMode, Pipeline, PipelineConfig};

#[derive(Parser)]
#[command(name = "fa-archiver")]
#[command(about = "Continuous FA archiver daemon", long_about = None)]
struct Cli {
    /// Prepared archive file.
    archive: PathBuf,

    /// Ring buffer size in input blocks.
    #[arg(short = 'b', long)]
    buffer_blocks: Option<usize>,

    /// Bind address for the socket server.
    #[arg(short = 's', long)]
    bind_address: Option<String>,

    /// Socket server port.
    #[arg(short = 'p', long)]
    port: Option<u16>,

    /// Open the archive without O_DIRECT (for filesystems that cannot
    /// do direct I/O).
    #[arg(short = 'F', long)]
    no_direct_io: bool,

    /// Expected FA entry count; must match the archive.
    #[arg(short = 'E', long)]
    entry_count: Option<usize>,

    /// Sniffer device node.
    #[arg(short = 'd', long)]
    device: Option<String>,

    /// Use the synthetic data source instead of hardware.
    #[arg(short = 'X', long)]
    simulate: bool,

    /// Serve queries only; never capture.
    #[arg(short = 'R', long)]
    read_only: bool,

    /// Run the sniffer thread at SCHED_FIFO priority 1.
    #[arg(short = 'B', long)]
    boost_priority: bool,

    /// Honour M (mask update) requests.
    #[arg(short = 'M', long)]
    allow_mask_update: bool,

    /// Log warnings and errors only.
    #[arg(short = 'q', long)]
    quiet: bool,

    /// Optional TOML settings file; flags override it.
    #[arg(long)]
    settings: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init(cli.quiet);
    signals::block_termination_signals()?;

    let mut settings = settings::load(cli.settings.as_deref())?;
    if let Some(blocks) = cli.buffer_blocks {
        settings.buffer_blocks = blocks;
    }
    if let Some(address) = &cli.bind_address {
        settings.bind_address = address.clone();
    }
    if let Some(port) = cli.port {
        settings.port = port;
    }
    if let Some(device) = &cli.device {
        settings.device = device.clone();
    }
    settings.boost_priority |= cli.boost_priority;
    settings.allow_mask_update |= cli.allow_mask_update;
    ensure!(settings.buffer_blocks >= 2, "need at least 2 ring blocks");

    let (archive, write_file) = Archive::open(
        &cli.archive,
        OpenMode {
            direct_io: !cli.no_direct_io,
        },
    )
    .with_context(|| format!("opening archive {}", cli.archive.display()))?;
    let entry_count = archive.geometry.fa_entry_count;
    if let Some(expected) = cli.entry_count {
        ensure!(
            expected == entry_count,
            "archive holds {entry_count} entries, not {expected}"
        );
    }

    let pipeline = Pipeline::start(
        Arc::clone(&archive),
        write_file,
        &PipelineConfig {
            ring_blocks: settings.buffer_blocks,
        },
    )?;

    let source: Arc<dyn SnifferSource> = if cli.read_only {
        info!("read-only archiver, using the empty sniffer");
        Arc::new(EmptySource)
    } else if cli.simulate {
        info!("simulated sniffer source");
        Arc::new(SimulationSource::new(SimulationConfig {
            entry_count,
            frame_interval_us: 100,
            start_timestamp: now_micros(),
            paced: true,
            total_frames: None,
        }))
    } else {
        Arc::new(DeviceSource::open(settings.device.as_ref(), entry_count)?)
    };
    let sniffer = SnifferThread::spawn(
        source,
        Arc::clone(pipeline.buffer()),
        SnifferConfig {
            boost_priority: settings.boost_priority,
            retry_delay: Duration::from_secs(1),
        },
    )
    .context("starting sniffer thread")?;

    let bind: SocketAddr = format!("{}:{}", settings.bind_address, settings.port)
        .parse()
        .context("parsing bind address")?;
    let read_file = Arc::new(Archive::open_read_handle(&cli.archive)?);
    let server = Server::start(
        bind,
        Arc::clone(&archive),
        read_file,
        ServerConfig {
            allow_mask_update: settings.allow_mask_update,
        },
    )?;

    let signal = signals::wait_for_termination()?;
    info!(signal, "shutting down");

    // Stop the ring first so neither the producer nor the consumer can
    // be left blocked on it, then take the threads down in data order.
    pipeline.buffer().stop();
    sniffer.stop();
    let result = pipeline.shutdown();
    server.shutdown();
    result
}
