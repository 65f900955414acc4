//! `fa-capture` — stream archived data from a server to a file.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::path::PathBuf;

use anyhow::{bail, ensure, Context};
use clap::Parser;
use tracing::info;

use fa_bin::logging;

#[derive(Parser)]
#[command(name = "fa-capture")]
#[command(about = "Capture data from an FA archiver", long_about = None)]
struct Cli {
    /// Archiver host.
    server: String,

    /// Id mask, e.g. "1-4,7" or a raw R mask.
    mask: String,

    /// Server port.
    #[arg(short = 'p', long, default_value_t = 8888)]
    port: u16,

    /// Data class: F (raw), D (decimated), DD (double decimated).
    #[arg(short = 'c', long, default_value = "F")]
    class: String,

    /// Start time, seconds since epoch (fractions allowed).
    #[arg(short = 's', long)]
    start: String,

    /// End time, seconds since epoch; alternative to --samples.
    #[arg(short = 'e', long)]
    end: Option<String>,

    /// Number of samples; alternative to --end.
    #[arg(short = 'n', long)]
    samples: Option<u64>,

    /// Tolerate gaps in the selected range.
    #[arg(short = 'a', long)]
    all_data: bool,

    /// Check frame-counter continuity.
    #[arg(short = 'g', long)]
    check_id0: bool,

    /// Output file; stdout when omitted.
    #[arg(short = 'o', long)]
    output: Option<PathBuf>,

    /// Log warnings and errors only.
    #[arg(short = 'q', long)]
    quiet: bool,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init(cli.quiet);

    ensure!(
        matches!(cli.class.as_str(), "F" | "D" | "DD"),
        "data class must be F, D or DD"
    );
    let range = match (&cli.end, cli.samples) {
        (Some(end), None) => format!("ES{end}"),
        (None, Some(samples)) => format!("N{samples}"),
        _ => bail!("exactly one of --end and --samples is required"),
    };
    let mut options = String::new();
    if cli.all_data {
        options.push('A');
    }
    if cli.check_id0 {
        options.push('G');
    }
    let request = format!(
        "R{}{}{}S{}{}\n",
        cli.class, cli.mask, options, cli.start, range
    );

    let address = format!("{}:{}", cli.server, cli.port);
    let mut stream =
        TcpStream::connect(&address).with_context(|| format!("connecting to {address}"))?;
    stream.write_all(request.as_bytes())?;

    let mut marker = [0u8; 1];
    stream.read_exact(&mut marker).context("empty response")?;
    if marker[0] != 0 {
        // Error line: the marker byte is its first character.
        let mut message = vec![marker[0]];
        stream.read_to_end(&mut message)?;
        bail!(
            "server refused request: {}",
            String::from_utf8_lossy(&message).trim_end()
        );
    }

    let mut output: Box<dyn Write> = match &cli.output {
        Some(path) => Box::new(
            std::fs::File::create(path)
                .with_context(|| format!("creating {}", path.display()))?,
        ),
        None => Box::new(std::io::stdout().lock()),
    };
    let bytes = std::io::copy(&mut stream, &mut output).context("streaming data")?;
    output.flush()?;
    info!(bytes, "capture complete");
    Ok(())
}
