//! `fa-prepare` — format a new archive file.

use std::path::PathBuf;

use anyhow::{bail, ensure, Context};
use clap::Parser;

use fa_bin::logging;
use fa_core::FilterMask;
use fa_storage::prepare::{block_count_for_size, prepare_archive, PrepareRequest};
use fa_storage::ArchiveGeometry;

#[derive(Parser)]
#[command(name = "fa-prepare")]
#[command(about = "Format a file as an FA archive", long_about = None)]
struct Cli {
    /// Target file.
    archive: PathBuf,

    /// Archive size, with an optional K/M/G/T suffix.
    size: String,

    /// Number of BPM ids per frame.
    #[arg(short = 'N', long, default_value_t = 256)]
    entry_count: usize,

    /// First decimation factor (power of two).
    #[arg(long, default_value_t = 64)]
    first_decimation: usize,

    /// Second decimation factor (power of two).
    #[arg(long, default_value_t = 128)]
    second_decimation: usize,

    /// Sniffer read size in bytes.
    #[arg(short = 'I', long, default_value_t = 65536)]
    input_block_size: usize,

    /// FA samples per major block.
    #[arg(short = 'M', long, default_value_t = 65536)]
    major_sample_count: usize,

    /// Ids to archive; all ids when omitted.
    #[arg(short = 'm', long)]
    mask: Option<String>,

    /// Reformat even if the file looks like a live archive.
    #[arg(short = 'f', long)]
    force: bool,

    /// Log warnings and errors only.
    #[arg(short = 'q', long)]
    quiet: bool,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init(cli.quiet);

    let size = parse_size(&cli.size)?;
    let mask = match &cli.mask {
        Some(text) => FilterMask::parse(text, cli.entry_count)
            .with_context(|| format!("parsing mask {text:?}"))?,
        None => FilterMask::parse(&format!("0-{}", cli.entry_count - 1), cli.entry_count)?,
    };

    let mut geometry = ArchiveGeometry {
        fa_entry_count: cli.entry_count,
        first_decimation_log2: power_of_two_log2("first decimation", cli.first_decimation)?,
        second_decimation_log2: power_of_two_log2("second decimation", cli.second_decimation)?,
        input_block_size: cli.input_block_size,
        major_sample_count: cli.major_sample_count,
        major_block_count: 4,
        archived_id_count: mask.count(),
    };
    geometry.major_block_count = block_count_for_size(&geometry, size)?;

    let total = prepare_archive(
        &cli.archive,
        &PrepareRequest {
            geometry,
            mask,
            force: cli.force,
        },
    )?;
    println!(
        "{}: {total} bytes, ready for fa-archiver",
        cli.archive.display()
    );
    Ok(())
}

fn power_of_two_log2(what: &str, value: usize) -> anyhow::Result<u32> {
    ensure!(
        value.is_power_of_two() && value >= 2,
        "{what} must be a power of two of at least 2, not {value}"
    );
    Ok(value.trailing_zeros())
}

fn parse_size(text: &str) -> anyhow::Result<u64> {
    let (digits, multiplier) = match text.as_bytes().last() {
        Some(b'K' | b'k') => (&text[..text.len() - 1], 1u64 << 10),
        Some(b'M') => (&text[..text.len() - 1], 1 << 20),
        Some(b'G' | b'g') => (&text[..text.len() - 1], 1 << 30),
        Some(b'T' | b't') => (&text[..text.len() - 1], 1 << 40),
        Some(b'm') => (&text[..text.len() - 1], 1 << 20),
        _ => (text, 1),
    };
    let value: u64 = digits
        .parse()
        .with_context(|| format!("bad size {text:?}"))?;
    value
        .checked_mul(multiplier)
        .map_or_else(|| bail_size(text), Ok)
}

fn bail_size(text: &str) -> anyhow::Result<u64> {
    bail!("size {text:?} overflows")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes_accept_suffixes() {
        assert_eq!(parse_size("4096").unwrap(), 4096);
        assert_eq!(parse_size("16M").unwrap(), 16 << 20);
        assert_eq!(parse_size("2G").unwrap(), 2 << 30);
        assert!(parse_size("x").is_err());
    }

    #[test]
    fn log2_requires_powers_of_two() {
        assert_eq!(power_of_two_log2("d", 64).unwrap(), 6);
        assert!(power_of_two_log2("d", 3).is_err());
        assert!(power_of_two_log2("d", 1).is_err());
    }
}
