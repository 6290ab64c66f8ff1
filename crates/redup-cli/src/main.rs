#![forbid(unused_must_use)]

use std::fs::File;
use std::io::{BufWriter, IsTerminal, Write};
use std::path::PathBuf;

use clap::Parser;
use redup_core::RewriteOptions;
use sync_file::RandomAccessFile;

/// Rewrites a deduplicated replication stream into a plain, self-contained stream.
///
/// Every `WRITE_BYREF` record is resolved against the `WRITE` it refers back to and rewritten
/// into an ordinary `WRITE`, and the stream's dedup feature flags are cleared. The rewritten
/// stream is written to stdout by default, or to `--output` if given.
#[derive(clap::Parser)]
#[command(version, about)]
struct Options {
    /// Path to the deduplicated stream to rewrite. Must be a regular, seekable file: resolving
    /// back-references requires positioned re-reads, which a pipe cannot support.
    input: PathBuf,

    /// Where to write the rewritten stream. Defaults to stdout.
    #[arg(short, long, conflicts_with = "stdout")]
    output: Option<PathBuf>,

    /// Write the rewritten stream to stdout even if it looks like a terminal. Without this,
    /// writing to a terminal is refused to avoid spraying binary data into the shell.
    #[arg(long)]
    stdout: bool,

    /// Print a summary of records processed, after the rewrite completes.
    #[arg(short, long)]
    verbose: bool,

    /// Override the automatic memory budget for the redup index, in mebibytes. Defaults to 20%
    /// of physical memory, floored at 128 MiB.
    #[arg(long, value_name = "MB")]
    max_memory_mb: Option<u64>,
}

fn main() -> anyhow::Result<()> {
    let options = Options::parse();
    configure_tracing(options.verbose);

    let file = File::open(&options.input)?;
    redup_core::check_seekable(&file)?;
    let input = RandomAccessFile::from(file);

    let mut out: Box<dyn Write> = match &options.output {
        Some(path) => Box::new(BufWriter::new(File::create(path)?)),
        None => {
            if !options.stdout && std::io::stdout().is_terminal() {
                anyhow::bail!(
                    "refusing to write binary stream data to a terminal; pass --stdout to override or use --output"
                );
            }
            Box::new(BufWriter::new(std::io::stdout()))
        }
    };

    let rewrite_options = RewriteOptions {
        memory_cap_bytes: options
            .max_memory_mb
            .map(|mb| mb * 1024 * 1024)
            .unwrap_or_else(redup_core::auto_memory_cap_bytes),
    };

    let summary = redup_core::rewrite(&input, &mut out, rewrite_options)?;
    out.flush()?;

    if options.verbose {
        eprintln!(
            "converted stream with {} total records, including {} dedup records, using {} of memory.",
            summary.total_records,
            summary.write_byref_records,
            friendly::bytes(summary.index_memory_bytes),
        );
    }

    Ok(())
}

fn configure_tracing(verbose: bool) {
    use tracing_subscriber::filter::LevelFilter;

    let max_level = if verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::WARN
    };

    tracing_subscriber::fmt().with_max_level(max_level).init();
}
