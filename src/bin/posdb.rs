use anyhow::{Context, bail};
use clap::{Parser, Subcommand, ValueEnum};
use kira_posdb::{BuildConfig, Builder, PositionDb, SequenceMers, TableLayout, encode_kmer};
use std::path::PathBuf;
use tracing::info;

/// Build and query bit-packed mer position tables.
#[derive(Parser, Debug)]
#[command(name = "posdb", author, version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Index every mer of a base file (FASTA headers and newlines are skipped)
    Build {
        /// Input sequence path
        #[arg(short, long)]
        input: PathBuf,

        /// Output table path
        #[arg(short, long)]
        output: PathBuf,

        /// Mer length in bases (<= 32)
        #[arg(short = 'k', long)]
        k: u32,

        /// Mers skipped after each indexed one
        #[arg(long, default_value_t = 0)]
        skip: u32,

        /// Mismatches the table is prepared for
        #[arg(long, default_value_t = 0)]
        max_mismatch: u32,

        /// Memory budget in MiB used to size the table (0 = smallest table)
        #[arg(long, default_value_t = 0)]
        memory: u64,

        /// Force 2^bits buckets
        #[arg(long)]
        table_bits: Option<u32>,

        /// Header layout
        #[arg(long, value_enum, default_value_t = LayoutArg::Packed)]
        layout: LayoutArg,

        /// Threads used while finalizing
        #[arg(long)]
        threads: Option<usize>,

        /// Progress at info level
        #[arg(short, long)]
        verbose: bool,
    },

    /// Print the configuration of a saved table
    Info {
        /// Table path
        #[arg(short, long)]
        index: PathBuf,
    },

    /// Look up one mer
    Query {
        /// Table path
        #[arg(short, long)]
        index: PathBuf,

        /// Mer as bases, e.g. ACGT
        mer: String,

        /// Allowed substitutions
        #[arg(short = 'n', long, default_value_t = 0)]
        mismatches: u32,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LayoutArg {
    Packed,
    Full,
}

impl From<LayoutArg> for TableLayout {
    fn from(l: LayoutArg) -> Self {
        match l {
            LayoutArg::Packed => TableLayout::Packed,
            LayoutArg::Full => TableLayout::FullWidth,
        }
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    match Cli::parse().command {
        Commands::Build {
            input,
            output,
            k,
            skip,
            max_mismatch,
            memory,
            table_bits,
            layout,
            threads,
            verbose,
        } => {
            let raw = std::fs::read(&input).with_context(|| format!("reading {}", input.display()))?;
            let seq = bases_of(&raw);

            let mut cfg = BuildConfig::new(k)
                .mer_skip(skip)
                .max_mismatch(max_mismatch)
                .max_memory_mb(memory)
                .layout(layout.into())
                .verbose(verbose);
            if let Some(t) = table_bits {
                cfg = cfg.table_bits(t);
            }
            if let Some(n) = threads {
                cfg = cfg.threads(n);
            }

            let mut mers = SequenceMers::new(&seq, k as usize)?;
            let db = Builder::new(cfg).build(&mut mers)?;
            db.save_state(&output)
                .with_context(|| format!("writing {}", output.display()))?;
            let c = db.counters();
            info!(
                "built {}: k={} table bits={} {} mers, {} distinct, {} unique",
                output.display(),
                db.mer_size(),
                db.table_bits(),
                c.mers,
                c.distinct,
                c.unique
            );
        }
        Commands::Info { index } => {
            let db = PositionDb::open(&index, false)
                .with_context(|| format!("opening {}", index.display()))?;
            let stdout = std::io::stdout();
            db.print_state(&mut stdout.lock())?;
        }
        Commands::Query { index, mer, mismatches } => {
            let db = PositionDb::open(&index, true)
                .with_context(|| format!("opening {}", index.display()))?;
            if mer.len() != db.mer_size() as usize {
                bail!("mer {mer} has {} bases, table holds {}", mer.len(), db.mer_size());
            }
            let Some(code) = encode_kmer(mer.as_bytes()) else {
                bail!("mer {mer} contains ambiguous bases");
            };
            let hits = if mismatches == 0 {
                db.get_exact(code)
            } else {
                db.get_up_to_n_mismatches(code, mismatches)?
            };
            match hits {
                Some(positions) => {
                    let line: Vec<String> = positions.iter().map(u64::to_string).collect();
                    println!("{mer}\t{}\t{}", positions.len(), line.join(","));
                }
                None => println!("{mer}\t0\t"),
            }
        }
    }
    Ok(())
}

/// Concatenated sequence lines, skipping `>` header lines.
fn bases_of(raw: &[u8]) -> Vec<u8> {
    raw.split(|&b| b == b'\n')
        .filter(|line| !line.starts_with(b">"))
        .flat_map(|line| line.iter().copied().filter(|b| !b.is_ascii_whitespace()))
        .collect()
}
