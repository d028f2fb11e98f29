use anyhow::{Result, anyhow};
use clap::{Parser, Subcommand};
use futures::TryStreamExt;
use tracing::instrument;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "uio",
    version,
    about = "Copy, move and synchronize files and directories across storage backends",
    long_about = "`uio` works on local paths and on any location a registered backend understands
(for example `memory://bucket/key`). Directory trees are transferred concurrently and files are
streamed in chunks unless the backend can copy them natively.

EXAMPLE:
    # Synchronize a tree, recording fingerprints in ./state.db
    uio sync /data/src /backup/src --db state.db --summary"
)]
struct Args {
    #[command(subcommand)]
    command: Command,

    // Progress & output
    /// Verbose level (implies "summary"): -v INFO / -vv DEBUG / -vvv TRACE (default: ERROR)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true, help_heading = "Progress & output")]
    verbose: u8,

    /// Print summary at the end
    #[arg(long, global = true, help_heading = "Progress & output")]
    summary: bool,

    /// Quiet mode, don't report errors
    #[arg(short = 'q', long = "quiet", global = true, help_heading = "Progress & output")]
    quiet: bool,

    // Performance & throttling
    /// Maximum number of transfers running at the same time, 0 means no limit
    #[arg(
        long,
        default_value = "5",
        value_name = "N",
        global = true,
        help_heading = "Performance & throttling"
    )]
    max_transfers: usize,

    /// Maximum number of file copies in flight within a single directory copy
    #[arg(
        long,
        default_value = "5",
        value_name = "N",
        global = true,
        help_heading = "Performance & throttling"
    )]
    max_width: usize,

    /// Throttle the number of streamed chunks per second, 0 means no throttle
    ///
    /// Files copied natively by a backend count as ((file size - 1) / chunk size) + 1 chunks.
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        global = true,
        help_heading = "Performance & throttling"
    )]
    iops_throttle: usize,

    /// Size of the chunks files are streamed and hashed in
    ///
    /// Accepts human readable sizes, e.g. "64KiB", "5MiB" or "1GB".
    #[arg(
        long,
        default_value = "5MiB",
        value_name = "SIZE",
        value_parser = parse_size,
        global = true,
        help_heading = "Performance & throttling"
    )]
    chunk_size: u64,

    // Transfer options
    /// Stream into a `.partial` sibling and rename it into place once complete
    #[arg(long, global = true, help_heading = "Transfer options")]
    partial: bool,

    /// Hash used to fingerprint files whose backend doesn't report modification time and size
    #[arg(
        long,
        value_enum,
        default_value_t = common::fingerprint::HashAlgorithm::Sha256,
        value_name = "ALGORITHM",
        global = true,
        help_heading = "Transfer options"
    )]
    hash: common::fingerprint::HashAlgorithm,

    // Advanced settings
    /// Number of worker threads, 0 means number of cores
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        global = true,
        help_heading = "Advanced settings"
    )]
    max_workers: usize,

    /// Number of blocking worker threads, 0 means Tokio runtime default (512)
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        global = true,
        help_heading = "Advanced settings"
    )]
    max_blocking_threads: usize,
}

#[derive(Subcommand, Debug, Clone)]
enum Command {
    /// Copy a file or a directory tree
    Copy {
        src: String,
        dst: String,
        /// Overwrite existing files, directories are merged
        #[arg(long)]
        overwrite: bool,
    },
    /// Move a file or a directory tree, renaming natively when possible
    Move {
        src: String,
        dst: String,
        /// Overwrite existing files, directories are merged
        #[arg(long)]
        overwrite: bool,
    },
    /// Create a directory
    Mkdir {
        path: String,
        /// Create missing parent directories as well
        #[arg(short = 'p', long = "parents")]
        parents: bool,
    },
    /// Remove a directory
    Rmdir {
        path: String,
        /// Remove the directory along with everything below it
        #[arg(short = 'r', long = "recursive")]
        recursive: bool,
    },
    /// List the children of a directory, directories are printed with a trailing `/`
    Ls { path: String },
    /// Print the fingerprint of a file
    Fingerprint { path: String },
    /// Copy every new or changed file from SRC into DST
    Sync {
        src: String,
        dst: String,
        /// Database recording the fingerprints of synchronized files
        #[arg(long, value_name = "PATH", conflicts_with = "in_memory")]
        db: Option<std::path::PathBuf>,
        /// Keep fingerprints for the duration of this run only
        #[arg(long)]
        in_memory: bool,
    },
}

fn parse_size(size: &str) -> std::result::Result<u64, String> {
    size.parse::<bytesize::ByteSize>().map(|size| size.as_u64())
}

enum Outcome {
    Transfer(common::copy::Summary),
    Sync(common::sync::Summary),
    Listed(usize),
    Updated(String),
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Outcome::Transfer(summary) => write!(f, "{summary}"),
            Outcome::Sync(summary) => write!(f, "{summary}"),
            Outcome::Listed(entries) => write!(f, "entries listed: {entries}"),
            Outcome::Updated(resource) => write!(f, "updated: {resource}"),
        }
    }
}

#[instrument]
async fn async_main(args: Args) -> Result<Outcome> {
    let throttle = common::ThrottleConfig {
        max_transfers: args.max_transfers,
        iops_throttle: args.iops_throttle,
    };
    let transfer = common::TransferConfig {
        chunk_size: args.chunk_size,
        max_width: args.max_width,
        use_partial_file: args.partial,
        hash_algorithm: args.hash,
    };
    let ctx = common::Context::new(throttle, transfer)?;
    match args.command {
        Command::Copy {
            src,
            dst,
            overwrite,
        } => {
            let settings = ctx.copy_settings().overwrite(overwrite);
            let (src, dst) = (ctx.resolve(&src)?, ctx.resolve(&dst)?);
            let _permit = ctx.transfer_limit().permit().await;
            Ok(Outcome::Transfer(
                common::copy::copy(&src, &dst, &settings).await?,
            ))
        }
        Command::Move {
            src,
            dst,
            overwrite,
        } => {
            let settings = ctx.copy_settings().overwrite(overwrite);
            let (src, dst) = (ctx.resolve(&src)?, ctx.resolve(&dst)?);
            let _permit = ctx.transfer_limit().permit().await;
            Ok(Outcome::Transfer(
                common::copy::move_to(&src, &dst, &settings).await?,
            ))
        }
        Command::Mkdir { path, parents } => {
            let dir = ctx.resolve(&path)?;
            common::dirs::mkdir(&dir, parents).await?;
            Ok(Outcome::Updated(dir.identity()))
        }
        Command::Rmdir { path, recursive } => {
            let dir = ctx.resolve(&path)?;
            common::dirs::rmdir(&dir, recursive).await?;
            Ok(Outcome::Updated(dir.identity()))
        }
        Command::Ls { path } => {
            let dir = ctx.resolve(&path)?;
            let mut children: Vec<common::Descriptor> = dir.list().await?.try_collect().await?;
            children.sort_by_key(|child| child.identity());
            for child in &children {
                if child.is_dir().await? {
                    println!("{child}/");
                } else {
                    println!("{child}");
                }
            }
            Ok(Outcome::Listed(children.len()))
        }
        Command::Fingerprint { path } => {
            let file = ctx.resolve(&path)?;
            let fingerprint = common::fingerprint::fingerprint_with(
                &file,
                ctx.transfer_config().hash_algorithm,
                ctx.copy_settings().chunk_size,
            )
            .await?
            .ok_or_else(|| anyhow!("{file} is not a file that can be fingerprinted"))?;
            println!("{fingerprint}");
            Ok(Outcome::Listed(1))
        }
        Command::Sync {
            src,
            dst,
            db,
            in_memory,
        } => {
            let store_config = match (in_memory, db) {
                (true, _) => common::StoreConfig::InMemory,
                (false, Some(path)) => common::StoreConfig::Sqlite(path),
                (false, None) => common::StoreConfig::default(),
            };
            let store = common::sync::open_store(&store_config)?;
            let synchronizer = common::sync::DirectorySynchronizer::new(
                ctx.resolve(&src)?,
                ctx.resolve(&dst)?,
                store.clone(),
                &ctx,
            );
            let result = synchronizer.sync_all().await;
            store.close()?;
            match result {
                Ok(summary) => Ok(Outcome::Sync(summary)),
                Err(error) => {
                    if args.summary || args.verbose > 0 {
                        return Err(anyhow!("{}\n\n{}", error, &error.summary));
                    }
                    Err(anyhow!(
                        "{}\n\nfiles updated before the failure: {}",
                        error,
                        error.summary.files_updated
                    ))
                }
            }
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    let func = {
        let args = args.clone();
        || async_main(args)
    };
    let output = common::OutputConfig {
        quiet: args.quiet,
        verbose: args.verbose,
        print_summary: args.summary || args.verbose > 0,
    };
    let runtime = common::RuntimeConfig {
        max_workers: args.max_workers,
        max_blocking_threads: args.max_blocking_threads,
    };
    let res = common::run(output, runtime, func);
    if res.is_none() {
        std::process::exit(1);
    }
    Ok(())
}
