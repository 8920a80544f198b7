use clap::Parser;
use ssscat::{ArchiveDestination, ArchiveSource, Config, CreateArchiveJobBuilder};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Build a tar archive out of S3 objects entirely server-side.
///
/// The source objects are never downloaded; the archive is assembled in the destination bucket
/// with multipart upload range copies.  The archive gains a synthetic `manifest.csv` first entry
/// listing every object that went in.
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Read the list of objects to archive from a CSV manifest.
    ///
    /// Each record is `bucket,key[,size[,etag]]`.  Records without a size are completed with a
    /// HeadObject call.  Mutually exclusive with --src-bucket/--src-prefix.
    #[clap(long, value_name = "PATH", conflicts_with_all = ["src_bucket", "src_prefix"])]
    src_manifest: Option<PathBuf>,

    /// Skip the first record of the source manifest (for manifests with a header row)
    #[clap(long, requires = "src_manifest")]
    skip_manifest_header: bool,

    /// The bucket to archive objects from
    #[clap(long, requires = "src_prefix")]
    src_bucket: Option<String>,

    /// Archive every object under this prefix of the source bucket
    #[clap(long, requires = "src_bucket")]
    src_prefix: Option<String>,

    /// The bucket the archive (and its scratch objects) are written to
    #[clap(long)]
    dst_bucket: String,

    /// Key prefix for the archive and its scratch objects
    #[clap(long, default_value = "")]
    dst_prefix: String,

    /// Object name of the finished archive, appended to --dst-prefix
    #[clap(long)]
    dst_key: String,

    /// Enable verbose log output
    #[clap(short = 'v', long, global = true)]
    verbose: bool,

    #[clap(flatten)]
    config: Config,
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;

    let args = Args::parse();

    let default_filter = if args.verbose {
        "ssscat=debug,ssscat_cli=debug,info"
    } else {
        "ssscat=info,ssscat_cli=info,warn"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let source = ArchiveSource::from_options(
        args.src_manifest,
        args.skip_manifest_header,
        args.src_bucket,
        args.src_prefix,
    )?;
    let destination = ArchiveDestination {
        bucket: args.dst_bucket,
        prefix: args.dst_prefix,
        key: args.dst_key,
    };

    let job = CreateArchiveJobBuilder::new(args.config, source, destination)
        .build()
        .await?;

    info!(
        objects = job.total_objects(),
        bytes = job.total_bytes(),
        "Archiving"
    );

    // Ctrl-C aborts the job; in-flight multipart uploads wind down and scratch objects are left
    // behind under the parts/ prefix for a later sweep
    let abort = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    let archive = job.run_without_progress(abort).await?;

    println!(
        "Created s3://{}/{} ({} bytes)",
        archive.bucket, archive.key, archive.size
    );

    Ok(())
}
