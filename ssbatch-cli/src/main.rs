use aws_credential_types::Credentials;
use clap::Parser;
use std::env;
use tracing_subscriber::EnvFilter;
use url::Url;

mod progress;

/// Copy large numbers of small objects between S3 buckets, packed into batched tar archives.
#[derive(Debug, Parser)]
#[clap(author, version, about)]
struct Args {
    /// The source bucket and optional key prefix, e.g. `s3://my-bucket/some/prefix/`.
    ///
    /// Every object whose key starts with the prefix is copied.
    source: Url,

    /// The destination bucket and optional key prefix, e.g. `s3://other-bucket/archives/`.
    ///
    /// One tar archive object per batch is created under the prefix.
    dest: Url,

    #[clap(flatten)]
    globals: GlobalArgs,
}

#[derive(Debug, clap::Args)]
struct GlobalArgs {
    /// Produce more verbose output, including the operational log on stderr
    #[clap(short, long, global = true)]
    verbose: bool,

    /// Suppress all output except errors
    #[clap(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    #[clap(flatten)]
    config: ssbatch::Config,
}

fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;

    let args = Args::parse();

    init_logging(&args.globals);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(run(args))
}

/// Logs go to stderr so the progress display and the final report own stdout.
fn init_logging(globals: &GlobalArgs) {
    let default_filter = if globals.verbose {
        "ssbatch=debug,info"
    } else if globals.quiet {
        "error"
    } else {
        "ssbatch=warn,error"
    };

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Read explicit credentials for one side of the transfer from a pair of environment variables.
///
/// When the variables aren't set, the AWS SDK's default credential sources apply.
fn credentials_from_env(access_key_var: &str, secret_key_var: &str) -> Option<Credentials> {
    match (env::var(access_key_var), env::var(secret_key_var)) {
        (Ok(access_key), Ok(secret_key)) => {
            Some(Credentials::from_keys(access_key, secret_key, None))
        }
        _ => None,
    }
}

async fn run(args: Args) -> color_eyre::Result<()> {
    let quiet = args.globals.quiet;
    let hide_progress = quiet || args.globals.verbose;

    let mut builder =
        ssbatch::TransferJobBuilder::new(args.globals.config, args.source, args.dest);

    if let Some(credentials) = credentials_from_env("SRC_ACCESS_KEY", "SRC_SECRET_KEY") {
        builder = builder.source_credentials(credentials);
    }

    if let Some(credentials) = credentials_from_env("DEST_ACCESS_KEY", "DEST_SECRET_KEY") {
        builder = builder.dest_credentials(credentials);
    }

    let job = builder.build().await?;

    let report = progress::TransferProgressReport::new(hide_progress);

    let summary = job.run(Box::new(report.clone())).await?;

    report.finish();

    if !quiet {
        let total = byte_unit::Byte::from_bytes(summary.total_bytes as u128)
            .get_appropriate_unit(true);

        println!(
            "Copied {} objects ({}) in {} batches",
            summary.total_objects, total, summary.batches
        );
    }

    Ok(())
}
