use url::Url;

/// The configuration settings that control the behavior of a batch transfer.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "clap", derive(clap::Parser))]
pub struct Config {
    /// Use a custom S3 endpoint for the source bucket instead of AWS.
    ///
    /// Use this when the source is a non-Amazon S3-compatible service.
    #[cfg_attr(feature = "clap", clap(long, global = true, value_name = "URL"))]
    pub source_endpoint: Option<Url>,

    /// Use a custom S3 endpoint for the destination bucket instead of AWS.
    ///
    /// Use this when the destination is a non-Amazon S3-compatible service.  Source and
    /// destination endpoints are independent, so a transfer can cross providers.
    #[cfg_attr(feature = "clap", clap(long, global = true, value_name = "URL"))]
    pub dest_endpoint: Option<Url>,

    /// The maximum number of source objects fetched concurrently.
    ///
    /// Every in-flight fetch holds an open connection to the source, so this is a hard cap on open
    /// source reads.  When not specified, one fetch per available CPU is used.
    #[cfg_attr(feature = "clap", clap(long, global = true))]
    pub concurrency: Option<usize>,

    /// How many source objects are packed into each archive object on the destination.
    #[cfg_attr(feature = "clap", clap(long, default_value = "100", global = true))]
    pub batch_size: usize,

    /// Compress each archive with gzip before uploading it.
    #[cfg_attr(feature = "clap", clap(long, global = true))]
    pub compress: bool,

    /// Buffer each archive in memory while it is being built.
    ///
    /// Passing `--spool-to-disk` instead buffers each archive in a temporary file, which keeps
    /// memory usage flat when batches are large but adds local disk I/O to every batch.
    #[cfg_attr(
        feature = "clap",
        clap(
            long = "spool-to-disk",
            action = clap::ArgAction::SetFalse,
            default_value_t = true,
            global = true
        )
    )]
    pub in_memory: bool,

    /// Tolerate a mid-archive read failure by dropping the affected entry rather than failing the
    /// whole batch.
    #[cfg_attr(feature = "clap", clap(long, global = true))]
    pub skip_errors: bool,

    /// The maximum number of attempts for each S3 request.
    ///
    /// The default of 1 disables retries entirely; the pipeline's own failure isolation handles
    /// per-object faults, so request-level retries mostly add latency.
    #[cfg_attr(feature = "clap", clap(long, default_value = "1", global = true))]
    pub max_retries: u32,

    /// The chunk size used for multi-part uploads of archive objects.
    ///
    /// Can be specified as an integer, ie "1000000", or with a suffix ie "10MB".
    #[cfg_attr(feature = "clap", clap(long, default_value = "8MiB", global = true))]
    pub multipart_chunk_size: byte_unit::Byte,

    /// The size threshold above which archive objects are uploaded with the multi-part API.
    ///
    /// Can be specified as an integer, ie "1000000", or with a suffix ie "10MB"
    #[cfg_attr(feature = "clap", clap(long, default_value = "8MiB", global = true))]
    pub multipart_threshold: byte_unit::Byte,
}

impl Config {
    /// The fetch concurrency cap actually in force: the configured value, or one fetch per
    /// available CPU when no value was configured.
    pub fn effective_concurrency(&self) -> usize {
        self.concurrency.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        // XXX: Unfortunately this is duplicated here and in the `clap` attributes, unfortunately I
        // can't find a better way unless we unconditionally take a clap dependency in the lib
        // crate which I'm not willing to do
        Self {
            source_endpoint: None,
            dest_endpoint: None,
            concurrency: None,
            batch_size: 100,
            compress: false,
            in_memory: true,
            skip_errors: false,
            max_retries: 1,
            multipart_chunk_size: byte_unit::Byte::from_bytes(8 * 1024 * 1024),
            multipart_threshold: byte_unit::Byte::from_bytes(8 * 1024 * 1024),
        }
    }
}
