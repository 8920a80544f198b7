use crate::redistribute::PartCountPolicy;
use url::Url;

/// The tunable settings that control how the archive is assembled.
///
/// None of these are required; the defaults reproduce the behavior of the stock tool.  The
/// destination and the source selection are not part of this struct, they are provided per job via
/// [`crate::CreateArchiveJobBuilder`].
#[derive(Clone, Debug)]
#[cfg_attr(feature = "clap", derive(clap::Parser))]
pub struct Config {
    /// Use a custom S3 endpoint instead of AWS.
    ///
    /// Use this to operate on a non-Amazon S3-compatible service.  If this is set, the AWS region
    /// is still sent to the service but is not used to pick an endpoint.
    #[cfg_attr(feature = "clap", clap(long, global = true, value_name = "URL"))]
    pub(crate) s3_endpoint: Option<Url>,

    /// The AWS region the source and destination buckets live in.
    ///
    /// If not set, the region is resolved the usual way from the environment and AWS config
    /// files.
    #[cfg_attr(feature = "clap", clap(long, global = true))]
    pub(crate) region: Option<String>,

    /// The target size of one batch of archive pieces when the small-file path parallelizes
    /// assembly.
    ///
    /// Batches are closed once they exceed this size, so every batch but the last is at least
    /// this large.  Can be specified as an integer, ie "1000000", or with a suffix ie "10MiB".
    #[cfg_attr(feature = "clap", clap(long, default_value = "10MiB", global = true))]
    pub(crate) batch_size: byte_unit::Byte,

    /// The maximum number of parts uploaded or copied concurrently within one multipart upload,
    /// and the maximum number of batches assembled concurrently.
    #[cfg_attr(feature = "clap", clap(long, default_value = "100", global = true))]
    pub(crate) max_concurrent_parts: usize,

    /// The maximum number of payload/header pairs concatenated concurrently on the large-file
    /// path.
    ///
    /// Each pair concatenation issues several sequential multipart uploads, so this bound is
    /// deliberately lower than `max_concurrent_parts`.
    #[cfg_attr(feature = "clap", clap(long, default_value = "25", global = true))]
    pub(crate) max_concurrent_pairs: usize,

    /// The policy that picks how many parts the final object is re-sliced into.
    #[cfg_attr(feature = "clap", clap(skip))]
    pub(crate) part_count_policy: PartCountPolicy,
}

impl Default for Config {
    fn default() -> Self {
        // XXX: these defaults are duplicated in the `clap` attributes; there's no better way
        // without taking an unconditional clap dependency in the lib crate
        Self {
            s3_endpoint: None,
            region: None,
            batch_size: byte_unit::Byte::from_bytes(10 * 1024 * 1024),
            max_concurrent_parts: 100,
            max_concurrent_pairs: 25,
            part_count_policy: PartCountPolicy::default(),
        }
    }
}

impl Config {
    pub(crate) fn batch_size_bytes(&self) -> u64 {
        self.batch_size.get_bytes() as u64
    }

    /// Override the batch target size, in bytes.
    ///
    /// Targets below the store's minimum part size are treated as the minimum; batches any
    /// smaller couldn't be used as multipart upload parts.
    pub fn with_batch_size(mut self, bytes: u64) -> Self {
        self.batch_size = byte_unit::Byte::from_bytes(bytes as u128);
        self
    }

    /// Override the per-upload part fan-out bound.
    pub fn with_max_concurrent_parts(mut self, limit: usize) -> Self {
        self.max_concurrent_parts = limit;
        self
    }

    /// Override the large-file pair fan-out bound.
    pub fn with_max_concurrent_pairs(mut self, limit: usize) -> Self {
        self.max_concurrent_pairs = limit;
        self
    }

    /// Override the policy that picks the final object's part count.
    pub fn with_part_count_policy(mut self, policy: PartCountPolicy) -> Self {
        self.part_count_policy = policy;
        self
    }
}
