use clap::Parser;
use segweave_engine::GapPolicy;
use std::path::PathBuf;

/// Define CLI arguments
#[derive(Parser, Debug)]
#[command(
    author = "hua0512 <https://github.com/hua0512>",
    version,
    about = "Concurrent HLS segment downloader",
    long_about = "Downloads every segment of an HLS media playlist with a bounded pool of\n\
                  workers, decrypts AES-128 streams, and writes one output file whose\n\
                  segment order matches the playlist regardless of completion order.\n\
                  \n\
                  Master playlists are resolved to a single variant first."
)]
pub struct CliArgs {
    /// Playlist URL
    #[arg(required = true, help = "URL of the media or master playlist")]
    pub url: String,

    #[arg(
        short,
        long,
        default_value = "output.ts",
        help = "File the reassembled stream is written to"
    )]
    pub output: PathBuf,

    /// Enable verbose logging
    #[arg(short, long, help = "Enable detailed debug logging")]
    pub verbose: bool,

    #[arg(
        short,
        long,
        default_value = "4",
        help = "Maximum number of segments fetched concurrently"
    )]
    pub workers: usize,

    #[arg(
        long,
        default_value = "50",
        help = "Delay in milliseconds between two segment submissions"
    )]
    pub delay_ms: u64,

    #[arg(
        long,
        default_value = "15",
        help = "Timeout in seconds for a single segment request"
    )]
    pub timeout: u64,

    /// Connection timeout in seconds
    #[arg(
        long,
        default_value = "10",
        help = "Connection timeout in seconds (time to establish initial connection)"
    )]
    pub connect_timeout: u64,

    #[arg(
        long,
        default_value = "0",
        help = "Extra attempts for a segment that failed with a transient error"
    )]
    pub retries: u32,

    /// Proxy endpoints rotated per segment index
    #[arg(
        long = "proxy",
        value_name = "URL",
        help = "Proxy endpoint (can be used multiple times; segments rotate over the ones that pass validation)"
    )]
    pub proxies: Vec<String>,

    /// Proxy username
    #[arg(long, help = "Username for proxy authentication")]
    pub proxy_user: Option<String>,

    /// Proxy password
    #[arg(long, help = "Password for proxy authentication")]
    pub proxy_pass: Option<String>,

    /// Disable all proxy settings for downloads
    #[arg(
        long,
        help = "Ignore system proxy settings when no --proxy is given"
    )]
    pub no_proxy: bool,

    /// Custom HTTP headers for download requests
    #[arg(
        long = "header",
        short = 'H',
        help = "Add custom HTTP header to requests (can be used multiple times). Format: 'Name: Value'",
        value_name = "HEADER"
    )]
    pub headers: Vec<String>,

    #[arg(
        long = "user-agent",
        value_name = "UA",
        help = "User agent to rotate over (can be used multiple times; replaces the built-in list)"
    )]
    pub user_agents: Vec<String>,

    #[arg(
        long,
        value_enum,
        default_value_t = GapPolicy::Wait,
        help = "What to do when a segment never arrives"
    )]
    pub gap_policy: GapPolicy,

    #[arg(
        long,
        default_value = "512",
        help = "Maximum segments held back waiting for a missing one (0 for unbounded)"
    )]
    pub max_buffered: usize,

    #[arg(
        long,
        value_name = "BPS",
        help = "Pick the master playlist variant closest to this bandwidth instead of the highest"
    )]
    pub bandwidth: Option<u64>,

    #[arg(long, help = "Accept invalid TLS certificates")]
    pub insecure: bool,

    #[arg(
        long,
        value_name = "PATH",
        help = "Also save the media playlist text to this path"
    )]
    pub save_playlist: Option<PathBuf>,

    /// Show progress bars for operations
    #[arg(
        short = 'P',
        long = "progress",
        default_value = "false",
        help = "Show a progress bar while downloading"
    )]
    pub show_progress: bool,
}
