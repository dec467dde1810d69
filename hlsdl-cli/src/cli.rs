use std::path::PathBuf;

use clap::Parser;
use hlsdl_engine::ResolutionPreference;

/// Download HLS (m3u8) streams with their audio and subtitle renditions.
#[derive(Parser, Debug)]
#[command(name = "hlsdl", version, about, long_about = None)]
pub struct Args {
    /// URLs, or files holding a JSON link list or one URL per line (`-` reads stdin)
    #[arg(required = true, value_name = "INPUT")]
    pub inputs: Vec<String>,

    /// Output root directory; each job writes into `<DIR>/<title>/`
    #[arg(short, long, value_name = "DIR")]
    pub output_dir: Option<PathBuf>,

    /// Preferred resolution: `best`, `720` or `720p`
    #[arg(short, long, value_name = "RES")]
    pub resolution: Option<ResolutionPreference>,

    /// Skip subtitle renditions
    #[arg(long)]
    pub no_subtitles: bool,

    /// Concurrent segment fetches per track
    #[arg(short = 'j', long, value_name = "N")]
    pub concurrency: Option<usize>,

    /// Jobs downloading at the same time
    #[arg(long, value_name = "N")]
    pub max_jobs: Option<usize>,

    /// Merge the video alone when the separate primary audio track cannot be fetched
    #[arg(long)]
    pub allow_missing_audio: bool,

    /// Path to the ffmpeg executable
    #[arg(long, value_name = "PATH", env = "FFMPEG_PATH")]
    pub ffmpeg: Option<PathBuf>,

    /// Extra request header, `Name: value` (repeatable)
    #[arg(short = 'H', long = "header", value_name = "HEADER")]
    pub headers: Vec<String>,

    /// User agent sent with every request
    #[arg(long, value_name = "UA")]
    pub user_agent: Option<String>,

    /// Request timeout in seconds
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<u64>,

    /// Retries per request after the first attempt
    #[arg(long, value_name = "N")]
    pub retries: Option<u32>,

    /// Configuration file (defaults to `<config dir>/hlsdl/config.toml` when present)
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Print final job snapshots as JSON
    #[arg(long)]
    pub json: bool,

    /// Enable debug logging
    #[arg(short, long, conflicts_with = "quiet")]
    pub verbose: bool,

    /// Only log errors and hide progress bars
    #[arg(short, long)]
    pub quiet: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_flags() {
        let args = Args::try_parse_from([
            "hlsdl",
            "-r",
            "720p",
            "-H",
            "Referer: https://example.com",
            "--no-subtitles",
            "http://h/master.m3u8",
            "links.txt",
        ])
        .unwrap();
        assert_eq!(args.resolution, Some(ResolutionPreference::Height(720)));
        assert_eq!(args.inputs, vec!["http://h/master.m3u8", "links.txt"]);
        assert!(args.no_subtitles);
        assert_eq!(args.headers.len(), 1);
    }

    #[test]
    fn rejects_bad_resolution_and_missing_input() {
        assert!(Args::try_parse_from(["hlsdl", "-r", "0", "http://h/a.m3u8"]).is_err());
        assert!(Args::try_parse_from(["hlsdl"]).is_err());
    }
}
