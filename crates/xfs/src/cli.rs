use std::path::PathBuf;

use clap::Parser;
use xfs_core::RunConfig;

/// Extract the root filesystem of a firmware image into a reproducible archive
#[derive(Clone, Debug, Parser)]
#[command(name = "xfs", version = env!("CARGO_PKG_VERSION"), about, long_about = None)]
pub struct Cli {
    pub firmware: PathBuf,

    /// Output directory for all artifacts. Default is the current directory.
    #[arg(long, short)]
    pub output: Option<PathBuf>,

    /// TOML file with run settings; flags override it
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Comma-separated list of extractors (carve, unpack)
    #[arg(long, value_delimiter = ',')]
    pub extractors: Option<Vec<String>>,

    /// Timeout for each extractor pass, in seconds
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Timeout for the whole run, in seconds
    #[arg(long)]
    pub run_timeout: Option<u64>,

    /// Maximum nesting depth of extracted artifacts
    #[arg(long)]
    pub depth: Option<usize>,

    /// Worker threads (0 = all cores)
    #[arg(long, short)]
    pub jobs: Option<usize>,

    /// Disable saving the scratch directory
    #[arg(long)]
    pub no_scratch: bool,

    /// Copy out the identified rootfs directory
    #[arg(long)]
    pub copy_rootfs: bool,

    /// Overwrite existing outputs
    #[arg(long)]
    pub force: bool,

    /// Materialize the best candidate even when it scores below the confidence floor
    #[arg(long)]
    pub accept_low_confidence: bool,

    /// Show progress while extracting
    #[arg(long)]
    pub progress: bool,

    /// Verbose logging of every extraction step
    #[arg(long)]
    pub loud: bool,

    /// Print the run report as one JSON line on stdout
    #[arg(long)]
    pub json: bool,
}

impl Cli {
    pub fn output(&self) -> PathBuf {
        self.output.clone().unwrap_or_else(|| PathBuf::from("."))
    }

    /// Overlay explicit flags on a loaded or default configuration.
    pub fn apply(&self, mut config: RunConfig) -> RunConfig {
        if self.no_scratch {
            config.keep_scratch = false;
        }
        config.copy_rootfs |= self.copy_rootfs;
        config.force |= self.force;
        config.progress |= self.progress;
        config.accept_low_confidence |= self.accept_low_confidence;
        if let Some(names) = &self.extractors {
            config.extractors = Some(names.iter().map(|n| n.trim().to_owned()).collect());
        }
        if let Some(timeout) = self.timeout {
            config.extractor_timeout = timeout;
        }
        if self.run_timeout.is_some() {
            config.run_timeout = self.run_timeout;
        }
        if let Some(depth) = self.depth {
            config.recursion_depth_limit = depth;
        }
        if let Some(jobs) = self.jobs {
            config.jobs = jobs;
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_defaults() {
        let cli = Cli::parse_from([
            "xfs",
            "fw.bin",
            "--no-scratch",
            "--copy-rootfs",
            "--extractors",
            "unpack, carve",
            "--timeout",
            "5",
        ]);
        let config = cli.apply(RunConfig::default());
        assert!(!config.keep_scratch);
        assert!(config.copy_rootfs);
        assert!(!config.force);
        assert_eq!(config.extractors, Some(vec!["unpack".to_string(), "carve".to_string()]));
        assert_eq!(config.extractor_timeout, 5);
        assert_eq!(cli.output(), PathBuf::from("."));
    }

    #[test]
    fn absent_flags_keep_file_settings() {
        let cli = Cli::parse_from(["xfs", "fw.bin", "-o", "out"]);
        let file = RunConfig::default().force(true).keep_scratch(false);
        let config = cli.apply(file.clone());
        assert_eq!(config, file);
        assert_eq!(cli.output(), PathBuf::from("out"));
    }
}
