use clap::Parser;
use std::path::PathBuf;

/// Computes the difference between a base and a patched object file and
/// writes a live-patch object containing the changed functions.
#[derive(Parser, Debug)]
#[command(name = "xsplice-diff", version)]
pub struct Args {
    /// Object file compiled from the original source.
    pub original: PathBuf,

    /// Object file compiled from the patched source.
    pub patched: PathBuf,

    /// Running image to resolve to-be-patched symbols against
    /// (e.g. xen-syms).
    pub running_image: PathBuf,

    /// Where to write the patch object.
    pub output: PathBuf,

    /// Show debug output.
    #[arg(long)]
    pub debug: bool,

    /// Prefill old function addresses from the running image instead of
    /// leaving them for the loader.
    #[arg(long)]
    pub resolve: bool,
}

impl Args {
    pub fn from_env() -> Self {
        Self::parse()
    }
}
