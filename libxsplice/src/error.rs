use std::fmt::Display;

pub type Result<T = (), E = anyhow::Error> = core::result::Result<T, E>;

/// A difference between the two inputs that the patch format cannot express.
/// The patch author needs to restructure the change; this is not a bug in
/// either the tool or the inputs.
#[derive(Debug)]
pub struct UnsupportedDiff(pub String);

/// The two inputs are equivalent; there is nothing to patch.
#[derive(Debug)]
pub struct NoChanges;

impl Display for UnsupportedDiff {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unsupported change: {}", self.0)
    }
}

impl core::error::Error for UnsupportedDiff {}

impl Display for NoChanges {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("no changes detected")
    }
}

impl core::error::Error for NoChanges {}

/// Like `bail!`, but produces an `UnsupportedDiff` so the caller exits with
/// code 2 rather than 1.
#[macro_export]
macro_rules! diff_bail {
    ($($arg:tt)*) => {
        return Err(anyhow::Error::new($crate::error::UnsupportedDiff(format!($($arg)*))))
    };
}

pub fn exit_code(error: &anyhow::Error) -> i32 {
    if error.is::<NoChanges>() {
        3
    } else if error.is::<UnsupportedDiff>() {
        2
    } else {
        1
    }
}

pub fn report_error_and_exit(error: &anyhow::Error) -> ! {
    if error.is::<NoChanges>() {
        eprintln!("xsplice-diff: {error}");
    } else {
        eprintln!("xsplice-diff: error: {error:#}");
    }
    std::process::exit(exit_code(error));
}
