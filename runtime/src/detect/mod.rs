//! Facts extracted from a reconstructed image filesystem.
//!
//! - [`OsRelease`]: operating system identity from `os-release`
//! - [`DpkgStatus`]: installed packages from the dpkg status database
//!
//! Both parsers work on byte streams already extracted from the archive and
//! never look at the archive format themselves.

mod dpkg;
mod release;

pub use dpkg::{DpkgStatus, Package, Packages, DPKG_STATUS_FILE};
pub use release::{OsRelease, ETC_OS_RELEASE, USR_LIB_OS_RELEASE};

/// Decode one line permissively, dropping the line terminator.
pub(crate) fn decode_line(raw: &[u8]) -> String {
    let line = String::from_utf8_lossy(raw);
    line.trim_end_matches(['\n', '\r']).to_string()
}
