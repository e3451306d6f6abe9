//! Everything that crosses the trust boundary from an isolated stage.
//!
//! Two wire formats exist, one per provider:
//!
//! - [`progress`]: one JSON record per line on the container's combined
//!   stdout/stderr.
//! - [`pixels`]: length-implied binary frames on a disposable VM's stdout.
//!
//! Both decoders treat their input as attacker-controlled.

pub mod pixels;
pub mod progress;

pub use pixels::PixelStreamReader;
pub use progress::parse_line;
