//! Download and unpack server distributions used by sandboxes.

pub mod distros;
