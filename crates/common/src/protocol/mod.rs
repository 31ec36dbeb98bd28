pub mod peer;
pub mod signal;
