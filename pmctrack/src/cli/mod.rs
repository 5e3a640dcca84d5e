//! Command-line front end
//!
//! [`Args`] is the clap surface; [`SessionConfig::from_args`] turns it into a
//! validated [`SessionConfig`].
//!
//! [`SessionConfig::from_args`]: crate::monitor::SessionConfig::from_args
//! [`SessionConfig`]: crate::monitor::SessionConfig

mod args;

pub use args::Args;
