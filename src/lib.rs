//! Path-style access to files on embedded boards reachable over a raw-REPL
//! serial channel, plus recursive file operations that work across the
//! local and remote filesystems.
//!
//! The [`Board`] owns one device session: it turns filesystem requests
//! into code snippets, runs them over the channel one at a time, and
//! caches per-directory metadata between mutations. A [`VirtualPath`]
//! addresses either filesystem through one query/mutation surface, and
//! [`fsops`] implements copy, move, remove and listing over any mix of
//! the two.

#[macro_use]
extern crate log;
#[macro_use]
extern crate bitflags;

mod cache;
mod error;
mod repl;

pub mod attrs;
pub mod board;
pub mod fsops;
/// Value encoding crossing the REPL channel
pub mod literal;
pub mod path;
/// The serial channel boundary
pub mod transport;

pub use attrs::{FileType, Metadata};
pub use board::Board;
pub use cache::RemoteEntry;
pub use error::{Error, RemoteErrorKind, Result};
pub use path::{FsKind, GlobIter, VirtualPath};
