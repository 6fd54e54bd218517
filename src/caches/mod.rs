//! Provided implementations of [`Cache`](crate::Cache).

mod dir;

pub use dir::DirCache;
pub use test::TestCache;
