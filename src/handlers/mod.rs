//! Request handlers, called from the dispatch functions in [`crate::server`].

pub mod admin;
pub mod object;
