//! burrow - recursive extractor for messy archive drops
//!
//! Digs through nested, split, password-protected, and cloaked archives
//! until nothing extractable is left.

pub mod backend;
pub mod classify;
pub mod extract;
pub mod grouping;
pub mod multipart;
pub mod passwords;
pub mod trash;
