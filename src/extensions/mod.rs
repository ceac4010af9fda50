//! Implementations of various IMAP extensions.
pub mod idle;
pub mod metadata;
pub mod sort;
