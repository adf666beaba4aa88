//! Protocol implementations.
//!
//! - `echo`: single-shot bounded echo, served inline by the event loop or
//!   by a hand-off worker

pub mod echo;
