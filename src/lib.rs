//! School gradebook daemon: marks in, compiled and ranked results out, with a
//! publication gate in front of students and parents and roster forwarding to
//! the store house.
//!
//! Requests arrive either as JSON lines on stdin ([`ipc`]) or over the REST
//! facade in [`http`]; both end in [`ipc::handle_request`].

pub mod archive;
pub mod calc;
pub mod config;
pub mod db;
pub mod directory;
pub mod error;
pub mod grading;
pub mod http;
pub mod ipc;
pub mod reports;
pub mod roles;
pub mod roster;
