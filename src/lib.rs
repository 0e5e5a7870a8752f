//! sshfake - an in-process fake SSH server for tests
//!
//! [`SshTestServer`] accepts real SSH clients, authenticates them by password
//! or public key, and gives each session channel a shell on a pty. Configured
//! triggers answer matching input with canned responses.
//!
//! The server binary is in `main.rs`, a test client CLI in
//! `bin/sshfake-client.rs`.

pub mod config;
pub mod error;
pub mod pty;
pub mod server;
pub mod ssh;
pub mod state;
pub mod testing;

pub use config::{FakeResponse, InterceptMode, ServerConfig};
pub use error::{Error, Result};
pub use server::SshTestServer;
