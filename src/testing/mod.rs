//! Testing utilities
//!
//! An SSH client for driving a fake server from tests.

mod ssh_client;

pub use ssh_client::{authenticate, strip_ansi, ClientHandler, Credentials, SshTestClient};
