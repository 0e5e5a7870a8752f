//! SSH test client CLI
//!
//! Sends commands to a fake server and prints what comes back.
//!
//! Usage:
//!   cargo run --bin sshfake-client --features testing -- --cmd "ls -lha"
//!   cargo run --bin sshfake-client --features testing -- --user joe --password user --cmd "ls -lha"

use anyhow::{Context, Result};
use sshfake::testing::{Credentials, SshTestClient};
use std::path::Path;
use std::time::Duration;

#[derive(Default)]
struct Args {
    addr: String,
    key: Option<String>,
    password: Option<String>,
    username: String,
    commands: Vec<String>,
    wait_ms: u64,
    raw: bool,
}

fn parse_args() -> Result<Args> {
    let mut args = Args {
        addr: "localhost:2222".to_string(),
        username: whoami::username(),
        wait_ms: 500,
        ..Default::default()
    };

    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--addr" | "-a" => {
                args.addr = iter.next().ok_or_else(|| anyhow::anyhow!("--addr requires value"))?;
            }
            "--key" | "-k" => {
                args.key = Some(iter.next().ok_or_else(|| anyhow::anyhow!("--key requires value"))?);
            }
            "--password" | "-p" => {
                args.password =
                    Some(iter.next().ok_or_else(|| anyhow::anyhow!("--password requires value"))?);
            }
            "--user" | "-u" => {
                args.username = iter.next().ok_or_else(|| anyhow::anyhow!("--user requires value"))?;
            }
            "--cmd" | "-c" => {
                args.commands.push(iter.next().ok_or_else(|| anyhow::anyhow!("--cmd requires value"))?);
            }
            "--wait" | "-w" => {
                args.wait_ms = iter
                    .next()
                    .ok_or_else(|| anyhow::anyhow!("--wait requires value"))?
                    .parse()?;
            }
            "--raw" | "-r" => {
                args.raw = true;
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            other => {
                eprintln!("unknown argument: {}", other);
                print_help();
                std::process::exit(1);
            }
        }
    }

    Ok(args)
}

fn print_help() {
    eprintln!(
        r#"sshfake-client - SSH test client for sshfake

USAGE:
    sshfake-client [OPTIONS] --cmd <COMMAND>...

OPTIONS:
    -a, --addr <ADDR>      Server address [default: localhost:2222]
    -k, --key <PATH>       SSH private key [default: ~/.ssh/id_ed25519]
    -p, --password <PASS>  Log in with a password instead of a key
    -u, --user <NAME>      Username [default: current user]
    -c, --cmd <COMMAND>    Command to send (can be repeated)
    -w, --wait <MS>        Wait time after commands [default: 500]
    -r, --raw              Print raw bytes (hex dump)
    -h, --help             Print help

EXAMPLES:
    sshfake-client --key host_key --cmd "ls -lha"
    sshfake-client --user joe --password user --cmd "ls -lha" --cmd "whoami"
"#
    );
}

/// Load a private key from a file path
fn load_private_key(path: &str) -> Result<russh::keys::PrivateKey> {
    let expanded = match path.strip_prefix("~/") {
        Some(rest) => dirs::home_dir()
            .map(|h| h.join(rest))
            .unwrap_or_else(|| Path::new(path).to_path_buf()),
        None => Path::new(path).to_path_buf(),
    };

    let key_str = std::fs::read_to_string(&expanded)
        .with_context(|| format!("failed to read key file: {}", expanded.display()))?;

    russh::keys::decode_secret_key(&key_str, None).context("failed to decode private key")
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = parse_args()?;

    if args.commands.is_empty() {
        eprintln!("error: at least one --cmd is required");
        print_help();
        std::process::exit(1);
    }

    let credentials = match &args.password {
        Some(password) => Credentials::password(password.clone()),
        None => {
            let key_path = args.key.as_deref().unwrap_or("~/.ssh/id_ed25519");
            Credentials::key(load_private_key(key_path)?)
        }
    };

    eprintln!("connecting to {} as {}...", args.addr, args.username);

    let mut client = SshTestClient::connect(args.addr.as_str(), &args.username, &credentials).await?;

    eprintln!("connected, sending {} command(s)...", args.commands.len());

    // let the shell print its prompt
    tokio::time::sleep(Duration::from_millis(200)).await;

    for cmd in &args.commands {
        eprintln!("> {}", cmd);
        client.send(cmd).await?;
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    let output = client.wait_and_collect(Duration::from_millis(args.wait_ms)).await?;

    eprintln!("--- output ({} bytes) ---", output.len());

    if args.raw {
        for (i, chunk) in output.chunks(16).enumerate() {
            print!("{:04x}: ", i * 16);
            for byte in chunk {
                print!("{:02x} ", byte);
            }
            print!("  ");
            for byte in chunk {
                if byte.is_ascii_graphic() || *byte == b' ' {
                    print!("{}", *byte as char);
                } else {
                    print!(".");
                }
            }
            println!();
        }
    } else {
        print!("{}", String::from_utf8_lossy(&output));
    }

    eprintln!("---");

    client.close().await?;
    eprintln!("disconnected");

    Ok(())
}
