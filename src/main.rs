//! sshfake - run a fake SSH server until interrupted
//!
//! Usage:
//!   sshfake --config fake.toml
//!   sshfake --port 2222 --user joe --password user --match "ls -lha" --response "this is a test"

use anyhow::{Context, Result};
use tracing::info;

use sshfake::{FakeResponse, InterceptMode, ServerConfig, SshTestServer};

fn parse_args() -> Result<ServerConfig> {
    let mut args: Vec<String> = std::env::args().skip(1).collect();

    // --config goes first so flags can override it
    let mut config = match args.iter().position(|a| a == "--config" || a == "-C") {
        Some(i) => {
            let path = args
                .get(i + 1)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("--config requires value"))?;
            args.drain(i..=i + 1);
            ServerConfig::load(&path)?
        }
        None => ServerConfig::default(),
    };

    let mut iter = args.into_iter();
    let mut pending_match: Option<String> = None;
    while let Some(arg) = iter.next() {
        let mut value = |name: &str| {
            iter.next()
                .ok_or_else(|| anyhow::anyhow!("{} requires value", name))
        };
        match arg.as_str() {
            "--host" => config.host = value("--host")?,
            "--port" | "-p" => {
                config.port = Some(value("--port")?.parse().context("invalid --port")?);
            }
            "--user" | "-u" => {
                config.username = value("--user")?;
                config.allow_password_auth = true;
            }
            "--password" => {
                config.password = value("--password")?;
                config.allow_password_auth = true;
            }
            "--no-key-auth" => config.allow_key_auth = false,
            "--host-key" => {
                let path = value("--host-key")?;
                config.private_key = Some(
                    std::fs::read_to_string(&path)
                        .with_context(|| format!("failed to read {}", path))?,
                );
            }
            "--authorized-key" => {
                let path = value("--authorized-key")?;
                config.public_key = Some(
                    std::fs::read_to_string(&path)
                        .with_context(|| format!("failed to read {}", path))?,
                );
            }
            "--match" | "-m" => pending_match = Some(value("--match")?),
            "--response" | "-r" => {
                let command_match = pending_match
                    .take()
                    .ok_or_else(|| anyhow::anyhow!("--response must follow --match"))?;
                let response = value("--response")?;
                if config.command_match.is_none() {
                    config = config.with_fake_response(command_match, response);
                } else {
                    config.responses.push(FakeResponse::new(command_match, response));
                }
            }
            "--augment" => config.intercept_mode = InterceptMode::Augment,
            "--shell" => config.shell = value("--shell")?,
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

    if let Some(m) = pending_match {
        anyhow::bail!("--match {:?} has no --response", m);
    }

    Ok(config)
}

fn print_help() {
    eprintln!(
        r#"sshfake - fake SSH server for tests

USAGE:
    sshfake [OPTIONS]

OPTIONS:
    -C, --config <PATH>          TOML config file (flags override it)
        --host <HOST>            Listen host [default: 0.0.0.0]
    -p, --port <PORT>            Listen port [default: random]
    -u, --user <NAME>            Username for password auth
        --password <PASS>        Password for password auth
        --no-key-auth            Disable public key auth
        --host-key <PATH>        Host private key [default: generated]
        --authorized-key <PATH>  Accepted client public key [default: host key]
    -m, --match <TEXT>           Input that triggers the next --response
    -r, --response <TEXT>        Canned response for the preceding --match
        --augment                Keep real shell output alongside responses
        --shell <PATH>           Shell to run [default: bash]
    -h, --help                   Print help

EXAMPLES:
    sshfake --port 2222 --user joe --password user --match "ls -lha" --response "this is a test"
"#
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("sshfake=info".parse()?),
        )
        .init();

    let config = parse_args()?;
    let server = SshTestServer::new(config);
    let addr = server.start().await.context("failed to start server")?;
    info!(%addr, "ready, ctrl-c to stop");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;

    info!("shutting down");
    server.close().await?;
    Ok(())
}
