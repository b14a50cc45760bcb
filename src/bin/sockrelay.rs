use anyhow::{Context as _, Result, bail};
use clap::Parser;
use sockrelay::{PermitCommand, Socks5Server, StaticCredentials, dispatch::BoundedPool};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Parser, Debug)]
#[command(author, version, about = "A SOCKS5 proxy server", long_about = None)]
struct Args {
    /// Listener address
    #[arg(short, long, default_value = "127.0.0.1:1080")]
    listen: String,

    /// Username for SOCKS5 proxy
    #[arg(short, long)]
    username: Option<String>,

    /// Password for SOCKS5 proxy
    #[arg(short, long)]
    password: Option<String>,

    /// Additional user as name:password (repeatable)
    #[arg(long = "user", value_name = "NAME:PASSWORD")]
    users: Vec<String>,

    /// Address BIND and UDP ASSOCIATE listen on
    #[arg(long)]
    bind_ip: Option<IpAddr>,

    /// Size of the connection worker pool
    #[arg(short, long)]
    workers: Option<usize>,

    /// Refuse CONNECT requests
    #[arg(long)]
    no_connect: bool,

    /// Refuse BIND requests
    #[arg(long)]
    no_bind: bool,

    /// Refuse UDP ASSOCIATE requests
    #[arg(long)]
    no_associate: bool,

    /// Seconds BIND waits for the incoming connection
    #[arg(long, value_name = "SECS")]
    bind_timeout: Option<u64>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

/// credentials collects the users given on the command line
fn credentials(args: &Args) -> Result<Option<StaticCredentials>> {
    let mut users = Vec::new();

    match (&args.username, &args.password) {
        (Some(u), Some(p)) => users.push((u.clone(), p.clone())),
        (None, None) => {}
        _ => bail!("[ERR] must provide both username and password (or neither)"),
    }

    for user in &args.users {
        let (name, password) = user
            .split_once(':')
            .with_context(|| format!("[ERR] expected NAME:PASSWORD, got '{user}'"))?;
        users.push((name.to_string(), password.to_string()));
    }

    if users.is_empty() {
        Ok(None)
    } else {
        Ok(Some(users.into_iter().collect()))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse args
    let args = Args::parse();

    // Initialize tracing subscriber
    let level = if args.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt().with_max_level(level).init();

    let mut builder = Socks5Server::builder().with_rules(PermitCommand::new(
        !args.no_connect,
        !args.no_bind,
        !args.no_associate,
    ));

    // Check for auth and grab it if present
    if let Some(creds) = credentials(&args)? {
        info!("Authentication enabled");
        builder = builder.with_credentials(creds);
    }
    if let Some(ip) = args.bind_ip {
        builder = builder.with_bind_ip(ip);
    }
    if let Some(workers) = args.workers {
        builder = builder.with_task_pool(BoundedPool::new(workers));
    }
    if let Some(secs) = args.bind_timeout {
        builder = builder.with_bind_accept_timeout(Duration::from_secs(secs));
    }

    // Run it
    info!("Starting SOCKS5 proxy: {}", args.listen);
    Arc::new(builder.build()).listen_and_serve(args.listen).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use sockrelay::CredentialStore;

    #[test]
    fn repeated_users_are_collected() {
        let args = Args::parse_from([
            "sockrelay",
            "--username",
            "alice",
            "--password",
            "a",
            "--user",
            "bob:b:c",
        ]);
        let creds = credentials(&args).unwrap().unwrap();
        assert!(creds.valid("alice", "a", ""));
        assert!(creds.valid("bob", "b:c", ""));
    }

    #[test]
    fn half_a_login_is_rejected() {
        let args = Args::parse_from(["sockrelay", "--username", "alice"]);
        assert!(credentials(&args).is_err());
    }

    #[test]
    fn no_users_means_no_auth() {
        let args = Args::parse_from(["sockrelay"]);
        assert!(credentials(&args).unwrap().is_none());
    }
}
