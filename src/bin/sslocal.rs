//! Local SOCKS5-to-encrypted-tunnel proxy.
//!
//! Listens on a local port, answers SOCKS5 negotiation, and forwards
//! every connection through a configured relay server with the whole
//! stream encrypted. Options may come from flags or a JSON config
//! file (`-c`); flags win.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use clap::Parser;

use sslocal::acl::Acl;
use sslocal::config::ConfigFile;
use sslocal::crypto::CipherKind;
use sslocal::{Config, Local, ServerAddr, DEFAULT_LOCAL_ADDR, DEFAULT_TIMEOUT_SECS};

#[derive(Parser, Debug)]
#[command(name = "sslocal", version, about)]
struct Opt {
    /// Relay server host; repeat for multiple servers
    #[arg(short = 's', long = "server")]
    server: Vec<String>,

    /// Relay server port
    #[arg(short = 'p', long = "server-port")]
    server_port: Option<u16>,

    /// Local bind address
    #[arg(short = 'b', long = "local-addr")]
    local_addr: Option<String>,

    /// Local SOCKS5 port
    #[arg(short = 'l', long = "local-port")]
    local_port: Option<u16>,

    /// Tunnel password
    #[arg(short = 'k', long = "password")]
    password: Option<String>,

    /// Cipher method
    #[arg(short = 'm', long = "method")]
    method: Option<String>,

    /// Upstream connect timeout in seconds
    #[arg(short = 't', long = "timeout")]
    timeout: Option<u64>,

    /// Daemonize and write a PID file here
    #[arg(short = 'f', long = "pid-file")]
    pid_file: Option<PathBuf>,

    /// Bind upstream sockets to this network interface (Linux only)
    #[arg(short = 'i', long = "iface")]
    iface: Option<String>,

    /// Run as this user once the listener is bound
    #[arg(short = 'a', long = "user")]
    user: Option<String>,

    /// Answer UDP ASSOCIATE with the stub reply
    #[arg(short = 'u', long = "udp-relay")]
    udp_relay: bool,

    /// Verbose logging
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,

    /// JSON configuration file
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// Attempt TCP Fast Open on upstream connects
    #[arg(long = "fast-open")]
    fast_open: bool,

    /// Bypass ACL file
    #[arg(long = "acl")]
    acl: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    let opt = Opt::parse();

    // Initialize tracing — respects RUST_LOG env var (e.g. RUST_LOG=debug)
    let default_level = if opt.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(false)
        .init();

    let config = build_config(&opt)?;

    #[cfg(unix)]
    if let Some(pid_file) = &opt.pid_file {
        daemonize(pid_file)?;
    }
    #[cfg(not(unix))]
    if opt.pid_file.is_some() {
        anyhow::bail!("-f/--pid-file is only supported on Unix");
    }

    if config.fast_open {
        tracing::info!("using tcp fast open");
    }
    if config.udp_relay {
        tracing::info!("udp associate stub enabled");
    }

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("building runtime")?;

    runtime.block_on(async {
        let local = Local::new(config);
        let listener = local.bind().await?;

        // Privileges are only needed for the bind; shed them before
        // any client traffic is handled.
        if let Some(user) = &opt.user {
            drop_privileges(user)?;
        }

        local.serve(listener).await?;
        Ok::<(), anyhow::Error>(())
    })
}

/// Merge flags over the optional config file into the runtime snapshot.
fn build_config(opt: &Opt) -> anyhow::Result<Config> {
    let file = match &opt.config {
        Some(path) => Some(ConfigFile::load(path)?),
        None => None,
    };
    let file = file.as_ref();

    let mut server_hosts = opt.server.clone();
    if server_hosts.is_empty() {
        if let Some(file) = file {
            server_hosts = file.server.clone();
        }
    }
    let server_port = opt.server_port.or(file.and_then(|f| f.server_port));
    let local_port = opt.local_port.or(file.and_then(|f| f.local_port));
    let password = opt
        .password
        .clone()
        .or(file.and_then(|f| f.password.clone()));

    const USAGE: &str = "a server (-s), server port (-p), local port (-l) and password (-k) \
                         are required, from flags or a config file (-c)";
    let (Some(server_port), Some(local_port), Some(password)) =
        (server_port, local_port, password)
    else {
        anyhow::bail!(USAGE);
    };
    if server_hosts.is_empty() {
        anyhow::bail!(USAGE);
    }

    let method: CipherKind = match opt
        .method
        .clone()
        .or(file.and_then(|f| f.method.clone()))
    {
        Some(name) => name.parse()?,
        None => CipherKind::default(),
    };
    tracing::info!("initializing cipher: {method}");

    let local_addr = opt
        .local_addr
        .clone()
        .or(file.and_then(|f| f.local_address.clone()))
        .unwrap_or_else(|| DEFAULT_LOCAL_ADDR.to_string());
    let timeout = opt
        .timeout
        .or(file.and_then(|f| f.timeout))
        .unwrap_or(DEFAULT_TIMEOUT_SECS);

    let servers = server_hosts
        .into_iter()
        .map(|host| ServerAddr {
            host,
            port: server_port,
        })
        .collect();

    let mut config = Config::new(
        servers,
        local_addr,
        local_port,
        method,
        &password,
        Duration::from_secs(timeout),
    );
    config.fast_open = opt.fast_open || file.map(|f| f.fast_open).unwrap_or(false);
    config.udp_relay = opt.udp_relay;
    config.iface = opt.iface.clone();
    config.nofile = file.and_then(|f| f.nofile);

    if let Some(path) = &opt.acl {
        let acl = Acl::load(path)?;
        tracing::info!("loaded {} bypass rules from {}", acl.len(), path.display());
        config.acl = Some(acl);
    }

    config
        .validate()
        .map_err(|e| anyhow::anyhow!("invalid configuration: {e}"))?;
    Ok(config)
}

#[cfg(unix)]
fn daemonize(pid_file: &Path) -> anyhow::Result<()> {
    daemonize::Daemonize::new()
        .pid_file(pid_file)
        .start()
        .with_context(|| format!("daemonizing with pid file {}", pid_file.display()))?;
    Ok(())
}

#[cfg(unix)]
fn drop_privileges(name: &str) -> anyhow::Result<()> {
    use nix::unistd::{setgid, setuid, User};

    let user = User::from_name(name)
        .with_context(|| format!("looking up user {name}"))?
        .with_context(|| format!("unknown user: {name}"))?;
    setgid(user.gid).context("setgid")?;
    setuid(user.uid).context("setuid")?;
    tracing::info!("running as {name}");
    Ok(())
}

#[cfg(not(unix))]
fn drop_privileges(_name: &str) -> anyhow::Result<()> {
    anyhow::bail!("-a/--user is only supported on Unix");
}
