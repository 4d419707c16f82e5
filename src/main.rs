use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use namecrab::app::Bootstrap;
use namecrab::config::{RuntimeConfig, DEFAULT_CONFIG_FILE};
use namecrab::dns::NameServerFactory;
use namecrab::os::SystemPlatform;
use namecrab::report::Reporter;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// An authoritative DNS name server.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// Configuration file.
    #[arg(short = 'c', value_name = "FILE", default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,
    /// Stay in the foreground.
    #[arg(short = 'f')]
    foreground: bool,
    /// Log to standard error; implies -f.
    #[arg(short = 'g')]
    log_stderr: bool,
    /// Raise the log level. Repeat for more.
    #[arg(short = 'd', action = ArgAction::Count)]
    debug: u8,
    /// Worker threads (0 for one per CPU).
    #[arg(short = 'n', value_name = "N")]
    workers: Option<usize>,
    /// UDP listeners per interface (0 for automatic).
    #[arg(short = 'U', value_name = "N")]
    udp_listeners: Option<usize>,
    /// Maximum number of sockets.
    #[arg(short = 'S', value_name = "N")]
    max_sockets: Option<usize>,
    /// Directory to chroot into.
    #[arg(short = 't', value_name = "DIR")]
    chroot: Option<PathBuf>,
    /// User to run as.
    #[arg(short = 'u', value_name = "USER")]
    user: Option<String>,
    /// Use IPv4 only.
    #[arg(short = '4', conflicts_with = "ipv6_only")]
    ipv4_only: bool,
    /// Use IPv6 only.
    #[arg(short = '6')]
    ipv6_only: bool,
    /// Test option; may be repeated.
    #[arg(short = 'T', value_name = "OPTION", action = ArgAction::Append)]
    test: Vec<String>,
    /// Restrict system calls once the server is running.
    #[arg(long)]
    sandbox: bool,
    /// Dump core on fatal errors.
    #[arg(long)]
    core_dumps: bool,
}

fn main() {
    let cli = Cli::parse();
    let program = program_name();

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => Reporter::new(&program, cli.core_dumps).early_fatal(&format!("{e:#}")),
    };

    let reporter = Arc::new(Reporter::new(program, config.core_dumps));
    reporter.install_panic_hook();

    let platform = SystemPlatform::new();
    let outcome = Bootstrap::new(&reporter, &platform, &NameServerFactory).run(&config);
    std::process::exit(outcome.status.code());
}

fn program_name() -> String {
    std::env::args()
        .next()
        .as_deref()
        .and_then(|arg0| Path::new(arg0).file_name())
        .map_or_else(
            || env!("CARGO_PKG_NAME").to_string(),
            |name| name.to_string_lossy().into_owned(),
        )
}

fn load_config(cli: &Cli) -> Result<RuntimeConfig> {
    let mut config = RuntimeConfig::try_from_file(&cli.config)
        .with_context(|| format!("loading configuration from {}", cli.config.display()))?;
    tracing::debug!("loaded config from {}", cli.config.display());

    config.foreground |= cli.foreground || cli.log_stderr;
    config.log_stderr |= cli.log_stderr;
    config.debug_level = config.debug_level.max(cli.debug);
    config.sandbox |= cli.sandbox;
    config.core_dumps |= cli.core_dumps;
    if let Some(n) = cli.workers {
        config.workers = n;
    }
    if let Some(n) = cli.udp_listeners {
        config.udp_listeners = n;
    }
    if cli.max_sockets.is_some() {
        config.max_sockets = cli.max_sockets;
    }
    if cli.chroot.is_some() {
        config.chroot = cli.chroot.clone();
    }
    if cli.user.is_some() {
        config.user = cli.user.clone();
    }
    if cli.ipv4_only {
        config.disable_ipv6 = true;
        config.disable_ipv4 = false;
    }
    if cli.ipv6_only {
        config.disable_ipv4 = true;
        config.disable_ipv6 = false;
    }
    for option in &cli.test {
        config.apply_test_option(option)?;
    }
    config.validate()?;
    Ok(config)
}
