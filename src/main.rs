mod auth;
mod connection;
mod daemon;
mod honeypot;
mod protocol;
mod ratelimiter;
mod reply;
mod session;
mod sink;
mod utils;

use structopt::StructOpt;
use anyhow::{Context, Result};
use std::sync::Arc;
use std::path::PathBuf;

#[derive(Debug, StructOpt, Clone)]
#[structopt(
    name = "smtp-auth-honeypot",
    about = "A SMTP honeypot capturing AUTH credentials and submitted mail",
    author = "2026, Philippe TEMESI <https://www.tems.be>",
    version = "0.1.0"
)]
pub struct Opt {
    /// Run as daemon
    #[structopt(short = "d", long = "daemon")]
    pub daemon: bool,

    /// PID file written in daemon mode
    #[structopt(long = "pid-file", default_value = "/tmp/smtp-auth-honeypot.pid", parse(from_os_str))]
    pub pid_file: PathBuf,

    /// User to switch to in daemon mode
    #[structopt(long = "user")]
    pub user: Option<String>,

    /// Group to switch to in daemon mode
    #[structopt(long = "group")]
    pub group: Option<String>,

    /// Listening ports (can be specified multiple times, default: 25)
    #[structopt(short = "p", long = "port", default_value = "25", number_of_values = 1)]
    pub ports: Vec<u16>,

    /// Listening address (default: 0.0.0.0)
    #[structopt(short = "a", long = "address", default_value = "0.0.0.0")]
    pub address: String,

    /// Banner sent in the 220 greeting and the EHLO reply
    #[structopt(long = "banner", default_value = "smtp.local")]
    pub banner: String,

    /// FQDN used in CRAM-MD5 challenges (default: system hostname)
    #[structopt(long = "hostname")]
    pub hostname: Option<String>,

    /// Accepted credential as user:password (can be specified multiple times)
    #[structopt(long = "credential", number_of_values = 1)]
    pub credentials: Vec<String>,

    /// Accept every AUTH attempt
    #[structopt(long = "accept-all-auth")]
    pub accept_all_auth: bool,

    /// Log file path
    #[structopt(long = "logs", parse(from_os_str))]
    pub log_file: Option<PathBuf>,

    /// Directory to save email contents (mbox)
    #[structopt(long = "data", parse(from_os_str))]
    pub data_dir: Option<PathBuf>,

    /// Maximum connections per minute from same IP (default: 10)
    #[structopt(long = "max-connections", default_value = "10")]
    pub max_connections_per_minute: usize,

    /// Maximum message size in bytes
    #[structopt(long = "max-message-size", default_value = "10485760")]
    pub max_message_size: usize,

    /// Idle timeout in seconds before a silent client is disconnected (0 disables it)
    #[structopt(long = "idle-timeout", default_value = "300")]
    pub idle_timeout: u64,

    /// Banner delay in milliseconds (default: 0)
    #[structopt(long = "banner-delay", default_value = "0")]
    pub banner_delay: u64,

    /// Verbose mode - display AUTH attempts and message bodies
    #[structopt(short = "v", long = "verbose")]
    pub verbose: bool,

    /// Enable raw display (not filtered) - DANGEROUS
    #[structopt(short = "r", long = "raw")]
    pub raw_display: bool,
}

fn main() -> Result<()> {
    let opt = Opt::from_args();

    println!("==========================================");
    println!("SMTP AUTH Honeypot v{}", env!("CARGO_PKG_VERSION"));
    println!("==========================================");

    let user = users::get_current_username()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "unknown".to_string());
    eprintln!("[INFO] Starting as user: {}", user);
    eprintln!("[INFO] PID: {}", std::process::id());

    if users::get_effective_uid() != 0 && opt.ports.iter().any(|&port| port < 1024) {
        eprintln!("[WARNING] Privileged ports requested without root: {:?}", opt.ports);
    }

    // Vérifier/Créer les répertoires nécessaires AVANT daemonisation
    if let Some(log_path) = &opt.log_file {
        if let Some(parent) = log_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create log directory: {:?}", parent))?;
                eprintln!("[INFO] Created log directory: {:?}", parent);
            }
        }
    }

    // Le fork doit précéder la création du runtime tokio
    if opt.daemon {
        daemon::daemonize(&opt)?;
    }

    let runtime = tokio::runtime::Runtime::new().context("Failed to build tokio runtime")?;
    runtime.block_on(async {
        let honeypot = match honeypot::SmtpHoneypot::new(opt).await {
            Ok(h) => Arc::new(h),
            Err(e) => {
                eprintln!("[ERROR] Failed to create honeypot: {:#}", e);
                std::process::exit(1);
            }
        };

        println!("[INFO] Ports: {:?}", honeypot.opt.ports);
        println!("[INFO] Banner: {}", honeypot.config.banner);
        println!("[INFO] CRAM-MD5 hostname: {}", honeypot.config.fqdn);
        if honeypot.credentials.accept_all() {
            println!("[INFO] Accepting every AUTH attempt");
        } else {
            println!("[INFO] Configured credentials: {}", honeypot.credentials.len());
        }
        println!("[INFO] Max connections per minute per IP: {}", honeypot.opt.max_connections_per_minute);
        println!("[INFO] Waiting for connections...");

        honeypot.run().await
    })
}
