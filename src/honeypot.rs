use crate::connection::Connection;
use crate::protocol::ProtocolConfig;
use crate::ratelimiter::RateLimiter;
use crate::session::{CredentialStore, HoneypotSession};
use crate::sink::MailboxSink;
use crate::utils::{self, Logger};
use crate::Opt;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::time;

pub struct SmtpHoneypot {
    pub opt: Opt,
    logger: Arc<Logger>,
    rate_limiter: Mutex<RateLimiter>,
    pub config: Arc<ProtocolConfig>,
    pub credentials: Arc<CredentialStore>,
    sink: Arc<MailboxSink>,
}

impl SmtpHoneypot {
    pub async fn new(opt: Opt) -> Result<Self> {
        let logger = Arc::new(Logger::new(opt.log_file.clone(), opt.raw_display, opt.verbose)?);

        let credentials = CredentialStore::parse(&opt.credentials, opt.accept_all_auth)?;
        if credentials.is_empty() && !credentials.accept_all() {
            eprintln!("[WARNING] No credentials configured: every AUTH attempt will be rejected");
        }

        let fqdn = match &opt.hostname {
            Some(hostname) => hostname.clone(),
            None => utils::system_hostname().unwrap_or_else(|| "localhost".to_string()),
        };

        let sink = MailboxSink::open(opt.data_dir.as_deref(), logger.clone()).await?;
        if let Some(data_dir) = &opt.data_dir {
            eprintln!("[INFO] Messages stored in: {:?}", data_dir);
        }

        Ok(Self {
            logger,
            rate_limiter: Mutex::new(RateLimiter::new(opt.max_connections_per_minute)),
            config: Arc::new(ProtocolConfig {
                banner: opt.banner.clone(),
                fqdn,
                max_message_size: opt.max_message_size,
            }),
            credentials: Arc::new(credentials),
            sink: Arc::new(sink),
            opt,
        })
    }

    pub async fn handle_client(&self, stream: TcpStream, client_addr: SocketAddr, port: u16) -> Result<()> {
        // Vérifier le rate limiting
        {
            let mut limiter = self.rate_limiter.lock().await;
            if !limiter.check_and_add(client_addr.ip()) {
                self.logger.log(&client_addr, &format!("Rate limit exceeded ({} per minute)", self.opt.max_connections_per_minute)).await;
                let mut stream = stream;
                let _ = stream.write_all(b"421 Too many connections from your IP\r\n").await;
                let _ = stream.shutdown().await;
                return Ok(());
            }
        }

        self.logger.log(&client_addr, &format!("New connection on port {}", port)).await;

        if self.opt.banner_delay > 0 {
            time::sleep(Duration::from_millis(self.opt.banner_delay)).await;
        }

        let (reader, writer) = stream.into_split();
        let session = HoneypotSession::new(client_addr, self.logger.clone(), self.credentials.clone());
        let connection = Connection::new(
            client_addr,
            self.config.clone(),
            session,
            self.sink.clone(),
            self.idle_timeout(),
        );

        let result = connection.serve(BufReader::new(reader), writer).await;
        self.logger.log(&client_addr, "Connection closed").await;
        result
    }

    /// `--idle-timeout 0` désactive la limite.
    fn idle_timeout(&self) -> Option<Duration> {
        match self.opt.idle_timeout {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    async fn run_server(self: Arc<Self>, port: u16) -> Result<()> {
        let addr = format!("{}:{}", self.opt.address, port);
        let listener = TcpListener::bind(&addr).await
            .with_context(|| format!("Failed to bind to {}", addr))?;

        self.logger.log(&utils::server_addr(), &format!("Listening on port {}", port)).await;

        loop {
            match listener.accept().await {
                Ok((stream, client_addr)) => {
                    let this = self.clone();

                    tokio::spawn(async move {
                        if let Err(e) = this.handle_client(stream, client_addr, port).await {
                            this.logger.log(&client_addr, &format!("Error: {}", e)).await;
                        }
                    });
                }
                Err(e) => {
                    self.logger.log(&utils::server_addr(), &format!("Accept error on port {}: {}", port, e)).await;
                }
            }
        }
    }

    pub async fn run(self: Arc<Self>) -> Result<()> {
        let mut handles = vec![];

        for port in self.opt.ports.clone() {
            let this = self.clone();
            let handle = tokio::spawn(async move {
                if let Err(e) = this.run_server(port).await {
                    eprintln!("[ERROR] Server on port {} failed: {:#}", port, e);
                }
            });
            handles.push(handle);
        }

        for handle in handles {
            handle.await?;
        }

        Ok(())
    }
}
