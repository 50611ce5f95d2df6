use crate::protocol::Message;
use crate::utils::Logger;

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

pub const MAILBOX_FILE: &str = "honeypot.mbox";

/// Reçoit les messages complets. `None` signifie succès (`250 Ok`), sinon la
/// chaîne est renvoyée telle quelle au client.
pub trait MessageSink: Send + Sync {
    fn process_message(&self, message: &Message) -> impl Future<Output = Option<String>> + Send;
}

/// Boîte mbox en ajout seul, partagée par toutes les connexions.
pub struct MailboxSink {
    mailbox: Option<(PathBuf, Mutex<File>)>,
    logger: Arc<Logger>,
}

impl MailboxSink {
    pub async fn open(data_dir: Option<&Path>, logger: Arc<Logger>) -> Result<Self> {
        let mailbox = match data_dir {
            Some(data_dir) => {
                tokio::fs::create_dir_all(data_dir)
                    .await
                    .with_context(|| format!("Failed to create data directory: {:?}", data_dir))?;
                let path = data_dir.join(MAILBOX_FILE);
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&path)
                    .await
                    .with_context(|| format!("Failed to open mailbox: {:?}", path))?;
                Some((path, Mutex::new(file)))
            }
            None => None,
        };
        Ok(Self { mailbox, logger })
    }

    async fn append(&self, message: &Message) -> Result<Option<&Path>> {
        let (path, file) = match &self.mailbox {
            Some((path, file)) => (path, file),
            None => return Ok(None),
        };
        let record = format_mbox_record(message, Local::now());

        // Un seul écrivain à la fois pour ne pas entrelacer les messages
        let mut file = file.lock().await;
        file.write_all(record.as_bytes()).await?;
        file.flush().await?;
        Ok(Some(path.as_path()))
    }
}

impl MessageSink for MailboxSink {
    async fn process_message(&self, message: &Message) -> Option<String> {
        self.logger.log_verbose(&message.peer, "EMAIL DATA", &message.data).await;

        match self.append(message).await {
            Ok(Some(path)) => {
                self.logger.log(&message.peer, &format!("Email saved to: {:?}", path)).await;
                None
            }
            Ok(None) => None,
            Err(e) => {
                self.logger.log(&message.peer, &format!("Failed to save email: {}", e)).await;
                Some("451 Requested action aborted: error in processing".to_string())
            }
        }
    }
}

/// Enregistrement mbox (variante mboxrd) avec les en-têtes du honeypot.
pub fn format_mbox_record(message: &Message, received: DateTime<Local>) -> String {
    let sender = match message.mail_from.as_deref() {
        None | Some("<>") => "MAILER-DAEMON",
        Some(sender) => sender,
    };

    let mut record = String::with_capacity(message.data.len() + 256);
    record.push_str(&format!("From {} {}\n", sender, received.format("%a %b %e %H:%M:%S %Y")));
    record.push_str(&format!("X-Honeypot-Client: {}\n", message.peer));
    record.push_str(&format!("X-Honeypot-Date: {}\n", received.format("%Y-%m-%d %H:%M:%S")));
    if let Some(mail_from) = &message.mail_from {
        record.push_str(&format!("X-Honeypot-MailFrom: {}\n", mail_from));
    }
    for rcpt in &message.recipients {
        record.push_str(&format!("X-Honeypot-RcptTo: {}\n", rcpt));
    }

    for line in message.data.split('\n') {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.trim_start_matches('>').starts_with("From ") {
            record.push('>');
        }
        record.push_str(line);
        record.push('\n');
    }
    record.push('\n');
    record
}
