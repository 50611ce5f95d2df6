use chrono::Local;
use std::fs::{File, OpenOptions};
use std::io::{Write, BufWriter};
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio::sync::Mutex;

/// Filtre pour ne garder que les caractères ASCII imprimables et les espaces blancs
pub fn filter_printable_chars(input: &str) -> String {
    input.chars()
        .filter(|c| c.is_ascii_graphic() || c.is_ascii_whitespace())
        .collect()
}

/// Convertit les caractères non imprimables en séquences d'échappement
pub fn safe_log_string(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '\0' => result.push_str("\\0"),
            '\x01'..='\x08' | '\x0b' | '\x0c' | '\x0e'..='\x1f' | '\x7f' => {
                result.push_str(&format!("\\x{:02x}", c as u32));
            }
            _ if c.is_ascii_graphic() || c.is_ascii_whitespace() => {
                result.push(c);
            }
            _ => {
                result.push_str(&format!("\\u{{{:x}}}", c as u32));
            }
        }
    }
    result
}

/// Nom d'hôte de la machine, utilisé comme FQDN par défaut.
pub fn system_hostname() -> Option<String> {
    let mut buf = [0u8; 256];
    // SAFETY: buf est valide en écriture sur toute sa longueur
    let ret = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
    if ret != 0 {
        return None;
    }
    let len = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    let name = String::from_utf8_lossy(&buf[..len]).into_owned();
    if name.is_empty() {
        None
    } else {
        Some(name)
    }
}

/// Adresse utilisée pour les messages qui ne concernent pas un client.
pub fn server_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 0))
}

pub struct Logger {
    writer: Option<Mutex<BufWriter<File>>>,
    raw_display: bool,
    verbose: bool,
}

impl Logger {
    pub fn new(log_file: Option<PathBuf>, raw_display: bool, verbose: bool) -> anyhow::Result<Self> {
        let writer = if let Some(path) = log_file {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() && !parent.exists() {
                    std::fs::create_dir_all(parent)?;
                }
            }

            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;

            Some(Mutex::new(BufWriter::new(file)))
        } else {
            None
        };

        Ok(Self { writer, raw_display, verbose })
    }

    pub async fn log(&self, client_addr: &SocketAddr, message: &str) {
        let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S%.3f");

        let log_line = format!("{} {} {}\n", timestamp, client_addr, message);

        if self.raw_display {
            print!("{}", log_line);
        } else {
            print!("{}", filter_printable_chars(&log_line));
        }

        if let Some(writer) = &self.writer {
            let mut writer = writer.lock().await;
            let file_line = format!("{} {} {}\n", timestamp, client_addr, safe_log_string(message));
            let _ = writer.write_all(file_line.as_bytes());
            let _ = writer.flush();
        }
    }

    /// Bloc multi-lignes (tentative AUTH, corps de message). Affiché sur la
    /// console en mode verbeux seulement, toujours écrit dans le fichier.
    pub async fn log_verbose(&self, client_addr: &SocketAddr, title: &str, details: &str) {
        let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
        let separator = "─".repeat(60);

        if self.verbose {
            let display_details = if self.raw_display {
                details.to_string()
            } else {
                safe_log_string(details)
            };

            print!(
                "{}\n{} VERBOSE: {} {}\n{}\n{}\n{}\n\n",
                separator,
                timestamp,
                client_addr,
                title,
                separator,
                display_details,
                separator
            );
        }

        if let Some(writer) = &self.writer {
            let mut writer = writer.lock().await;
            let file_log = format!(
                "{}\n{} VERBOSE: {} {}\n{}\n{}\n{}\n\n",
                separator,
                timestamp,
                client_addr,
                title,
                separator,
                safe_log_string(details),
                separator
            );
            let _ = writer.write_all(file_log.as_bytes());
            let _ = writer.flush();
        }
    }
}
