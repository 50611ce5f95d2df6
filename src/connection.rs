use crate::protocol::{Action, Protocol, ProtocolConfig};
use crate::reply::Reply;
use crate::session::Session;
use crate::sink::MessageSink;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time;

/// Longueur maximale d'une ligne, CRLF compris (RFC 5321 §4.5.3.1.6).
pub const MAX_LINE_LENGTH: usize = 1000;

/// Relie la machine à états au flux réseau d'un client.
pub struct Connection<S, M> {
    peer: SocketAddr,
    config: Arc<ProtocolConfig>,
    session: S,
    sink: Arc<M>,
    /// `None` : pas de limite d'inactivité.
    idle_timeout: Option<Duration>,
}

impl<S: Session, M: MessageSink> Connection<S, M> {
    pub fn new(
        peer: SocketAddr,
        config: Arc<ProtocolConfig>,
        session: S,
        sink: Arc<M>,
        idle_timeout: Option<Duration>,
    ) -> Self {
        Self {
            peer,
            config,
            session,
            sink,
            idle_timeout,
        }
    }

    pub async fn serve<R, W>(&self, mut reader: R, mut writer: W) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let (mut protocol, banner) = Protocol::start(self.config.clone(), self.peer);
        self.send(&mut writer, &banner).await?;

        let mut buffer = Vec::with_capacity(MAX_LINE_LENGTH);

        loop {
            buffer.clear();

            let mut limited = (&mut reader).take(MAX_LINE_LENGTH as u64);
            let read = limited.read_until(b'\n', &mut buffer);
            let bytes_read = match self.idle_timeout {
                Some(idle_timeout) => match time::timeout(idle_timeout, read).await {
                    Ok(result) => result?,
                    Err(_) => {
                        self.send(&mut writer, &Reply::new(421, "Timeout, closing connection")).await?;
                        break;
                    }
                },
                None => read.await?,
            };

            if bytes_read == 0 {
                break;
            }

            let complete = buffer.ends_with(b"\n");
            let line = decode_line(&buffer);
            self.session.transcript_incoming(&line).await;

            if !complete {
                // Ligne trop longue, ou fin de flux au milieu d'une ligne
                if bytes_read >= MAX_LINE_LENGTH {
                    self.send(&mut writer, &Reply::new(500, "Error: line too long")).await?;
                }
                break;
            }

            if !self.dispatch(&mut protocol, &line, &mut writer).await? {
                break;
            }
        }

        let _ = writer.shutdown().await;
        Ok(())
    }

    /// Renvoie `false` quand la connexion doit être fermée.
    async fn dispatch<W>(&self, protocol: &mut Protocol, line: &str, writer: &mut W) -> Result<bool>
    where
        W: AsyncWrite + Unpin,
    {
        let mut action = protocol.process_line(line);

        loop {
            action = match action {
                Action::None => return Ok(true),
                Action::Reply(reply) => {
                    self.send(writer, &reply).await?;
                    return Ok(true);
                }
                Action::Close(reply) => {
                    self.send(writer, &reply).await?;
                    return Ok(false);
                }
                Action::Authenticate(attempt) => {
                    let accepted = self.session.try_auth(&attempt).await;
                    protocol.finish_auth(accepted)
                }
                Action::Deliver(message) => {
                    let status = self.sink.process_message(&message).await;
                    Action::Reply(protocol.finish_delivery(status))
                }
            };
        }
    }

    async fn send<W>(&self, writer: &mut W, reply: &Reply) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        for line in reply.lines() {
            self.session.transcript_outgoing(line).await;
            writer.write_all(line.as_bytes()).await?;
            writer.write_all(b"\r\n").await?;
        }
        writer.flush().await?;
        Ok(())
    }
}

fn decode_line(buffer: &[u8]) -> String {
    let line = buffer.strip_suffix(b"\n").unwrap_or(buffer);
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    String::from_utf8_lossy(line).into_owned()
}
