//! Line-level NNTP session (RFC 3977, AUTHINFO from RFC 4643).
//!
//! Commands are built and status lines parsed by `nntp-rs`; this type owns the
//! transport so bodies keep their line structure for the yEnc decoder and can be
//! cut short at a byte limit.

use super::{ArticleBody, ArticleStatus, NntpSession, bracket_message_id, is_missing_article};
use crate::config::ServerConfig;
use crate::error::{Error, Result};
use async_trait::async_trait;
use nntp_rs::{codes, commands};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufStream};

/// Longest status or body line accepted
const MAX_LINE_BYTES: usize = 64 * 1024;

/// Byte stream a session runs over (plain TCP, TLS, or an in-memory pipe in tests)
pub trait NntpIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> NntpIo for T {}

/// An established, authenticated NNTP session
pub struct NntpConnection {
    stream: BufStream<Box<dyn NntpIo>>,
    io_timeout: Duration,
    /// A body was abandoned mid-response; nothing more can be said on this stream
    abandoned: bool,
}

impl std::fmt::Debug for NntpConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NntpConnection")
            .field("io_timeout", &self.io_timeout)
            .field("abandoned", &self.abandoned)
            .finish_non_exhaustive()
    }
}

fn status_error(context: &str, code: u16, message: &str) -> Error {
    Error::Nntp(format!("{}: {} {}", context, code, message))
}

impl NntpConnection {
    /// Read the greeting and authenticate when credentials are configured
    pub async fn handshake(io: Box<dyn NntpIo>, server: &ServerConfig) -> Result<Self> {
        let mut conn = Self {
            stream: BufStream::new(io),
            io_timeout: server.connect_timeout,
            abandoned: false,
        };

        let (code, message) = conn.read_status().await?;
        if code != codes::READY_POSTING_ALLOWED && code != codes::READY_NO_POSTING {
            return Err(status_error("server rejected connection", code, &message));
        }

        if let Some(username) = &server.username {
            conn.authenticate(username, server.password.as_deref().unwrap_or_default())
                .await?;
        }

        Ok(conn)
    }

    async fn authenticate(&mut self, username: &str, password: &str) -> Result<()> {
        let (code, message) = self.command(&commands::authinfo_user(username)).await?;
        if code == codes::AUTH_ACCEPTED {
            return Ok(());
        }
        if code != codes::AUTH_CONTINUE {
            return Err(status_error("AUTHINFO USER rejected", code, &message));
        }

        let (code, message) = self.command(&commands::authinfo_pass(password)).await?;
        if code == codes::AUTH_ACCEPTED {
            Ok(())
        } else {
            Err(status_error("authentication failed", code, &message))
        }
    }

    /// Send one CRLF-terminated command and read its status line
    async fn command(&mut self, command: &str) -> Result<(u16, String)> {
        if self.abandoned {
            return Err(Error::Nntp("session abandoned after a partial body".into()));
        }
        self.stream.write_all(command.as_bytes()).await?;
        self.stream.flush().await?;
        self.read_status().await
    }

    async fn read_status(&mut self) -> Result<(u16, String)> {
        let raw = self.read_raw_line().await?;
        let line = String::from_utf8_lossy(&raw);
        commands::parse_response_line(line.trim_end()).map_err(|e| Error::Nntp(e.to_string()))
    }

    /// One line including its terminator
    async fn read_raw_line(&mut self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        let read = tokio::time::timeout(self.io_timeout, async {
            loop {
                let available = self.stream.fill_buf().await?;
                if available.is_empty() {
                    return Ok::<bool, std::io::Error>(false);
                }
                let (used, done) = match available.iter().position(|b| *b == b'\n') {
                    Some(pos) => (pos + 1, true),
                    None => (available.len(), false),
                };
                buf.extend_from_slice(&available[..used]);
                self.stream.consume(used);
                if done || buf.len() > MAX_LINE_BYTES {
                    return Ok(true);
                }
            }
        })
        .await
        .map_err(|_| Error::Timeout)??;

        if !read && buf.is_empty() {
            return Err(Error::Nntp("connection closed by server".into()));
        }
        if buf.len() > MAX_LINE_BYTES {
            return Err(Error::Nntp("line exceeds maximum length".into()));
        }
        Ok(buf)
    }

    /// Read a dot-terminated block, undoing dot-stuffing. Stops before the first
    /// line that would take the block past `limit`.
    async fn read_multiline(&mut self, limit: usize) -> Result<ArticleBody> {
        let mut data = Vec::new();
        loop {
            let line = self.read_raw_line().await?;
            if line == b".\r\n" || line == b".\n" {
                return Ok(ArticleBody {
                    data,
                    complete: true,
                });
            }
            let content = if line.starts_with(b"..") {
                &line[1..]
            } else {
                &line[..]
            };
            if data.len() + content.len() > limit {
                self.abandoned = true;
                return Ok(ArticleBody {
                    data,
                    complete: false,
                });
            }
            data.extend_from_slice(content);
        }
    }
}

#[async_trait]
impl NntpSession for NntpConnection {
    async fn stat(&mut self, message_id: &str) -> Result<ArticleStatus> {
        let (code, message) = self
            .command(&commands::stat(&bracket_message_id(message_id)))
            .await?;
        match code {
            codes::ARTICLE_STAT => Ok(ArticleStatus::Present),
            code if is_missing_article(code) => Ok(ArticleStatus::Missing),
            _ => Err(status_error("unexpected STAT response", code, &message)),
        }
    }

    async fn body(&mut self, message_id: &str, limit: usize) -> Result<Option<ArticleBody>> {
        let (code, message) = self
            .command(&commands::body(&bracket_message_id(message_id)))
            .await?;
        match code {
            codes::BODY_FOLLOWS => self.read_multiline(limit).await.map(Some),
            code if is_missing_article(code) => Ok(None),
            _ => Err(status_error("unexpected BODY response", code, &message)),
        }
    }

    async fn ping(&mut self) -> Result<()> {
        let (code, message) = self.command(commands::date()).await?;
        if code == codes::SERVER_DATE {
            Ok(())
        } else {
            Err(status_error("unexpected DATE response", code, &message))
        }
    }

    async fn quit(&mut self) {
        if !self.abandoned
            && let Err(e) = self.command(commands::quit()).await
        {
            tracing::debug!(error = %e, "QUIT failed");
        }
        if let Err(e) = self.stream.shutdown().await {
            tracing::debug!(error = %e, "closing NNTP transport failed");
        }
    }
}
