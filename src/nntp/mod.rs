//! News server sessions.
//!
//! The triage engine only needs four commands: `STAT` to check that an article
//! exists, `BODY` to fetch one for header inspection, `DATE` as a keep-alive ping,
//! and `QUIT`. [`NntpSession`] is that surface; [`Connector`] produces sessions for
//! the pool. [`NntpConnector`] is the real TCP/TLS implementation, speaking the
//! command set and reply codes defined by `nntp-rs`.

mod connection;
mod connector;

pub use connection::{NntpConnection, NntpIo};
pub use connector::{NntpConnector, build_tls_config};

use crate::error::Result;
use async_trait::async_trait;
use nntp_rs::codes;

/// Answer to an existence check
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArticleStatus {
    /// The server has the article (`223`)
    Present,
    /// The server cleanly reported the article as unknown (`430` / `423`)
    Missing,
}

/// An article body as read off the wire, dot-unstuffed, lines kept intact
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArticleBody {
    /// Whole lines, at most the limit passed to [`NntpSession::body`]
    pub data: Vec<u8>,
    /// `false` when reading stopped at the limit; the rest of the response is
    /// still in flight and the session cannot be reused
    pub complete: bool,
}

/// One authenticated news server session
///
/// Any `Err` means the session is no longer trustworthy and must not be reused.
#[async_trait]
pub trait NntpSession: Send {
    /// Check whether an article exists (`STAT`)
    async fn stat(&mut self, message_id: &str) -> Result<ArticleStatus>;

    /// Fetch an article body (`BODY`), keeping at most `limit` bytes;
    /// `None` when the server reports it missing
    async fn body(&mut self, message_id: &str, limit: usize) -> Result<Option<ArticleBody>>;

    /// Cheap round-trip used to keep idle sessions alive (`DATE`)
    async fn ping(&mut self) -> Result<()>;

    /// Say goodbye and close the transport
    async fn quit(&mut self);
}

/// Factory for new sessions
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open, greet and authenticate a new session
    async fn connect(&self) -> Result<Box<dyn NntpSession>>;
}

/// Wrap a message id in angle brackets unless it already carries them
pub(crate) fn bracket_message_id(message_id: &str) -> String {
    let trimmed = message_id.trim();
    if trimmed.starts_with('<') && trimmed.ends_with('>') {
        trimmed.to_string()
    } else {
        format!("<{}>", trimmed)
    }
}

/// Reply codes meaning "no such article", by message id or by number
pub(crate) fn is_missing_article(code: u16) -> bool {
    code == codes::NO_SUCH_ARTICLE_ID || code == codes::NO_SUCH_ARTICLE_NUMBER
}
