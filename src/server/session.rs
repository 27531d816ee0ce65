//! Pluggable programs that run once a channel's shell request is accepted.

use std::sync::Arc;

use async_trait::async_trait;
use russh::server::{Handle, Msg};
use russh::Channel;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::auth::VerifiedIdentity;
use crate::error::Result;

/// Byte stream handed to a [`SessionHandler`].
pub trait SessionIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> SessionIo for T {}

/// The interactive program bound to an authenticated channel.
///
/// Returning ends the session; the channel is closed afterwards.
#[async_trait]
pub trait SessionHandler: Send + Sync {
    async fn handle(&self, identity: &VerifiedIdentity, io: Box<dyn SessionIo>) -> Result<()>;
}

/// Run `shell` on `channel`, then close the channel.
pub(crate) async fn run_session(
    shell: Arc<dyn SessionHandler>,
    identity: VerifiedIdentity,
    channel: Channel<Msg>,
    handle: Handle,
    conn_id: u64,
    cancel: CancellationToken,
) {
    let channel_id = channel.id();
    let io: Box<dyn SessionIo> = Box::new(channel.into_stream());
    tokio::select! {
        result = shell.handle(&identity, io) => {
            if let Err(e) = result {
                warn!(conn_id, channel = ?channel_id, error = %e, "Session handler failed");
            }
        }
        _ = cancel.cancelled() => {
            debug!(conn_id, channel = ?channel_id, "Session cancelled");
        }
    }
    let _ = handle.eof(channel_id).await;
    let _ = handle.close(channel_id).await;
    debug!(conn_id, channel = ?channel_id, login = %identity.login, "Session finished");
}

const CTRL_C: u8 = 0x03;
const CTRL_D: u8 = 0x04;
const BACKSPACE: u8 = 0x08;
const ESC: u8 = 0x1b;
const DELETE: u8 = 0x7f;

/// Echoes each line back to the user.
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoShell;

#[async_trait]
impl SessionHandler for EchoShell {
    async fn handle(&self, identity: &VerifiedIdentity, mut io: Box<dyn SessionIo>) -> Result<()> {
        let prompt = format!("{}> ", identity.login);
        io.write_all(prompt.as_bytes()).await?;
        io.flush().await?;

        let mut editor = LineEditor::default();
        let mut buf = [0u8; 1024];
        loop {
            let n = io.read(&mut buf).await?;
            if n == 0 {
                debug!(login = %identity.login, "Client closed the session");
                return Ok(());
            }
            let mut out = Vec::new();
            for &byte in &buf[..n] {
                match editor.feed(byte, &mut out) {
                    Some(Input::Line(line)) => {
                        debug!(login = %identity.login, %line, "Line received");
                        out.extend_from_slice(format!("You wrote: {line}\r\n{prompt}").as_bytes());
                    }
                    Some(Input::Hangup) => {
                        out.extend_from_slice(b"\r\n");
                        io.write_all(&out).await?;
                        io.flush().await?;
                        return Ok(());
                    }
                    None => {}
                }
            }
            io.write_all(&out).await?;
            io.flush().await?;
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Input {
    Line(String),
    Hangup,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
enum Escape {
    #[default]
    None,
    Started,
    Csi,
}

/// Minimal line discipline for clients in raw mode.
#[derive(Debug, Default)]
struct LineEditor {
    line: Vec<u8>,
    after_cr: bool,
    escape: Escape,
}

impl LineEditor {
    /// Consume one input byte, appending whatever should be echoed to `echo`.
    fn feed(&mut self, byte: u8, echo: &mut Vec<u8>) -> Option<Input> {
        let after_cr = std::mem::replace(&mut self.after_cr, false);
        match self.escape {
            Escape::Started => {
                self.escape = if byte == b'[' { Escape::Csi } else { Escape::None };
                return None;
            }
            Escape::Csi => {
                if (0x40..=0x7e).contains(&byte) {
                    self.escape = Escape::None;
                }
                return None;
            }
            Escape::None => {}
        }
        match byte {
            b'\r' => {
                self.after_cr = true;
                Some(self.finish(echo))
            }
            b'\n' if after_cr => None,
            b'\n' => Some(self.finish(echo)),
            CTRL_C => Some(Input::Hangup),
            CTRL_D if self.line.is_empty() => Some(Input::Hangup),
            BACKSPACE | DELETE => {
                if self.erase() {
                    echo.extend_from_slice(b"\x08 \x08");
                }
                None
            }
            ESC => {
                self.escape = Escape::Started;
                None
            }
            b if b < 0x20 => None,
            b => {
                self.line.push(b);
                echo.push(b);
                None
            }
        }
    }

    fn finish(&mut self, echo: &mut Vec<u8>) -> Input {
        echo.extend_from_slice(b"\r\n");
        let line = std::mem::take(&mut self.line);
        Input::Line(String::from_utf8_lossy(&line).into_owned())
    }

    /// Drop the last character, including all of its UTF-8 bytes.
    fn erase(&mut self) -> bool {
        if self.line.is_empty() {
            return false;
        }
        while let Some(byte) = self.line.pop() {
            if byte & 0xc0 != 0x80 {
                break;
            }
        }
        true
    }
}
