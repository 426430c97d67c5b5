//! Line-oriented control protocol.
//!
//! One `\n`-terminated line identifies the peer, one line answers it, and
//! everything after that is opaque payload:
//!
//! | Direction | Line |
//! |---|---|
//! | provider → broker | `REGISTER:<name>` |
//! | consumer → broker | `REQUEST:<name>` |
//! | broker → either | `OK:<text>` or `ERROR:<text>` |

use bytes::BytesMut;
use std::fmt;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{Error, Result};
use crate::name::{InvalidName, ServiceName};
use crate::stream::RelayStream;

/// Longest control line accepted by default, terminator excluded.
pub const DEFAULT_MAX_LINE_LEN: usize = 1024;

const REGISTER: &str = "REGISTER";
const REQUEST: &str = "REQUEST";
const OK: &str = "OK";
const ERROR: &str = "ERROR";

/// Reply text for an accepted registration.
pub const SERVICE_REGISTERED: &str = "Service registered";
/// Reply text for an established bridge.
pub const CONNECTED_TO_SERVICE: &str = "Connected to service";
/// Reply text when no provider is registered under the name.
pub const SERVICE_NOT_FOUND: &str = "Service not found";
/// Reply text for an unrecognised control line.
pub const INVALID_PROTOCOL: &str = "Invalid protocol";
/// Reply text for a name that fails validation.
pub const INVALID_SERVICE_NAME: &str = "Invalid service name";
/// Reply text when the authorization hook refuses the session.
pub const ACCESS_DENIED: &str = "Access denied";

/// Identification line sent by a provider or consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `REGISTER:<name>`: claim the name as provider.
    Register(ServiceName),
    /// `REQUEST:<name>`: ask to be bridged to the provider of `<name>`.
    Request(ServiceName),
}

/// Why an identification line was refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    /// Not a `REGISTER:`/`REQUEST:` line.
    #[error("unrecognised control line")]
    Unrecognised,
    /// Right keyword, unusable name.
    #[error(transparent)]
    Name(#[from] InvalidName),
}

impl CommandError {
    /// The `ERROR:` text sent back for this failure.
    pub fn reply(&self) -> Reply {
        match self {
            Self::Unrecognised => Reply::error(INVALID_PROTOCOL),
            Self::Name(_) => Reply::error(INVALID_SERVICE_NAME),
        }
    }
}

impl Command {
    /// Parse a control line. Surrounding whitespace, including a trailing
    /// `\r`, is ignored; the name is everything after the first colon.
    pub fn parse(line: &str) -> std::result::Result<Self, CommandError> {
        let (keyword, name) = line
            .trim()
            .split_once(':')
            .ok_or(CommandError::Unrecognised)?;
        match keyword {
            REGISTER => Ok(Self::Register(ServiceName::new(name)?)),
            REQUEST => Ok(Self::Request(ServiceName::new(name)?)),
            _ => Err(CommandError::Unrecognised),
        }
    }

    /// The service name carried by the command.
    pub fn name(&self) -> &ServiceName {
        match self {
            Self::Register(name) | Self::Request(name) => name,
        }
    }

    /// Wire form, including the terminator.
    pub fn to_line(&self) -> String {
        match self {
            Self::Register(name) => format!("{REGISTER}:{name}\n"),
            Self::Request(name) => format!("{REQUEST}:{name}\n"),
        }
    }
}

/// Broker answer to an identification line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// `OK:<text>`
    Ok(String),
    /// `ERROR:<text>`
    Error(String),
}

impl Reply {
    /// Success reply.
    pub fn ok(text: impl Into<String>) -> Self {
        Self::Ok(text.into())
    }

    /// Failure reply.
    pub fn error(text: impl Into<String>) -> Self {
        Self::Error(text.into())
    }

    /// Parse a reply line.
    pub fn parse(line: &str) -> Result<Self> {
        match line.trim().split_once(':') {
            Some((OK, text)) => Ok(Self::Ok(text.to_string())),
            Some((ERROR, text)) => Ok(Self::Error(text.to_string())),
            _ => Err(Error::protocol(format!("unexpected reply {line:?}"))),
        }
    }

    /// Wire form, including the terminator.
    pub fn to_line(&self) -> String {
        match self {
            Self::Ok(text) => format!("{OK}:{text}\n"),
            Self::Error(text) => format!("{ERROR}:{text}\n"),
        }
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.to_line().trim_end())
    }
}

/// Read one `\n`-terminated line from `reader`.
///
/// Returns the line without its terminator together with any bytes that were
/// read past it. Fails with [`Error::Protocol`] when the peer closes before a
/// terminator, the line exceeds `max_len`, or it is not valid UTF-8.
pub async fn read_line_from<R>(reader: &mut R, max_len: usize) -> Result<(String, BytesMut)>
where
    R: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(256);
    let mut scanned = 0;
    loop {
        if let Some(pos) = buf[scanned..].iter().position(|b| *b == b'\n') {
            let end = scanned + pos;
            if end > max_len {
                return Err(Error::protocol("control line too long"));
            }
            let mut line = buf.split_to(end + 1);
            line.truncate(end);
            let line = String::from_utf8(line.to_vec())
                .map_err(|_| Error::protocol("control line is not valid UTF-8"))?;
            return Ok((line, buf));
        }
        scanned = buf.len();
        if scanned > max_len {
            return Err(Error::protocol("control line too long"));
        }

        buf.reserve(256);
        if reader.read_buf(&mut buf).await? == 0 {
            return Err(Error::protocol("connection closed before control line"));
        }
    }
}

/// Read one control line from a relay stream, pushing any read-ahead bytes
/// back so the payload that follows stays intact.
pub async fn read_line(stream: &mut RelayStream, max_len: usize) -> Result<String> {
    let (line, rest) = read_line_from(stream, max_len).await?;
    stream.unread(&rest);
    Ok(line)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{PeerInfo, TransportKind};
    use tokio::io::AsyncWriteExt;

    fn name(s: &str) -> ServiceName {
        ServiceName::new(s).unwrap()
    }

    #[test]
    fn parses_register_and_request() {
        assert_eq!(
            Command::parse("REGISTER:cam1"),
            Ok(Command::Register(name("cam1")))
        );
        assert_eq!(
            Command::parse("REQUEST:cam1\r"),
            Ok(Command::Request(name("cam1")))
        );
        assert_eq!(
            Command::parse("REGISTER:a:b"),
            Ok(Command::Register(name("a:b")))
        );
    }

    #[test]
    fn rejects_unknown_and_empty() {
        assert_eq!(Command::parse("HELLO"), Err(CommandError::Unrecognised));
        assert_eq!(
            Command::parse("PROVIDER:cam1"),
            Err(CommandError::Unrecognised)
        );
        assert_eq!(Command::parse("register:cam1"), Err(CommandError::Unrecognised));
        assert_eq!(
            Command::parse("REGISTER:"),
            Err(CommandError::Name(InvalidName::Empty))
        );
        assert_eq!(
            Command::parse("REGISTER:").unwrap_err().reply().to_line(),
            "ERROR:Invalid service name\n"
        );
        assert_eq!(
            Command::parse("junk").unwrap_err().reply().to_line(),
            "ERROR:Invalid protocol\n"
        );
    }

    #[test]
    fn command_wire_form() {
        assert_eq!(Command::Register(name("cam1")).to_line(), "REGISTER:cam1\n");
        assert_eq!(Command::Request(name("cam1")).to_line(), "REQUEST:cam1\n");
    }

    #[test]
    fn replies() {
        assert_eq!(
            Reply::ok(SERVICE_REGISTERED).to_line(),
            "OK:Service registered\n"
        );
        assert_eq!(
            Reply::parse("ERROR:Service not found\n").unwrap(),
            Reply::error(SERVICE_NOT_FOUND)
        );
        assert_eq!(Reply::parse("OK:").unwrap(), Reply::ok(""));
        assert!(Reply::parse("OK").is_err());
        assert!(Reply::parse("CONNECT").is_err());
    }

    #[tokio::test]
    async fn line_reader_keeps_read_ahead() {
        let mut mock = tokio_test::io::Builder::new()
            .read(b"REQUEST:ca")
            .read(b"m1\npi")
            .build();
        let (line, rest) = read_line_from(&mut mock, DEFAULT_MAX_LINE_LEN)
            .await
            .unwrap();
        assert_eq!(line, "REQUEST:cam1");
        assert_eq!(&rest[..], b"pi");
    }

    #[tokio::test]
    async fn line_reader_rejects_eof_and_oversize() {
        let mut mock = tokio_test::io::Builder::new().read(b"REGISTER:cam").build();
        let err = read_line_from(&mut mock, DEFAULT_MAX_LINE_LEN)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));

        let long = vec![b'A'; 64];
        let mut mock = tokio_test::io::Builder::new().read(&long).build();
        let err = read_line_from(&mut mock, 16).await.unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[tokio::test]
    async fn relay_stream_line_then_payload() {
        let (near, mut far) = tokio::io::duplex(256);
        let mut stream = RelayStream::new(near, PeerInfo::new(None, TransportKind::Memory));
        far.write_all(b"REGISTER:cam1\nRFB 003.008\n").await.unwrap();
        drop(far);

        let line = read_line(&mut stream, DEFAULT_MAX_LINE_LEN).await.unwrap();
        assert_eq!(line, "REGISTER:cam1");

        let mut payload = Vec::new();
        stream.read_to_end(&mut payload).await.unwrap();
        assert_eq!(payload, b"RFB 003.008\n");
    }
}
