use std::fmt;
use std::io::{self, BufRead, BufReader, Cursor, ErrorKind};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use failure::Fail;
use lettre::smtp::client::net::NetworkStream;
use lettre::smtp::client::InnerClient;
use lettre::smtp::commands::{DataCommand, EhloCommand, MailCommand, RcptCommand};
use lettre::smtp::error::Error as LettreSmtpError;
use lettre::smtp::extension::ClientId;
use lettre::smtp::response::{Response, Severity};
use lettre::EmailAddress;

use super::Shutdown;

/// The step of the SMTP exchange a delivery failed at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Connect,
    Greeting,
    SenderDeclaration,
    RecipientDeclaration,
    BodyTransmission,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match *self {
            Stage::Connect => "connect",
            Stage::Greeting => "greeting",
            Stage::SenderDeclaration => "MAIL FROM",
            Stage::RecipientDeclaration => "RCPT TO",
            Stage::BodyTransmission => "DATA",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Worth retrying on a later run (4xx, network trouble)
    Transient,
    /// Retrying will not help without a change somewhere (5xx)
    Permanent,
    /// Abandoned because a shutdown was requested
    Cancelled,
}

impl fmt::Display for FailureClass {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match *self {
            FailureClass::Transient => "transient",
            FailureClass::Permanent => "permanent",
            FailureClass::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Fail)]
#[fail(display = "{} failed ({}): {}", stage, class, detail)]
pub struct DeliveryError {
    pub stage: Stage,
    pub class: FailureClass,
    pub detail: String,
}

impl DeliveryError {
    pub fn new<S: Into<String>>(stage: Stage, class: FailureClass, detail: S) -> DeliveryError {
        DeliveryError {
            stage,
            class,
            detail: detail.into(),
        }
    }

    fn io(stage: Stage, ioe: &io::Error) -> DeliveryError {
        DeliveryError::new(stage, io_failure_class(ioe), format!("I/O error: {}", ioe))
    }

    fn cancelled(stage: Stage) -> DeliveryError {
        DeliveryError::new(stage, FailureClass::Cancelled, "shutdown requested")
    }
}

/// One delivery of one message to one recipient through one exchanger
#[derive(Debug, Clone)]
pub struct DeliveryAttempt<'a> {
    pub host: &'a str,
    pub port: u16,
    pub sender: &'a str,
    pub recipient: &'a str,
    pub message: &'a [u8],
    /// The name we announce ourselves as
    pub helo_name: &'a str,
}

/// Performs a single outbound delivery attempt
pub trait Transport: Send + Sync {
    fn deliver(&self, attempt: &DeliveryAttempt<'_>, shutdown: &Shutdown)
        -> Result<(), DeliveryError>;
}

/// Plaintext SMTP delivery straight to an exchanger
#[derive(Debug, Clone)]
pub struct SmtpTransport {
    connect_timeout: Duration,
    io_timeout: Duration,
}

impl SmtpTransport {
    pub fn new(connect_timeout: Duration, io_timeout: Duration) -> SmtpTransport {
        SmtpTransport {
            connect_timeout,
            io_timeout,
        }
    }

    fn connect(&self, host: &str, port: u16) -> Result<TcpStream, DeliveryError> {
        let addrs: Vec<SocketAddr> = match (host, port).to_socket_addrs() {
            Ok(iter) => iter.collect(),
            Err(e) => {
                warn!("ToSocketAddr failed for ({}, {}): {:?}", host, port, e);
                return Err(DeliveryError::io(Stage::Connect, &e));
            }
        };
        if addrs.is_empty() {
            return Err(DeliveryError::new(
                Stage::Connect,
                FailureClass::Permanent,
                format!("no addresses for ({}, {})", host, port),
            ));
        }

        let mut last_error: Option<io::Error> = None;
        for addr in &addrs {
            match TcpStream::connect_timeout(addr, self.connect_timeout) {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    debug!("connect to {} ({}) failed: {}", host, addr, e);
                    last_error = Some(e);
                }
            }
        }
        let e = last_error
            .unwrap_or_else(|| io::Error::new(ErrorKind::NotConnected, "no address connected"));
        Err(DeliveryError::io(Stage::Connect, &e))
    }
}

impl Transport for SmtpTransport {
    fn deliver(
        &self,
        attempt: &DeliveryAttempt<'_>,
        shutdown: &Shutdown,
    ) -> Result<(), DeliveryError> {
        checkpoint(shutdown, Stage::Connect)?;
        let stream = self.connect(attempt.host, attempt.port)?;
        stream
            .set_read_timeout(Some(self.io_timeout))
            .and_then(|_| stream.set_write_timeout(Some(self.io_timeout)))
            .map_err(|e| DeliveryError::io(Stage::Connect, &e))?;

        // Banner, then EHLO (HELO for servers which refuse EHLO)
        checkpoint(shutdown, Stage::Greeting)?;
        let banner = read_banner(&stream)?;
        trace!("{} greeted us: {:?}", attempt.host, banner);

        let mut session = Session::new(stream);
        let client = &mut session.client;
        let client_id = ClientId::Domain(attempt.helo_name.to_owned());
        match client.command(EhloCommand::new(client_id.clone())) {
            Ok(_) => {}
            Err(LettreSmtpError::Permanent(response)) => {
                debug!("EHLO refused by {} ({:?}), trying HELO", attempt.host, response);
                client
                    .command(HeloCommand(client_id))
                    .map_err(|e| classify(Stage::Greeting, e))?;
            }
            Err(e) => return Err(classify(Stage::Greeting, e)),
        }

        checkpoint(shutdown, Stage::SenderDeclaration)?;
        let from = email_address(attempt.sender, Stage::SenderDeclaration)?;
        client
            .command(MailCommand::new(Some(from), vec![]))
            .map_err(|e| classify(Stage::SenderDeclaration, e))?;

        checkpoint(shutdown, Stage::RecipientDeclaration)?;
        let to = email_address(attempt.recipient, Stage::RecipientDeclaration)?;
        client
            .command(RcptCommand::new(to, vec![]))
            .map_err(|e| classify(Stage::RecipientDeclaration, e))?;

        checkpoint(shutdown, Stage::BodyTransmission)?;
        client
            .command(DataCommand)
            .map_err(|e| classify(Stage::BodyTransmission, e))?;
        let response = client
            .message(Box::new(Cursor::new(wire_body(attempt.message))))
            .map_err(|e| classify(Stage::BodyTransmission, e))?;
        debug!(
            "{} accepted message for {}: {:?}",
            attempt.host, attempt.recipient, response
        );

        // QUIT goes out when the session drops; the message is accepted
        // already, so its reply changes nothing
        Ok(())
    }
}

// Owns the client so the connection is shut down on every exit path.
// `InnerClient::close` sends QUIT before dropping the stream.
struct Session {
    client: InnerClient<NetworkStream>,
}

impl Session {
    fn new(stream: TcpStream) -> Session {
        let mut client = InnerClient::new();
        client.set_stream(NetworkStream::Tcp(stream));
        Session { client }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.client.close();
    }
}

/// Reads the server greeting straight off the socket, before lettre takes
/// over the stream.  Nothing else is sent by the server until we speak, so
/// buffering here cannot swallow a later reply.
fn read_banner(stream: &TcpStream) -> Result<Response, DeliveryError> {
    let mut reader = BufReader::new(stream);
    let mut raw = String::new();
    loop {
        let start = raw.len();
        let count = reader
            .read_line(&mut raw)
            .map_err(|e| DeliveryError::io(Stage::Greeting, &e))?;
        if count == 0 {
            return Err(DeliveryError::new(
                Stage::Greeting,
                FailureClass::Transient,
                "connection closed before the greeting",
            ));
        }
        // "220-" continues a multi-line reply, "220 " ends it
        if raw.as_bytes().get(start + 3) != Some(&b'-') {
            break;
        }
    }

    let response = raw.parse::<Response>().map_err(|e| {
        DeliveryError::new(
            Stage::Greeting,
            FailureClass::Permanent,
            format!("unparseable greeting {:?}: {:?}", raw.trim_end(), e),
        )
    })?;
    match response.code.severity {
        Severity::PositiveCompletion => Ok(response),
        Severity::TransientNegativeCompletion => Err(DeliveryError::new(
            Stage::Greeting,
            FailureClass::Transient,
            format!("{:?}", response),
        )),
        _ => Err(DeliveryError::new(
            Stage::Greeting,
            FailureClass::Permanent,
            format!("{:?}", response),
        )),
    }
}

/// Puts a queued body into SMTP line form.  Bare LF and bare CR become CRLF
/// so lettre's transparency codec sees every line start, and a dot opening
/// the very first line is doubled since the codec only stuffs after a CRLF.
fn wire_body(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len() + body.len() / 32 + 1);
    if body.first() == Some(&b'.') {
        out.push(b'.');
    }
    let mut bytes = body.iter().peekable();
    while let Some(&byte) = bytes.next() {
        match byte {
            b'\r' => {
                out.extend_from_slice(b"\r\n");
                if bytes.peek() == Some(&&b'\n') {
                    bytes.next();
                }
            }
            b'\n' => out.extend_from_slice(b"\r\n"),
            _ => out.push(byte),
        }
    }
    out
}

// lettre only ships EHLO
struct HeloCommand(ClientId);

impl fmt::Display for HeloCommand {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "HELO {}\r\n", self.0)
    }
}

fn checkpoint(shutdown: &Shutdown, stage: Stage) -> Result<(), DeliveryError> {
    if shutdown.is_triggered() {
        Err(DeliveryError::cancelled(stage))
    } else {
        Ok(())
    }
}

fn email_address(addr: &str, stage: Stage) -> Result<EmailAddress, DeliveryError> {
    EmailAddress::new(addr.to_owned()).map_err(|e| {
        DeliveryError::new(
            stage,
            FailureClass::Permanent,
            format!("invalid address {}: {:?}", addr, e),
        )
    })
}

#[allow(unreachable_patterns)] // lettre may add more
fn classify(stage: Stage, err: LettreSmtpError) -> DeliveryError {
    match err {
        LettreSmtpError::Transient(response) => {
            DeliveryError::new(stage, FailureClass::Transient, format!("{:?}", response))
        }
        LettreSmtpError::Permanent(response) => {
            DeliveryError::new(stage, FailureClass::Permanent, format!("{:?}", response))
        }
        LettreSmtpError::Resolution => {
            DeliveryError::new(stage, FailureClass::Transient, "DNS resolution failed")
        }
        LettreSmtpError::Io(ioe) => DeliveryError::io(stage, &ioe),
        e => DeliveryError::new(stage, FailureClass::Permanent, format!("{:?}", e)),
    }
}

fn io_failure_class(ioe: &io::Error) -> FailureClass {
    match ioe.kind() {
        ErrorKind::ConnectionRefused
        | ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::AddrInUse
        | ErrorKind::BrokenPipe
        | ErrorKind::TimedOut
        | ErrorKind::WouldBlock
        | ErrorKind::UnexpectedEof
        | ErrorKind::Interrupted => FailureClass::Transient,
        _ => {
            // Kinds stable rust doesn't name yet still show up in the debug output
            let asdebug = format!("{:?}", ioe);
            if asdebug.contains("kind: HostUnreachable")
                || asdebug.contains("kind: NetworkUnreachable")
                || asdebug.contains("kind: NetworkDown")
                || asdebug.contains("kind: ResourceBusy")
            {
                FailureClass::Transient
            } else {
                FailureClass::Permanent
            }
        }
    }
}
