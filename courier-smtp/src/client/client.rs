//! SMTP submission client with implicit TLS, STARTTLS and AUTH.

use std::{future::Future, time::Duration};

use base64::{Engine, engine::general_purpose::STANDARD};
use courier_common::{incoming, outgoing};
use tokio::net::TcpStream;

use super::{
    config::Credentials,
    connection::ClientConnection,
    error::{ClientError, Result},
    response::Response,
};

/// Initial size of the read buffer for SMTP responses.
const BUFFER_SIZE: usize = 8192;

/// Maximum size of the read buffer to prevent unbounded growth (1MB).
const MAX_BUFFER_SIZE: usize = 1024 * 1024;

const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(15);

/// An authentication mechanism the client can drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMechanism {
    Plain,
    Login,
}

impl AuthMechanism {
    const fn keyword(self) -> &'static str {
        match self {
            Self::Plain => "PLAIN",
            Self::Login => "LOGIN",
        }
    }
}

/// A single SMTP session.
///
/// Every read and write is bounded by the command timeout; the greeting has
/// its own deadline passed to [`SmtpClient::read_greeting`].
pub struct SmtpClient {
    connection: Option<ClientConnection>,
    buffer: Vec<u8>,
    buffer_pos: usize,
    server_domain: String,
    accept_invalid_certs: bool,
    command_timeout: Duration,
    capabilities: Vec<String>,
}

async fn deadline<T>(
    operation: &'static str,
    after: Duration,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::time::timeout(after, fut)
        .await
        .map_err(|_| ClientError::Timeout { operation, after })?
}

impl SmtpClient {
    fn from_connection(
        connection: ClientConnection,
        server_domain: String,
        accept_invalid_certs: bool,
    ) -> Self {
        Self {
            connection: Some(connection),
            buffer: vec![0u8; BUFFER_SIZE],
            buffer_pos: 0,
            server_domain,
            accept_invalid_certs,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            capabilities: Vec::new(),
        }
    }

    /// Opens a plain TCP connection to `addr`.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection fails or does not complete within
    /// `connect_timeout`.
    pub async fn connect(
        addr: &str,
        server_domain: impl Into<String>,
        connect_timeout: Duration,
    ) -> Result<Self> {
        let stream = deadline("connect", connect_timeout, async {
            Ok::<_, ClientError>(TcpStream::connect(addr).await?)
        })
        .await?;

        Ok(Self::from_connection(
            ClientConnection::Plain(stream),
            server_domain.into(),
            false,
        ))
    }

    /// Opens a connection that speaks TLS from the first byte (port 465).
    ///
    /// The handshake counts against `connect_timeout`.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection or the handshake fails, or either
    /// runs past the deadline.
    pub async fn connect_tls(
        addr: &str,
        server_domain: impl Into<String>,
        connect_timeout: Duration,
        accept_invalid_certs: bool,
    ) -> Result<Self> {
        let server_domain = server_domain.into();
        let connection = deadline("connect", connect_timeout, async {
            let stream = TcpStream::connect(addr).await?;
            ClientConnection::wrap_tls(stream, &server_domain, accept_invalid_certs).await
        })
        .await?;

        Ok(Self::from_connection(
            connection,
            server_domain,
            accept_invalid_certs,
        ))
    }

    /// Sets whether to accept invalid TLS certificates on `STARTTLS`.
    ///
    /// Default is `false`. Only meant for self-signed test servers.
    #[must_use]
    pub const fn accept_invalid_certs(mut self, accept: bool) -> Self {
        self.accept_invalid_certs = accept;
        self
    }

    #[must_use]
    pub const fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    #[must_use]
    pub fn is_tls(&self) -> bool {
        self.connection.as_ref().is_some_and(ClientConnection::is_tls)
    }

    /// Extension keywords from the last EHLO reply, e.g. `AUTH PLAIN LOGIN`.
    #[must_use]
    pub fn capabilities(&self) -> &[String] {
        &self.capabilities
    }

    /// Whether the server advertised `keyword` in its EHLO reply.
    #[must_use]
    pub fn supports(&self, keyword: &str) -> bool {
        self.capabilities.iter().any(|line| {
            line.split([' ', '='])
                .next()
                .is_some_and(|k| k.eq_ignore_ascii_case(keyword))
        })
    }

    /// Mechanisms advertised on the `AUTH` line (or the legacy `AUTH=` form).
    #[must_use]
    pub fn auth_mechanisms(&self) -> Vec<String> {
        self.capabilities
            .iter()
            .filter_map(|line| {
                let upper = line.to_ascii_uppercase();
                upper
                    .strip_prefix("AUTH ")
                    .or_else(|| upper.strip_prefix("AUTH="))
                    .map(str::to_string)
            })
            .flat_map(|mechs| {
                mechs
                    .split_whitespace()
                    .map(str::to_string)
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    /// Reads the `220` banner.
    ///
    /// # Errors
    ///
    /// Returns an error if the banner is not `220` or does not arrive within
    /// `timeout`.
    pub async fn read_greeting(&mut self, timeout: Duration) -> Result<Response> {
        deadline("greeting", timeout, self.read_response())
            .await?
            .expect_code(220)
    }

    /// Sends a raw command and reads the response.
    ///
    /// # Errors
    ///
    /// Returns an error if sending or reading fails or times out.
    pub async fn command(&mut self, command: &str) -> Result<Response> {
        outgoing!("{command}");
        self.exchange(command).await
    }

    /// Like [`SmtpClient::command`] but keeps the line out of the wire log.
    async fn secret_command(&mut self, label: &str, command: &str) -> Result<Response> {
        outgoing!("{label} <redacted>");
        self.exchange(command).await
    }

    async fn exchange(&mut self, command: &str) -> Result<Response> {
        let after = self.command_timeout;
        let data = format!("{command}\r\n");
        deadline("command", after, async {
            self.connection_mut()?.send(data.as_bytes()).await?;
            self.read_response().await
        })
        .await
    }

    /// Sends EHLO and records the advertised extensions.
    ///
    /// # Errors
    ///
    /// Returns an error unless the server answers `250`.
    pub async fn ehlo(&mut self, domain: &str) -> Result<Response> {
        let response = self.command(&format!("EHLO {domain}")).await?.expect_code(250)?;
        self.capabilities = response.lines.iter().skip(1).cloned().collect();
        Ok(response)
    }

    /// Sends `STARTTLS` and upgrades the connection.
    ///
    /// Capabilities are cleared; the caller must EHLO again.
    ///
    /// # Errors
    ///
    /// Returns an error if the server refuses or the handshake fails.
    pub async fn starttls(&mut self) -> Result<Response> {
        let response = self.command("STARTTLS").await?.expect_code(220)?;

        let old_connection = self.connection.take().ok_or(ClientError::ConnectionClosed)?;
        let domain = self.server_domain.clone();
        let accept_invalid = self.accept_invalid_certs;
        let after = self.command_timeout;

        self.connection = Some(
            deadline(
                "tls handshake",
                after,
                old_connection.upgrade_to_tls(&domain, accept_invalid),
            )
            .await?,
        );
        self.buffer_pos = 0;
        self.capabilities.clear();

        Ok(response)
    }

    /// Logs in with the best mechanism both sides support, PLAIN before LOGIN.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::AuthUnsupported`] when there is no common
    /// mechanism, or the server's rejection (typically `535`).
    pub async fn authenticate(&mut self, credentials: &Credentials) -> Result<Response> {
        let offered = self.auth_mechanisms();
        let mechanism = [AuthMechanism::Plain, AuthMechanism::Login]
            .into_iter()
            .find(|m| offered.iter().any(|o| o == m.keyword()))
            .ok_or_else(|| {
                ClientError::AuthUnsupported(if offered.is_empty() {
                    "none".to_string()
                } else {
                    offered.join(" ")
                })
            })?;

        self.authenticate_with(mechanism, credentials).await
    }

    /// Logs in with a specific mechanism regardless of what was advertised.
    ///
    /// # Errors
    ///
    /// Returns the server's rejection, or `UnexpectedResponse` when the
    /// exchange goes off script.
    pub async fn authenticate_with(
        &mut self,
        mechanism: AuthMechanism,
        credentials: &Credentials,
    ) -> Result<Response> {
        match mechanism {
            AuthMechanism::Plain => {
                let token = STANDARD.encode(format!(
                    "\0{}\0{}",
                    credentials.username, credentials.password
                ));
                self.secret_command("AUTH PLAIN", &format!("AUTH PLAIN {token}"))
                    .await?
                    .expect_code(235)
            }
            AuthMechanism::Login => {
                self.command("AUTH LOGIN").await?.expect_code(334)?;
                self.secret_command("username", &STANDARD.encode(&credentials.username))
                    .await?
                    .expect_code(334)?;
                self.secret_command("password", &STANDARD.encode(&credentials.password))
                    .await?
                    .expect_code(235)
            }
        }
    }

    /// # Errors
    ///
    /// Returns an error unless the server answers `250`.
    pub async fn mail_from(&mut self, from: &str) -> Result<Response> {
        self.command(&format!("MAIL FROM:<{from}>"))
            .await?
            .expect_code(250)
    }

    /// # Errors
    ///
    /// Returns an error unless the server accepts the recipient (`250`/`251`).
    pub async fn rcpt_to(&mut self, to: &str) -> Result<Response> {
        let response = self.command(&format!("RCPT TO:<{to}>")).await?.into_result()?;
        if matches!(response.code, 250 | 251) {
            Ok(response)
        } else {
            Err(ClientError::UnexpectedResponse {
                code: response.code,
                message: response.message(),
            })
        }
    }

    /// # Errors
    ///
    /// Returns an error unless the server answers `354`.
    pub async fn data(&mut self) -> Result<Response> {
        self.command("DATA").await?.expect_code(354)
    }

    /// Sends the message content and the terminating dot.
    ///
    /// Line endings are normalised to CRLF and lines starting with `.` are
    /// dot-stuffed.
    ///
    /// # Errors
    ///
    /// Returns an error if sending fails or the server does not accept the
    /// message with `250`.
    pub async fn send_data(&mut self, data: &str) -> Result<Response> {
        let payload = encode_data(data);
        outgoing!("<{} bytes of message data>", payload.len());

        let after = self.command_timeout;
        deadline("message data", after, async {
            self.connection_mut()?.send(payload.as_bytes()).await?;
            self.read_response().await
        })
        .await?
        .expect_code(250)
    }

    /// # Errors
    ///
    /// Returns an error if the command fails.
    pub async fn rset(&mut self) -> Result<Response> {
        self.command("RSET").await?.expect_code(250)
    }

    /// # Errors
    ///
    /// Returns an error if the command fails.
    pub async fn noop(&mut self) -> Result<Response> {
        self.command("NOOP").await?.expect_code(250)
    }

    /// # Errors
    ///
    /// Returns an error if the command fails.
    pub async fn quit(&mut self) -> Result<Response> {
        self.command("QUIT").await
    }

    /// Says goodbye if the connection still works, then closes the socket.
    ///
    /// Never fails; a broken connection is simply dropped.
    pub async fn close(&mut self) {
        if self.connection.is_some()
            && let Err(e) = self.quit().await
        {
            courier_common::tracing::debug!("QUIT failed while closing: {e}");
        }

        if let Some(mut connection) = self.connection.take() {
            let _ = tokio::time::timeout(self.command_timeout, connection.shutdown()).await;
        }
    }

    fn connection_mut(&mut self) -> Result<&mut ClientConnection> {
        self.connection.as_mut().ok_or(ClientError::ConnectionClosed)
    }

    async fn read_response(&mut self) -> Result<Response> {
        loop {
            if let Some((response, consumed)) =
                Response::parse_response(&self.buffer[..self.buffer_pos])?
            {
                self.buffer.copy_within(consumed..self.buffer_pos, 0);
                self.buffer_pos -= consumed;

                incoming!("{} {}", response.code, response.message());
                return Ok(response);
            }

            if self.buffer_pos >= self.buffer.len() {
                let new_size = self.buffer.len() * 2;
                if new_size > MAX_BUFFER_SIZE {
                    return Err(ClientError::ParseError(format!(
                        "Response too large (exceeds {MAX_BUFFER_SIZE} bytes)"
                    )));
                }
                self.buffer.resize(new_size, 0);
            }

            let pos = self.buffer_pos;
            let connection = self
                .connection
                .as_mut()
                .ok_or(ClientError::ConnectionClosed)?;
            let n = connection.read(&mut self.buffer[pos..]).await?;
            self.buffer_pos += n;
        }
    }
}

/// CRLF-normalise, dot-stuff and terminate message content for `DATA`.
fn encode_data(data: &str) -> String {
    let mut out = String::with_capacity(data.len() + data.len() / 16 + 5);
    for line in data.split('\n') {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.starts_with('.') {
            out.push('.');
        }
        out.push_str(line);
        out.push_str("\r\n");
    }

    // `split` yields a trailing empty piece when the data ends with a newline.
    if data.ends_with('\n') {
        out.truncate(out.len() - 2);
    }
    out.push_str(".\r\n");
    out
}
