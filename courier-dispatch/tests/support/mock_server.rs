//! Mock SMTP relay for transport tests
//!
//! A configurable plaintext SMTP server that can:
//! - Answer each command with a chosen reply
//! - Accept or reject `AUTH PLAIN` / `AUTH LOGIN`
//! - Reject individual recipients
//! - Drop the connection after a number of commands
//! - Record everything it received
#![allow(dead_code)] // Test utility module - not all methods used in every test

use std::{
    fmt::Write,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use ahash::AHashMap;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
    sync::RwLock,
    time::timeout,
};

/// SMTP command received by the mock server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SmtpCommand {
    Ehlo(String),
    /// The decoded `user` and `password`
    Auth {
        mechanism: String,
        username: String,
        password: String,
    },
    MailFrom(String),
    RcptTo(String),
    Data,
    /// Message content after DATA, dot-unstuffed
    MessageContent(String),
    Rset,
    Quit,
    Other(String),
}

#[derive(Debug, Clone)]
pub struct SmtpResponse {
    pub code: u16,
    pub message: String,
}

impl SmtpResponse {
    fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    fn to_bytes(&self) -> Vec<u8> {
        format!("{} {}\r\n", self.code, self.message).into_bytes()
    }
}

#[derive(Clone)]
struct MockServerConfig {
    greeting: SmtpResponse,
    capabilities: Vec<String>,
    auth_response: SmtpResponse,
    mail_from_response: SmtpResponse,
    rcpt_to_response: SmtpResponse,
    rcpt_overrides: AHashMap<String, SmtpResponse>,
    data_end_response: SmtpResponse,
    drop_after_commands: Option<usize>,
}

impl Default for MockServerConfig {
    fn default() -> Self {
        Self {
            greeting: SmtpResponse::new(220, "Mock SMTP Server"),
            capabilities: vec![
                "mock.example.com".to_string(),
                "AUTH PLAIN LOGIN".to_string(),
                "8BITMIME".to_string(),
            ],
            auth_response: SmtpResponse::new(235, "2.7.0 Accepted"),
            mail_from_response: SmtpResponse::new(250, "OK"),
            rcpt_to_response: SmtpResponse::new(250, "OK"),
            rcpt_overrides: AHashMap::new(),
            data_end_response: SmtpResponse::new(250, "OK: Message accepted"),
            drop_after_commands: None,
        }
    }
}

/// Mock SMTP server for testing
pub struct MockSmtpServer {
    addr: SocketAddr,
    commands_received: Arc<RwLock<Vec<SmtpCommand>>>,
    shutdown: Arc<AtomicBool>,
    connections: Arc<AtomicUsize>,
}

impl MockSmtpServer {
    #[must_use]
    pub fn builder() -> MockSmtpServerBuilder {
        MockSmtpServerBuilder::new()
    }

    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub async fn commands(&self) -> Vec<SmtpCommand> {
        self.commands_received.read().await.clone()
    }

    /// Bodies of every message received after DATA.
    pub async fn messages(&self) -> Vec<String> {
        self.commands()
            .await
            .into_iter()
            .filter_map(|cmd| match cmd {
                SmtpCommand::MessageContent(content) => Some(content),
                _ => None,
            })
            .collect()
    }

    #[must_use]
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::Relaxed)
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    fn ehlo_bytes(config: &MockServerConfig) -> Vec<u8> {
        let mut response = String::new();
        let last = config.capabilities.len().saturating_sub(1);
        for (i, cap) in config.capabilities.iter().enumerate() {
            let sep = if i < last { '-' } else { ' ' };
            let _ = write!(&mut response, "250{sep}{cap}\r\n");
        }
        response.into_bytes()
    }

    fn decode(value: &str) -> String {
        use base64::Engine;
        base64::engine::general_purpose::STANDARD
            .decode(value.trim())
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
            .unwrap_or_default()
    }

    #[allow(clippy::too_many_lines)]
    async fn handle_client(
        mut stream: TcpStream,
        config: Arc<MockServerConfig>,
        commands: Arc<RwLock<Vec<SmtpCommand>>>,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let (reader, mut writer) = stream.split();
        let mut reader = BufReader::new(reader);
        let mut line = String::new();
        let mut local_command_count = 0;

        writer.write_all(&config.greeting.to_bytes()).await?;
        writer.flush().await?;

        loop {
            line.clear();

            if let Some(drop_after) = config.drop_after_commands
                && local_command_count >= drop_after
            {
                return Ok(());
            }

            let read_result = timeout(Duration::from_secs(10), reader.read_line(&mut line)).await;
            let Ok(bytes_read) = read_result else {
                return Ok(());
            };
            if bytes_read? == 0 {
                return Ok(());
            }
            local_command_count += 1;

            let cmd_line = line.trim_end().to_string();
            let (verb, arg) = cmd_line
                .split_once(' ')
                .map_or((cmd_line.as_str(), ""), |(v, a)| (v, a));

            let (response, smtp_cmd) = match verb.to_uppercase().as_str() {
                "EHLO" => (
                    Self::ehlo_bytes(&config),
                    SmtpCommand::Ehlo(arg.to_string()),
                ),
                "AUTH" => {
                    let (mechanism, initial) =
                        arg.split_once(' ').map_or((arg, ""), |(m, i)| (m, i));
                    let (username, password) = if mechanism.eq_ignore_ascii_case("PLAIN") {
                        let decoded = Self::decode(initial);
                        let mut parts = decoded.split('\0').skip(1);
                        (
                            parts.next().unwrap_or_default().to_string(),
                            parts.next().unwrap_or_default().to_string(),
                        )
                    } else {
                        writer.write_all(b"334 VXNlcm5hbWU6\r\n").await?;
                        line.clear();
                        reader.read_line(&mut line).await?;
                        let username = Self::decode(&line);
                        writer.write_all(b"334 UGFzc3dvcmQ6\r\n").await?;
                        line.clear();
                        reader.read_line(&mut line).await?;
                        (username, Self::decode(&line))
                    };
                    (
                        config.auth_response.to_bytes(),
                        SmtpCommand::Auth {
                            mechanism: mechanism.to_uppercase(),
                            username,
                            password,
                        },
                    )
                }
                "MAIL" => (
                    config.mail_from_response.to_bytes(),
                    SmtpCommand::MailFrom(arg.to_string()),
                ),
                "RCPT" => {
                    let address = arg
                        .trim_start_matches("TO:")
                        .trim_matches(|c| c == '<' || c == '>')
                        .to_string();
                    let response = config
                        .rcpt_overrides
                        .get(&address)
                        .unwrap_or(&config.rcpt_to_response)
                        .to_bytes();
                    (response, SmtpCommand::RcptTo(address))
                }
                "DATA" => (
                    SmtpResponse::new(354, "Start mail input; end with <CRLF>.<CRLF>").to_bytes(),
                    SmtpCommand::Data,
                ),
                "RSET" => (SmtpResponse::new(250, "OK").to_bytes(), SmtpCommand::Rset),
                "NOOP" => (
                    SmtpResponse::new(250, "OK").to_bytes(),
                    SmtpCommand::Other(cmd_line.clone()),
                ),
                "QUIT" => {
                    commands.write().await.push(SmtpCommand::Quit);
                    writer.write_all(b"221 Bye\r\n").await?;
                    writer.flush().await?;
                    return Ok(());
                }
                _ => (
                    SmtpResponse::new(500, "Unknown command").to_bytes(),
                    SmtpCommand::Other(cmd_line.clone()),
                ),
            };

            let is_data = smtp_cmd == SmtpCommand::Data;
            commands.write().await.push(smtp_cmd);
            writer.write_all(&response).await?;
            writer.flush().await?;

            if is_data {
                let mut message_content = String::new();
                let mut data_line = String::new();

                loop {
                    data_line.clear();
                    if reader.read_line(&mut data_line).await? == 0 {
                        return Ok(());
                    }

                    if data_line.trim_end() == "." {
                        commands
                            .write()
                            .await
                            .push(SmtpCommand::MessageContent(message_content));
                        writer
                            .write_all(&config.data_end_response.to_bytes())
                            .await?;
                        writer.flush().await?;
                        break;
                    }

                    let unstuffed = data_line.strip_prefix('.').unwrap_or(&data_line);
                    message_content.push_str(unstuffed);
                }
            }
        }
    }
}

/// Builder for configuring a `MockSmtpServer`
pub struct MockSmtpServerBuilder {
    config: MockServerConfig,
}

impl MockSmtpServerBuilder {
    fn new() -> Self {
        Self {
            config: MockServerConfig::default(),
        }
    }

    #[must_use]
    pub fn with_greeting(mut self, code: u16, message: impl Into<String>) -> Self {
        self.config.greeting = SmtpResponse::new(code, message);
        self
    }

    /// EHLO lines after the first (the hostname line is kept).
    #[must_use]
    pub fn with_capabilities(mut self, capabilities: &[&str]) -> Self {
        self.config.capabilities.truncate(1);
        self.config
            .capabilities
            .extend(capabilities.iter().map(ToString::to_string));
        self
    }

    #[must_use]
    pub fn with_auth_response(mut self, code: u16, message: impl Into<String>) -> Self {
        self.config.auth_response = SmtpResponse::new(code, message);
        self
    }

    #[must_use]
    pub fn with_mail_from_response(mut self, code: u16, message: impl Into<String>) -> Self {
        self.config.mail_from_response = SmtpResponse::new(code, message);
        self
    }

    #[must_use]
    pub fn with_rcpt_to_response(mut self, code: u16, message: impl Into<String>) -> Self {
        self.config.rcpt_to_response = SmtpResponse::new(code, message);
        self
    }

    /// Answer RCPT for one address differently.
    #[must_use]
    pub fn with_rcpt_response_for(
        mut self,
        address: &str,
        code: u16,
        message: impl Into<String>,
    ) -> Self {
        self.config
            .rcpt_overrides
            .insert(address.to_string(), SmtpResponse::new(code, message));
        self
    }

    #[must_use]
    pub fn with_data_end_response(mut self, code: u16, message: impl Into<String>) -> Self {
        self.config.data_end_response = SmtpResponse::new(code, message);
        self
    }

    /// Drop every connection after N commands
    #[must_use]
    pub const fn with_network_error_after_commands(mut self, count: usize) -> Self {
        self.config.drop_after_commands = Some(count);
        self
    }

    /// Build and start the mock SMTP server
    ///
    /// # Errors
    ///
    /// Returns an error if the server fails to bind to a port
    pub async fn build(self) -> Result<MockSmtpServer, std::io::Error> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let config = Arc::new(self.config);
        let commands = Arc::new(RwLock::new(Vec::new()));
        let shutdown = Arc::new(AtomicBool::new(false));
        let connections = Arc::new(AtomicUsize::new(0));

        let commands_clone = Arc::clone(&commands);
        let shutdown_clone = Arc::clone(&shutdown);
        let connections_clone = Arc::clone(&connections);

        tokio::spawn(async move {
            loop {
                if shutdown_clone.load(Ordering::Relaxed) {
                    break;
                }

                // Accept with a timeout so the shutdown flag is checked
                let accept_result = timeout(Duration::from_millis(100), listener.accept()).await;

                if let Ok(Ok((stream, _peer))) = accept_result {
                    connections_clone.fetch_add(1, Ordering::Relaxed);
                    let config = Arc::clone(&config);
                    let commands = Arc::clone(&commands_clone);

                    tokio::spawn(async move {
                        if let Err(e) = MockSmtpServer::handle_client(stream, config, commands).await
                        {
                            tracing::debug!("Mock server client error: {e}");
                        }
                    });
                }
            }
        });

        Ok(MockSmtpServer {
            addr,
            commands_received: commands,
            shutdown,
            connections,
        })
    }
}
