//! Scriptable SMTP exchanger for delivery tests.
#![allow(dead_code)]
//!
//! Replies are fixed per verb and every command received is recorded, so a
//! test can assert on exactly what the delivery engine sent.
//!
//! ```rust,no_run
//! let server = MockSmtpServer::builder()
//!     .with_rcpt_to_response(550, "User unknown")
//!     .build()
//!     .await?;
//! ```

use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
    sync::RwLock,
    time::timeout,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SmtpCommand {
    Ehlo(String),
    /// Address between the angle brackets.
    MailFrom(String),
    RcptTo(String),
    Data,
    /// Body as received, still dot-stuffed, without the final `.` line.
    MessageContent(Vec<u8>),
    Quit,
    Other(String),
}

#[derive(Debug, Clone)]
struct Reply {
    code: u16,
    message: String,
}

impl Reply {
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

#[derive(Debug, Clone)]
struct Script {
    greeting: Reply,
    ehlo: Reply,
    mail_from: Reply,
    rcpt_to: Reply,
    data: Reply,
    data_end: Reply,
    quit: Reply,
    response_delay: Option<Duration>,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            greeting: Reply::new(220, "mock.test ESMTP"),
            ehlo: Reply::new(250, "mock.test"),
            mail_from: Reply::new(250, "OK"),
            rcpt_to: Reply::new(250, "OK"),
            data: Reply::new(354, "Start mail input; end with <CRLF>.<CRLF>"),
            data_end: Reply::new(250, "OK: Message accepted"),
            quit: Reply::new(221, "Bye"),
            response_delay: None,
        }
    }
}

fn between_brackets(argument: &str) -> String {
    argument
        .split_once('<')
        .and_then(|(_, rest)| rest.split_once('>'))
        .map_or_else(|| argument.to_string(), |(address, _)| address.to_string())
}

pub struct MockSmtpServer {
    addr: SocketAddr,
    commands: Arc<RwLock<Vec<SmtpCommand>>>,
    shutdown: Arc<AtomicBool>,
}

impl MockSmtpServer {
    #[must_use]
    pub fn builder() -> MockSmtpServerBuilder {
        MockSmtpServerBuilder {
            script: Script::default(),
        }
    }

    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// `127.0.0.1:<port>`, suitable as an MX override.
    #[must_use]
    pub fn override_address(&self) -> String {
        self.addr.to_string()
    }

    pub async fn commands(&self) -> Vec<SmtpCommand> {
        self.commands.read().await.clone()
    }

    pub async fn messages(&self) -> Vec<Vec<u8>> {
        self.commands
            .read()
            .await
            .iter()
            .filter_map(|command| match command {
                SmtpCommand::MessageContent(content) => Some(content.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    async fn handle_client(
        mut stream: TcpStream,
        script: Arc<Script>,
        commands: Arc<RwLock<Vec<SmtpCommand>>>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let (reader, mut writer) = stream.split();
        let mut reader = BufReader::new(reader);
        let mut line = String::new();

        writer.write_all(&script.greeting.to_bytes()).await?;

        loop {
            line.clear();
            let Ok(read) = timeout(Duration::from_secs(10), reader.read_line(&mut line)).await
            else {
                return Ok(());
            };
            if read? == 0 {
                return Ok(());
            }

            let command_line = line.trim_end_matches(['\r', '\n']);
            let (verb, argument) = command_line
                .split_once(' ')
                .unwrap_or((command_line, ""));

            let (reply, command) = match verb.to_ascii_uppercase().as_str() {
                "EHLO" => (&script.ehlo, SmtpCommand::Ehlo(argument.to_string())),
                "MAIL" => (
                    &script.mail_from,
                    SmtpCommand::MailFrom(between_brackets(argument)),
                ),
                "RCPT" => (
                    &script.rcpt_to,
                    SmtpCommand::RcptTo(between_brackets(argument)),
                ),
                "DATA" => (&script.data, SmtpCommand::Data),
                "QUIT" => {
                    commands.write().await.push(SmtpCommand::Quit);
                    writer.write_all(&script.quit.to_bytes()).await?;
                    return Ok(());
                }
                _ => {
                    commands
                        .write()
                        .await
                        .push(SmtpCommand::Other(command_line.to_string()));
                    writer.write_all(b"502 Command not implemented\r\n").await?;
                    continue;
                }
            };

            let starts_data = command == SmtpCommand::Data && reply.code == 354;
            commands.write().await.push(command);

            if let Some(delay) = script.response_delay {
                tokio::time::sleep(delay).await;
            }
            writer.write_all(&reply.to_bytes()).await?;

            if starts_data {
                let mut content = Vec::new();
                loop {
                    line.clear();
                    if reader.read_line(&mut line).await? == 0 {
                        return Ok(());
                    }
                    if line.trim_end_matches(['\r', '\n']) == "." {
                        break;
                    }
                    content.extend_from_slice(line.as_bytes());
                }

                commands
                    .write()
                    .await
                    .push(SmtpCommand::MessageContent(content));
                writer.write_all(&script.data_end.to_bytes()).await?;
            }
        }
    }
}

pub struct MockSmtpServerBuilder {
    script: Script,
}

impl MockSmtpServerBuilder {
    #[must_use]
    pub fn with_greeting(mut self, code: u16, message: impl Into<String>) -> Self {
        self.script.greeting = Reply::new(code, message);
        self
    }

    #[must_use]
    pub fn with_mail_from_response(mut self, code: u16, message: impl Into<String>) -> Self {
        self.script.mail_from = Reply::new(code, message);
        self
    }

    #[must_use]
    pub fn with_rcpt_to_response(mut self, code: u16, message: impl Into<String>) -> Self {
        self.script.rcpt_to = Reply::new(code, message);
        self
    }

    #[must_use]
    pub fn with_data_end_response(mut self, code: u16, message: impl Into<String>) -> Self {
        self.script.data_end = Reply::new(code, message);
        self
    }

    #[must_use]
    pub const fn with_response_delay(mut self, delay: Duration) -> Self {
        self.script.response_delay = Some(delay);
        self
    }

    /// Bind to an ephemeral port and start accepting.
    pub async fn build(self) -> Result<MockSmtpServer, std::io::Error> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let script = Arc::new(self.script);
        let commands = Arc::new(RwLock::new(Vec::new()));
        let shutdown = Arc::new(AtomicBool::new(false));

        let server_commands = Arc::clone(&commands);
        let server_shutdown = Arc::clone(&shutdown);
        tokio::spawn(async move {
            while !server_shutdown.load(Ordering::Relaxed) {
                // Poll so the shutdown flag is noticed
                let Ok(Ok((stream, _))) =
                    timeout(Duration::from_millis(100), listener.accept()).await
                else {
                    continue;
                };

                let script = Arc::clone(&script);
                let commands = Arc::clone(&server_commands);
                tokio::spawn(async move {
                    if let Err(err) = MockSmtpServer::handle_client(stream, script, commands).await
                    {
                        tracing::debug!("Mock server client error: {err}");
                    }
                });
            }
        });

        Ok(MockSmtpServer {
            addr,
            commands,
            shutdown,
        })
    }
}
