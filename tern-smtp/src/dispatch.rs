//! Command dispatch.
//!
//! Every verb maps to one [`HandlerSpec`]. The spec carries the guards the
//! dispatcher enforces before the handler runs, so handlers only deal with
//! their own argument syntax and state transition.

use std::{
    borrow::Cow,
    fmt::{self, Display, Formatter},
};

use tern_common::{address::is_plausible, internal, status::Status};

use crate::{
    auth::{self, AuthError, PASSWORD_PROMPT, USERNAME_PROMPT},
    command::{Command, Verb, path_argument},
    session::SessionConfig,
    state::{AuthStep, Context, State},
};

#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub enum Event {
    ConnectionClose,
    ConnectionKeepAlive,
}

/// A reply to the client, possibly spanning several lines.
#[derive(PartialEq, Eq, Debug, Clone)]
pub struct Reply {
    pub status: Status,
    pub lines: Vec<Cow<'static, str>>,
}

impl Reply {
    pub fn new(status: Status, text: impl Into<Cow<'static, str>>) -> Self {
        Self {
            status,
            lines: vec![text.into()],
        }
    }

    #[must_use]
    pub const fn multi(status: Status, lines: Vec<Cow<'static, str>>) -> Self {
        Self { status, lines }
    }

    #[must_use]
    pub fn ok() -> Self {
        Self::new(Status::Ok, "OK")
    }

    /// The first line of text, or an empty string.
    #[must_use]
    pub fn text(&self) -> &str {
        self.lines.first().map_or("", |line| line.as_ref())
    }
}

impl Display for Reply {
    /// Every line but the last is written as `code-text`, the last as
    /// `code text`. Lines are separated by CRLF without a trailing one.
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        if self.lines.is_empty() {
            return write!(fmt, "{} ", self.status);
        }

        let last = self.lines.len() - 1;
        for (index, line) in self.lines.iter().enumerate() {
            if index == last {
                write!(fmt, "{} {line}", self.status)?;
            } else {
                write!(fmt, "{}-{line}\r\n", self.status)?;
            }
        }

        Ok(())
    }
}

pub type Response = (Reply, Event);

type Handler = fn(&mut Context, &SessionConfig, &str) -> Response;

/// Dispatch-table entry for a verb.
#[derive(Clone, Copy)]
pub struct HandlerSpec {
    /// Rejected with `530` when the server requires authentication and the
    /// session has not authenticated.
    pub requires_auth: bool,
    /// Rejected with `503` outside a mail transaction.
    pub requires_transaction: bool,
    pub handle: Handler,
}

impl HandlerSpec {
    const fn open(handle: Handler) -> Self {
        Self {
            requires_auth: false,
            requires_transaction: false,
            handle,
        }
    }

    const fn in_transaction(handle: Handler) -> Self {
        Self {
            requires_auth: false,
            requires_transaction: true,
            handle,
        }
    }
}

impl Verb {
    #[must_use]
    pub const fn handler(self) -> HandlerSpec {
        match self {
            Self::Helo => HandlerSpec::open(helo),
            Self::Ehlo => HandlerSpec::open(ehlo),
            Self::Auth => HandlerSpec::open(auth),
            Self::Mail => HandlerSpec {
                requires_auth: true,
                requires_transaction: false,
                handle: mail,
            },
            Self::Rcpt => HandlerSpec::in_transaction(rcpt),
            Self::Data => HandlerSpec::in_transaction(data),
            Self::Rset => HandlerSpec::open(rset),
            Self::Noop => HandlerSpec::open(noop),
            Self::Quit => HandlerSpec::open(quit),
            Self::Help => HandlerSpec::open(help),
            Self::Vrfy => HandlerSpec::open(vrfy),
            Self::Expn | Self::Unknown => HandlerSpec::open(not_implemented),
        }
    }
}

const fn keep_alive(reply: Reply) -> Response {
    (reply, Event::ConnectionKeepAlive)
}

fn bad_sequence(text: &'static str) -> Response {
    keep_alive(Reply::new(Status::InvalidCommandSequence, text))
}

fn syntax_error(text: &'static str) -> Response {
    keep_alive(Reply::new(Status::SyntaxError, text))
}

/// Run one command line against the session context.
pub fn dispatch(context: &mut Context, config: &SessionConfig, command: &Command) -> Response {
    let spec = command.verb.handler();

    if spec.requires_auth && config.require_auth && !context.authenticated {
        return keep_alive(Reply::new(Status::AuthRequired, "Authentication required"));
    }

    if spec.requires_transaction && !context.in_transaction() {
        return bad_sequence("Bad sequence of commands");
    }

    (spec.handle)(context, config, &command.args)
}

fn greet(context: &mut Context, host: &str) {
    context.client_host = Some(host.to_string());
    context.reset_transaction();
}

fn helo(context: &mut Context, config: &SessionConfig, args: &str) -> Response {
    if args.is_empty() {
        return syntax_error("Syntax: HELO hostname");
    }

    greet(context, args);
    keep_alive(Reply::new(
        Status::Ok,
        format!("{} Hello {args}", config.banner),
    ))
}

fn ehlo(context: &mut Context, config: &SessionConfig, args: &str) -> Response {
    if args.is_empty() {
        return syntax_error("Syntax: EHLO hostname");
    }

    greet(context, args);
    keep_alive(Reply::multi(
        Status::Ok,
        vec![
            Cow::Owned(format!("{} Hello {args}", config.banner)),
            Cow::Owned(format!("SIZE {}", config.max_message_size)),
            Cow::Borrowed("PIPELINING"),
            Cow::Borrowed("ENHANCEDSTATUSCODES"),
            Cow::Borrowed("8BITMIME"),
            Cow::Borrowed("AUTH LOGIN PLAIN"),
            Cow::Borrowed("SMTPUTF8"),
        ],
    ))
}

fn auth(context: &mut Context, config: &SessionConfig, args: &str) -> Response {
    if context.client_host.is_none() {
        return bad_sequence("Send HELO/EHLO first");
    }

    if context.authenticated {
        return bad_sequence("Already authenticated");
    }

    if context.in_transaction() {
        return bad_sequence("AUTH not permitted during a mail transaction");
    }

    let mut parts = args.split_whitespace();
    let Some(mechanism) = parts.next() else {
        return syntax_error("Missing argument");
    };
    let initial = parts.next();
    if parts.next().is_some() {
        return syntax_error("Invalid arguments");
    }

    if mechanism.eq_ignore_ascii_case("PLAIN") {
        match initial {
            Some(response) => finish_plain(context, config, response),
            None => {
                context.auth_step = Some(AuthStep::Plain);
                keep_alive(Reply::new(Status::AuthChallenge, ""))
            }
        }
    } else if mechanism.eq_ignore_ascii_case("LOGIN") {
        match initial {
            Some(response) => login_username(context, response),
            None => {
                context.auth_step = Some(AuthStep::LoginUsername);
                keep_alive(Reply::new(Status::AuthChallenge, USERNAME_PROMPT))
            }
        }
    } else {
        keep_alive(Reply::new(
            Status::ParameterNotImplemented,
            "Unrecognized authentication type",
        ))
    }
}

/// Feed the client's answer to an outstanding AUTH challenge.
pub fn auth_continuation(context: &mut Context, config: &SessionConfig, line: &str) -> Response {
    let Some(step) = context.auth_step.take() else {
        return bad_sequence("No authentication in progress");
    };

    if line.trim() == "*" {
        return syntax_error("Authentication cancelled");
    }

    match step {
        AuthStep::Plain => finish_plain(context, config, line),
        AuthStep::LoginUsername => login_username(context, line),
        AuthStep::LoginPassword { username } => match auth::decode(line) {
            Ok(password) => finish_auth(context, config, username, &password),
            Err(err) => auth_error(&err),
        },
    }
}

fn auth_error(err: &AuthError) -> Response {
    keep_alive(Reply::new(Status::SyntaxError, err.to_string()))
}

fn login_username(context: &mut Context, response: &str) -> Response {
    match auth::decode(response) {
        Ok(username) => {
            context.auth_step = Some(AuthStep::LoginPassword { username });
            keep_alive(Reply::new(Status::AuthChallenge, PASSWORD_PROMPT))
        }
        Err(err) => auth_error(&err),
    }
}

fn finish_plain(context: &mut Context, config: &SessionConfig, response: &str) -> Response {
    match auth::decode_plain(response) {
        Ok((username, password)) => finish_auth(context, config, username, &password),
        Err(err) => auth_error(&err),
    }
}

fn finish_auth(
    context: &mut Context,
    config: &SessionConfig,
    username: String,
    password: &str,
) -> Response {
    if config.credentials.verify(&username, password) {
        internal!(level = INFO, "Authenticated as {username}");
        context.authenticated = true;
        context.auth_user = Some(username);
        keep_alive(Reply::new(
            Status::AuthSuccessful,
            "Authentication successful",
        ))
    } else {
        internal!(level = WARN, "Failed authentication attempt for {username}");
        keep_alive(Reply::new(
            Status::InvalidCredentials,
            "Authentication credentials invalid",
        ))
    }
}

fn mail(context: &mut Context, _: &SessionConfig, args: &str) -> Response {
    if context.client_host.is_none() {
        return bad_sequence("Send HELO/EHLO first");
    }

    if context.in_transaction() {
        return bad_sequence("Sender already specified");
    }

    let Some(address) = path_argument(args, "FROM:") else {
        return syntax_error("Syntax: MAIL FROM:<address>");
    };

    if !is_plausible(address) {
        return syntax_error("Invalid email address");
    }

    context.sender = Some(address.to_string());
    context.recipients.clear();
    context.state = State::MailSet;

    keep_alive(Reply::ok())
}

fn rcpt(context: &mut Context, config: &SessionConfig, args: &str) -> Response {
    let Some(address) = path_argument(args, "TO:") else {
        return syntax_error("Syntax: RCPT TO:<address>");
    };

    if !is_plausible(address) {
        return syntax_error("Invalid email address");
    }

    if !context.authenticated && !config.local_domains.is_local_address(address) {
        internal!(level = WARN, "Refused relay to {address} for unauthenticated client");
        return keep_alive(Reply::new(Status::Error, "5.7.1 Relay access denied"));
    }

    context.recipients.push(address.to_string());
    context.state = State::RcptSet;

    keep_alive(Reply::ok())
}

fn data(context: &mut Context, _: &SessionConfig, _: &str) -> Response {
    if context.recipients.is_empty() {
        return bad_sequence("No recipients");
    }

    context.body.clear();
    context.body_overflow = false;
    context.state = State::ReceivingData;

    keep_alive(Reply::new(
        Status::StartMailInput,
        "Start mail input; end with <CRLF>.<CRLF>",
    ))
}

fn rset(context: &mut Context, _: &SessionConfig, _: &str) -> Response {
    context.reset_transaction();
    keep_alive(Reply::ok())
}

fn noop(_: &mut Context, _: &SessionConfig, _: &str) -> Response {
    keep_alive(Reply::ok())
}

fn quit(context: &mut Context, config: &SessionConfig, _: &str) -> Response {
    context.state = State::Closed;
    (
        Reply::new(
            Status::GoodBye,
            format!("{} closing connection", config.banner),
        ),
        Event::ConnectionClose,
    )
}

fn help(_: &mut Context, _: &SessionConfig, _: &str) -> Response {
    keep_alive(Reply::multi(
        Status::HelpMessage,
        vec![
            Cow::Borrowed("This server supports the following commands:"),
            Cow::Borrowed("HELO EHLO AUTH MAIL RCPT DATA RSET NOOP QUIT VRFY EXPN HELP"),
        ],
    ))
}

fn vrfy(_: &mut Context, _: &SessionConfig, _: &str) -> Response {
    keep_alive(Reply::new(
        Status::CannotVerify,
        "Cannot VRFY user, but will accept message and attempt delivery",
    ))
}

fn not_implemented(_: &mut Context, _: &SessionConfig, _: &str) -> Response {
    keep_alive(Reply::new(Status::NotImplemented, "Command not implemented"))
}
