use core::fmt::{self, Display, Formatter};

/// Command verbs the server understands.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum Verb {
    Helo,
    Ehlo,
    Auth,
    Mail,
    Rcpt,
    Data,
    Rset,
    Noop,
    Quit,
    Help,
    Vrfy,
    Expn,
    Unknown,
}

impl Verb {
    pub const ALL: [Self; 12] = [
        Self::Helo,
        Self::Ehlo,
        Self::Auth,
        Self::Mail,
        Self::Rcpt,
        Self::Data,
        Self::Rset,
        Self::Noop,
        Self::Quit,
        Self::Help,
        Self::Vrfy,
        Self::Expn,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Helo => "HELO",
            Self::Ehlo => "EHLO",
            Self::Auth => "AUTH",
            Self::Mail => "MAIL",
            Self::Rcpt => "RCPT",
            Self::Data => "DATA",
            Self::Rset => "RSET",
            Self::Noop => "NOOP",
            Self::Quit => "QUIT",
            Self::Help => "HELP",
            Self::Vrfy => "VRFY",
            Self::Expn => "EXPN",
            Self::Unknown => "UNKNOWN",
        }
    }

    fn parse(word: &str) -> Self {
        Self::ALL
            .into_iter()
            .find(|verb| verb.as_str().eq_ignore_ascii_case(word))
            .unwrap_or(Self::Unknown)
    }
}

impl Display for Verb {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        fmt.write_str(self.as_str())
    }
}

/// One command line split into its verb and the (trimmed) remainder.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Command {
    pub verb: Verb,
    pub args: String,
}

impl Command {
    #[must_use]
    pub fn parse(line: &str) -> Self {
        let line = line.trim();
        let (word, args) = line
            .split_once(char::is_whitespace)
            .map_or((line, ""), |(word, args)| (word, args.trim()));

        Self {
            verb: Verb::parse(word),
            args: args.to_string(),
        }
    }
}

impl Display for Command {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        match self.verb {
            // Never echo credentials into the log
            Verb::Auth => write!(fmt, "AUTH {}", self.args.split(' ').next().unwrap_or_default()),
            _ if self.args.is_empty() => write!(fmt, "{}", self.verb),
            _ => write!(fmt, "{} {}", self.verb, self.args),
        }
    }
}

/// Extract the address from `FROM:<addr>` / `TO:<addr>` style arguments.
///
/// The keyword match is case-insensitive, spaces after the colon are
/// tolerated and anything after the closing `>` (ESMTP parameters) is
/// ignored. Angle brackets are optional.
#[must_use]
pub fn path_argument<'a>(args: &'a str, keyword: &str) -> Option<&'a str> {
    let prefix = args.get(..keyword.len())?;
    if !prefix.eq_ignore_ascii_case(keyword) {
        return None;
    }

    let rest = args[keyword.len()..].trim_start();
    let address = if let Some(bracketed) = rest.strip_prefix('<') {
        bracketed.split_once('>').map(|(address, _)| address)?
    } else {
        rest.split_whitespace().next().unwrap_or_default()
    };

    Some(address.trim())
}
