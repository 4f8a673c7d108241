use core::fmt::{self, Display, Formatter};

use postern_common::envelope::{BodyType, DsnNotify, DsnReturn};

/// Longest accepted command line in bytes, CRLF excluded
/// (RFC 5321 section 4.5.3.1.4).
pub const MAX_COMMAND_LINE: usize = 512;

/// Value-returned parse failures; the session maps each to a reply code and
/// carries on. Malformed command bytes never abort a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// Line exceeded [`MAX_COMMAND_LINE`]; maps to 500.
    LineTooLong,

    /// Unrecognisable command line; maps to 500.
    Syntax(String),

    /// Recognised verb with malformed parameters; maps to 501.
    Parameter(String),
}

impl Display for ParseError {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::LineTooLong => fmt.write_str("Command line too long"),
            Self::Syntax(reason) | Self::Parameter(reason) => fmt.write_str(reason),
        }
    }
}

#[derive(PartialEq, Eq, Hash, Debug, Clone)]
pub enum HeloVariant {
    Ehlo(String),
    Helo(String),
}

impl Display for HeloVariant {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Ehlo(_) => "EHLO",
            Self::Helo(_) => "HELO",
        })
    }
}

/// ESMTP parameters accepted on MAIL FROM.
///
/// Unknown parameters are collected rather than silently dropped; whether
/// they are fatal is the session's call (`strict_esmtp_params`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MailParameters {
    pub declared_size: Option<u64>,
    pub body: Option<BodyType>,
    pub ret: Option<DsnReturn>,
    pub envid: Option<String>,
    pub unknown: Vec<String>,
}

/// ESMTP parameters accepted on RCPT TO.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RcptParameters {
    pub notify: Option<Vec<DsnNotify>>,
    pub orcpt: Option<String>,
    pub unknown: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Helo(HeloVariant),
    /// `None` is the null reverse-path (`MAIL FROM:<>`) from RFC 5321.
    MailFrom(Option<String>, MailParameters),
    RcptTo(String, RcptParameters),
    Data,
    Bdat {
        size: u64,
        last: bool,
    },
    Rset,
    Noop,
    Quit,
    StartTls,
    Auth {
        mechanism: String,
        initial: Option<String>,
    },
    Vrfy(String),
    Expn(String),
    Help(Option<String>),
    Unknown(String),
}

impl Command {
    /// Parse one raw command line, CRLF already stripped.
    pub fn parse(line: &[u8]) -> Result<Self, ParseError> {
        if line.len() > MAX_COMMAND_LINE {
            return Err(ParseError::LineTooLong);
        }

        let line = std::str::from_utf8(line)
            .map_err(|_| ParseError::Syntax("Command line is not valid UTF-8".to_string()))?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Err(ParseError::Syntax("Empty command".to_string()));
        }

        let (verb, rest) = trimmed
            .split_once(char::is_whitespace)
            .map_or((trimmed, ""), |(verb, rest)| (verb, rest.trim_start()));

        match verb.to_ascii_uppercase().as_str() {
            "HELO" => Ok(Self::Helo(HeloVariant::Helo(require_identifier(rest)?))),
            "EHLO" => Ok(Self::Helo(HeloVariant::Ehlo(require_identifier(rest)?))),
            "MAIL" => parse_mail(rest),
            "RCPT" => parse_rcpt(rest),
            "DATA" => require_bare(rest, Self::Data),
            "RSET" => require_bare(rest, Self::Rset),
            "NOOP" => Ok(Self::Noop),
            "QUIT" => require_bare(rest, Self::Quit),
            "STARTTLS" => require_bare(rest, Self::StartTls),
            "BDAT" => parse_bdat(rest),
            "AUTH" => parse_auth(rest),
            "VRFY" => Ok(Self::Vrfy(require_identifier(rest)?)),
            "EXPN" => Ok(Self::Expn(require_identifier(rest)?)),
            "HELP" => Ok(Self::Help(
                (!rest.is_empty()).then(|| rest.to_string()),
            )),
            _ => Ok(Self::Unknown(verb.to_string())),
        }
    }
}

fn require_identifier(rest: &str) -> Result<String, ParseError> {
    if rest.is_empty() {
        Err(ParseError::Parameter("Argument required".to_string()))
    } else {
        Ok(rest.to_string())
    }
}

fn require_bare(rest: &str, command: Command) -> Result<Command, ParseError> {
    if rest.is_empty() {
        Ok(command)
    } else {
        Err(ParseError::Parameter(
            "Command takes no parameters".to_string(),
        ))
    }
}

fn strip_prefix_ci<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    s.get(..prefix.len())
        .filter(|head| head.eq_ignore_ascii_case(prefix))
        .map(|_| &s[prefix.len()..])
}

/// Extract the path after `FROM:`/`TO:`: either `<...>` (contents may be
/// empty) or a bare token ending at whitespace. Returns the address and the
/// unconsumed remainder.
fn parse_path(s: &str) -> Result<(String, &str), ParseError> {
    let s = s.trim_start();

    if let Some(bracketed) = s.strip_prefix('<') {
        let end = bracketed.find('>').ok_or_else(|| {
            ParseError::Parameter("Unbalanced angle brackets in path".to_string())
        })?;
        Ok((bracketed[..end].to_string(), &bracketed[end + 1..]))
    } else {
        let end = s
            .find(char::is_whitespace)
            .unwrap_or(s.len());
        if end == 0 {
            return Err(ParseError::Parameter("Missing address".to_string()));
        }
        Ok((s[..end].to_string(), &s[end..]))
    }
}

fn parse_mail(rest: &str) -> Result<Command, ParseError> {
    let rest = strip_prefix_ci(rest, "FROM:")
        .ok_or_else(|| ParseError::Syntax("Expected MAIL FROM:<address>".to_string()))?;

    let (address, remainder) = parse_path(rest)?;
    let params = parse_mail_parameters(remainder)?;

    // An empty bracketed path is the null sender.
    let sender = (!address.is_empty()).then_some(address);
    Ok(Command::MailFrom(sender, params))
}

fn parse_rcpt(rest: &str) -> Result<Command, ParseError> {
    let rest = strip_prefix_ci(rest, "TO:")
        .ok_or_else(|| ParseError::Syntax("Expected RCPT TO:<address>".to_string()))?;

    let (address, remainder) = parse_path(rest)?;
    if address.is_empty() {
        return Err(ParseError::Parameter("Missing recipient address".to_string()));
    }

    let params = parse_rcpt_parameters(remainder)?;
    Ok(Command::RcptTo(address, params))
}

fn split_keyword<'a>(token: &'a str) -> (&'a str, Option<&'a str>) {
    token
        .split_once('=')
        .map_or((token, None), |(key, value)| (key, Some(value)))
}

fn require_value<'a>(key: &str, value: Option<&'a str>) -> Result<&'a str, ParseError> {
    value
        .filter(|value| !value.is_empty())
        .ok_or_else(|| ParseError::Parameter(format!("{key} requires a value")))
}

fn parse_mail_parameters(s: &str) -> Result<MailParameters, ParseError> {
    let mut params = MailParameters::default();

    for token in s.split_whitespace() {
        let (key, value) = split_keyword(token);
        match key.to_ascii_uppercase().as_str() {
            "SIZE" => {
                if params.declared_size.is_some() {
                    return Err(ParseError::Parameter(
                        "Duplicate SIZE parameter not allowed".to_string(),
                    ));
                }
                let value = require_value("SIZE", value)?;
                params.declared_size = Some(value.parse::<u64>().map_err(|_| {
                    ParseError::Parameter(format!("SIZE value {value:?} is not a number"))
                })?);
            }
            "BODY" => {
                let value = require_value("BODY", value)?;
                params.body = Some(match value.to_ascii_uppercase().as_str() {
                    "7BIT" => BodyType::SevenBit,
                    "8BITMIME" => BodyType::EightBitMime,
                    "BINARYMIME" => BodyType::BinaryMime,
                    _ => {
                        return Err(ParseError::Parameter(format!(
                            "Unknown BODY value {value:?}"
                        )))
                    }
                });
            }
            "RET" => {
                let value = require_value("RET", value)?;
                params.ret = Some(match value.to_ascii_uppercase().as_str() {
                    "FULL" => DsnReturn::Full,
                    "HDRS" => DsnReturn::Headers,
                    _ => {
                        return Err(ParseError::Parameter(format!(
                            "Unknown RET value {value:?}"
                        )))
                    }
                });
            }
            "ENVID" => {
                params.envid = Some(require_value("ENVID", value)?.to_string());
            }
            _ => params.unknown.push(token.to_string()),
        }
    }

    Ok(params)
}

fn parse_rcpt_parameters(s: &str) -> Result<RcptParameters, ParseError> {
    let mut params = RcptParameters::default();

    for token in s.split_whitespace() {
        let (key, value) = split_keyword(token);
        match key.to_ascii_uppercase().as_str() {
            "NOTIFY" => {
                let value = require_value("NOTIFY", value)?;
                let mut notify = Vec::new();
                for item in value.split(',') {
                    notify.push(match item.to_ascii_uppercase().as_str() {
                        "NEVER" => DsnNotify::Never,
                        "SUCCESS" => DsnNotify::Success,
                        "FAILURE" => DsnNotify::Failure,
                        "DELAY" => DsnNotify::Delay,
                        _ => {
                            return Err(ParseError::Parameter(format!(
                                "Unknown NOTIFY value {item:?}"
                            )))
                        }
                    });
                }
                if notify.contains(&DsnNotify::Never) && notify.len() > 1 {
                    return Err(ParseError::Parameter(
                        "NOTIFY=NEVER cannot be combined".to_string(),
                    ));
                }
                params.notify = Some(notify);
            }
            "ORCPT" => {
                params.orcpt = Some(require_value("ORCPT", value)?.to_string());
            }
            _ => params.unknown.push(token.to_string()),
        }
    }

    Ok(params)
}

fn parse_bdat(rest: &str) -> Result<Command, ParseError> {
    let mut tokens = rest.split_whitespace();

    let size = tokens
        .next()
        .ok_or_else(|| ParseError::Parameter("BDAT requires a chunk size".to_string()))?;
    let size = size.parse::<u64>().map_err(|_| {
        ParseError::Parameter(format!("BDAT chunk size {size:?} is not a number"))
    })?;

    let last = match tokens.next() {
        None => false,
        Some(keyword) if keyword.eq_ignore_ascii_case("LAST") => true,
        Some(keyword) => {
            return Err(ParseError::Parameter(format!(
                "Unexpected BDAT parameter {keyword:?}"
            )))
        }
    };

    if tokens.next().is_some() {
        return Err(ParseError::Parameter(
            "Too many BDAT parameters".to_string(),
        ));
    }

    Ok(Command::Bdat { size, last })
}

fn parse_auth(rest: &str) -> Result<Command, ParseError> {
    let mut tokens = rest.split_whitespace();

    let mechanism = tokens
        .next()
        .ok_or_else(|| ParseError::Parameter("AUTH requires a mechanism".to_string()))?
        .to_string();
    let initial = tokens.next().map(str::to_string);

    if tokens.next().is_some() {
        return Err(ParseError::Parameter(
            "Too many AUTH parameters".to_string(),
        ));
    }

    Ok(Command::Auth { mechanism, initial })
}

impl Display for Command {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Helo(v @ (HeloVariant::Ehlo(id) | HeloVariant::Helo(id))) => {
                write!(fmt, "{v} {id}")
            }
            Self::MailFrom(sender, params) => {
                write!(fmt, "MAIL FROM:<{}>", sender.as_deref().unwrap_or_default())?;
                if let Some(size) = params.declared_size {
                    write!(fmt, " SIZE={size}")?;
                }
                Ok(())
            }
            Self::RcptTo(rcpt, _) => write!(fmt, "RCPT TO:<{rcpt}>"),
            Self::Data => fmt.write_str("DATA"),
            Self::Bdat { size, last } => {
                write!(fmt, "BDAT {size}")?;
                if *last {
                    fmt.write_str(" LAST")?;
                }
                Ok(())
            }
            Self::Rset => fmt.write_str("RSET"),
            Self::Noop => fmt.write_str("NOOP"),
            Self::Quit => fmt.write_str("QUIT"),
            Self::StartTls => fmt.write_str("STARTTLS"),
            // The initial response carries credentials; never render it.
            Self::Auth { mechanism, .. } => write!(fmt, "AUTH {mechanism}"),
            Self::Vrfy(who) => write!(fmt, "VRFY {who}"),
            Self::Expn(list) => write!(fmt, "EXPN {list}"),
            Self::Help(Some(topic)) => write!(fmt, "HELP {topic}"),
            Self::Help(None) => fmt.write_str("HELP"),
            Self::Unknown(verb) => write!(fmt, "{verb} (unrecognised)"),
        }
    }
}

#[cfg(test)]
mod test {
    use postern_common::envelope::{BodyType, DsnNotify, DsnReturn};
    use pretty_assertions::assert_eq;

    use super::{Command, HeloVariant, MailParameters, ParseError, MAX_COMMAND_LINE};

    // Idea copied from https://gitlab.com/erichdongubler-experiments/rust_case_permutations/blob/master/src/lib.rs#L97
    fn string_casing(string: &str) -> impl Iterator<Item = String> + '_ {
        let len = string.len();
        let num_cases = usize::pow(2, u32::try_from(len).unwrap_or(0));

        let (upper, lower) = string.chars().fold(
            (Vec::with_capacity(len), Vec::with_capacity(len)),
            |(mut upper, mut lower), c| {
                upper.push(c.to_ascii_uppercase());
                lower.push(c.to_ascii_lowercase());
                (upper, lower)
            },
        );

        (0..num_cases).map(move |i| {
            (0..len).fold(String::with_capacity(len), |mut s, idx| {
                if (i & (1 << idx)) == 0 {
                    s.push(lower[idx]);
                } else {
                    s.push(upper[idx]);
                }
                s
            })
        })
    }

    fn parse(line: &str) -> Result<Command, ParseError> {
        Command::parse(line.as_bytes())
    }

    #[test]
    fn mail_from_command() {
        assert_eq!(
            parse("MAIL FROM:<test@example.com>"),
            Ok(Command::MailFrom(
                Some("test@example.com".to_string()),
                MailParameters::default()
            ))
        );

        // Space after the colon is tolerated.
        assert_eq!(
            parse("Mail From: test@example.com"),
            Ok(Command::MailFrom(
                Some("test@example.com".to_string()),
                MailParameters::default()
            ))
        );

        // Null reverse-path.
        assert_eq!(
            parse("MAIL FROM:<>"),
            Ok(Command::MailFrom(None, MailParameters::default()))
        );

        assert!(matches!(parse("MAIL FROM:"), Err(ParseError::Parameter(_))));
        assert!(matches!(parse("MAIL TO:<a@x>"), Err(ParseError::Syntax(_))));

        for comm in string_casing("mail from") {
            assert!(matches!(
                parse(&format!("{comm}: test@example.com")),
                Ok(Command::MailFrom(_, _))
            ));
        }
    }

    #[test]
    fn mail_from_esmtp_parameters() {
        assert_eq!(
            parse("MAIL FROM:<a@x> SIZE=12345"),
            Ok(Command::MailFrom(
                Some("a@x".to_string()),
                MailParameters {
                    declared_size: Some(12345),
                    ..MailParameters::default()
                }
            ))
        );

        assert_eq!(
            parse("MAIL FROM:<a@x> size=5000 body=8bitmime RET=HDRS ENVID=tracking-42"),
            Ok(Command::MailFrom(
                Some("a@x".to_string()),
                MailParameters {
                    declared_size: Some(5000),
                    body: Some(BodyType::EightBitMime),
                    ret: Some(DsnReturn::Headers),
                    envid: Some("tracking-42".to_string()),
                    unknown: Vec::new(),
                }
            ))
        );

        // Unknown parameters are reported, not dropped.
        assert_eq!(
            parse("MAIL FROM:<a@x> XCUSTOM=1"),
            Ok(Command::MailFrom(
                Some("a@x".to_string()),
                MailParameters {
                    unknown: vec!["XCUSTOM=1".to_string()],
                    ..MailParameters::default()
                }
            ))
        );

        assert!(matches!(
            parse("MAIL FROM:<a@x> SIZE=1000 SIZE=2000"),
            Err(ParseError::Parameter(_))
        ));
        assert!(matches!(
            parse("MAIL FROM:<a@x> SIZE="),
            Err(ParseError::Parameter(_))
        ));
        assert!(matches!(
            parse("MAIL FROM:<a@x> SIZE=abc"),
            Err(ParseError::Parameter(_))
        ));
        assert!(matches!(
            parse("MAIL FROM:<a@x> BODY=QUANTUM"),
            Err(ParseError::Parameter(_))
        ));
    }

    #[test]
    fn rcpt_to_command() {
        assert_eq!(
            parse("RCPT TO:<b@y>"),
            Ok(Command::RcptTo(
                "b@y".to_string(),
                super::RcptParameters::default()
            ))
        );

        assert_eq!(
            parse("rcpt to:<b@y> NOTIFY=SUCCESS,FAILURE ORCPT=rfc822;b@y"),
            Ok(Command::RcptTo(
                "b@y".to_string(),
                super::RcptParameters {
                    notify: Some(vec![DsnNotify::Success, DsnNotify::Failure]),
                    orcpt: Some("rfc822;b@y".to_string()),
                    unknown: Vec::new(),
                }
            ))
        );

        // The null path is never a valid recipient.
        assert!(matches!(parse("RCPT TO:<>"), Err(ParseError::Parameter(_))));
        assert!(matches!(parse("RCPT TO:"), Err(ParseError::Parameter(_))));
        assert!(matches!(
            parse("RCPT TO:<b@y> NOTIFY=NEVER,SUCCESS"),
            Err(ParseError::Parameter(_))
        ));

        for comm in string_casing("rcpt to") {
            assert!(matches!(
                parse(&format!("{comm}: test@example.com")),
                Ok(Command::RcptTo(_, _))
            ));
        }
    }

    #[test]
    fn helo_ehlo_command() {
        assert!(parse("EHLO").is_err());
        assert!(parse("HELO").is_err());

        assert_eq!(
            parse("EHLO client.example.com"),
            Ok(Command::Helo(HeloVariant::Ehlo(
                "client.example.com".to_string()
            )))
        );

        for comm in string_casing("ehlo") {
            assert!(
                matches!(
                    parse(&format!("{comm} test")),
                    Ok(Command::Helo(HeloVariant::Ehlo(_)))
                ),
                "'{comm}' should map to Ehlo"
            );
        }

        for comm in string_casing("helo") {
            assert!(
                matches!(
                    parse(&format!("{comm} test")),
                    Ok(Command::Helo(HeloVariant::Helo(_)))
                ),
                "'{comm}' should map to Helo"
            );
        }
    }

    #[test]
    fn bdat_command() {
        assert_eq!(parse("BDAT 1000"), Ok(Command::Bdat { size: 1000, last: false }));
        assert_eq!(
            parse("BDAT 42 LAST"),
            Ok(Command::Bdat { size: 42, last: true })
        );
        assert_eq!(
            parse("bdat 0 last"),
            Ok(Command::Bdat { size: 0, last: true })
        );

        assert!(matches!(parse("BDAT"), Err(ParseError::Parameter(_))));
        assert!(matches!(parse("BDAT x"), Err(ParseError::Parameter(_))));
        assert!(matches!(
            parse("BDAT 10 FIRST"),
            Err(ParseError::Parameter(_))
        ));
        assert!(matches!(
            parse("BDAT 10 LAST extra"),
            Err(ParseError::Parameter(_))
        ));
    }

    #[test]
    fn auth_command() {
        assert_eq!(
            parse("AUTH PLAIN AGFsaWNlAHdvbmRlcmxhbmQ="),
            Ok(Command::Auth {
                mechanism: "PLAIN".to_string(),
                initial: Some("AGFsaWNlAHdvbmRlcmxhbmQ=".to_string()),
            })
        );
        assert_eq!(
            parse("AUTH LOGIN"),
            Ok(Command::Auth {
                mechanism: "LOGIN".to_string(),
                initial: None,
            })
        );
        assert!(matches!(parse("AUTH"), Err(ParseError::Parameter(_))));
    }

    #[test]
    fn auth_display_redacts_initial_response() {
        let command = parse("AUTH PLAIN c2VjcmV0cGFzc3dvcmQ=").unwrap();
        let rendered = command.to_string();
        assert_eq!(rendered, "AUTH PLAIN");
        assert!(!rendered.contains("c2VjcmV0"));
    }

    #[test]
    fn other_commands() {
        for comm in string_casing("data") {
            assert_eq!(parse(&comm), Ok(Command::Data));
        }
        for comm in string_casing("quit") {
            assert_eq!(parse(&comm), Ok(Command::Quit));
        }
        for comm in string_casing("rset") {
            assert_eq!(parse(&comm), Ok(Command::Rset));
        }

        assert_eq!(parse("STARTTLS"), Ok(Command::StartTls));
        assert_eq!(parse("NOOP"), Ok(Command::Noop));
        assert_eq!(parse("HELP"), Ok(Command::Help(None)));
        assert_eq!(parse("HELP DATA"), Ok(Command::Help(Some("DATA".to_string()))));
        assert_eq!(parse("VRFY alice"), Ok(Command::Vrfy("alice".to_string())));

        // Bare-verb commands refuse stray parameters.
        assert!(matches!(parse("DATA now"), Err(ParseError::Parameter(_))));
        assert!(matches!(parse("QUIT now"), Err(ParseError::Parameter(_))));
    }

    #[test]
    fn unknown_verbs_are_reported_not_errors() {
        assert_eq!(
            parse("XDEBUG all"),
            Ok(Command::Unknown("XDEBUG".to_string()))
        );
    }

    #[test]
    fn oversized_line_is_distinguished() {
        let line = format!("MAIL FROM:<{}@x>", "a".repeat(MAX_COMMAND_LINE));
        assert_eq!(
            Command::parse(line.as_bytes()),
            Err(ParseError::LineTooLong)
        );
    }

    #[test]
    fn truncated_injection_attempt_is_rejected() {
        // A header-injection attempt split at the CR by the line reader
        // leaves an unbalanced path, which must fail with a parameter error.
        assert!(matches!(
            parse("MAIL FROM:<a@x"),
            Err(ParseError::Parameter(_))
        ));
    }

    #[test]
    fn non_utf8_is_a_syntax_error() {
        assert!(matches!(
            Command::parse(b"MAIL FROM:<\xff\xfe>"),
            Err(ParseError::Syntax(_))
        ));
    }
}
