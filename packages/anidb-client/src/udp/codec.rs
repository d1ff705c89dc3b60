//! UDP API command encoding and response parsing
//!
//! Requests are a command name followed by `&`-separated `key=value` pairs;
//! the session key travels as the `s` parameter. Responses start with a
//! three-digit return code and a message, optionally followed by data lines.

use std::fmt;

use crate::error::{AniDbError, AniDbResult};
use crate::state::SessionToken;

/// Parameters whose values never appear in logs
const MASKED_PARAMS: &[&str] = &["pass", "s"];

/// UDP API return code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReturnCode {
    LoginAccepted,
    LoginAcceptedNewVersion,
    LoggedOut,
    MylistEntryAdded,
    File,
    Pong,
    FileAlreadyInMylist,
    NoSuchFile,
    NotLoggedIn,
    LoginFailed,
    LoginFirst,
    AccessDenied,
    ClientVersionOutdated,
    ClientBanned,
    IllegalInput,
    InvalidSession,
    Banned,
    UnknownCommand,
    InternalServerError,
    OutOfService,
    ServerBusy,
    NoData,
    TimeoutDelayAndResubmit,
    Other(u16),
}

/// The four outcomes a response can have for connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseClass {
    Success,
    Ban,
    InvalidSession,
    Error,
}

impl ReturnCode {
    pub fn from_u16(code: u16) -> Self {
        match code {
            200 => Self::LoginAccepted,
            201 => Self::LoginAcceptedNewVersion,
            203 => Self::LoggedOut,
            210 => Self::MylistEntryAdded,
            220 => Self::File,
            300 => Self::Pong,
            310 => Self::FileAlreadyInMylist,
            320 => Self::NoSuchFile,
            403 => Self::NotLoggedIn,
            500 => Self::LoginFailed,
            501 => Self::LoginFirst,
            502 => Self::AccessDenied,
            503 => Self::ClientVersionOutdated,
            504 => Self::ClientBanned,
            505 => Self::IllegalInput,
            506 => Self::InvalidSession,
            555 => Self::Banned,
            598 => Self::UnknownCommand,
            600 => Self::InternalServerError,
            601 => Self::OutOfService,
            602 => Self::ServerBusy,
            603 => Self::NoData,
            604 => Self::TimeoutDelayAndResubmit,
            other => Self::Other(other),
        }
    }

    pub fn as_u16(&self) -> u16 {
        match self {
            Self::LoginAccepted => 200,
            Self::LoginAcceptedNewVersion => 201,
            Self::LoggedOut => 203,
            Self::MylistEntryAdded => 210,
            Self::File => 220,
            Self::Pong => 300,
            Self::FileAlreadyInMylist => 310,
            Self::NoSuchFile => 320,
            Self::NotLoggedIn => 403,
            Self::LoginFailed => 500,
            Self::LoginFirst => 501,
            Self::AccessDenied => 502,
            Self::ClientVersionOutdated => 503,
            Self::ClientBanned => 504,
            Self::IllegalInput => 505,
            Self::InvalidSession => 506,
            Self::Banned => 555,
            Self::UnknownCommand => 598,
            Self::InternalServerError => 600,
            Self::OutOfService => 601,
            Self::ServerBusy => 602,
            Self::NoData => 603,
            Self::TimeoutDelayAndResubmit => 604,
            Self::Other(code) => *code,
        }
    }

    pub fn class(&self) -> ResponseClass {
        match self {
            Self::Banned | Self::ClientBanned => ResponseClass::Ban,
            Self::LoginFirst | Self::InvalidSession | Self::NotLoggedIn => {
                ResponseClass::InvalidSession
            }
            code if code.as_u16() >= 500 => ResponseClass::Error,
            _ => ResponseClass::Success,
        }
    }

    /// Codes after which the server wants to be left alone for a while
    pub fn starts_backoff(&self) -> bool {
        matches!(self, Self::OutOfService | Self::ServerBusy)
    }
}

impl fmt::Display for ReturnCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_u16())
    }
}

/// A UDP API command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    name: String,
    params: Vec<(String, String)>,
}

impl Command {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: Vec::new(),
        }
    }

    pub fn param(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.params.push((key.into(), value.to_string()));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wire form of the command, with the session key appended if given
    pub fn encode(&self, session: Option<&SessionToken>) -> String {
        let mut pairs: Vec<String> = self
            .params
            .iter()
            .map(|(k, v)| format!("{}={}", k, escape_value(v)))
            .collect();
        if let Some(token) = session {
            pairs.push(format!("s={}", token.as_str()));
        }

        if pairs.is_empty() {
            self.name.clone()
        } else {
            format!("{} {}", self.name, pairs.join("&"))
        }
    }
}

/// Escape characters that would break the parameter syntax
fn escape_value(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace("\r\n", "<br />")
        .replace('\n', "<br />")
}

/// Hide credentials and session keys in an encoded command
pub fn mask_for_log(wire: &str) -> String {
    let Some((name, params)) = wire.split_once(' ') else {
        return wire.to_string();
    };

    let masked: Vec<String> = params
        .split('&')
        .map(|pair| match pair.split_once('=') {
            Some((key, _)) if MASKED_PARAMS.contains(&key) => format!("{}=****", key),
            _ => pair.to_string(),
        })
        .collect();

    format!("{} {}", name, masked.join("&"))
}

/// A parsed UDP API response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpResponse {
    pub code: ReturnCode,
    pub message: String,
    pub lines: Vec<String>,
}

impl UdpResponse {
    pub fn parse(raw: &str) -> AniDbResult<Self> {
        let raw = raw.trim_start_matches('\u{feff}').trim_end_matches('\0');
        let mut lines = raw.lines();
        let header = lines
            .next()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .ok_or_else(|| AniDbError::UnexpectedResponse("empty response".to_string()))?;

        let (code, message) = header.split_once(' ').unwrap_or((header, ""));
        let code: u16 = code
            .parse()
            .map_err(|_| AniDbError::UnexpectedResponse(format!("no return code in '{}'", header)))?;

        Ok(Self {
            code: ReturnCode::from_u16(code),
            message: message.trim().to_string(),
            lines: lines
                .map(|line| line.trim_end_matches('\r').to_string())
                .filter(|line| !line.is_empty())
                .collect(),
        })
    }

    /// Session key from a LOGIN ACCEPTED reply (`200 {key} [{ip:port}] LOGIN ACCEPTED`)
    pub fn session_token(&self) -> AniDbResult<SessionToken> {
        self.message
            .split_whitespace()
            .next()
            .filter(|key| key.chars().all(|c| c.is_ascii_alphanumeric()))
            .map(SessionToken::new)
            .ok_or_else(|| {
                AniDbError::UnexpectedResponse(format!("no session key in '{}'", self.message))
            })
    }

    /// `|`-separated fields of the first data line
    pub fn fields(&self) -> Vec<&str> {
        self.lines
            .first()
            .map(|line| line.split('|').collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(200, ResponseClass::Success)]
    #[case(220, ResponseClass::Success)]
    #[case(320, ResponseClass::Success)]
    #[case(403, ResponseClass::InvalidSession)]
    #[case(500, ResponseClass::Error)]
    #[case(501, ResponseClass::InvalidSession)]
    #[case(504, ResponseClass::Ban)]
    #[case(506, ResponseClass::InvalidSession)]
    #[case(555, ResponseClass::Ban)]
    #[case(598, ResponseClass::Error)]
    #[case(602, ResponseClass::Error)]
    #[case(699, ResponseClass::Error)]
    fn test_return_code_classes(#[case] code: u16, #[case] class: ResponseClass) {
        assert_eq!(ReturnCode::from_u16(code).class(), class);
        assert_eq!(ReturnCode::from_u16(code).as_u16(), code);
    }

    #[test]
    fn test_encode_appends_session() {
        let command = Command::new("FILE").param("size", 1024).param("ed2k", "abc");
        let token = SessionToken::new("Xy12z");
        assert_eq!(command.encode(Some(&token)), "FILE size=1024&ed2k=abc&s=Xy12z");
        assert_eq!(Command::new("PING").encode(None), "PING");
    }

    #[test]
    fn test_encode_escapes_values() {
        let command = Command::new("MYLISTADD").param("other", "a&b\nc");
        assert_eq!(command.encode(None), "MYLISTADD other=a&amp;b<br />c");
    }

    #[test]
    fn test_mask_for_log_hides_secrets() {
        let masked = mask_for_log("AUTH user=me&pass=hunter2&protover=3&s=abc12");
        assert_eq!(masked, "AUTH user=me&pass=****&protover=3&s=****");
        assert_eq!(mask_for_log("PING"), "PING");
    }

    #[test]
    fn test_parse_login_accepted() {
        let response = UdpResponse::parse("200 aBc12 1.2.3.4:4556 LOGIN ACCEPTED\n").unwrap();
        assert_eq!(response.code, ReturnCode::LoginAccepted);
        assert_eq!(response.session_token().unwrap(), SessionToken::new("aBc12"));
    }

    #[test]
    fn test_parse_data_lines() {
        let response = UdpResponse::parse("220 FILE\n312498|4896|69260|4243\n").unwrap();
        assert_eq!(response.code, ReturnCode::File);
        assert_eq!(response.fields(), vec!["312498", "4896", "69260", "4243"]);
    }

    #[test]
    fn test_parse_strips_bom_and_padding() {
        let response = UdpResponse::parse("\u{feff}300 PONG\n4556\0\0").unwrap();
        assert_eq!(response.code, ReturnCode::Pong);
        assert_eq!(response.lines, vec!["4556".to_string()]);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(
            UdpResponse::parse("hello world"),
            Err(AniDbError::UnexpectedResponse(_))
        ));
        assert!(matches!(
            UdpResponse::parse(""),
            Err(AniDbError::UnexpectedResponse(_))
        ));
    }
}
