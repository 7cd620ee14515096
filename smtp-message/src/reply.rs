use std::{borrow::Cow, fmt, io, str};

use nom::{
    branch::alt,
    bytes::streaming::{tag, take},
    character::streaming::char,
    combinator::{map, map_opt, map_res, opt},
    sequence::{terminated, tuple},
    IResult,
};

use crate::misc::MaybeUtf8;

/// Three-digit SMTP reply code, as specified in RFC 5321 section 4.2.
#[cfg_attr(test, derive(PartialEq))]
#[derive(Debug, Clone, Copy)]
pub struct ReplyCode {
    code: u16,
}

#[cfg_attr(test, allow(dead_code))]
impl ReplyCode {
    pub const SYSTEM_STATUS: ReplyCode = ReplyCode { code: 211 };
    pub const HELP_MESSAGE: ReplyCode = ReplyCode { code: 214 };
    pub const SERVICE_READY: ReplyCode = ReplyCode { code: 220 };
    pub const CLOSING_CHANNEL: ReplyCode = ReplyCode { code: 221 };
    pub const AUTH_SUCCESSFUL: ReplyCode = ReplyCode { code: 235 };
    pub const OKAY: ReplyCode = ReplyCode { code: 250 };
    pub const USER_NOT_LOCAL_WILL_FORWARD: ReplyCode = ReplyCode { code: 251 };
    pub const CANNOT_VRFY_BUT_PLEASE_TRY: ReplyCode = ReplyCode { code: 252 };
    pub const AUTH_CONTINUE: ReplyCode = ReplyCode { code: 334 };
    pub const START_MAIL_INPUT: ReplyCode = ReplyCode { code: 354 };
    pub const SERVICE_NOT_AVAILABLE: ReplyCode = ReplyCode { code: 421 };
    pub const MAILBOX_TEMPORARILY_UNAVAILABLE: ReplyCode = ReplyCode { code: 450 };
    pub const LOCAL_ERROR: ReplyCode = ReplyCode { code: 451 };
    pub const INSUFFICIENT_STORAGE: ReplyCode = ReplyCode { code: 452 };
    pub const UNABLE_TO_ACCEPT_PARAMETERS: ReplyCode = ReplyCode { code: 455 };
    pub const COMMAND_UNRECOGNIZED: ReplyCode = ReplyCode { code: 500 };
    pub const SYNTAX_ERROR: ReplyCode = ReplyCode { code: 501 };
    pub const COMMAND_UNIMPLEMENTED: ReplyCode = ReplyCode { code: 502 };
    pub const BAD_SEQUENCE: ReplyCode = ReplyCode { code: 503 };
    pub const PARAMETER_UNIMPLEMENTED: ReplyCode = ReplyCode { code: 504 };
    pub const AUTH_REQUIRED: ReplyCode = ReplyCode { code: 530 };
    pub const AUTH_CREDENTIALS_INVALID: ReplyCode = ReplyCode { code: 535 };
    pub const MAILBOX_UNAVAILABLE: ReplyCode = ReplyCode { code: 550 };
    pub const POLICY_REASON: ReplyCode = ReplyCode { code: 550 };
    pub const USER_NOT_LOCAL: ReplyCode = ReplyCode { code: 551 };
    pub const EXCEEDED_STORAGE: ReplyCode = ReplyCode { code: 552 };
    pub const MAILBOX_NAME_INCORRECT: ReplyCode = ReplyCode { code: 553 };
    pub const TRANSACTION_FAILED: ReplyCode = ReplyCode { code: 554 };
    pub const MAIL_OR_RCPT_PARAMETER_UNIMPLEMENTED: ReplyCode = ReplyCode { code: 555 };

    pub fn custom(code: u16) -> ReplyCode {
        assert!(code < 1000);
        ReplyCode { code }
    }

    pub fn code(&self) -> u16 {
        self.code
    }

    /// Classifies this code per the first digit, as used to decide how a
    /// client should react to a reply (RFC 5321 section 4.2.1).
    pub fn kind(&self) -> ReplyCodeKind {
        match self.code / 100 {
            2 => ReplyCodeKind::PositiveCompletion,
            3 => ReplyCodeKind::PositiveIntermediate,
            4 => ReplyCodeKind::TransientNegative,
            5 => ReplyCodeKind::PermanentNegative,
            _ => ReplyCodeKind::PermanentNegative,
        }
    }

    /// Classifies this code per the second digit (RFC 5321 section 4.2.1).
    pub fn category(&self) -> ReplyCodeCategory {
        match (self.code / 10) % 10 {
            0 => ReplyCodeCategory::Syntax,
            1 => ReplyCodeCategory::Information,
            2 => ReplyCodeCategory::Connections,
            5 => ReplyCodeCategory::MailSystem,
            _ => ReplyCodeCategory::Unspecified,
        }
    }
}

impl fmt::Display for ReplyCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:03}", self.code)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyCodeKind {
    PositiveCompletion,
    PositiveIntermediate,
    TransientNegative,
    PermanentNegative,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyCodeCategory {
    Syntax,
    Information,
    Connections,
    Unspecified,
    MailSystem,
}

/// Enhanced status code as specified by RFC 3463, of the form
/// `class.subject.detail`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnhancedReplyCode {
    class: EnhancedReplyCodeClass,
    subject: EnhancedReplyCodeSubject,
    detail: u16,
}

#[cfg_attr(test, allow(dead_code))]
impl EnhancedReplyCode {
    pub const SUCCESS_UNDEFINED: EnhancedReplyCode = EnhancedReplyCode {
        class: EnhancedReplyCodeClass::Success,
        subject: EnhancedReplyCodeSubject::Undefined,
        detail: 0,
    };
    pub const SUCCESS_DEST_VALID: EnhancedReplyCode = EnhancedReplyCode {
        class: EnhancedReplyCodeClass::Success,
        subject: EnhancedReplyCodeSubject::Addressing,
        detail: 5,
    };
    pub const TRANSIENT_UNDEFINED: EnhancedReplyCode = EnhancedReplyCode {
        class: EnhancedReplyCodeClass::TransientFailure,
        subject: EnhancedReplyCodeSubject::Undefined,
        detail: 0,
    };
    pub const TRANSIENT_SYSTEM_INCORRECTLY_CONFIGURED: EnhancedReplyCode = EnhancedReplyCode {
        class: EnhancedReplyCodeClass::TransientFailure,
        subject: EnhancedReplyCodeSubject::MailSystem,
        detail: 4,
    };
    pub const TRANSIENT_TOO_MANY_RECIPIENTS: EnhancedReplyCode = EnhancedReplyCode {
        class: EnhancedReplyCodeClass::TransientFailure,
        subject: EnhancedReplyCodeSubject::MailDelivery,
        detail: 3,
    };
    pub const PERMANENT_UNDEFINED: EnhancedReplyCode = EnhancedReplyCode {
        class: EnhancedReplyCodeClass::PermanentFailure,
        subject: EnhancedReplyCodeSubject::Undefined,
        detail: 0,
    };
    pub const PERMANENT_INVALID_COMMAND: EnhancedReplyCode = EnhancedReplyCode {
        class: EnhancedReplyCodeClass::PermanentFailure,
        subject: EnhancedReplyCodeSubject::Undefined,
        detail: 2,
    };
    pub const PERMANENT_MAILBOX_UNAVAILABLE: EnhancedReplyCode = EnhancedReplyCode {
        class: EnhancedReplyCodeClass::PermanentFailure,
        subject: EnhancedReplyCodeSubject::Mailbox,
        detail: 1,
    };
    pub const PERMANENT_AUTH_REQUIRED: EnhancedReplyCode = EnhancedReplyCode {
        class: EnhancedReplyCodeClass::PermanentFailure,
        subject: EnhancedReplyCodeSubject::Security,
        detail: 7,
    };
    pub const PERMANENT_BAD_CREDENTIALS: EnhancedReplyCode = EnhancedReplyCode {
        class: EnhancedReplyCodeClass::PermanentFailure,
        subject: EnhancedReplyCodeSubject::Security,
        detail: 8,
    };

    pub fn custom(
        class: EnhancedReplyCodeClass,
        subject: EnhancedReplyCodeSubject,
        detail: u16,
    ) -> EnhancedReplyCode {
        EnhancedReplyCode {
            class,
            subject,
            detail,
        }
    }

    pub fn class(&self) -> EnhancedReplyCodeClass {
        self.class
    }

    pub fn subject(&self) -> EnhancedReplyCodeSubject {
        self.subject
    }

    pub fn detail(&self) -> u16 {
        self.detail
    }
}

impl fmt::Display for EnhancedReplyCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}",
            self.class as u16,
            self.subject as u16,
            self.detail
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnhancedReplyCodeClass {
    Success = 2,
    TransientFailure = 4,
    PermanentFailure = 5,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnhancedReplyCodeSubject {
    Undefined = 0,
    Addressing = 1,
    Mailbox = 2,
    MailSystem = 3,
    Network = 4,
    MailDelivery = 5,
    Content = 6,
    Security = 7,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsLastLine {
    Yes,
    No,
}

/// A full, possibly multi-line, SMTP reply.
#[cfg_attr(test, derive(PartialEq))]
#[derive(Debug, Clone)]
pub struct Reply<S = String> {
    pub code: ReplyCode,
    pub ecode: Option<EnhancedReplyCode>,
    pub text: Vec<MaybeUtf8<S>>,
}

impl<'a> Reply<&'a str> {
    pub fn parse(buf: &'a [u8]) -> IResult<&'a [u8], Reply<&'a str>> {
        reply(buf)
    }
}

impl<'a> Reply<&'a str> {
    pub fn into_owned(self) -> Reply<String> {
        Reply {
            code: self.code,
            ecode: self.ecode,
            text: self
                .text
                .into_iter()
                .map(|t| match t {
                    MaybeUtf8::Ascii(s) => MaybeUtf8::Ascii(s.to_owned()),
                    MaybeUtf8::Utf8(s) => MaybeUtf8::Utf8(s.to_owned()),
                })
                .collect(),
        }
    }
}

impl<S> Reply<S>
where
    S: AsRef<str>,
{
    pub fn send_to(&self, w: &mut dyn io::Write) -> io::Result<()> {
        let num_lines = self.text.len().max(1);
        for (i, line) in self.lines_or_empty().enumerate() {
            let is_last = i + 1 == num_lines;
            self.send_line_to(w, line, is_last);
        }
        Ok(())
    }

    fn lines_or_empty(&self) -> impl Iterator<Item = Cow<'_, str>> + '_ {
        if self.text.is_empty() {
            vec![Cow::Borrowed("")].into_iter()
        } else {
            self.text
                .iter()
                .map(|t| Cow::Owned(t.as_ref().to_owned()))
                .collect::<Vec<_>>()
                .into_iter()
        }
    }

    fn send_line_to(&self, w: &mut dyn io::Write, line: Cow<'_, str>, is_last: bool) -> () {
        let sep: &[u8] = if is_last { b" " } else { b"-" };
        let code = self.code.to_string();
        let _ = w.write_all(code.as_bytes());
        let _ = w.write_all(sep);
        if is_last {
            if let Some(ref e) = self.ecode {
                let _ = write!(w, "{} ", e);
            }
        }
        let _ = w.write_all(line.as_bytes());
        let _ = w.write_all(b"\r\n");
    }
}

impl<S> fmt::Display for Reply<S>
where
    S: AsRef<str>,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code)?;
        if let Some(ref e) = self.ecode {
            write!(f, " {}", e)?;
        }
        for t in &self.text {
            write!(f, " {}", t.as_ref())?;
        }
        Ok(())
    }
}

fn reply_code(buf: &[u8]) -> IResult<&[u8], ReplyCode> {
    map(
        map_res(
            map_res(take(3usize), str::from_utf8),
            |s: &str| s.parse::<u16>(),
        ),
        ReplyCode::custom,
    )(buf)
}

fn enhanced_code(buf: &[u8]) -> IResult<&[u8], EnhancedReplyCode> {
    fn digits(buf: &[u8]) -> IResult<&[u8], u16> {
        map_res(
            nom::bytes::streaming::take_while1(|c: u8| c.is_ascii_digit()),
            |s: &[u8]| str::from_utf8(s).unwrap().parse::<u16>(),
        )(buf)
    }
    map_opt(
        tuple((digits, char('.'), digits, char('.'), digits, char(' '))),
        |(class, _, subject, _, detail, _)| {
            let class = match class {
                2 => EnhancedReplyCodeClass::Success,
                4 => EnhancedReplyCodeClass::TransientFailure,
                5 => EnhancedReplyCodeClass::PermanentFailure,
                _ => return None,
            };
            let subject = match subject {
                0 => EnhancedReplyCodeSubject::Undefined,
                1 => EnhancedReplyCodeSubject::Addressing,
                2 => EnhancedReplyCodeSubject::Mailbox,
                3 => EnhancedReplyCodeSubject::MailSystem,
                4 => EnhancedReplyCodeSubject::Network,
                5 => EnhancedReplyCodeSubject::MailDelivery,
                6 => EnhancedReplyCodeSubject::Content,
                7 => EnhancedReplyCodeSubject::Security,
                _ => return None,
            };
            Some(EnhancedReplyCode::custom(class, subject, detail))
        },
    )(buf)
}

fn reply_line(buf: &[u8]) -> IResult<&[u8], (ReplyCode, IsLastLine, Option<EnhancedReplyCode>, &str)> {
    let (buf, code) = reply_code(buf)?;
    let (buf, is_last) = map(alt((char('-'), char(' '))), |c| {
        if c == ' ' {
            IsLastLine::Yes
        } else {
            IsLastLine::No
        }
    })(buf)?;
    let (buf, ecode) = opt(enhanced_code)(buf)?;
    let (buf, line) = terminated(
        map_res(
            nom::bytes::streaming::take_until("\r\n"),
            str::from_utf8,
        ),
        tag("\r\n"),
    )(buf)?;
    Ok((buf, (code, is_last, ecode, line)))
}

fn reply(buf: &[u8]) -> IResult<&[u8], Reply<&str>> {
    let mut rest = buf;
    let mut text = Vec::new();
    let (mut code, mut ecode) = (ReplyCode::custom(0), None);
    loop {
        let (new_rest, (line_code, is_last, line_ecode, line_text)) = reply_line(rest)?;
        rest = new_rest;
        code = line_code;
        ecode = line_ecode;
        text.push(MaybeUtf8::Utf8(line_text));
        if is_last == IsLastLine::Yes {
            break;
        }
    }
    Ok((rest, Reply { code, ecode, text }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_code_kind() {
        assert_eq!(ReplyCode::OKAY.kind(), ReplyCodeKind::PositiveCompletion);
        assert_eq!(
            ReplyCode::START_MAIL_INPUT.kind(),
            ReplyCodeKind::PositiveIntermediate
        );
        assert_eq!(
            ReplyCode::LOCAL_ERROR.kind(),
            ReplyCodeKind::TransientNegative
        );
        assert_eq!(
            ReplyCode::TRANSACTION_FAILED.kind(),
            ReplyCodeKind::PermanentNegative
        );
    }

    #[test]
    fn enhanced_code_display() {
        assert_eq!(format!("{}", EnhancedReplyCode::SUCCESS_DEST_VALID), "2.1.5");
    }

    #[test]
    fn single_line_reply() {
        let (rem, r) = Reply::parse(b"250 2.0.0 All is well\r\n").unwrap();
        assert!(rem.is_empty());
        assert_eq!(r.code.code(), 250);
        assert_eq!(r.ecode.unwrap().detail(), 0);
    }

    #[test]
    fn multi_line_reply() {
        let (rem, r) = Reply::parse(b"250-first line\r\n250 second line\r\n").unwrap();
        assert!(rem.is_empty());
        assert_eq!(r.text.len(), 2);
    }

    #[test]
    fn send_single_line() {
        let r = Reply {
            code: ReplyCode::SERVICE_READY,
            ecode: None,
            text: vec![MaybeUtf8::Utf8("hello".to_owned())],
        };
        let mut out = Vec::new();
        r.send_to(&mut out).unwrap();
        assert_eq!(out, b"220 hello\r\n");
    }
}
