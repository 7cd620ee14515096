use std::io;

use nom::{
    branch::alt,
    bytes::streaming::{tag, tag_no_case, take_until},
    character::streaming::space0,
    combinator::{map, map_res, opt},
    sequence::{preceded, terminated, tuple},
    IResult,
};

use crate::misc::{email_with_path, Email, Hostname, MaybeUtf8, Path};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterName<S = String>(pub S);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Parameters<S = String>(pub Vec<(ParameterName<S>, Option<MaybeUtf8<S>>)>);

/// The SMTP commands this relay recognizes on its ingress side.
///
/// `VRFY`/`EXPN`/`HELP` are intentionally not modeled here: this relay never
/// exposes mailbox-verification or documentation commands to clients.
#[derive(Debug, Clone)]
pub enum Command<S = String> {
    Ehlo {
        hostname: Hostname<S>,
    },
    Helo {
        hostname: Hostname<S>,
    },
    Mail {
        path: Option<Path<S>>,
        email: Option<Email<S>>,
        params: Parameters<S>,
    },
    Rcpt {
        path: Option<Path<S>>,
        email: Email<S>,
        params: Parameters<S>,
    },
    Data,
    Rset,
    Starttls,
    AuthLogin,
    AuthPlain {
        initial_response: Option<Vec<u8>>,
    },
    Noop {
        string: MaybeUtf8<S>,
    },
    Quit,
}

impl<'a> Command<&'a str> {
    pub fn parse(buf: &'a [u8]) -> IResult<&'a [u8], Command<&'a str>> {
        command(buf)
    }
}

fn mail(buf: &[u8]) -> IResult<&[u8], Command<&str>> {
    let (buf, _) = tuple((tag_no_case("MAIL"), space0, tag_no_case("FROM:"), space0))(buf)?;
    let (buf, res) = alt((
        map(tag_no_case("<>"), |_| None),
        map(
            email_with_path(b"\r\n", b"\r\n@", b">\r\n", b">\r\n@"),
            Some,
        ),
    ))(buf)?;
    let (buf, params) = parameters(buf)?;
    let (buf, _) = tag("\r\n")(buf)?;
    let (path, email) = match res {
        Some((path, email)) => (path, Some(email)),
        None => (None, None),
    };
    Ok((
        buf,
        Command::Mail {
            path,
            email,
            params,
        },
    ))
}

fn ehlo(buf: &[u8]) -> IResult<&[u8], Command<&str>> {
    let (buf, _) = tuple((tag_no_case("EHLO"), space0))(buf)?;
    let (buf, hostname) = Hostname::parse_until(b"\r\n")(buf)?;
    let (buf, _) = tag("\r\n")(buf)?;
    Ok((buf, Command::Ehlo { hostname }))
}

fn helo(buf: &[u8]) -> IResult<&[u8], Command<&str>> {
    let (buf, _) = tuple((tag_no_case("HELO"), space0))(buf)?;
    let (buf, hostname) = Hostname::parse_until(b"\r\n")(buf)?;
    let (buf, _) = tag("\r\n")(buf)?;
    Ok((buf, Command::Helo { hostname }))
}

fn rcpt(buf: &[u8]) -> IResult<&[u8], Command<&str>> {
    let (buf, _) = tuple((tag_no_case("RCPT"), space0, tag_no_case("TO:"), space0))(buf)?;
    let (buf, (path, email)) = email_with_path(b"\r\n", b"\r\n@", b">\r\n", b">\r\n@")(buf)?;
    let (buf, params) = parameters(buf)?;
    let (buf, _) = tag("\r\n")(buf)?;
    Ok((
        buf,
        Command::Rcpt {
            path,
            email,
            params,
        },
    ))
}

/// Parses the trailing ` NAME` / ` NAME=VALUE` mail parameters (eg. `SIZE=`,
/// `BODY=8BITMIME`) up to, but not including, the terminating CRLF.
fn parameters(buf: &[u8]) -> IResult<&[u8], Parameters<&str>> {
    let mut params = Vec::new();
    let mut rest = buf;
    while let Ok((new_rest, raw)) = preceded(tag(" "), take_until_one_of(b" \r"))(rest) {
        let raw = std::str::from_utf8(raw).unwrap_or("");
        if let Some(eq) = raw.find('=') {
            params.push((
                ParameterName(&raw[..eq]),
                Some(MaybeUtf8::Ascii(&raw[eq + 1..])),
            ));
        } else {
            params.push((ParameterName(raw), None));
        }
        rest = new_rest;
    }
    Ok((rest, Parameters(params)))
}

fn take_until_one_of<'a>(
    chars: &'static [u8],
) -> impl Fn(&'a [u8]) -> IResult<&'a [u8], &'a [u8]> {
    move |buf: &'a [u8]| {
        let end = buf
            .iter()
            .position(|b| chars.contains(b))
            .unwrap_or(buf.len());
        if end == 0 {
            return Err(nom::Err::Error(nom::error::Error::new(
                buf,
                nom::error::ErrorKind::TakeUntil,
            )));
        }
        Ok((&buf[end..], &buf[..end]))
    }
}

fn data(buf: &[u8]) -> IResult<&[u8], Command<&str>> {
    map(terminated(tag_no_case("DATA"), tag("\r\n")), |_| {
        Command::Data
    })(buf)
}

fn rset(buf: &[u8]) -> IResult<&[u8], Command<&str>> {
    map(terminated(tag_no_case("RSET"), tag("\r\n")), |_| {
        Command::Rset
    })(buf)
}

fn starttls(buf: &[u8]) -> IResult<&[u8], Command<&str>> {
    map(terminated(tag_no_case("STARTTLS"), tag("\r\n")), |_| {
        Command::Starttls
    })(buf)
}

fn quit(buf: &[u8]) -> IResult<&[u8], Command<&str>> {
    map(terminated(tag_no_case("QUIT"), tag("\r\n")), |_| {
        Command::Quit
    })(buf)
}

fn line_arg_no_crlf(buf: &[u8]) -> IResult<&[u8], &str> {
    map_res(take_until("\r\n"), std::str::from_utf8)(buf)
}

fn noop(buf: &[u8]) -> IResult<&[u8], Command<&str>> {
    let (buf, _) = tag_no_case("NOOP")(buf)?;
    let (buf, arg) = opt(preceded(tag(" "), line_arg_no_crlf))(buf)?;
    let (buf, _) = tag("\r\n")(buf)?;
    Ok((
        buf,
        Command::Noop {
            string: MaybeUtf8::Ascii(arg.unwrap_or("")),
        },
    ))
}

fn auth(buf: &[u8]) -> IResult<&[u8], Command<&str>> {
    let (buf, _) = tuple((tag_no_case("AUTH"), space0))(buf)?;
    alt((
        map(terminated(tag_no_case("LOGIN"), tag("\r\n")), |_| {
            Command::AuthLogin
        }),
        map(
            terminated(
                preceded(
                    tag_no_case("PLAIN"),
                    opt(preceded(tag(" "), line_arg_no_crlf)),
                ),
                tag("\r\n"),
            ),
            |resp: Option<&str>| Command::AuthPlain {
                initial_response: resp.map(|r| r.as_bytes().to_vec()),
            },
        ),
    ))(buf)
}

fn command(buf: &[u8]) -> IResult<&[u8], Command<&str>> {
    alt((
        ehlo, helo, mail, rcpt, data, rset, starttls, auth, quit, noop,
    ))(buf)
}

impl<S> Command<S>
where
    S: AsRef<str>,
{
    pub fn send_to(&self, w: &mut dyn io::Write) -> io::Result<()> {
        match self {
            Command::Ehlo { hostname } => {
                w.write_all(b"EHLO ")?;
                write_io_slices(w, hostname.as_io_slices())?;
            }
            Command::Helo { hostname } => {
                w.write_all(b"HELO ")?;
                write_io_slices(w, hostname.as_io_slices())?;
            }
            Command::Mail { email, .. } => {
                w.write_all(b"MAIL FROM:<")?;
                if let Some(email) = email {
                    write_io_slices(w, email.as_io_slices())?;
                }
                w.write_all(b">")?;
            }
            Command::Rcpt { email, .. } => {
                w.write_all(b"RCPT TO:<")?;
                write_io_slices(w, email.as_io_slices())?;
                w.write_all(b">")?;
            }
            Command::Data => w.write_all(b"DATA")?,
            Command::Rset => w.write_all(b"RSET")?,
            Command::Starttls => w.write_all(b"STARTTLS")?,
            Command::AuthLogin => w.write_all(b"AUTH LOGIN")?,
            Command::AuthPlain { initial_response } => {
                w.write_all(b"AUTH PLAIN")?;
                if let Some(resp) = initial_response {
                    w.write_all(b" ")?;
                    w.write_all(resp)?;
                }
            }
            Command::Noop { string } => {
                w.write_all(b"NOOP ")?;
                w.write_all(string.as_ref().as_bytes())?;
            }
            Command::Quit => w.write_all(b"QUIT")?,
        }
        w.write_all(b"\r\n")
    }
}

fn write_io_slices<'a>(
    w: &mut dyn io::Write,
    slices: impl Iterator<Item = io::IoSlice<'a>>,
) -> io::Result<()> {
    for s in slices {
        w.write_all(&s)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ehlo() {
        let (rem, cmd) = Command::parse(b"EHLO example.org\r\n").unwrap();
        assert!(rem.is_empty());
        match cmd {
            Command::Ehlo { hostname } => assert_eq!(hostname.raw(), &"example.org"),
            _ => panic!("wrong command"),
        }
    }

    #[test]
    fn parses_mail_from() {
        let (rem, cmd) = Command::parse(b"MAIL FROM:<foo@example.org>\r\n").unwrap();
        assert!(rem.is_empty());
        assert!(matches!(cmd, Command::Mail { email: Some(_), .. }));
    }

    #[test]
    fn parses_mail_from_empty() {
        let (rem, cmd) = Command::parse(b"MAIL FROM:<>\r\n").unwrap();
        assert!(rem.is_empty());
        assert!(matches!(cmd, Command::Mail { email: None, .. }));
    }

    #[test]
    fn parses_rcpt_to() {
        let (rem, cmd) = Command::parse(b"RCPT TO:<bar@example.org>\r\n").unwrap();
        assert!(rem.is_empty());
        assert!(matches!(cmd, Command::Rcpt { .. }));
    }

    #[test]
    fn parses_data_rset_quit_starttls() {
        assert!(matches!(
            Command::parse(b"DATA\r\n").unwrap().1,
            Command::Data
        ));
        assert!(matches!(
            Command::parse(b"RSET\r\n").unwrap().1,
            Command::Rset
        ));
        assert!(matches!(
            Command::parse(b"QUIT\r\n").unwrap().1,
            Command::Quit
        ));
        assert!(matches!(
            Command::parse(b"STARTTLS\r\n").unwrap().1,
            Command::Starttls
        ));
    }

    #[test]
    fn parses_auth_login() {
        assert!(matches!(
            Command::parse(b"AUTH LOGIN\r\n").unwrap().1,
            Command::AuthLogin
        ));
    }
}
