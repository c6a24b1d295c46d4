/// SMTP reply text returned to the agent on reject and tempfail
use std::fmt;

use crate::{Error, Result};

/// Maximum number of lines in a multi-line reply
pub const MAX_REPLY_LINES: usize = 32;

/// Maximum length of a single reply line
pub const MAX_LINE_LEN: usize = 980;

/// SMTP reply code, restricted to the 4xx and 5xx classes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplyCode(u16);

impl ReplyCode {
    pub const TEMP_FAIL: Self = Self(451);
    pub const REJECTED: Self = Self(550);

    pub fn new(code: u16) -> Result<Self> {
        if (400..600).contains(&code) {
            Ok(Self(code))
        } else {
            Err(Error::InvalidReply(format!(
                "reply code {code} is not a 4xx or 5xx code"
            )))
        }
    }

    /// Parse a three digit code as written in the reply
    pub fn parse(s: &str) -> Result<Self> {
        if s.len() != 3 || !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(Error::InvalidReply(format!(
                "reply code {s:?} is not three digits"
            )));
        }
        s.parse::<u16>()
            .map_err(|e| Error::InvalidReply(e.to_string()))
            .and_then(Self::new)
    }

    pub fn value(&self) -> u16 {
        self.0
    }

    /// First digit, 4 or 5
    pub fn class(&self) -> u8 {
        (self.0 / 100) as u8
    }

    pub fn is_transient(&self) -> bool {
        self.class() == 4
    }

    pub fn is_permanent(&self) -> bool {
        self.class() == 5
    }
}

impl fmt::Display for ReplyCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// RFC 3463 enhanced status code (`class.subject.detail`)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnhancedCode {
    pub class: u8,
    pub subject: u16,
    pub detail: u16,
}

impl EnhancedCode {
    pub fn parse(s: &str) -> Result<Self> {
        let invalid = || Error::InvalidReply(format!("enhanced status code {s:?} is malformed"));

        let mut parts = s.split('.');
        let (Some(class), Some(subject), Some(detail), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(invalid());
        };

        let number = |part: &str| -> Result<u16> {
            if part.is_empty() || part.len() > 3 || !part.bytes().all(|b| b.is_ascii_digit()) {
                return Err(invalid());
            }
            part.parse::<u16>().map_err(|_| invalid())
        };

        if class.len() != 1 {
            return Err(invalid());
        }
        let class = number(class)? as u8;
        if !matches!(class, 2 | 4 | 5) {
            return Err(invalid());
        }

        Ok(Self {
            class,
            subject: number(subject)?,
            detail: number(detail)?,
        })
    }

    fn default_for(code: ReplyCode) -> Self {
        Self {
            class: code.class(),
            subject: 0,
            detail: 0,
        }
    }
}

impl fmt::Display for EnhancedCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.class, self.subject, self.detail)
    }
}

/// Validated SMTP reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmtpReply {
    code: ReplyCode,
    enhanced: Option<EnhancedCode>,
    lines: Vec<String>,
}

impl SmtpReply {
    /// Single line reply. Both the enhanced code and the message may be
    /// omitted.
    pub fn new(code: &str, enhanced: Option<&str>, message: Option<&str>) -> Result<Self> {
        let code = ReplyCode::parse(code)?;
        let enhanced = Self::check_enhanced(code, enhanced)?;
        let lines = match message {
            Some(message) => {
                check_line(message)?;
                vec![message.to_string()]
            }
            None => Vec::new(),
        };
        Ok(Self {
            code,
            enhanced,
            lines,
        })
    }

    /// Multi-line reply; the enhanced code defaults to `4.0.0`/`5.0.0`
    pub fn multi_line<S: AsRef<str>>(
        code: &str,
        enhanced: Option<&str>,
        lines: &[S],
    ) -> Result<Self> {
        if lines.len() > MAX_REPLY_LINES {
            return Err(Error::ResourceLimit {
                lines: lines.len(),
                max: MAX_REPLY_LINES,
            });
        }
        if lines.is_empty() {
            return Err(Error::InvalidReply("reply has no lines".into()));
        }

        let code = ReplyCode::parse(code)?;
        let enhanced = Self::check_enhanced(code, enhanced)?
            .unwrap_or_else(|| EnhancedCode::default_for(code));
        let lines = lines
            .iter()
            .map(|line| {
                let line = line.as_ref();
                check_line(line)?;
                Ok(line.to_string())
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            code,
            enhanced: Some(enhanced),
            lines,
        })
    }

    fn check_enhanced(code: ReplyCode, enhanced: Option<&str>) -> Result<Option<EnhancedCode>> {
        let Some(enhanced) = enhanced else {
            return Ok(None);
        };
        let parsed = EnhancedCode::parse(enhanced)?;
        if parsed.class != code.class() {
            return Err(Error::InvalidReply(format!(
                "enhanced status code {parsed} does not match reply code {code}"
            )));
        }
        Ok(Some(parsed))
    }

    pub fn code(&self) -> ReplyCode {
        self.code
    }

    pub fn enhanced(&self) -> Option<EnhancedCode> {
        self.enhanced
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    /// Reply text as carried in a reply-code packet (no trailing CRLF)
    pub fn text(&self) -> String {
        let prefix = match self.enhanced {
            Some(enhanced) => format!("{} {}", self.code, enhanced),
            None => self.code.to_string(),
        };

        if self.lines.is_empty() {
            return prefix;
        }
        if self.lines.len() == 1 {
            return format!("{prefix} {}", self.lines[0]);
        }

        let enhanced = self
            .enhanced
            .unwrap_or_else(|| EnhancedCode::default_for(self.code));
        let mut result = String::new();
        let last = self.lines.len() - 1;
        for (i, line) in self.lines.iter().enumerate() {
            if i < last {
                result.push_str(&format!("{}-{enhanced} {line}\r\n", self.code));
            } else {
                result.push_str(&format!("{} {enhanced} {line}", self.code));
            }
        }
        result
    }
}

impl fmt::Display for SmtpReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text())
    }
}

fn check_line(line: &str) -> Result<()> {
    if line.contains(['\r', '\n']) {
        return Err(Error::InvalidReply("reply line contains CR or LF".into()));
    }
    if line.len() > MAX_LINE_LEN {
        return Err(Error::InvalidReply(format!(
            "reply line is {} bytes (limit {MAX_LINE_LEN})",
            line.len()
        )));
    }
    Ok(())
}
