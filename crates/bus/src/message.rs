//! Line-oriented message codec.
//!
//! One message per LF-terminated line:
//!
//! ```text
//! [server/][service/]COMMAND [key=value ...]
//! ```
//!
//! A single routing prefix segment is the target service (`images/PING`);
//! two segments are `server/service`. Values containing whitespace, `=`,
//! quotes or backslashes are double-quoted with `\"` and `\\` escapes.
use std::fmt;

use thiserror::Error;

/// A message failed to parse.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InvalidMessage {
    #[error("empty message")]
    Empty,
    #[error("invalid command word `{0}`")]
    Command(String),
    #[error("invalid routing prefix")]
    Prefix,
    #[error("invalid parameter key `{0}`")]
    ParameterKey(String),
    #[error("malformed parameter `{0}`")]
    Parameter(String),
    #[error("unterminated quoted value")]
    UnterminatedValue,
    #[error("message line too long")]
    LineTooLong,
}

/// A routed command with named parameters.
///
/// Messages are stateless values; the router reads the header fields and
/// coerces individual parameters to integers on demand.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    /// Target host name. `.` means this host, `*` all hosts, empty any.
    pub server: String,
    /// Target service on that host; `*`/`?`/`.` select a broadcast scope.
    pub service: String,
    /// The command word.
    pub command: String,
    params: Vec<(String, String)>,
}

impl Message {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Self::default()
        }
    }

    pub fn with_server(mut self, server: impl Into<String>) -> Self {
        self.server = server.into();
        self
    }

    pub fn with_service(mut self, service: impl Into<String>) -> Self {
        self.service = service.into();
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_param(key, value);
        self
    }

    /// Set a parameter, replacing any previous value under the same key.
    pub fn set_param(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();

        if let Some(entry) = self.params.iter_mut().find(|(k, _)| *k == key) {
            entry.1 = value;
        } else {
            self.params.push((key, value));
        }
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn has_param(&self, key: &str) -> bool {
        self.param(key).is_some()
    }

    /// A parameter coerced to an integer. `None` when absent or malformed.
    pub fn int_param(&self, key: &str) -> Option<i64> {
        self.param(key).and_then(|v| v.parse().ok())
    }

    /// Originating host, filled in by the daemon that first saw the message.
    pub fn sent_from_server(&self) -> Option<&str> {
        self.param("sent_from_server")
    }

    /// Originating service.
    pub fn sent_from_service(&self) -> Option<&str> {
        self.param("sent_from_service")
    }

    /// Parse a single line, without its terminating newline.
    pub fn from_line(line: &str) -> Result<Self, InvalidMessage> {
        let line = line.trim_end_matches('\r');
        if line.trim().is_empty() {
            return Err(InvalidMessage::Empty);
        }

        let (head, rest) = match line.find(' ') {
            Some(at) => (&line[..at], &line[at + 1..]),
            None => (line, ""),
        };

        let mut msg = Self::default();
        let segments: Vec<&str> = head.split('/').collect();
        let command = match segments.as_slice() {
            [command] => command,
            [service, command] => {
                msg.service = (*service).to_owned();
                command
            }
            [server, service, command] => {
                msg.server = (*server).to_owned();
                msg.service = (*service).to_owned();
                command
            }
            _ => return Err(InvalidMessage::Prefix),
        };

        if !is_command(command) {
            return Err(InvalidMessage::Command((*command).to_owned()));
        }
        msg.command = (*command).to_owned();

        let mut chars = rest.chars().peekable();
        while let Some(&c) = chars.peek() {
            if c == ' ' {
                chars.next();
                continue;
            }

            let mut key = String::new();
            let mut assigned = false;
            for c in chars.by_ref() {
                if c == '=' {
                    assigned = true;
                    break;
                }
                key.push(c);
            }
            if !is_key(&key) {
                return Err(InvalidMessage::ParameterKey(key));
            }
            if !assigned {
                return Err(InvalidMessage::Parameter(key));
            }

            let value = match chars.peek() {
                Some('"') => {
                    chars.next();
                    let mut value = String::new();
                    loop {
                        match chars.next() {
                            Some('\\') => match chars.next() {
                                Some(c @ ('"' | '\\')) => value.push(c),
                                _ => return Err(InvalidMessage::Parameter(key)),
                            },
                            Some('"') => break,
                            Some(c) => value.push(c),
                            None => return Err(InvalidMessage::UnterminatedValue),
                        }
                    }
                    // A quoted value ends the token.
                    match chars.next() {
                        None | Some(' ') => {}
                        Some(_) => return Err(InvalidMessage::Parameter(key)),
                    }
                    value
                }
                _ => {
                    let mut value = String::new();
                    for c in chars.by_ref() {
                        if c == ' ' {
                            break;
                        }
                        if c == '"' || c == '=' {
                            return Err(InvalidMessage::Parameter(key));
                        }
                        value.push(c);
                    }
                    value
                }
            };

            msg.params.push((key, value));
        }

        Ok(msg)
    }

    /// Serialize to a wire line, including the terminating newline.
    pub fn to_line(&self) -> String {
        format!("{}\n", self)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.server.is_empty() {
            write!(f, "{}/{}/", self.server, self.service)?;
        } else if !self.service.is_empty() {
            write!(f, "{}/", self.service)?;
        }
        write!(f, "{}", self.command)?;

        for (key, value) in &self.params {
            if needs_quoting(value) {
                let escaped = value.replace('\\', "\\\\").replace('"', "\\\"");
                write!(f, " {}=\"{}\"", key, escaped)?;
            } else {
                write!(f, " {}={}", key, value)?;
            }
        }
        Ok(())
    }
}

fn needs_quoting(value: &str) -> bool {
    value.is_empty()
        || value
            .chars()
            .any(|c| c.is_whitespace() || c == '=' || c == '"' || c == '\\')
}

/// Command words are `[A-Z_][A-Z0-9_]*`.
fn is_command(word: &str) -> bool {
    let mut chars = word.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_uppercase() || c == '_')
        && chars.all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_')
}

/// Parameter keys are `[A-Za-z_][A-Za-z0-9_]*`.
fn is_key(word: &str) -> bool {
    let mut chars = word.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
