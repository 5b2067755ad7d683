//! Wire protocol
//!
//! The control plane is ASCII lines terminated by LF or CRLF; file bodies
//! are raw bytes framed by an explicit 8-byte big-endian length prefix.
//! This module holds the protocol limits, the line reader used by the
//! authentication and command phases, the body frame codec, and the
//! priority-aware command tokenizer.

use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use thiserror::Error;

use crate::task::Priority;

/// Maximum length of a single control line, in bytes.
pub const MAX_LINE_LEN: usize = 4096;
/// Maximum accepted file body size.
pub const MAX_BODY_SIZE: u64 = 10 * 1024 * 1024;
/// Maximum filename length accepted from a client.
pub const MAX_FILENAME_LEN: usize = 255;
/// Maximum username length.
pub const MAX_USERNAME_LEN: usize = 49;
/// Maximum password length.
pub const MAX_PASSWORD_LEN: usize = 49;
/// Cap on human-readable task result messages.
pub const MAX_MESSAGE_LEN: usize = 4096;

/// Control line requesting the upload body from the client.
pub const SEND_FILE_DATA: &[u8] = b"SEND_FILE_DATA\n";
/// Prompt written between command cycles.
pub const PROMPT: &[u8] = b"> ";

/// How long a blocked control-plane read waits before re-checking the
/// shutdown flag. Bounds handler shutdown latency.
pub(crate) const READ_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Outcome of reading one control line.
#[derive(Debug)]
pub(crate) enum LineEvent {
    /// A complete line, with the terminator (and any trailing CR) stripped.
    Line(String),
    /// The peer closed the connection.
    Closed,
    /// Shutdown was signalled while the read was blocked.
    ShutdownAbort,
}

/// Read one line from `stream`, polling `shutdown` while blocked.
///
/// Bytes are consumed one at a time so that anything after the line
/// terminator (an upload length prefix, say) stays in the socket buffer
/// for whichever thread reads the body. A line longer than
/// [`MAX_LINE_LEN`] is a fatal protocol error.
pub(crate) fn read_line(stream: &TcpStream, shutdown: &AtomicBool) -> io::Result<LineEvent> {
    stream.set_read_timeout(Some(READ_POLL_INTERVAL))?;

    let mut reader = stream;
    let mut line = Vec::with_capacity(64);
    let mut byte = [0u8; 1];
    loop {
        match reader.read(&mut byte) {
            Ok(0) => return Ok(LineEvent::Closed),
            Ok(_) => {
                if byte[0] == b'\n' {
                    if line.last() == Some(&b'\r') {
                        line.pop();
                    }
                    let text = String::from_utf8_lossy(&line).into_owned();
                    return Ok(LineEvent::Line(text));
                }
                if line.len() >= MAX_LINE_LEN {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "control line exceeds maximum length",
                    ));
                }
                line.push(byte[0]);
            }
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::TimedOut =>
            {
                if shutdown.load(Ordering::SeqCst) {
                    return Ok(LineEvent::ShutdownAbort);
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
}

/// Write the 8-byte big-endian body length prefix.
pub(crate) fn write_frame_len<W: Write>(w: &mut W, len: u64) -> io::Result<()> {
    w.write_all(&len.to_be_bytes())
}

/// Read the 8-byte big-endian body length prefix.
pub(crate) fn read_frame_len<R: Read>(r: &mut R) -> io::Result<u64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(u64::from_be_bytes(buf))
}

/// A parsed client command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Store a file body under the given name.
    Upload {
        /// Client-supplied filename, not yet sanitized.
        name: String,
        /// Scheduling priority.
        priority: Priority,
    },
    /// Retrieve a stored file.
    Download {
        /// Client-supplied filename, not yet sanitized.
        name: String,
        /// Scheduling priority.
        priority: Priority,
    },
    /// Remove a stored file.
    Delete {
        /// Client-supplied filename, not yet sanitized.
        name: String,
        /// Scheduling priority.
        priority: Priority,
    },
    /// List the user's files.
    List {
        /// Scheduling priority.
        priority: Priority,
    },
    /// End the session.
    Quit,
}

/// Command-line parse failure, surfaced to the client as `ERROR: …`.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    /// The line contained no tokens.
    #[error("empty command")]
    Empty,
    /// The first token is not a known verb.
    #[error(
        "Unknown command '{0}'. Use UPLOAD <filename>, DOWNLOAD <filename>, \
         DELETE <filename>, LIST, or QUIT"
    )]
    UnknownCommand(String),
    /// UPLOAD/DOWNLOAD/DELETE without a filename argument.
    #[error("{0} requires a filename")]
    MissingFilename(&'static str),
    /// Filename argument over [`MAX_FILENAME_LEN`] bytes.
    #[error("Filename exceeds {MAX_FILENAME_LEN} bytes")]
    FilenameTooLong,
}

fn parse_priority_flag(token: &str) -> Option<Priority> {
    match token {
        "--high" | "--priority=high" | "-high" => Some(Priority::High),
        "--medium" | "--priority=medium" => Some(Priority::Medium),
        "--low" | "--priority=low" | "-low" => Some(Priority::Low),
        _ => None,
    }
}

/// Tokenize one command line.
///
/// The verb is case-insensitive. The following one or two tokens may be a
/// filename (any token not starting with `-`) and/or a priority flag;
/// unrecognized flags fall back to [`Priority::Medium`] rather than
/// failing, so older clients with odd flag spellings keep working.
pub fn parse_command(line: &str) -> Result<Command, ParseError> {
    // Clients sometimes echo the prompt back; tolerate it.
    let line = line.strip_prefix("> ").unwrap_or(line);

    let mut tokens = line.split_whitespace();
    let verb = tokens.next().ok_or(ParseError::Empty)?.to_ascii_uppercase();

    let mut filename: Option<&str> = None;
    let mut priority = Priority::Medium;
    for token in tokens.take(2) {
        if token.starts_with('-') {
            if let Some(p) = parse_priority_flag(token) {
                priority = p;
            } else {
                log::debug!("ignoring unknown priority flag {token:?}");
            }
        } else if filename.is_none() {
            filename = Some(token);
        }
    }

    let require_filename = |cmd: &'static str| -> Result<String, ParseError> {
        let name = filename.ok_or(ParseError::MissingFilename(cmd))?;
        if name.len() > MAX_FILENAME_LEN {
            return Err(ParseError::FilenameTooLong);
        }
        Ok(name.to_string())
    };

    match verb.as_str() {
        "UPLOAD" => Ok(Command::Upload {
            name: require_filename("UPLOAD")?,
            priority,
        }),
        "DOWNLOAD" => Ok(Command::Download {
            name: require_filename("DOWNLOAD")?,
            priority,
        }),
        "DELETE" => Ok(Command::Delete {
            name: require_filename("DELETE")?,
            priority,
        }),
        // A stray filename token on LIST is ignored, as it always has been.
        "LIST" => Ok(Command::List { priority }),
        "QUIT" | "EXIT" => Ok(Command::Quit),
        _ => Err(ParseError::UnknownCommand(verb)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn verbs_are_case_insensitive() {
        assert_eq!(
            parse_command("upload a.txt"),
            Ok(Command::Upload {
                name: "a.txt".into(),
                priority: Priority::Medium
            })
        );
        assert_eq!(parse_command("Quit"), Ok(Command::Quit));
        assert_eq!(parse_command("EXIT"), Ok(Command::Quit));
    }

    #[test]
    fn filenames_keep_their_case() {
        assert_eq!(
            parse_command("DOWNLOAD MixedCase.TXT"),
            Ok(Command::Download {
                name: "MixedCase.TXT".into(),
                priority: Priority::Medium
            })
        );
    }

    #[test]
    fn priority_flags_in_either_position() {
        assert_eq!(
            parse_command("UPLOAD a.txt --high"),
            Ok(Command::Upload {
                name: "a.txt".into(),
                priority: Priority::High
            })
        );
        assert_eq!(
            parse_command("UPLOAD --low a.txt"),
            Ok(Command::Upload {
                name: "a.txt".into(),
                priority: Priority::Low
            })
        );
        assert_eq!(
            parse_command("LIST --priority=high"),
            Ok(Command::List {
                priority: Priority::High
            })
        );
        assert_eq!(
            parse_command("DELETE a.txt -low"),
            Ok(Command::Delete {
                name: "a.txt".into(),
                priority: Priority::Low
            })
        );
    }

    #[test]
    fn unknown_flags_default_to_medium() {
        assert_eq!(
            parse_command("UPLOAD a.txt --urgent"),
            Ok(Command::Upload {
                name: "a.txt".into(),
                priority: Priority::Medium
            })
        );
        assert_eq!(
            parse_command("LIST -medium"),
            Ok(Command::List {
                priority: Priority::Medium
            })
        );
    }

    #[test]
    fn filename_is_required_where_it_is_required() {
        assert_eq!(
            parse_command("UPLOAD"),
            Err(ParseError::MissingFilename("UPLOAD"))
        );
        assert_eq!(
            parse_command("DELETE --high"),
            Err(ParseError::MissingFilename("DELETE"))
        );
    }

    #[test]
    fn over_long_filenames_are_rejected_not_truncated() {
        let name = "x".repeat(MAX_FILENAME_LEN + 1);
        assert_eq!(
            parse_command(&format!("UPLOAD {name}")),
            Err(ParseError::FilenameTooLong)
        );
    }

    #[test]
    fn unknown_commands_fail() {
        assert!(matches!(
            parse_command("FROBNICATE a.txt"),
            Err(ParseError::UnknownCommand(_))
        ));
        assert_eq!(parse_command("   "), Err(ParseError::Empty));
    }

    #[test]
    fn echoed_prompt_is_tolerated() {
        assert_eq!(parse_command("> LIST"), Ok(Command::List {
            priority: Priority::Medium
        }));
    }

    #[test]
    fn frame_len_round_trip() {
        let mut buf = Vec::new();
        write_frame_len(&mut buf, 0xDEAD_BEEF).unwrap();
        assert_eq!(buf.len(), 8);
        assert_eq!(read_frame_len(&mut Cursor::new(&buf)).unwrap(), 0xDEAD_BEEF);
    }

    #[test]
    fn frame_len_is_big_endian() {
        let mut buf = Vec::new();
        write_frame_len(&mut buf, 5).unwrap();
        assert_eq!(buf, [0, 0, 0, 0, 0, 0, 0, 5]);
    }
}
