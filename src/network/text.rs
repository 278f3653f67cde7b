//! Line-oriented rendering of control and peer commands.
//!
//! The binary [`Message`](crate::network::rpc::Message) framing is what goes
//! on the wire. The line forms below are what operators see in logs and
//! what `from_text` accepts, e.g. when replaying a command by hand:
//!
//! ```text
//! INIT\n<metadata>\r
//! MOVE_DATA\n<start>\n<end>\n<name>\n<address>\n<port>\n<migration_id>\n<metadata>\r
//! RESOLVE_MIGRATION\n<migration_id>\r
//! SERVER_PUT\n<key>\n<value>\n\r
//! ```

use crate::error::ProtocolError;
use crate::network::rpc::{ControlRequest, MoveDataRequest, PeerRequest};
use crate::partitioning::KeyRange;
use crate::types::ServerIdentity;
use std::fmt;
use std::str::FromStr;

/// Argument separator.
const FIELD_SEPARATOR: char = '\n';

/// Command terminator.
const TERMINATOR: char = '\r';

impl fmt::Display for ControlRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlRequest::Init { metadata } | ControlRequest::Update { metadata } => {
                write!(f, "{}\n{}\r", self.name(), metadata)
            }
            ControlRequest::MoveData(req) => write!(
                f,
                "{}\n{}\n{}\n{}\n{}\n{}\n{}\n{}\r",
                self.name(),
                req.range.start,
                req.range.end,
                req.destination.name,
                req.destination.address,
                req.destination.port,
                req.migration_id,
                req.metadata
            ),
            ControlRequest::ResolveMigration { migration_id } => {
                write!(f, "{}\n{}\r", self.name(), migration_id)
            }
            _ => write!(f, "{}\r", self.name()),
        }
    }
}

impl ControlRequest {
    /// Parse a control command from its line form.
    ///
    /// The trailing `\r` is optional.
    pub fn from_text(text: &str) -> Result<Self, ProtocolError> {
        let body = text.strip_suffix(TERMINATOR).unwrap_or(text);
        let mut fields = body.split(FIELD_SEPARATOR);
        let command = fields.next().unwrap_or_default();
        let args: Vec<&str> = fields.collect();

        match command {
            "INIT" | "UPDATE" => {
                // Metadata never contains the separator, but tolerate a
                // missing argument as an empty cluster.
                let is_init = command == "INIT";
                let metadata = match args.as_slice() {
                    [] => String::new(),
                    [metadata] => metadata.to_string(),
                    _ => {
                        let name = if is_init { "INIT" } else { "UPDATE" };
                        return Err(wrong_count(name, 1, args.len()));
                    }
                };
                Ok(if is_init {
                    ControlRequest::Init { metadata }
                } else {
                    ControlRequest::Update { metadata }
                })
            }
            "START" => no_args(ControlRequest::Start, &args),
            "STOP" => no_args(ControlRequest::Stop, &args),
            "SHUTDOWN" => no_args(ControlRequest::Shutdown, &args),
            "LOCK_WRITE" => no_args(ControlRequest::LockWrite, &args),
            "UNLOCK_WRITE" => no_args(ControlRequest::UnlockWrite, &args),
            "MOVE_DATA" => {
                let [start, end, name, address, port, id, metadata] = args.as_slice() else {
                    return Err(wrong_count("MOVE_DATA", 7, args.len()));
                };
                let start = number::<u32>(start, "range start")?;
                let end = number::<u32>(end, "range end")?;
                let port = number::<u16>(port, "port")?;

                Ok(ControlRequest::MoveData(MoveDataRequest {
                    migration_id: number(id, "migration id")?,
                    range: KeyRange::new(start, end),
                    destination: ServerIdentity::new(*name, *address, port),
                    metadata: metadata.to_string(),
                }))
            }
            "RESOLVE_MIGRATION" => match args.as_slice() {
                [id] => Ok(ControlRequest::ResolveMigration {
                    migration_id: number(id, "migration id")?,
                }),
                _ => Err(wrong_count("RESOLVE_MIGRATION", 1, args.len())),
            },
            other => Err(ProtocolError::UnknownCommand(other.to_string())),
        }
    }
}

impl fmt::Display for PeerRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerRequest::Put { key, value } => write!(f, "SERVER_PUT\n{}\n{}\n\r", key, value),
            PeerRequest::Delete { key } => write!(f, "SERVER_DELETE\n{}\n\r", key),
            PeerRequest::PutAll(batch) => write!(
                f,
                "SERVER_PUT_ALL\n{}\n{}\n{}\n\r",
                batch.migration_id,
                batch.sequence,
                batch.len()
            ),
            PeerRequest::Revert { migration_id, keys } => {
                write!(f, "SERVER_REVERT\n{}\n{}\n\r", migration_id, keys.len())
            }
        }
    }
}

fn no_args(request: ControlRequest, args: &[&str]) -> Result<ControlRequest, ProtocolError> {
    if args.is_empty() {
        Ok(request)
    } else {
        Err(wrong_count(request.name(), 0, args.len()))
    }
}

fn wrong_count(command: &'static str, expected: usize, actual: usize) -> ProtocolError {
    ProtocolError::WrongArgumentCount {
        command,
        expected,
        actual,
    }
}

fn number<T: FromStr>(field: &str, what: &str) -> Result<T, ProtocolError> {
    field
        .trim()
        .parse()
        .map_err(|_| ProtocolError::Malformed(format!("invalid {}: {:?}", what, field)))
}
