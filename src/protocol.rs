//! Line-oriented replication protocol
//!
//! Every request is one UTF-8 line of pipe-delimited fields terminated by
//! `\n`. A connection carries exactly one request and one response.
//! Encoding refuses any field that would break the framing, so a block that
//! encodes successfully always decodes back to the same fields.

use crate::blockchain::Block;
use crate::error::ChainError;
use crate::network::PeerAddr;
use std::fmt;

pub const FIELD_SEPARATOR: char = '|';
pub const PAYLOAD_SEPARATOR: char = ':';

/// Upper bound on a single inbound line.
pub const MAX_LINE_BYTES: usize = 16 * 1024 * 1024;

/// Reasons sent back as `ERR|<reason>`.
pub mod reason {
    pub const EMPTY: &str = "EMPTY";
    pub const MALFORMED: &str = "MALFORMED";
    pub const BAD_PORT: &str = "BAD_PORT";
    pub const UNKNOWN_CMD: &str = "UNKNOWN_CMD";
    pub const TIMEOUT: &str = "TIMEOUT";
    pub const TOO_LONG: &str = "TOO_LONG";
}

fn malformed(reason: &str) -> ChainError {
    ChainError::MalformedMessage(reason.to_string())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Ping,
    GetChain,
    GetFullChain,
    ListPeers,
    RegisterPeer(PeerAddr),
    ReplicateBlock(Block),
    Unknown(String),
}

impl Command {
    pub fn name(&self) -> &str {
        match self {
            Command::Ping => "PING",
            Command::GetChain => "GET_CHAIN",
            Command::GetFullChain => "GET_FULL_CHAIN",
            Command::ListPeers => "LIST_PEERS",
            Command::RegisterPeer(_) => "REGISTER_PEER",
            Command::ReplicateBlock(_) => "REPLICATE_BLOCK",
            Command::Unknown(name) => name,
        }
    }

    /// Parse one request line. Trailing `\r`/`\n` are ignored.
    ///
    /// Errors carry the reason to send back: `EMPTY`, `MALFORMED` or `BAD_PORT`.
    pub fn parse(line: &str) -> Result<Command, ChainError> {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.trim().is_empty() {
            return Err(malformed(reason::EMPTY));
        }

        let parts: Vec<&str> = line.split(FIELD_SEPARATOR).collect();
        let keyword = parts[0].trim();

        let simple = match keyword.to_ascii_uppercase().as_str() {
            "PING" => Some(Command::Ping),
            "GET_CHAIN" => Some(Command::GetChain),
            "GET_FULL_CHAIN" => Some(Command::GetFullChain),
            "LIST_PEERS" => Some(Command::ListPeers),
            _ => None,
        };
        if let Some(command) = simple {
            // These take no arguments.
            if parts.len() != 1 {
                return Err(malformed(reason::MALFORMED));
            }
            return Ok(command);
        }

        match keyword {
            "REGISTER_PEER" => {
                if parts.len() != 3 || parts[1].trim().is_empty() {
                    return Err(malformed(reason::MALFORMED));
                }
                let port = parse_port(parts[2])?;
                Ok(Command::RegisterPeer(PeerAddr::new(parts[1].trim(), port)))
            }
            "REPLICATE_BLOCK" => Ok(Command::ReplicateBlock(decode_block_fields(&parts[1..])?)),
            other => Ok(Command::Unknown(other.to_string())),
        }
    }

    /// Render the request line, including the trailing newline.
    pub fn encode(&self) -> Result<String, ChainError> {
        let body = match self {
            Command::Ping | Command::GetChain | Command::GetFullChain | Command::ListPeers => {
                self.name().to_string()
            }
            Command::RegisterPeer(peer) => {
                check_field(&peer.host)?;
                format!("REGISTER_PEER|{}|{}", peer.host, peer.port)
            }
            Command::ReplicateBlock(block) => format!("REPLICATE_BLOCK|{}", encode_block_fields(block)?),
            Command::Unknown(name) => {
                check_field(name)?;
                name.clone()
            }
        };
        Ok(format!("{}\n", body))
    }
}

fn parse_port(raw: &str) -> Result<u16, ChainError> {
    match raw.trim().parse::<u16>() {
        Ok(port) if port != 0 => Ok(port),
        _ => Err(malformed(reason::BAD_PORT)),
    }
}

fn check_field(field: &str) -> Result<(), ChainError> {
    if field.contains([FIELD_SEPARATOR, '\n', '\r']) {
        return Err(ChainError::SerializationError(format!(
            "Field contains a framing character: {:?}",
            field
        )));
    }
    Ok(())
}

/// `index|hash|previousHash|nonce|timestamp|wrappedKey|p1:p2:...`
pub fn encode_block_fields(block: &Block) -> Result<String, ChainError> {
    for field in [&block.hash, &block.previous_hash, &block.wrapped_key] {
        check_field(field)?;
    }
    for payload in &block.encrypted_payloads {
        check_field(payload)?;
        if payload.contains(PAYLOAD_SEPARATOR) {
            return Err(ChainError::SerializationError(
                "Encrypted payload contains ':'".to_string(),
            ));
        }
    }

    Ok(format!(
        "{}|{}|{}|{}|{}|{}|{}",
        block.index,
        block.hash,
        block.previous_hash,
        block.nonce,
        block.timestamp,
        block.wrapped_key,
        block.encrypted_payloads.join(":")
    ))
}

/// Rebuild a block with exactly the sender's fields. The hash is not recomputed.
pub fn decode_block_fields(fields: &[&str]) -> Result<Block, ChainError> {
    if fields.len() != 7 {
        return Err(malformed(reason::MALFORMED));
    }
    let number = |raw: &str| raw.trim().parse::<u64>().map_err(|_| malformed(reason::MALFORMED));

    let index = number(fields[0])?;
    let hash = fields[1].to_string();
    let previous_hash = fields[2].to_string();
    let nonce = number(fields[3])?;
    let timestamp = number(fields[4])?;
    let wrapped_key = fields[5].to_string();
    let encrypted_payloads = if fields[6].is_empty() {
        Vec::new()
    } else {
        fields[6].split(PAYLOAD_SEPARATOR).map(str::to_string).collect()
    };

    if hash.is_empty() || previous_hash.is_empty() {
        return Err(malformed(reason::MALFORMED));
    }

    Ok(Block::from_parts(
        index,
        hash,
        previous_hash,
        nonce,
        timestamp,
        wrapped_key,
        encrypted_payloads,
    ))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Pong,
    ChainLength(usize),
    Peers(Vec<PeerAddr>),
    Registered(PeerAddr),
    Added,
    FullChain(Vec<Block>),
    Error(String),
}

impl Response {
    pub fn error(reason: impl Into<String>) -> Self {
        Response::Error(reason.into())
    }

    /// Render the response, one line per frame, each terminated by `\n`.
    pub fn encode(&self) -> Result<String, ChainError> {
        Ok(match self {
            Response::Pong => "PONG\n".to_string(),
            Response::ChainLength(len) => format!("OK|{}\n", len),
            Response::Peers(peers) => {
                let mut line = String::from("OK");
                for peer in peers {
                    line.push(FIELD_SEPARATOR);
                    line.push_str(&peer.to_string());
                }
                line.push('\n');
                line
            }
            Response::Registered(peer) => format!("OK|REGISTERED|{}\n", peer),
            Response::Added => "OK|ADDED\n".to_string(),
            Response::FullChain(blocks) => {
                let mut out = format!("OK|{}\n", blocks.len());
                for block in blocks {
                    out.push_str(&encode_block_fields(block)?);
                    out.push('\n');
                }
                out
            }
            Response::Error(reason) => format!("ERR|{}\n", reason),
        })
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Response::Pong => write!(f, "PONG"),
            Response::ChainLength(len) => write!(f, "OK|{}", len),
            Response::Peers(peers) => write!(f, "OK ({} peers)", peers.len()),
            Response::Registered(peer) => write!(f, "OK|REGISTERED|{}", peer),
            Response::Added => write!(f, "OK|ADDED"),
            Response::FullChain(blocks) => write!(f, "OK ({} blocks)", blocks.len()),
            Response::Error(reason) => write!(f, "ERR|{}", reason),
        }
    }
}

/// Split an `ERR|reason` line into its reason, if it is one.
pub fn error_reason(line: &str) -> Option<&str> {
    line.trim_end_matches(['\r', '\n']).strip_prefix("ERR|")
}

fn ok_fields(line: &str) -> Result<Vec<&str>, ChainError> {
    let line = line.trim_end_matches(['\r', '\n']);
    if let Some(reason) = error_reason(line) {
        return Err(ChainError::MalformedMessage(format!("peer replied ERR|{}", reason)));
    }
    let mut parts = line.split(FIELD_SEPARATOR);
    match parts.next() {
        Some("OK") => Ok(parts.collect()),
        _ => Err(ChainError::MalformedMessage(format!("unexpected reply {:?}", line))),
    }
}

/// Parse the `OK|<length>` reply to `GET_CHAIN` (also the header of `GET_FULL_CHAIN`).
pub fn parse_chain_length(line: &str) -> Result<usize, ChainError> {
    match ok_fields(line)?.as_slice() {
        [len] => len
            .trim()
            .parse()
            .map_err(|_| ChainError::MalformedMessage(format!("bad chain length {:?}", len))),
        _ => Err(ChainError::MalformedMessage("chain length reply has wrong arity".to_string())),
    }
}

/// Parse the `OK|host:port|...` reply to `LIST_PEERS`.
pub fn parse_peer_list(line: &str) -> Result<Vec<PeerAddr>, ChainError> {
    ok_fields(line)?
        .into_iter()
        .filter(|entry| !entry.is_empty())
        .map(|entry| entry.parse())
        .collect()
}

/// Parse one block line of a `GET_FULL_CHAIN` reply.
pub fn parse_block_line(line: &str) -> Result<Block, ChainError> {
    let line = line.trim_end_matches(['\r', '\n']);
    let fields: Vec<&str> = line.split(FIELD_SEPARATOR).collect();
    decode_block_fields(&fields)
}
