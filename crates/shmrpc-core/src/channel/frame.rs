//! Request and response frames.
//!
//! All integers are big-endian. Offsets are relative to the channel payload,
//! which starts right after the state byte.
//!
//! ```text
//! request:  u16 cmd_len | u32 args_len | cmd (ASCII) | args
//! response: u8 status ('+' or '-') | u32 len | body
//! ```

use crate::error::{Result, ShmRpcError};

pub const REQUEST_HEADER_LEN: usize = 6;
pub const RESPONSE_HEADER_LEN: usize = 5;

const STATUS_OK: u8 = b'+';
const STATUS_ERR: u8 = b'-';

/// A method call as laid out in the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Request<'a> {
    pub method: &'a str,
    pub args: &'a [u8],
}

impl<'a> Request<'a> {
    /// Build a request, validating the method name and argument size.
    pub fn new(method: &'a str, args: &'a [u8]) -> Result<Self> {
        if method.is_empty() || !method.is_ascii() {
            return Err(ShmRpcError::protocol(format!(
                "method name must be non-empty ASCII: {:?}",
                method
            )));
        }
        if method.len() > u16::MAX as usize {
            return Err(ShmRpcError::protocol("method name longer than 65535 bytes"));
        }
        if args.len() > u32::MAX as usize {
            return Err(ShmRpcError::protocol("arguments larger than 4 GiB"));
        }
        Ok(Self { method, args })
    }

    pub fn encoded_len(&self) -> usize {
        REQUEST_HEADER_LEN + self.method.len() + self.args.len()
    }

    /// Write the frame at the start of `buf`.
    pub fn encode_into(&self, buf: &mut [u8]) -> Result<usize> {
        let len = self.encoded_len();
        if buf.len() < len {
            return Err(ShmRpcError::protocol(format!(
                "request of {} bytes does not fit in {} bytes",
                len,
                buf.len()
            )));
        }
        let cmd_end = REQUEST_HEADER_LEN + self.method.len();
        buf[0..2].copy_from_slice(&(self.method.len() as u16).to_be_bytes());
        buf[2..6].copy_from_slice(&(self.args.len() as u32).to_be_bytes());
        buf[REQUEST_HEADER_LEN..cmd_end].copy_from_slice(self.method.as_bytes());
        buf[cmd_end..len].copy_from_slice(self.args);
        Ok(len)
    }

    /// Parse a frame from the start of `buf`.
    pub fn decode(buf: &'a [u8]) -> Result<Self> {
        if buf.len() < REQUEST_HEADER_LEN {
            return Err(ShmRpcError::protocol("truncated request header"));
        }
        let cmd_len = u16::from_be_bytes([buf[0], buf[1]]) as usize;
        let args_len = u32::from_be_bytes([buf[2], buf[3], buf[4], buf[5]]) as usize;
        let cmd_end = REQUEST_HEADER_LEN + cmd_len;
        let end = cmd_end
            .checked_add(args_len)
            .filter(|end| *end <= buf.len())
            .ok_or_else(|| {
                ShmRpcError::protocol(format!(
                    "request claims {} + {} bytes but segment holds {}",
                    cmd_len,
                    args_len,
                    buf.len()
                ))
            })?;

        let method = std::str::from_utf8(&buf[REQUEST_HEADER_LEN..cmd_end])
            .ok()
            .filter(|m| m.is_ascii())
            .ok_or_else(|| ShmRpcError::protocol("method name is not ASCII"))?;

        Ok(Self {
            method,
            args: &buf[cmd_end..end],
        })
    }
}

/// Outcome tag of a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    Err,
}

/// A method result (or error text) as laid out in the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Response<'a> {
    pub status: Status,
    pub body: &'a [u8],
}

impl<'a> Response<'a> {
    pub fn ok(body: &'a [u8]) -> Self {
        Self {
            status: Status::Ok,
            body,
        }
    }

    pub fn err(text: &'a str) -> Self {
        Self {
            status: Status::Err,
            body: text.as_bytes(),
        }
    }

    pub fn encoded_len(&self) -> usize {
        RESPONSE_HEADER_LEN + self.body.len()
    }

    pub fn encode_into(&self, buf: &mut [u8]) -> Result<usize> {
        let len = self.encoded_len();
        if self.body.len() > u32::MAX as usize {
            return Err(ShmRpcError::protocol("response larger than 4 GiB"));
        }
        if buf.len() < len {
            return Err(ShmRpcError::protocol(format!(
                "response of {} bytes does not fit in {} bytes",
                len,
                buf.len()
            )));
        }
        buf[0] = match self.status {
            Status::Ok => STATUS_OK,
            Status::Err => STATUS_ERR,
        };
        buf[1..5].copy_from_slice(&(self.body.len() as u32).to_be_bytes());
        buf[RESPONSE_HEADER_LEN..len].copy_from_slice(self.body);
        Ok(len)
    }

    pub fn decode(buf: &'a [u8]) -> Result<Self> {
        if buf.len() < RESPONSE_HEADER_LEN {
            return Err(ShmRpcError::protocol("truncated response header"));
        }
        let status = match buf[0] {
            STATUS_OK => Status::Ok,
            STATUS_ERR => Status::Err,
            other => {
                return Err(ShmRpcError::protocol(format!(
                    "unknown response status byte {:#04x}",
                    other
                )))
            }
        };
        let len = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]) as usize;
        let end = RESPONSE_HEADER_LEN
            .checked_add(len)
            .filter(|end| *end <= buf.len())
            .ok_or_else(|| {
                ShmRpcError::protocol(format!(
                    "response claims {} bytes but segment holds {}",
                    len,
                    buf.len()
                ))
            })?;
        Ok(Self {
            status,
            body: &buf[RESPONSE_HEADER_LEN..end],
        })
    }
}
