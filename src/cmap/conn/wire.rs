mod header;
mod message;
mod reply;
mod util;

use tokio::io::AsyncRead;

pub(crate) use self::{
    header::{Header, OpCode},
    message::{DocumentSequence, Message, DEFAULT_MAX_MESSAGE_SIZE_BYTES},
    reply::Reply,
    util::next_request_id,
};
#[cfg(test)]
pub(crate) use self::{message::MessageFlags, reply::ResponseFlags};
use crate::error::{ErrorKind, Result};

/// A message read off the wire: either an OP_MSG or a legacy OP_REPLY.
#[derive(Debug, Clone)]
pub(crate) enum WireMessage {
    Message(Message),
    Reply(Reply),
}

impl WireMessage {
    /// Reads one complete message from `reader`.
    pub(crate) async fn read_from<R: AsyncRead + Unpin + Send>(
        mut reader: R,
        max_message_size_bytes: Option<i32>,
    ) -> Result<Self> {
        let header = Header::read_from(&mut reader).await?;
        let max_len = max_message_size_bytes.unwrap_or(DEFAULT_MAX_MESSAGE_SIZE_BYTES);

        match header.op_code {
            OpCode::Message => Ok(Self::Message(
                Message::read_body(reader, &header, max_len).await?,
            )),
            OpCode::Reply => Ok(Self::Reply(
                Reply::read_body(reader, &header, max_len).await?,
            )),
            other => Err(ErrorKind::InvalidResponse {
                message: format!(
                    "Invalid op code, expected {} or {} and got {}",
                    OpCode::Message as u32,
                    OpCode::Reply as u32,
                    other as u32
                ),
            }
            .into()),
        }
    }

    pub(crate) fn response_to(&self) -> i32 {
        match self {
            Self::Message(message) => message.response_to,
            Self::Reply(reply) => reply.response_to,
        }
    }
}
