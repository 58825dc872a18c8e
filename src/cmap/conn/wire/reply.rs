use bitflags::bitflags;
use tokio::io::{AsyncRead, AsyncReadExt};

use super::{
    header::Header,
    util::{read_document_bytes, SyncCountReader, SyncLittleEndianRead},
};
use crate::{
    bson::RawDocumentBuf,
    error::{Error, Result},
};

/// Represents a wire protocol OP_REPLY operation, as sent by servers answering a legacy OP_QUERY.
#[derive(Debug, Clone)]
pub(crate) struct Reply {
    pub(crate) response_to: i32,
    pub(crate) response_flags: ResponseFlags,
    pub(crate) documents: Vec<RawDocumentBuf>,
}

bitflags! {
    /// Represents the bitwise flags for an OP_REPLY.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub(crate) struct ResponseFlags: u32 {
        const CURSOR_NOT_FOUND = 0b_0000_0000_0000_0000_0000_0000_0000_0001;
        const QUERY_FAILURE    = 0b_0000_0000_0000_0000_0000_0000_0000_0010;
        const AWAIT_CAPABLE    = 0b_0000_0000_0000_0000_0000_0000_0000_1000;
    }
}

const FIXED_FIELDS_LENGTH: usize = std::mem::size_of::<u32>() // flags
    + std::mem::size_of::<i64>() // cursor id
    + std::mem::size_of::<i32>() // starting_from
    + std::mem::size_of::<i32>(); // number_returned

impl Reply {
    /// Reads the body of an OP_REPLY whose header has already been consumed.
    pub(crate) async fn read_body<R: AsyncRead + Unpin + Send>(
        mut reader: R,
        header: &Header,
        max_message_size_bytes: i32,
    ) -> Result<Self> {
        let length_remaining = header.body_length(max_message_size_bytes)?;
        let mut buf = vec![0u8; length_remaining];
        reader.read_exact(&mut buf).await?;
        let mut reader = buf.as_slice();

        let response_flags = ResponseFlags::from_bits_truncate(reader.read_u32_sync()?);
        // Command replies never carry a cursor; the id and starting offset are skipped.
        reader.read_i64_sync()?;
        reader.read_i32_sync()?;
        let number_returned = reader.read_i32_sync()?;

        let documents_length = length_remaining
            .checked_sub(FIXED_FIELDS_LENGTH)
            .ok_or_else(|| Error::invalid_response("OP_REPLY too short"))?;

        let mut count_reader = SyncCountReader::new(&mut reader);
        let mut documents = Vec::new();
        while documents_length > count_reader.bytes_read() {
            let bytes = read_document_bytes(&mut count_reader)?;
            documents.push(RawDocumentBuf::from_bytes(bytes)?);
        }

        if usize::try_from(number_returned).ok() != Some(documents.len()) {
            return Err(Error::invalid_response(format!(
                "The server indicated that the reply would contain {} documents, but it contained {}",
                number_returned,
                documents.len(),
            )));
        }

        if documents_length != count_reader.bytes_read() {
            return Err(Error::invalid_response(format!(
                "The server indicated that the reply would be {} bytes long, but it instead was {}",
                header.length,
                Header::LENGTH + FIXED_FIELDS_LENGTH + count_reader.bytes_read(),
            )));
        }

        Ok(Self {
            response_to: header.response_to,
            response_flags,
            documents,
        })
    }

    pub(crate) fn is_query_failure(&self) -> bool {
        self.response_flags.contains(ResponseFlags::QUERY_FAILURE)
    }

    /// Serializes the reply. Only servers send OP_REPLY, so this is used by the in-memory test
    /// server.
    #[cfg(test)]
    pub(crate) async fn write_to<W: tokio::io::AsyncWrite + Unpin + Send>(
        &self,
        mut writer: W,
    ) -> Result<()> {
        use tokio::io::AsyncWriteExt;

        let documents: Vec<u8> = self
            .documents
            .iter()
            .flat_map(|d| d.as_bytes().iter().copied())
            .collect();
        let header = Header {
            length: (Header::LENGTH + FIXED_FIELDS_LENGTH + documents.len()) as i32,
            request_id: super::next_request_id(),
            response_to: self.response_to,
            op_code: super::OpCode::Reply,
        };
        header.write_to(&mut writer).await?;
        writer.write_u32_le(self.response_flags.bits()).await?;
        writer.write_i64_le(0).await?;
        writer.write_i32_le(0).await?;
        writer
            .write_i32_le(i32::try_from(self.documents.len()).unwrap_or(i32::MAX))
            .await?;
        writer.write_all(&documents).await?;
        writer.flush().await?;
        Ok(())
    }
}
