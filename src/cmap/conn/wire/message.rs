use bitflags::bitflags;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{
    header::{Header, OpCode},
    next_request_id,
    util::{read_document_bytes, SyncCountReader, SyncLittleEndianRead},
};
use crate::{
    bson::{doc, Array, Document, RawDocumentBuf},
    cmap::conn::command::Command,
    error::{Error, ErrorKind, Result},
};

/// Represents an OP_MSG wire protocol operation.
#[derive(Debug, Clone)]
pub(crate) struct Message {
    // OP_MSG payload type 0
    pub(crate) document_payload: RawDocumentBuf,
    // OP_MSG payload type 1
    pub(crate) document_sequences: Vec<DocumentSequence>,
    pub(crate) response_to: i32,
    pub(crate) flags: MessageFlags,
    pub(crate) checksum: Option<u32>,
    pub(crate) request_id: Option<i32>,
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct DocumentSequence {
    pub(crate) identifier: String,
    pub(crate) documents: Vec<RawDocumentBuf>,
}

impl Message {
    /// Creates a `Message` from a given `Command`. Note that the `response_to` field must be set
    /// manually.
    pub(crate) fn from_command(command: Command, request_id: Option<i32>) -> Result<Self> {
        let document_payload = crate::bson::to_raw_document_buf(&command)?;

        let mut flags = MessageFlags::empty();
        if command.exhaust_allowed {
            flags |= MessageFlags::EXHAUST_ALLOWED;
        }
        if command.unacknowledged {
            flags |= MessageFlags::MORE_TO_COME;
        }

        Ok(Self {
            document_payload,
            document_sequences: command.document_sequences,
            response_to: 0,
            flags,
            checksum: None,
            request_id,
        })
    }

    /// Creates a reply to the message with the given request id.
    #[cfg(test)]
    pub(crate) fn reply(document_payload: RawDocumentBuf, response_to: i32) -> Self {
        Self {
            document_payload,
            document_sequences: Vec::new(),
            response_to,
            flags: MessageFlags::empty(),
            checksum: None,
            request_id: None,
        }
    }

    /// Gets this message's command as a Document, with document sequences folded in as arrays.
    /// If deserialization fails, returns a document containing the error.
    pub(crate) fn get_command_document(&self) -> Document {
        let mut command = match self.document_payload.to_document() {
            Ok(document) => document,
            Err(error) => return doc! { "serialization error": error.to_string() },
        };

        for document_sequence in &self.document_sequences {
            let mut documents = Array::new();
            for document in &document_sequence.documents {
                match document.to_document() {
                    Ok(document) => documents.push(document.into()),
                    Err(error) => return doc! { "serialization error": error.to_string() },
                }
            }
            command.insert(document_sequence.identifier.clone(), documents);
        }

        command
    }

    /// Whether the peer will not send a reply to this message.
    pub(crate) fn is_more_to_come(&self) -> bool {
        self.flags.contains(MessageFlags::MORE_TO_COME)
    }

    /// Reads the body of an OP_MSG whose header has already been consumed.
    pub(crate) async fn read_body<T: AsyncRead + Unpin + Send>(
        mut reader: T,
        header: &Header,
        max_message_size_bytes: i32,
    ) -> Result<Self> {
        let length_remaining = header.body_length(max_message_size_bytes)?;
        let mut buf = vec![0u8; length_remaining];
        reader.read_exact(&mut buf).await?;

        Self::read_op_common(buf.as_slice(), length_remaining, header)
    }

    fn read_op_common(mut reader: &[u8], length_remaining: usize, header: &Header) -> Result<Self> {
        let flags = MessageFlags::from_bits_truncate(reader.read_u32_sync()?);
        let mut length_remaining = length_remaining
            .checked_sub(std::mem::size_of::<u32>())
            .ok_or_else(|| Error::invalid_response("OP_MSG too short to contain flag bits"))?;

        let mut count_reader = SyncCountReader::new(&mut reader);
        let mut document_payload = None;
        let mut document_sequences = Vec::new();
        while length_remaining.saturating_sub(count_reader.bytes_read()) > 4 {
            let next_section = MessageSection::read(&mut count_reader)?;
            match next_section {
                MessageSection::Document(document) => {
                    if document_payload.is_some() {
                        return Err(ErrorKind::InvalidResponse {
                            message: "an OP_MSG response must contain exactly one payload type 0 \
                                      section"
                                .into(),
                        }
                        .into());
                    } else {
                        document_payload = Some(document);
                    }
                }
                MessageSection::Sequence(document_sequence) => {
                    document_sequences.push(document_sequence)
                }
            }
        }

        length_remaining = length_remaining
            .checked_sub(count_reader.bytes_read())
            .ok_or_else(|| {
                Error::invalid_response(format!(
                    "The server indicated that the reply would be {} bytes long, but more were \
                     read",
                    header.length,
                ))
            })?;

        let mut checksum = None;

        if length_remaining == 4 && flags.contains(MessageFlags::CHECKSUM_PRESENT) {
            checksum = Some(reader.read_u32_sync()?);
        } else if length_remaining != 0 {
            return Err(Error::invalid_response(format!(
                "The server indicated that the reply would be {} bytes long, but {} bytes were \
                 left over",
                header.length, length_remaining,
            )));
        }

        Ok(Self {
            response_to: header.response_to,
            flags,
            document_payload: document_payload.ok_or_else(|| ErrorKind::InvalidResponse {
                message: "an OP_MSG response must contain exactly one payload type 0 section"
                    .into(),
            })?,
            document_sequences,
            checksum,
            request_id: Some(header.request_id),
        })
    }

    /// Serializes the Message to bytes and writes them to `writer`. Returns the request id used.
    pub(crate) async fn write_to<T: AsyncWrite + Send + Unpin>(
        &self,
        mut writer: T,
    ) -> Result<i32> {
        let sections = self.get_sections_bytes()?;

        let total_length = Header::LENGTH
            + std::mem::size_of::<u32>()
            + sections.len()
            + self
                .checksum
                .as_ref()
                .map(std::mem::size_of_val)
                .unwrap_or(0);

        let request_id = self.request_id.unwrap_or_else(next_request_id);
        let header = Header {
            length: i32::try_from(total_length)
                .map_err(|_| Error::invalid_argument("message length overflows i32"))?,
            request_id,
            response_to: self.response_to,
            op_code: OpCode::Message,
        };

        header.write_to(&mut writer).await?;
        writer.write_u32_le(self.flags.bits()).await?;
        writer.write_all(&sections).await?;

        if let Some(checksum) = self.checksum {
            writer.write_u32_le(checksum).await?;
        }

        writer.flush().await?;

        Ok(request_id)
    }

    fn get_sections_bytes(&self) -> Result<Vec<u8>> {
        let mut sections = Vec::new();

        // Payload type 0
        sections.push(0);
        sections.extend(self.document_payload.as_bytes());

        for document_sequence in &self.document_sequences {
            // Payload type 1
            sections.push(1);

            let identifier_bytes = document_sequence.identifier.as_bytes();

            let documents_size = document_sequence
                .documents
                .iter()
                .fold(0, |running_size, document| {
                    running_size + document.as_bytes().len()
                });

            // Size bytes + identifier bytes + null-terminator byte + document bytes
            let size = 4 + identifier_bytes.len() + 1 + documents_size;
            let size = i32::try_from(size)
                .map_err(|_| Error::invalid_argument("document sequence overflows i32"))?;
            sections.extend(size.to_le_bytes());

            sections.extend(identifier_bytes);
            sections.push(0);

            for document in &document_sequence.documents {
                sections.extend(document.as_bytes());
            }
        }

        Ok(sections)
    }
}

pub(crate) const DEFAULT_MAX_MESSAGE_SIZE_BYTES: i32 = 48 * 1024 * 1024;

bitflags! {
    /// Represents the bitwise flags for an OP_MSG.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub(crate) struct MessageFlags: u32 {
        const CHECKSUM_PRESENT = 0b_0000_0000_0000_0000_0000_0000_0000_0001;
        const MORE_TO_COME     = 0b_0000_0000_0000_0000_0000_0000_0000_0010;
        const EXHAUST_ALLOWED  = 0b_0000_0000_0000_0001_0000_0000_0000_0000;
    }
}

/// Represents a section of an OP_MSG.
#[derive(Debug)]
enum MessageSection {
    Document(RawDocumentBuf),
    Sequence(DocumentSequence),
}

impl MessageSection {
    /// Reads bytes from `reader` and deserializes them into a MessageSection.
    fn read<R: std::io::Read>(reader: &mut R) -> Result<Self> {
        let payload_type = reader.read_u8_sync()?;

        if payload_type == 0 {
            let bytes = read_document_bytes(reader)?;
            let document = RawDocumentBuf::from_bytes(bytes)?;
            return Ok(MessageSection::Document(document));
        }
        if payload_type != 1 {
            return Err(Error::invalid_response(format!(
                "invalid OP_MSG payload type {payload_type}"
            )));
        }

        let size = reader.read_i32_sync()?;
        let mut length_remaining = usize::try_from(size)
            .ok()
            .and_then(|s| s.checked_sub(std::mem::size_of::<i32>()))
            .ok_or_else(|| Error::invalid_response(format!("invalid section size {size}")))?;

        let (identifier, identifier_len) = reader.read_cstring_sync()?;
        length_remaining = length_remaining
            .checked_sub(identifier_len)
            .ok_or_else(|| Error::invalid_response("document sequence identifier too long"))?;

        let mut documents = Vec::new();
        let mut count_reader = SyncCountReader::new(reader);

        while length_remaining > count_reader.bytes_read() {
            let bytes = read_document_bytes(&mut count_reader)?;
            let document = RawDocumentBuf::from_bytes(bytes)?;
            documents.push(document);
        }

        if length_remaining != count_reader.bytes_read() {
            return Err(ErrorKind::InvalidResponse {
                message: format!(
                    "The server indicated that the document sequence would be {} bytes long, but \
                     it instead was {}",
                    size,
                    count_reader.bytes_read() + identifier_len + std::mem::size_of::<i32>(),
                ),
            }
            .into());
        }

        Ok(MessageSection::Sequence(DocumentSequence {
            identifier,
            documents,
        }))
    }
}
