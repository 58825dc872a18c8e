use crate::{
    bson::{oid::ObjectId, Bson, Document},
    selection_criteria::SelectionCriteria,
};

pub(crate) mod command;

pub(crate) const COMMAND_TRACING_EVENT_TARGET: &str = "mongodb_core::command";
pub(crate) const CONNECTION_TRACING_EVENT_TARGET: &str = "mongodb_core::connection";
pub(crate) const SERVER_SELECTION_TRACING_EVENT_TARGET: &str = "mongodb_core::server_selection";
pub(crate) const RETRY_TRACING_EVENT_TARGET: &str = "mongodb_core::retry";

pub(crate) const DEFAULT_MAX_DOCUMENT_LENGTH_BYTES: usize = 1000;

pub(crate) trait TracingRepresentation {
    type Representation;

    fn tracing_representation(&self) -> Self::Representation;
}

impl TracingRepresentation for ObjectId {
    type Representation = String;

    fn tracing_representation(&self) -> String {
        self.to_hex()
    }
}

impl TracingRepresentation for Document {
    type Representation = String;

    fn tracing_representation(&self) -> String {
        Bson::Document(self.clone())
            .into_relaxed_extjson()
            .to_string()
    }
}

impl TracingRepresentation for crate::error::Error {
    type Representation = String;

    fn tracing_representation(&self) -> String {
        self.to_string()
    }
}

impl TracingRepresentation for SelectionCriteria {
    type Representation = String;

    fn tracing_representation(&self) -> Self::Representation {
        self.to_string()
    }
}

/// Serializes a command or reply to extended JSON, truncated to at most `max_length_bytes`
/// (rounded down to a char boundary) with a trailing ellipsis.
pub(crate) fn serialize_command_or_reply(doc: Document, max_length_bytes: usize) -> String {
    let mut ext_json = doc.tracing_representation();
    truncate_on_char_boundary(&mut ext_json, max_length_bytes);
    ext_json
}

pub(crate) fn truncate_on_char_boundary(s: &mut String, new_len: usize) {
    let original_len = s.len();
    if original_len > new_len {
        let mut truncate_index = new_len;
        while !s.is_char_boundary(truncate_index) {
            truncate_index -= 1;
        }
        s.truncate(truncate_index);
        if s.len() < original_len {
            s.push_str("...");
        }
    }
}

#[cfg(test)]
mod test {
    use super::truncate_on_char_boundary;

    #[test]
    fn truncation() {
        let mut s = String::from("hello world");
        truncate_on_char_boundary(&mut s, 5);
        assert_eq!(s, "hello...");

        // "é" is two bytes wide
        let mut s = String::from("ééé");
        truncate_on_char_boundary(&mut s, 3);
        assert_eq!(s, "é...");

        let mut s = String::from("short");
        truncate_on_char_boundary(&mut s, 100);
        assert_eq!(s, "short");
    }
}
