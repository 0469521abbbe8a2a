use bytes::Bytes;

/// Message is the unit read from the upstream queue. It is opaque to the output, the [Measure]
/// decides what the parts mean.
///
/// [Measure]: crate::measure::Measure
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Message {
    pub parts: Vec<Bytes>,
}

impl Message {
    pub fn new(parts: Vec<Bytes>) -> Self {
        Self { parts }
    }

    /// Total number of bytes across all the parts.
    pub fn len_bytes(&self) -> usize {
        self.parts.iter().map(|p| p.len()).sum()
    }
}

impl From<Vec<Vec<u8>>> for Message {
    fn from(parts: Vec<Vec<u8>>) -> Self {
        Self {
            parts: parts.into_iter().map(Bytes::from).collect(),
        }
    }
}

/// Response is the acknowledgment sent back to the producer, one per accepted [Message].
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Success,
    Failed(String),
}

impl Response {
    pub fn is_success(&self) -> bool {
        matches!(self, Response::Success)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_len_bytes() {
        let msg = Message::from(vec![b"123".to_vec(), b"hello".to_vec()]);
        assert_eq!(msg.parts.len(), 2);
        assert_eq!(msg.len_bytes(), 8);
        assert_eq!(Message::default().len_bytes(), 0);
    }

    #[test]
    fn test_response_status() {
        assert!(Response::Success.is_success());
        assert!(!Response::Failed("boom".to_string()).is_success());
    }
}
