//! The response-writer boundary between the core and transports.
//!
//! The core never touches the network. A transport stores a
//! [`ResponseWriter`] in the execution context before running the pipeline,
//! and response handlers write through it.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::WriteError;
use crate::http::Response;

/// Sink for the single response of one unit of work.
#[async_trait]
pub trait ResponseWriter: Send + Sync {
    /// Writes the response. Writing twice is an error.
    async fn write(&self, response: Response) -> Result<(), WriteError>;

    /// Returns `true` once a response has been written.
    fn is_written(&self) -> bool;
}

/// Type alias for a shared writer handle.
pub type BoxedWriter = Arc<dyn ResponseWriter>;

/// A writer that keeps the response in memory.
///
/// Used by in-process transports and tests.
#[derive(Debug, Default)]
pub struct RecordingWriter {
    response: Mutex<Option<Response>>,
}

impl RecordingWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of the written response.
    pub fn response(&self) -> Option<Response> {
        self.response.lock().clone()
    }

    /// Removes and returns the written response.
    pub fn take(&self) -> Option<Response> {
        self.response.lock().take()
    }
}

#[async_trait]
impl ResponseWriter for RecordingWriter {
    async fn write(&self, response: Response) -> Result<(), WriteError> {
        let mut slot = self.response.lock();
        if slot.is_some() {
            return Err(WriteError::AlreadyWritten);
        }
        *slot = Some(response);
        Ok(())
    }

    fn is_written(&self) -> bool {
        self.response.lock().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::StatusCode;

    #[tokio::test]
    async fn test_second_write_is_rejected() {
        let writer = RecordingWriter::new();
        writer.write(Response::new(StatusCode::NO_CONTENT)).await.unwrap();

        assert!(writer.is_written());
        assert!(matches!(
            writer.write(Response::new(StatusCode::INTERNAL_SERVER_ERROR)).await,
            Err(WriteError::AlreadyWritten)
        ));
        assert_eq!(writer.response().unwrap().status, 204);
    }
}
