use serde::Serialize;

/// A unit passed from producer to consumers through the queue.
///
/// End-of-stream is a variant of its own, so no payload value can ever be
/// mistaken for the shutdown signal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum WorkItem<T> {
    Data(T),
    EndOfStream,
}

impl<T> WorkItem<T> {
    pub fn is_end_of_stream(&self) -> bool {
        matches!(self, WorkItem::EndOfStream)
    }

    pub fn into_data(self) -> Option<T> {
        match self {
            WorkItem::Data(payload) => Some(payload),
            WorkItem::EndOfStream => None,
        }
    }

    pub fn as_data(&self) -> Option<&T> {
        match self {
            WorkItem::Data(payload) => Some(payload),
            WorkItem::EndOfStream => None,
        }
    }
}

impl<T> From<T> for WorkItem<T> {
    fn from(payload: T) -> Self {
        WorkItem::Data(payload)
    }
}
