use std::io;

use thiserror::Error;

use crate::model::NodeId;

pub type Result<T> = std::result::Result<T, GraphError>;

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("corrupt record: {0}")]
    CorruptFormat(String),
    #[error("value cannot be encoded: {0}")]
    UnencodableValue(&'static str),
    #[error("persistence failure: {0}")]
    Persistence(String),
    #[error("failed to load node {id}: {source}")]
    LoadFailed {
        id: NodeId,
        #[source]
        source: Box<GraphError>,
    },
    #[error("backpressure wait was cancelled")]
    Cancelled,
    #[error("backpressure wait timed out")]
    TimedOut,
    #[error("reference manager is closed")]
    Shutdown,
}

impl GraphError {
    pub(crate) fn load_failed(id: NodeId, source: GraphError) -> Self {
        GraphError::LoadFailed {
            id,
            source: Box::new(source),
        }
    }
}
