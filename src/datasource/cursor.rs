//! Result cursor returned by `Connector::find`

use std::collections::VecDeque;

use bson::Document;

use super::errors::DatasourceResult;

/// Forward-only sequence of documents
#[derive(Debug, Default, Clone)]
pub struct Cursor {
    documents: VecDeque<Document>,
}

impl Cursor {
    pub fn new(documents: Vec<Document>) -> Self {
        Self {
            documents: documents.into(),
        }
    }

    /// Decode a cursor from BSON-encoded blobs
    pub fn from_blobs(blobs: &[Vec<u8>]) -> DatasourceResult<Self> {
        let mut documents = VecDeque::with_capacity(blobs.len());
        for blob in blobs {
            documents.push_back(Document::from_reader(&mut blob.as_slice())?);
        }
        Ok(Self { documents })
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    /// Drain the remaining documents
    pub fn all(self) -> Vec<Document> {
        self.documents.into()
    }
}

impl Iterator for Cursor {
    type Item = Document;

    fn next(&mut self) -> Option<Document> {
        self.documents.pop_front()
    }
}
