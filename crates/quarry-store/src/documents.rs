use parking_lot::Mutex;
use tracing::instrument;

use quarry_core::document::Document;
use quarry_core::ids::DocumentId;

use crate::error::StoreError;

/// Read/write contract for tracked documents.
///
/// Documents keep their position: when a placeholder is promoted to its
/// server id inside `update`, the record stays in the same slot.
pub trait DocumentStore: Send + Sync {
    fn insert(&self, document: Document) -> Result<(), StoreError>;
    fn get(&self, id: &DocumentId) -> Result<Document, StoreError>;
    /// Insertion order.
    fn list(&self) -> Result<Vec<Document>, StoreError>;
    fn update(
        &self,
        id: &DocumentId,
        transform: &mut dyn FnMut(&mut Document),
    ) -> Result<Document, StoreError>;
    fn remove(&self, id: &DocumentId) -> Result<Option<Document>, StoreError>;
}

#[derive(Default)]
pub struct MemoryDocumentStore {
    documents: Mutex<Vec<Document>>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DocumentStore for MemoryDocumentStore {
    fn insert(&self, document: Document) -> Result<(), StoreError> {
        let mut documents = self.documents.lock();
        if documents.iter().any(|d| d.id == document.id) {
            return Err(StoreError::Conflict(format!(
                "document {} already exists",
                document.id
            )));
        }
        documents.push(document);
        Ok(())
    }

    fn get(&self, id: &DocumentId) -> Result<Document, StoreError> {
        self.documents
            .lock()
            .iter()
            .find(|d| &d.id == id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("document {id}")))
    }

    fn list(&self) -> Result<Vec<Document>, StoreError> {
        Ok(self.documents.lock().clone())
    }

    #[instrument(skip(self, transform), fields(document_id = %id))]
    fn update(
        &self,
        id: &DocumentId,
        transform: &mut dyn FnMut(&mut Document),
    ) -> Result<Document, StoreError> {
        let mut documents = self.documents.lock();
        let slot = documents
            .iter_mut()
            .find(|d| &d.id == id)
            .ok_or_else(|| StoreError::NotFound(format!("document {id}")))?;
        transform(slot);
        Ok(slot.clone())
    }

    fn remove(&self, id: &DocumentId) -> Result<Option<Document>, StoreError> {
        let mut documents = self.documents.lock();
        Ok(documents
            .iter()
            .position(|d| &d.id == id)
            .map(|idx| documents.remove(idx)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quarry_core::document::DocumentStatus;

    #[test]
    fn promotion_keeps_slot() {
        let store = MemoryDocumentStore::new();
        let first = Document::placeholder("a.pdf", 1);
        let second = Document::placeholder("b.pdf", 2);
        let first_id = first.id.clone();
        store.insert(first).unwrap();
        store.insert(second).unwrap();

        let promoted = store
            .update(&first_id, &mut |doc| {
                doc.promote(DocumentId::from_raw("srv-a"));
            })
            .unwrap();
        assert_eq!(promoted.status, DocumentStatus::Processing);

        let listed = store.list().unwrap();
        assert_eq!(listed[0].id.as_str(), "srv-a");
        assert_eq!(listed[1].name, "b.pdf");
        assert!(store.get(&first_id).is_err());
    }

    #[test]
    fn duplicate_insert_conflicts() {
        let store = MemoryDocumentStore::new();
        let doc = Document::placeholder("a.pdf", 1);
        store.insert(doc.clone()).unwrap();
        assert!(matches!(store.insert(doc), Err(StoreError::Conflict(_))));
    }

    #[test]
    fn update_missing_is_not_found() {
        let store = MemoryDocumentStore::new();
        let result = store.update(&DocumentId::from_raw("nope"), &mut |_| {});
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }

    #[test]
    fn remove_returns_record() {
        let store = MemoryDocumentStore::new();
        let doc = Document::placeholder("a.pdf", 1);
        let id = doc.id.clone();
        store.insert(doc).unwrap();
        assert_eq!(store.remove(&id).unwrap().map(|d| d.name), Some("a.pdf".into()));
        assert!(store.remove(&id).unwrap().is_none());
    }
}
