use crate::embeddings::Embedder;
use crate::error::RetrieveError;
use crate::models::RetrievalResult;
use crate::store::VectorStore;

// Embeds queries with the provider used at ingest time. A `k` larger than
// the store is clamped to what exists; an empty store yields empty results.
pub struct Retriever<E: Embedder> {
    store: VectorStore,
    embedder: E,
}

impl<E: Embedder> Retriever<E> {
    pub fn new(store: VectorStore, embedder: E) -> Self {
        Self { store, embedder }
    }

    pub async fn retrieve(
        &self,
        query: &str,
        k: usize,
    ) -> Result<Vec<RetrievalResult>, RetrieveError> {
        let query_vector = self.embedder.embed(query).await?;
        let hits = self.store.search(&query_vector, k)?;
        Ok(hits)
    }

    pub fn store(&self) -> &VectorStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut VectorStore {
        &mut self.store
    }

    pub fn embedder(&self) -> &E {
        &self.embedder
    }

    pub fn into_store(self) -> VectorStore {
        self.store
    }
}
