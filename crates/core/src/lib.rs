pub mod bot;
pub mod chat;
pub mod embeddings;
pub mod error;
pub mod extractor;
pub mod models;
pub mod processor;
pub mod retriever;
pub mod store;

pub use bot::{
    Bot, BotConfig, ChatMessage, ChatModel, HttpChatModel, ResponseStream, StaticTokenStream,
    TokenStream, NO_CONTEXT_REPLY,
};
pub use chat::{ConversationHistory, DEFAULT_HISTORY_WINDOW};
pub use embeddings::{Embedder, HashEmbedder, HttpEmbedder, DEFAULT_EMBEDDING_DIMENSIONS};
pub use error::{
    EmbeddingError, GenerationError, IngestError, RetrieveError, StoreError,
};
pub use extractor::{
    digest_file, discover_source_files, validate_pdf, write_findings_jsonl, ExtractionClient,
    ExtractionConfig, EXTRACTION_PROMPT,
};
pub use models::{
    Chunk, ChunkMetadata, FindingRecord, ProcessorOptions, RetrievalResult, Role, Turn,
    VectorRecord,
};
pub use processor::{
    chunk_id, discover_finding_files, process_batch, read_finding_payloads, split_text,
    FailedChunk, IngestReport, SkippedPayload,
};
pub use retriever::Retriever;
pub use store::VectorStore;
