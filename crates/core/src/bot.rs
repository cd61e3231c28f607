use crate::chat::ConversationHistory;
use crate::embeddings::Embedder;
use crate::error::GenerationError;
use crate::models::{RetrievalResult, Role, Turn};
use crate::retriever::Retriever;
use async_trait::async_trait;
use regex::Regex;
use reqwest::Client;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::path::Path;
use std::time::Duration;
use tracing::warn;
use url::Url;

pub const NO_CONTEXT_REPLY: &str =
    "Based on the available sources, I cannot provide information about this topic.";

#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

#[derive(Debug, Clone)]
pub struct BotConfig {
    pub name: String,
    pub persona: String,
    pub top_k: usize,
    pub min_similarity: f32,
    pub history_window: usize,
    /// Whether a reply interrupted mid-stream is still committed to history.
    pub append_partial: bool,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            name: "Research Assistant".to_string(),
            persona: "an expert reader of the indexed scientific literature".to_string(),
            top_k: 4,
            min_similarity: 0.6,
            history_window: 10,
            append_partial: false,
        }
    }
}

// A lazy, single-pass sequence of reply tokens. Not restartable within a
// call; dropping it early closes the underlying source.
#[async_trait]
pub trait TokenStream: Send {
    async fn next_token(&mut self) -> Option<Result<String, GenerationError>>;
}

#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn stream_reply(
        &self,
        messages: &[ChatMessage],
    ) -> Result<Box<dyn TokenStream>, GenerationError>;
}

#[async_trait]
impl ChatModel for Box<dyn ChatModel> {
    async fn stream_reply(
        &self,
        messages: &[ChatMessage],
    ) -> Result<Box<dyn TokenStream>, GenerationError> {
        self.as_ref().stream_reply(messages).await
    }
}

// Canned token sequence; backs the no-context reply and test doubles.
pub struct StaticTokenStream {
    tokens: VecDeque<String>,
}

impl StaticTokenStream {
    pub fn new(tokens: Vec<String>) -> Self {
        Self {
            tokens: tokens.into(),
        }
    }

    pub fn from_text(text: &str) -> Self {
        let words: Vec<&str> = text.split_whitespace().collect();
        let last = words.len().saturating_sub(1);
        Self::new(
            words
                .iter()
                .enumerate()
                .map(|(index, word)| {
                    if index < last {
                        format!("{word} ")
                    } else {
                        (*word).to_string()
                    }
                })
                .collect(),
        )
    }
}

#[async_trait]
impl TokenStream for StaticTokenStream {
    async fn next_token(&mut self) -> Option<Result<String, GenerationError>> {
        self.tokens.pop_front().map(Ok)
    }
}

// Streaming chat completions over an OpenAI-compatible endpoint.
pub struct HttpChatModel {
    endpoint: Url,
    model: String,
    api_key: Option<String>,
    client: Client,
}

impl HttpChatModel {
    pub fn new(endpoint: &str, model: impl Into<String>) -> Result<Self, GenerationError> {
        Ok(Self {
            endpoint: Url::parse(endpoint)?,
            model: model.into(),
            api_key: None,
            client: Client::new(),
        })
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    // Connect timeout only; a whole-request timeout would cut off long
    // generations mid-stream.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Result<Self, GenerationError> {
        self.client = Client::builder().connect_timeout(timeout).build()?;
        Ok(self)
    }
}

#[async_trait]
impl ChatModel for HttpChatModel {
    async fn stream_reply(
        &self,
        messages: &[ChatMessage],
    ) -> Result<Box<dyn TokenStream>, GenerationError> {
        let mut request = self.client.post(self.endpoint.clone()).json(&json!({
            "model": self.model,
            "messages": messages,
            "stream": true,
        }));

        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key);
        }

        let response = request.send().await?;

        if !response.status().is_success() {
            return Err(GenerationError::Backend {
                status: response.status().to_string(),
            });
        }

        Ok(Box::new(SseTokenStream {
            response: Some(response),
            buffer: Vec::new(),
        }))
    }
}

struct SseTokenStream {
    response: Option<reqwest::Response>,
    buffer: Vec<u8>,
}

enum SseEvent {
    Token(String),
    Done,
    Ignore,
}

impl SseTokenStream {
    fn take_line(&mut self) -> Option<String> {
        let newline = self.buffer.iter().position(|byte| *byte == b'\n')?;
        let line: Vec<u8> = self.buffer.drain(..=newline).collect();
        Some(String::from_utf8_lossy(&line).trim().to_string())
    }
}

#[async_trait]
impl TokenStream for SseTokenStream {
    async fn next_token(&mut self) -> Option<Result<String, GenerationError>> {
        loop {
            while let Some(line) = self.take_line() {
                match parse_sse_line(&line) {
                    SseEvent::Token(token) => return Some(Ok(token)),
                    SseEvent::Done => {
                        self.response = None;
                        return None;
                    }
                    SseEvent::Ignore => {}
                }
            }

            let response = self.response.as_mut()?;
            match response.chunk().await {
                Ok(Some(bytes)) => self.buffer.extend_from_slice(&bytes),
                Ok(None) => {
                    self.response = None;
                    return None;
                }
                Err(error) => {
                    self.response = None;
                    return Some(Err(GenerationError::Http(error)));
                }
            }
        }
    }
}

fn parse_sse_line(line: &str) -> SseEvent {
    let Some(payload) = line.strip_prefix("data:") else {
        return SseEvent::Ignore;
    };
    let payload = payload.trim();

    if payload == "[DONE]" {
        return SseEvent::Done;
    }

    match serde_json::from_str::<Value>(payload) {
        Ok(value) => value
            .pointer("/choices/0/delta/content")
            .and_then(Value::as_str)
            .map(|token| SseEvent::Token(token.to_string()))
            .unwrap_or(SseEvent::Ignore),
        Err(_) => SseEvent::Ignore,
    }
}

pub struct Bot<E: Embedder, M: ChatModel> {
    retriever: Retriever<E>,
    model: M,
    history: ConversationHistory,
    config: BotConfig,
}

impl<E: Embedder, M: ChatModel> Bot<E, M> {
    pub fn new(
        retriever: Retriever<E>,
        model: M,
        history: ConversationHistory,
        config: BotConfig,
    ) -> Self {
        Self {
            retriever,
            model,
            history,
            config,
        }
    }

    pub fn history(&self) -> &ConversationHistory {
        &self.history
    }

    pub fn retriever(&self) -> &Retriever<E> {
        &self.retriever
    }

    /// One retrieve-then-generate call. The user turn and the assembled reply
    /// are committed to history only when the stream completes; dropping the
    /// stream early commits nothing unless `append_partial` is set. A failed
    /// generation is not retried here, so tokens already shown to the caller
    /// cannot be duplicated.
    pub async fn get_response(
        &mut self,
        query: &str,
    ) -> Result<ResponseStream<'_>, GenerationError> {
        let hits = self.retriever.retrieve(query, self.config.top_k).await?;
        let relevant: Vec<RetrievalResult> = hits
            .into_iter()
            .filter(|hit| hit.similarity >= self.config.min_similarity)
            .collect();

        let inner: Box<dyn TokenStream> = if relevant.is_empty() {
            Box::new(StaticTokenStream::from_text(NO_CONTEXT_REPLY))
        } else {
            let messages = compose_messages(
                &self.config,
                &relevant,
                self.history.recent(self.config.history_window),
                query,
            );
            self.model.stream_reply(&messages).await?
        };

        Ok(ResponseStream {
            inner,
            history: &mut self.history,
            query: query.to_string(),
            assembled: String::new(),
            append_partial: self.config.append_partial,
            state: StreamState::Streaming,
        })
    }
}

enum StreamState {
    Streaming,
    Finished,
    Failed,
}

// Per-call token stream. Single-pass; cancellation is dropping it.
pub struct ResponseStream<'a> {
    inner: Box<dyn TokenStream>,
    history: &'a mut ConversationHistory,
    query: String,
    assembled: String,
    append_partial: bool,
    state: StreamState,
}

impl ResponseStream<'_> {
    pub async fn next_token(&mut self) -> Option<Result<String, GenerationError>> {
        if !matches!(self.state, StreamState::Streaming) {
            return None;
        }

        match self.inner.next_token().await {
            Some(Ok(token)) => {
                self.assembled.push_str(&token);
                Some(Ok(token))
            }
            Some(Err(error)) => {
                self.state = StreamState::Failed;
                Some(Err(error))
            }
            None => {
                self.state = StreamState::Finished;
                let reply = self.assembled.trim().to_string();
                self.commit(reply);
                None
            }
        }
    }

    pub async fn collect(mut self) -> Result<String, GenerationError> {
        while let Some(token) = self.next_token().await {
            token?;
        }
        Ok(self.assembled.trim().to_string())
    }

    pub fn assembled(&self) -> &str {
        &self.assembled
    }

    fn commit(&mut self, reply: String) {
        if let Err(error) = self.history.append(Turn::user(self.query.clone())) {
            warn!(%error, "failed to persist user turn");
        }
        if let Err(error) = self.history.append(Turn::assistant(reply)) {
            warn!(%error, "failed to persist assistant turn");
        }
    }
}

impl Drop for ResponseStream<'_> {
    fn drop(&mut self) {
        if matches!(self.state, StreamState::Finished) {
            return;
        }
        if self.append_partial && !self.assembled.trim().is_empty() {
            let partial = self.assembled.trim().to_string();
            self.commit(partial);
        }
    }
}

fn compose_messages(
    config: &BotConfig,
    hits: &[RetrievalResult],
    history: &[Turn],
    query: &str,
) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(history.len() + 2);
    messages.push(ChatMessage {
        role: Role::System,
        content: system_prompt(config, hits),
    });

    for turn in history {
        messages.push(ChatMessage {
            role: turn.role,
            content: turn.content.clone(),
        });
    }

    messages.push(ChatMessage {
        role: Role::User,
        content: query.to_string(),
    });

    messages
}

fn system_prompt(config: &BotConfig, hits: &[RetrievalResult]) -> String {
    let mut prompt = format!(
        "You are {}, {}.\n\
         Answer ONLY from the sources between [CONTEXT START] and [CONTEXT END].\n\
         Write a single well-developed paragraph in proper scientific language and \
         cite sources in [source] form. If the sources do not cover the question, \
         say that the available sources cannot answer it.\n\n[CONTEXT START]\n",
        config.name, config.persona
    );

    for hit in hits {
        prompt.push_str(&format!(
            "[{}] ({}, similarity {:.2}) {}\n",
            source_name(&hit.record.source_document),
            hit.record.metadata.finding_type,
            hit.similarity,
            clean_text(&hit.record.text),
        ));
    }

    prompt.push_str("[CONTEXT END]\n");
    prompt
}

fn source_name(source_document: &str) -> String {
    Path::new(source_document)
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or(source_document)
        .to_string()
}

// Strip figure/table references and stray page numbers that survive PDF
// extraction, then collapse whitespace.
fn clean_text(text: &str) -> String {
    let mut cleaned = text.to_string();

    for pattern in [
        r"(?i)\b(?:fig\.|figure|table)\s*\d+\S*",
        r"(?m)^\s*\d+\s*$",
    ] {
        if let Ok(re) = Regex::new(pattern) {
            cleaned = re.replace_all(&cleaned, "").into_owned();
        }
    }

    cleaned.split_whitespace().collect::<Vec<_>>().join(" ")
}
