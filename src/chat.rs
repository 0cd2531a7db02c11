//! Chat orchestration: retrieval-grounded, streamed answers.
//!
//! [`ChatOrchestrator::answer`] spawns a producer task and hands back the
//! receiving end of a bounded channel as an [`AnswerStream`]. The stream
//! yields zero or more [`ChatFrame::Delta`]s followed by exactly one
//! terminal frame: [`ChatFrame::Sources`] when the model finished, or
//! [`ChatFrame::Error`] when it failed. Deltas are forwarded as soon as the
//! model yields them.
//!
//! Dropping the stream closes the channel. The producer notices through
//! `Sender::closed`, abandons retrieval or the upstream model stream,
//! whichever is in flight, and sends nothing more.

use futures::stream::{Stream, StreamExt};
use serde::Serialize;
use std::collections::HashSet;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::config::Config;
use crate::error::{GenerationError, RetrievalError};
use crate::generation::{conversation_turns, LanguageModel, Passage, Prompt};
use crate::models::{ChatMessage, Document, Query, Role, SourceRef};
use crate::retrieval::Retriever;

const NO_DOCUMENTS: &str = "(No specific documents found - using general knowledge only)";

const ANSWER_GUIDELINES: &str = "When answering:\n\
1. Cite relevant documents using [Document X] references\n\
2. Combine information from multiple sources when relevant\n\
3. Be clear about what comes from the documents vs general knowledge\n\
4. Write in academic UK English with clear paragraph structure";

#[derive(Debug, Clone, PartialEq)]
pub enum ChatFrame {
    Delta(String),
    Sources(Vec<SourceRef>),
    Error(String),
}

impl ChatFrame {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ChatFrame::Delta(_))
    }
}

pub type AnswerStream = Pin<Box<dyn Stream<Item = ChatFrame> + Send>>;

/// A fully collected answer, for non-streaming callers.
#[derive(Debug, Clone, Serialize)]
pub struct ChatAnswer {
    pub content: String,
    pub sources: Vec<SourceRef>,
}

#[derive(Debug, Clone)]
pub struct ChatSettings {
    pub top_n: usize,
    pub context_chars: usize,
    pub channel_capacity: usize,
    pub system_prompt: String,
}

impl ChatSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            top_n: config.chat.top_n,
            context_chars: config.chat.context_chars,
            channel_capacity: config.chat.channel_capacity.max(1),
            system_prompt: config.generation.system_prompt.clone(),
        }
    }
}

/// Documents selected to ground one answer.
#[derive(Debug, Clone, Default)]
pub struct Grounding {
    pub sources: Vec<SourceRef>,
    pub passages: Vec<Passage>,
    /// Rendered block placed in the system message; empty without documents.
    pub context: String,
}

#[derive(Clone)]
pub struct ChatOrchestrator {
    retriever: Arc<Retriever>,
    model: Arc<dyn LanguageModel>,
    settings: Arc<ChatSettings>,
}

impl ChatOrchestrator {
    pub fn new(retriever: Arc<Retriever>, model: Arc<dyn LanguageModel>, settings: ChatSettings) -> Self {
        Self {
            retriever,
            model,
            settings: Arc::new(settings),
        }
    }

    pub fn model_name(&self) -> &str {
        self.model.name()
    }

    /// Start answering the latest user turn of `conversation`.
    pub fn answer(&self, conversation: Vec<ChatMessage>, use_retrieval: bool) -> AnswerStream {
        let (tx, rx) = mpsc::channel(self.settings.channel_capacity);
        let this = self.clone();
        tokio::spawn(async move {
            this.produce(conversation, use_retrieval, tx).await;
        });
        Box::pin(ReceiverStream::new(rx))
    }

    /// Drive [`answer`](Self::answer) to completion.
    pub async fn collect(
        &self,
        conversation: Vec<ChatMessage>,
        use_retrieval: bool,
    ) -> Result<ChatAnswer, GenerationError> {
        let mut stream = self.answer(conversation, use_retrieval);
        let mut content = String::new();
        while let Some(frame) = stream.next().await {
            match frame {
                ChatFrame::Delta(delta) => content.push_str(&delta),
                ChatFrame::Sources(sources) => return Ok(ChatAnswer { content, sources }),
                ChatFrame::Error(message) => return Err(GenerationError::Stream(message)),
            }
        }
        Err(GenerationError::Stream("answer ended without completing".to_string()))
    }

    /// Retrieve and render grounding for `question`.
    pub async fn grounding(&self, question: &str) -> Result<Grounding, RetrievalError> {
        let retrieval = self
            .retriever
            .retrieve(&Query::new(question).with_k(self.settings.top_n))
            .await?;
        let mut documents = self.retriever.fetch_documents(&retrieval.results).await?;

        let mut grounding = Grounding::default();
        let mut seen = HashSet::new();
        let mut blocks = Vec::new();
        for result in retrieval.results.iter().take(self.settings.top_n) {
            if !seen.insert(result.document_id) {
                continue;
            }
            let Some(doc) = documents.remove(&result.document_id) else {
                continue;
            };
            let excerpt: String = doc.content.chars().take(self.settings.context_chars).collect();
            blocks.push(render_block(blocks.len() + 1, &doc, &excerpt));
            grounding.passages.push(Passage {
                title: doc.title.clone(),
                author: doc.author.clone(),
                year: doc.year,
                excerpt,
            });
            grounding.sources.push(SourceRef::from(result));
        }

        if !blocks.is_empty() {
            grounding.context = format!(
                "Relevant documents from the knowledge base:\n\n{}",
                blocks.join("\n\n")
            );
        }
        Ok(grounding)
    }

    async fn produce(&self, conversation: Vec<ChatMessage>, use_retrieval: bool, tx: mpsc::Sender<ChatFrame>) {
        let question = latest_user_turn(&conversation).unwrap_or_default();

        let grounding = if use_retrieval && !question.trim().is_empty() {
            let retrieved = tokio::select! {
                _ = tx.closed() => return,
                retrieved = self.grounding(&question) => retrieved,
            };
            match retrieved {
                Ok(grounding) => grounding,
                Err(e) => {
                    tracing::warn!(error = %e, "retrieval failed; answering without documents");
                    Grounding::default()
                }
            }
        } else {
            Grounding::default()
        };

        let mut messages = vec![ChatMessage::system(system_message(
            &self.settings.system_prompt,
            &grounding.context,
        ))];
        messages.extend(conversation_turns(&conversation).cloned());
        let prompt = Prompt {
            messages,
            passages: grounding.passages,
            question,
        };

        let started = tokio::select! {
            _ = tx.closed() => return,
            started = self.model.stream(prompt) => started,
        };
        let mut tokens = match started {
            Ok(tokens) => tokens,
            Err(e) => {
                tracing::error!(model = self.model.name(), error = %e, "language model failed to start");
                let _ = tx.send(ChatFrame::Error(e.to_string())).await;
                return;
            }
        };

        loop {
            tokio::select! {
                _ = tx.closed() => {
                    tracing::debug!("answer stream dropped by consumer");
                    return;
                }
                next = tokens.next() => match next {
                    Some(Ok(delta)) => {
                        if tx.send(ChatFrame::Delta(delta)).await.is_err() {
                            return;
                        }
                    }
                    Some(Err(e)) => {
                        tracing::error!(model = self.model.name(), error = %e, "language model stream failed");
                        let _ = tx.send(ChatFrame::Error(e.to_string())).await;
                        return;
                    }
                    None => break,
                },
            }
        }

        let _ = tx.send(ChatFrame::Sources(grounding.sources)).await;
    }
}

fn latest_user_turn(conversation: &[ChatMessage]) -> Option<String> {
    conversation
        .iter()
        .rev()
        .find(|m| m.role == Role::User)
        .map(|m| m.content.clone())
}

fn render_block(number: usize, doc: &Document, excerpt: &str) -> String {
    let mut block = format!("[Document {}] {}", number, doc.heading());
    block.push_str(&format!("\nType: {}", doc.doc_type));
    block.push_str(&format!("\nContent: {}", excerpt));
    if !doc.tags.is_empty() {
        block.push_str(&format!("\nTags: {}", doc.tags.join(", ")));
    }
    block
}

/// System prompt, then grounding (or a note that there is none), then guidelines.
pub fn system_message(system_prompt: &str, context: &str) -> String {
    let context = if context.is_empty() { NO_DOCUMENTS } else { context };
    format!("{}\n\n{}\n\n{}", system_prompt, context, ANSWER_GUIDELINES)
}
