//! Paginated history and conversation directory calls against the portal
//! REST API.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{ACCEPT, COOKIE};
use serde::de::DeserializeOwned;
use url::Url;

use crate::conversation::{ConversationMeta, LoadTicket};
use crate::error::FetchError;
use crate::message::{ConversationId, Message, MessageId};
use crate::protocol::ConversationRef;

/// Source of older messages. An empty page means there is nothing older.
#[async_trait]
pub trait HistoryFetcher: Send + Sync {
    async fn fetch_history(
        &self,
        conversation: ConversationId,
        before: Option<MessageId>,
    ) -> Result<Vec<Message>, FetchError>;
}

/// The rest of the chat REST surface used by the client.
#[async_trait]
pub trait ChatApi: HistoryFetcher {
    /// Conversations the user takes part in, most recently active first.
    async fn presence(&self) -> Result<Vec<ConversationMeta>, FetchError>;

    /// Join (or create, for a direct message) and describe a conversation.
    async fn join(&self, reference: &ConversationRef) -> Result<ConversationMeta, FetchError>;
}

/// Run the fetch a ticket asks for, bounded by `limit`.
pub async fn fetch_with_timeout<F>(
    fetcher: &F,
    ticket: &LoadTicket,
    limit: Duration,
) -> Result<Vec<Message>, FetchError>
where
    F: HistoryFetcher + ?Sized,
{
    match tokio::time::timeout(limit, fetcher.fetch_history(ticket.conversation, ticket.before))
        .await
    {
        Ok(result) => result,
        Err(_) => Err(FetchError::Timeout(limit)),
    }
}

/// `reqwest` client for the portal's `/api/chat/...` endpoints.
#[derive(Clone, Debug)]
pub struct HttpChatApi {
    client: reqwest::Client,
    base: Url,
    cookie: Option<String>,
}

impl HttpChatApi {
    /// `base` must end with a slash; `cookie` is forwarded verbatim.
    pub fn new(base: Url, cookie: Option<String>) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder().build()?;
        Ok(Self {
            client,
            base,
            cookie,
        })
    }

    pub fn history_url(
        &self,
        conversation: ConversationId,
        before: Option<MessageId>,
    ) -> Result<Url, FetchError> {
        let mut url = self.endpoint(&format!("api/chat/{}/history", conversation))?;
        if let Some(before) = before {
            url.query_pairs_mut().append_pair("to", &before.to_string());
        }
        Ok(url)
    }

    fn endpoint(&self, path: &str) -> Result<Url, FetchError> {
        self.base
            .join(path)
            .map_err(|e| FetchError::Http(format!("bad endpoint {}: {}", path, e)))
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<T, FetchError> {
        let mut request = self.client.get(url).header(ACCEPT, "application/json");
        if let Some(cookie) = &self.cookie {
            request = request.header(COOKIE, cookie);
        }
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }
        let body = response.bytes().await?;
        serde_json::from_slice(&body).map_err(|e| FetchError::Decode(e.to_string()))
    }
}

#[async_trait]
impl HistoryFetcher for HttpChatApi {
    async fn fetch_history(
        &self,
        conversation: ConversationId,
        before: Option<MessageId>,
    ) -> Result<Vec<Message>, FetchError> {
        let url = self.history_url(conversation, before)?;
        tracing::debug!(%conversation, ?before, "fetching history page");
        let mut page: Vec<Message> = self.get_json(url).await?;
        for message in &mut page {
            message.conversation = conversation;
        }
        Ok(page)
    }
}

#[async_trait]
impl ChatApi for HttpChatApi {
    async fn presence(&self) -> Result<Vec<ConversationMeta>, FetchError> {
        let url = self.endpoint("api/chat/presence")?;
        self.get_json(url).await
    }

    async fn join(&self, reference: &ConversationRef) -> Result<ConversationMeta, FetchError> {
        let url = self.endpoint(&format!("api/chat/{}/join", reference))?;
        self.get_json(url).await
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted fetcher shared by the session and backend tests.

    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use super::*;
    use crate::conversation::ConversationKind;

    #[derive(Default)]
    pub struct ScriptedApi {
        pages: Mutex<VecDeque<Result<Vec<Message>, FetchError>>>,
        directory: Mutex<Vec<ConversationMeta>>,
        calls: AtomicUsize,
        requests: Mutex<Vec<(ConversationId, Option<MessageId>)>>,
        delay: Option<Duration>,
    }

    impl ScriptedApi {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_delay(delay: Duration) -> Self {
            Self {
                delay: Some(delay),
                ..Self::default()
            }
        }

        pub fn push_page(&self, page: Result<Vec<Message>, FetchError>) {
            self.pages.lock().unwrap().push_back(page);
        }

        pub fn push_conversation(&self, meta: ConversationMeta) {
            self.directory.lock().unwrap().push(meta);
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        pub fn requests(&self) -> Vec<(ConversationId, Option<MessageId>)> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl HistoryFetcher for ScriptedApi {
        async fn fetch_history(
            &self,
            conversation: ConversationId,
            before: Option<MessageId>,
        ) -> Result<Vec<Message>, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.requests.lock().unwrap().push((conversation, before));
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let next = self.pages.lock().unwrap().pop_front();
            next.unwrap_or_else(|| Ok(Vec::new()))
        }
    }

    #[async_trait]
    impl ChatApi for ScriptedApi {
        async fn presence(&self) -> Result<Vec<ConversationMeta>, FetchError> {
            Ok(self.directory.lock().unwrap().clone())
        }

        async fn join(&self, reference: &ConversationRef) -> Result<ConversationMeta, FetchError> {
            let directory = self.directory.lock().unwrap();
            match reference {
                ConversationRef::Conversation(id) => directory
                    .iter()
                    .find(|m| m.id == *id)
                    .cloned()
                    .ok_or(FetchError::Status(404)),
                ConversationRef::User(user) => directory
                    .iter()
                    .find(|m| m.kind == ConversationKind::Dm && m.users.iter().any(|p| p.id == *user))
                    .cloned()
                    .ok_or(FetchError::Status(404)),
            }
        }
    }
}
