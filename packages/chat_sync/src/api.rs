//! REST collaborator: conversation CRUD and the create-message endpoint.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;

use crate::config::ApiConfig;
use crate::error::SyncError;
use crate::protocol::{SendRequest, SendResponse, normalize_status, value_to_id};
use crate::types::{
    Conversation, ConversationId, Message, MessageId, MessageSections, MessageStatus, Role,
    SectionContent,
};

/// A conversation with its persisted history, oldest first.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationDetail {
    pub conversation: Conversation,
    pub messages: Vec<Message>,
}

pub trait ConversationApi: Send + Sync + 'static {
    fn list_conversations(
        &self,
    ) -> impl Future<Output = Result<Vec<Conversation>, SyncError>> + Send;

    fn get_conversation(
        &self,
        id: &ConversationId,
    ) -> impl Future<Output = Result<ConversationDetail, SyncError>> + Send;

    fn delete_conversation(
        &self,
        id: &ConversationId,
    ) -> impl Future<Output = Result<(), SyncError>> + Send;

    fn rename_conversation(
        &self,
        id: &ConversationId,
        title: &str,
    ) -> impl Future<Output = Result<Conversation, SyncError>> + Send;

    /// Submit a user message. The reply streams back over the persistent connection.
    fn create_message(
        &self,
        request: &SendRequest,
    ) -> impl Future<Output = Result<SendResponse, SyncError>> + Send;
}

// =============================================================================
// Wire records
// =============================================================================

const UNTITLED: &str = "Untitled";

#[derive(Debug, Clone, Deserialize)]
pub struct ConversationRecord {
    pub id: Value,
    #[serde(default)]
    pub title: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl ConversationRecord {
    pub fn into_conversation(self) -> Result<Conversation, SyncError> {
        let id = value_to_id(&self.id).ok_or_else(|| {
            SyncError::Api(format!("conversation without a usable id: {}", self.id))
        })?;
        Ok(Conversation {
            id: ConversationId::from(id),
            title: self
                .title
                .filter(|t| !t.trim().is_empty())
                .unwrap_or_else(|| UNTITLED.to_string()),
            created_at: self.created_at,
            updated_at: self.updated_at.unwrap_or(self.created_at),
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum ConversationList {
    Bare(Vec<ConversationRecord>),
    Wrapped { conversations: Vec<ConversationRecord> },
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConversationDetailRecord {
    #[serde(flatten)]
    pub conversation: ConversationRecord,
    #[serde(default)]
    pub messages: Vec<PersistedMessage>,
}

impl ConversationDetailRecord {
    pub fn into_detail(self) -> Result<ConversationDetail, SyncError> {
        let conversation = self.conversation.into_conversation()?;
        let messages = self
            .messages
            .into_iter()
            .filter_map(|m| m.into_message(&conversation.id))
            .collect();
        Ok(ConversationDetail {
            conversation,
            messages,
        })
    }
}

/// A message as stored server-side.
#[derive(Debug, Clone, Deserialize)]
pub struct PersistedMessage {
    pub id: Value,
    pub role: Role,
    #[serde(default)]
    pub content: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub thinking: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
}

impl PersistedMessage {
    /// Convert to a store message. Persisted messages are keyed by their server id.
    pub fn into_message(self, conversation_id: &ConversationId) -> Option<Message> {
        let id = value_to_id(&self.id)?;
        let mut message = Message::new(conversation_id.clone(), self.role, self.created_at)
            .with_id(MessageId::from(id.as_str()));
        message.content = self.content;
        message.status = self
            .status
            .as_deref()
            .and_then(normalize_status)
            .unwrap_or(MessageStatus::COMPLETE);
        message.metadata.server_id = Some(id);
        message.metadata.model = self.model;
        if let Some(thinking) = self.thinking.filter(|t| !t.is_empty()) {
            message.sections = Some(MessageSections {
                thinking: Some(SectionContent {
                    content: thinking,
                    visible: true,
                }),
                ..Default::default()
            });
        }
        Some(message)
    }
}

#[derive(Debug, Serialize)]
struct RenameBody<'a> {
    title: &'a str,
}

// =============================================================================
// HTTP implementation
// =============================================================================

#[derive(Debug, Clone)]
pub struct HttpConversationApi {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

impl HttpConversationApi {
    pub fn new(config: &ApiConfig, token: impl Into<String>) -> Result<Self, SyncError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(SyncError::from_reqwest)?;
        Ok(Self {
            client,
            base_url: config.base_url.clone(),
            token: token.into(),
        })
    }

    fn conversation_url(&self, id: &ConversationId) -> String {
        format!("{}/conversations/{}", self.base_url, id)
    }
}

impl ConversationApi for HttpConversationApi {
    async fn list_conversations(&self) -> Result<Vec<Conversation>, SyncError> {
        let resp = self
            .client
            .get(format!("{}/conversations", self.base_url))
            .bearer_auth(&self.token)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(SyncError::from_reqwest)?;
        let records = match resp
            .json::<ConversationList>()
            .await
            .map_err(SyncError::from_reqwest)?
        {
            ConversationList::Bare(records) => records,
            ConversationList::Wrapped { conversations } => conversations,
        };
        records
            .into_iter()
            .map(ConversationRecord::into_conversation)
            .collect()
    }

    async fn get_conversation(&self, id: &ConversationId) -> Result<ConversationDetail, SyncError> {
        let resp = self
            .client
            .get(self.conversation_url(id))
            .bearer_auth(&self.token)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(SyncError::from_reqwest)?;
        resp.json::<ConversationDetailRecord>()
            .await
            .map_err(SyncError::from_reqwest)?
            .into_detail()
    }

    async fn delete_conversation(&self, id: &ConversationId) -> Result<(), SyncError> {
        self.client
            .delete(self.conversation_url(id))
            .bearer_auth(&self.token)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(SyncError::from_reqwest)?;
        Ok(())
    }

    async fn rename_conversation(
        &self,
        id: &ConversationId,
        title: &str,
    ) -> Result<Conversation, SyncError> {
        let resp = self
            .client
            .patch(self.conversation_url(id))
            .bearer_auth(&self.token)
            .json(&RenameBody { title })
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(SyncError::from_reqwest)?;
        resp.json::<ConversationRecord>()
            .await
            .map_err(SyncError::from_reqwest)?
            .into_conversation()
    }

    async fn create_message(&self, request: &SendRequest) -> Result<SendResponse, SyncError> {
        let resp = self
            .client
            .post(format!("{}/messages", self.base_url))
            .bearer_auth(&self.token)
            .json(request)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| SyncError::Send(e.to_string()))?;
        resp.json::<SendResponse>()
            .await
            .map_err(|e| SyncError::Send(e.to_string()))
    }
}
