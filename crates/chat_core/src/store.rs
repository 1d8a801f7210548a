//! Persistence seams of the chat core and their SQLite-backed implementations.

use std::{
    collections::HashMap,
    sync::{Mutex, PoisonError},
};

use anyhow::Result;
use async_trait::async_trait;
use shared::domain::{ChatId, ChatMode, ConferenceId};
use storage::{InsertOutcome, MirroredMessage, Storage, StoredCredential, StoredTextChat};

pub const ANNOUNCEMENTS_CHANNEL_KEY: &str = "ANNOUNCEMENTS_CHANNEL_SID";
pub const CHAT_CALLBACK_URL_KEY: &str = "CHAT_CALLBACK_URL";

#[async_trait]
pub trait ConferenceConfigStore: Send + Sync {
    async fn get_by_key(&self, key: &str, conference_id: &ConferenceId) -> Result<Vec<String>>;
}

/// Locally cached provider credentials, keyed by user session scope.
#[async_trait]
pub trait CredentialCache: Send + Sync {
    async fn load(&self, scope: &str) -> Result<Option<StoredCredential>>;
    async fn store(&self, scope: &str, credential: &StoredCredential) -> Result<()>;
    async fn clear(&self, scope: &str) -> Result<()>;
}

/// Classification records kept next to every provider channel.
#[async_trait]
pub trait ChannelRecordStore: Send + Sync {
    async fn insert_record(&self, record: &StoredTextChat) -> Result<InsertOutcome>;
    async fn record(&self, chat_id: &ChatId) -> Result<Option<StoredTextChat>>;
    async fn record_by_mode(
        &self,
        conference_id: &ConferenceId,
        mode: ChatMode,
    ) -> Result<Option<StoredTextChat>>;
    async fn set_moderation_completed(&self, chat_id: &ChatId, completed: bool) -> Result<bool>;
    async fn set_auto_watch(&self, chat_id: &ChatId, enabled: bool) -> Result<bool>;
    async fn delete_record(&self, chat_id: &ChatId) -> Result<()>;
}

#[async_trait]
pub trait MirrorBackend: Send + Sync {
    async fn health_check(&self) -> Result<()>;
    async fn mirror_channel(
        &self,
        chat_id: &ChatId,
        conference_id: &ConferenceId,
        snapshot: &str,
    ) -> Result<()>;
    async fn mirror_message(&self, message: &MirroredMessage) -> Result<()>;
    async fn remove_channel(&self, chat_id: &ChatId) -> Result<()>;
}

#[async_trait]
impl ConferenceConfigStore for Storage {
    async fn get_by_key(&self, key: &str, conference_id: &ConferenceId) -> Result<Vec<String>> {
        self.config_values_by_key(key, conference_id).await
    }
}

#[async_trait]
impl CredentialCache for Storage {
    async fn load(&self, scope: &str) -> Result<Option<StoredCredential>> {
        self.load_credential(scope).await
    }

    async fn store(&self, scope: &str, credential: &StoredCredential) -> Result<()> {
        self.save_credential(scope, credential).await
    }

    async fn clear(&self, scope: &str) -> Result<()> {
        self.clear_credential(scope).await
    }
}

#[async_trait]
impl ChannelRecordStore for Storage {
    async fn insert_record(&self, record: &StoredTextChat) -> Result<InsertOutcome> {
        self.insert_text_chat(record).await
    }

    async fn record(&self, chat_id: &ChatId) -> Result<Option<StoredTextChat>> {
        self.text_chat(chat_id).await
    }

    async fn record_by_mode(
        &self,
        conference_id: &ConferenceId,
        mode: ChatMode,
    ) -> Result<Option<StoredTextChat>> {
        self.text_chat_by_mode(conference_id, mode).await
    }

    async fn set_moderation_completed(&self, chat_id: &ChatId, completed: bool) -> Result<bool> {
        Storage::set_moderation_completed(self, chat_id, completed).await
    }

    async fn set_auto_watch(&self, chat_id: &ChatId, enabled: bool) -> Result<bool> {
        Storage::set_auto_watch(self, chat_id, enabled).await
    }

    async fn delete_record(&self, chat_id: &ChatId) -> Result<()> {
        self.delete_text_chat(chat_id).await
    }
}

#[async_trait]
impl MirrorBackend for Storage {
    async fn health_check(&self) -> Result<()> {
        Storage::health_check(self).await
    }

    async fn mirror_channel(
        &self,
        chat_id: &ChatId,
        conference_id: &ConferenceId,
        snapshot: &str,
    ) -> Result<()> {
        self.upsert_mirrored_channel(chat_id, conference_id, snapshot)
            .await
    }

    async fn mirror_message(&self, message: &MirroredMessage) -> Result<()> {
        self.insert_mirrored_message(message).await
    }

    async fn remove_channel(&self, chat_id: &ChatId) -> Result<()> {
        self.delete_mirrored_channel(chat_id).await
    }
}

/// Credential cache that lives only as long as the process.
#[derive(Default)]
pub struct MemoryCredentialCache {
    entries: Mutex<HashMap<String, StoredCredential>>,
}

impl MemoryCredentialCache {
    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, StoredCredential>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl CredentialCache for MemoryCredentialCache {
    async fn load(&self, scope: &str) -> Result<Option<StoredCredential>> {
        Ok(self.entries().get(scope).cloned())
    }

    async fn store(&self, scope: &str, credential: &StoredCredential) -> Result<()> {
        self.entries()
            .insert(scope.to_string(), credential.clone());
        Ok(())
    }

    async fn clear(&self, scope: &str) -> Result<()> {
        self.entries().remove(scope);
        Ok(())
    }
}
