//! Trial usage quotas over the store's per-user counters.
//!
//! Message quota is checked before dispatch and charged only after a trial
//! generation completes. Voice quota is pre-charged whenever the shared
//! speech credential is used, so a failed transcription still consumes it.

use std::sync::Arc;

use rcommon::UserId;
use rstore::ChatStateStore;

use crate::error::RelayError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaLimits {
    pub trial_messages: u64,
    pub trial_voice_interactions: u64,
}

impl QuotaLimits {
    pub const DEFAULT_TRIAL_MESSAGES: u64 = 50;
    pub const DEFAULT_TRIAL_VOICE_INTERACTIONS: u64 = 10;

    pub fn with_trial_messages(mut self, limit: u64) -> Self {
        self.trial_messages = limit;
        self
    }

    pub fn with_trial_voice_interactions(mut self, limit: u64) -> Self {
        self.trial_voice_interactions = limit;
        self
    }
}

impl Default for QuotaLimits {
    fn default() -> Self {
        Self {
            trial_messages: Self::DEFAULT_TRIAL_MESSAGES,
            trial_voice_interactions: Self::DEFAULT_TRIAL_VOICE_INTERACTIONS,
        }
    }
}

#[derive(Clone)]
pub struct QuotaEnforcer {
    store: Arc<dyn ChatStateStore>,
    limits: QuotaLimits,
}

impl QuotaEnforcer {
    pub fn new(store: Arc<dyn ChatStateStore>, limits: QuotaLimits) -> Self {
        Self { store, limits }
    }

    pub fn limits(&self) -> QuotaLimits {
        self.limits
    }

    /// True when the user may still send a trial message.
    pub async fn check_message_quota(&self, user_id: &UserId) -> Result<bool, RelayError> {
        let count = self.store.message_count(user_id).await?;
        Ok(count < self.limits.trial_messages)
    }

    /// Charged only after a trial generation completed successfully.
    pub async fn charge_message(&self, user_id: &UserId) -> Result<u64, RelayError> {
        Ok(self.store.increment_message_count(user_id).await?)
    }

    /// Pre-charges the voice quota. Returns `false` (without charging) when
    /// the quota is exhausted. Callers on their own speech credential are
    /// never charged or limited here.
    pub async fn precharge_voice(
        &self,
        user_id: &UserId,
        using_shared_credential: bool,
    ) -> Result<bool, RelayError> {
        if !using_shared_credential {
            return Ok(true);
        }

        let count = self.store.voice_count(user_id).await?;
        if count >= self.limits.trial_voice_interactions {
            return Ok(false);
        }

        self.store.increment_voice_count(user_id).await?;
        Ok(true)
    }
}
