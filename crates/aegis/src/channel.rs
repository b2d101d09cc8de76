// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Channel interface — the transport boundary between the core and a
//! specific chat operator integration.
//!
//! The core knows nothing about any concrete transport; it only calls
//! through this trait. A channel authenticates incoming messages against an
//! allow-list and enforces a length cap on free-text replies, then hands
//! raw replies to the core through a bounded queue. It MUST NOT call the
//! decision guard itself — only the core may do that, so the guard stays
//! the single point of anti-replay enforcement.

use std::future::Future;
use std::pin::Pin;

use tokio::sync::mpsc;

use crate::detector::{DetectionResult, PromptKind};

/// Opaque reference to a message the channel sent, for later editing
/// ("recorded") or cross-referencing in the store.
pub type ChannelMsgRef = i64;

/// A prompt as presented to the operator-facing transport.
#[derive(Debug, Clone)]
pub struct ChannelPrompt {
    pub prompt_id: String,
    pub session_id: String,
    pub kind: PromptKind,
    pub excerpt: String,
    pub choices: Vec<String>,
}

impl ChannelPrompt {
    pub fn from_detection(prompt_id: String, session_id: String, detection: &DetectionResult) -> Self {
        Self {
            prompt_id,
            session_id,
            kind: detection.kind,
            excerpt: detection.excerpt.clone(),
            choices: detection.choices.clone(),
        }
    }
}

/// A reply delivered by the channel, not yet validated against the
/// decision guard.
#[derive(Debug, Clone)]
pub struct ChannelReply {
    pub prompt_id: String,
    pub normalized_value: String,
    pub decider_identity: String,
    pub submitted_nonce: String,
}

/// Why a reply was rejected before it ever reached the decision guard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyRejection {
    UnauthorizedSender,
    TooLong,
}

/// Transport-polymorphic channel to an operator. Object-safe so the core
/// can hold `Box<dyn Channel>` without knowing the concrete transport.
pub trait Channel: Send + 'static {
    /// Send a newly-detected prompt, returning an opaque message reference.
    fn send_prompt(
        &self,
        prompt: ChannelPrompt,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<ChannelMsgRef>> + Send + '_>>;

    /// Send a free-form informational message (session start/end, etc).
    fn send_message(
        &self,
        text: String,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>>;

    /// Notify the operator that a prompt timed out and was auto-answered.
    fn send_timeout_notice(
        &self,
        prompt_id: String,
        injected_value: String,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>>;

    fn close(&self) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>>;
}

/// Allow-list and length-cap enforcement applied to every inbound message
/// before it becomes a [`ChannelReply`] the core will act on.
pub struct InboundGuard {
    allowed_identities: Vec<String>,
    free_text_max_chars: usize,
}

impl InboundGuard {
    pub fn new(allowed_identities: Vec<String>, free_text_max_chars: usize) -> Self {
        Self { allowed_identities, free_text_max_chars }
    }

    /// Validate and normalize an inbound message, truncating free-text
    /// replies to the configured cap. Returns the rejection reason, if any.
    pub fn admit(
        &self,
        decider_identity: &str,
        raw_value: &str,
    ) -> Result<String, ReplyRejection> {
        if !self.allowed_identities.iter().any(|id| id == decider_identity) {
            return Err(ReplyRejection::UnauthorizedSender);
        }

        let truncated: String = raw_value.chars().take(self.free_text_max_chars).collect();
        Ok(truncated)
    }
}

/// Queue depth for the bounded reply channel between channel ingestion and
/// the core's response consumer.
pub const REPLY_QUEUE_CAPACITY: usize = 64;

pub fn reply_queue() -> (mpsc::Sender<ChannelReply>, mpsc::Receiver<ChannelReply>) {
    mpsc::channel(REPLY_QUEUE_CAPACITY)
}

/// Transport-less channel: logs what would have been sent and never
/// produces a reply. The real operator-facing transport (long-poll client,
/// message formatting, inline keyboards) is an external collaborator this
/// crate only specifies an interface for; this is the stand-in used when
/// none is wired up, so every routed prompt simply rides out its TTL and
/// resolves to its safe default.
pub struct NullChannel;

impl Channel for NullChannel {
    fn send_prompt(
        &self,
        prompt: ChannelPrompt,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<ChannelMsgRef>> + Send + '_>> {
        Box::pin(async move {
            tracing::warn!(
                prompt_id = %prompt.prompt_id,
                excerpt = %prompt.excerpt,
                "no decision channel configured; prompt will ride out its TTL"
            );
            Ok(0)
        })
    }

    fn send_message(&self, text: String) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        Box::pin(async move {
            tracing::info!(%text, "channel message (no transport configured)");
            Ok(())
        })
    }

    fn send_timeout_notice(
        &self,
        prompt_id: String,
        injected_value: String,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        Box::pin(async move {
            tracing::info!(%prompt_id, %injected_value, "prompt timed out (no transport configured)");
            Ok(())
        })
    }

    fn close(&self) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        Box::pin(async { Ok(()) })
    }
}

/// In-memory channel used by tests and by `aegis doctor` style dry runs:
/// records everything sent and lets the test push replies directly.
#[cfg(any(test, feature = "test-support"))]
pub mod memory {
    use std::sync::Mutex;

    use super::*;

    pub struct MemoryChannel {
        pub sent_prompts: Mutex<Vec<ChannelPrompt>>,
        pub sent_messages: Mutex<Vec<String>>,
        pub timeout_notices: Mutex<Vec<(String, String)>>,
        next_ref: Mutex<i64>,
    }

    impl Default for MemoryChannel {
        fn default() -> Self {
            Self {
                sent_prompts: Mutex::new(Vec::new()),
                sent_messages: Mutex::new(Vec::new()),
                timeout_notices: Mutex::new(Vec::new()),
                next_ref: Mutex::new(1),
            }
        }
    }

    impl Channel for MemoryChannel {
        fn send_prompt(
            &self,
            prompt: ChannelPrompt,
        ) -> Pin<Box<dyn Future<Output = anyhow::Result<ChannelMsgRef>> + Send + '_>> {
            Box::pin(async move {
                self.sent_prompts.lock().expect("mutex poisoned").push(prompt);
                let mut next = self.next_ref.lock().expect("mutex poisoned");
                let msg_ref = *next;
                *next += 1;
                Ok(msg_ref)
            })
        }

        fn send_message(
            &self,
            text: String,
        ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
            Box::pin(async move {
                self.sent_messages.lock().expect("mutex poisoned").push(text);
                Ok(())
            })
        }

        fn send_timeout_notice(
            &self,
            prompt_id: String,
            injected_value: String,
        ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
            Box::pin(async move {
                self.timeout_notices
                    .lock()
                    .expect("mutex poisoned")
                    .push((prompt_id, injected_value));
                Ok(())
            })
        }

        fn close(&self) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
            Box::pin(async move { Ok(()) })
        }
    }
}

#[cfg(test)]
#[path = "channel_tests.rs"]
mod tests;
