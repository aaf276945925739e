use async_trait::async_trait;
use log::{debug, error};
use serde::Serialize;
use std::fmt;

use crate::constants::{DEFAULT_MAX_MEMORY, SYSTEM_CONTEXT};
use crate::error::ServiceError;

pub const NO_CANDIDATES_REPLY: &str = "Hmm, I'm having trouble responding right now.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Role::System => "System",
            Role::User => "User",
            Role::Assistant => "Assistant",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConversationTurn {
    pub role: Role,
    pub content: String,
}

/// External text generation service
#[async_trait]
pub trait TextGenerator: Send + Sync {
    /// Generate a reply to the flattened transcript; `None` when the
    /// service produced no candidate
    async fn generate(&self, prompt: &str) -> Result<Option<String>, ServiceError>;
}

/// Bounded transcript shared by every chat request
#[derive(Debug, Clone)]
pub struct Conversation {
    turns: Vec<ConversationTurn>,
    cap: usize,
    pin_system_turn: bool,
}

impl Default for Conversation {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_MEMORY, false)
    }
}

impl Conversation {
    /// New transcript seeded with the system turn
    ///
    /// `cap` counts every turn, the system turn included.
    pub fn new(cap: usize, pin_system_turn: bool) -> Self {
        Self {
            turns: vec![ConversationTurn {
                role: Role::System,
                content: SYSTEM_CONTEXT.to_string(),
            }],
            cap: cap.max(1),
            pin_system_turn,
        }
    }

    pub fn turns(&self) -> &[ConversationTurn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// Flatten the transcript into `Role: content` lines
    pub fn prompt_text(&self) -> String {
        self.turns
            .iter()
            .map(|t| format!("{}: {}\n", t.role, t.content))
            .collect()
    }

    fn push(&mut self, role: Role, content: String) {
        self.turns.push(ConversationTurn { role, content });
    }

    /// Drop the oldest turns until the cap holds
    fn trim(&mut self) {
        let keep_first = self.pin_system_turn
            && self.turns.first().map(|t| t.role) == Some(Role::System);
        let oldest = usize::from(keep_first);
        while self.turns.len() > self.cap && self.turns.len() > oldest {
            self.turns.remove(oldest);
        }
    }

    /// Run one chat turn and return the assistant reply
    ///
    /// Generation failures become the reply text instead of an error.
    pub async fn ask(&mut self, generator: &dyn TextGenerator, prompt: &str) -> String {
        self.push(Role::User, prompt.to_string());
        let text = self.prompt_text();
        debug!("Sending {} turns ({} chars) to generator", self.len(), text.len());

        let reply = match generator.generate(&text).await {
            Ok(Some(reply)) => reply.trim().to_string(),
            Ok(None) => NO_CANDIDATES_REPLY.to_string(),
            Err(e) => {
                error!("Text generation failed: {}", e);
                format!("Error generating response: {}", e)
            }
        };

        self.push(Role::Assistant, reply.clone());
        self.trim();
        reply
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Scripted {
        answer: Result<Option<String>, ()>,
        prompts: Mutex<Vec<String>>,
    }

    impl Scripted {
        fn new(answer: Result<Option<String>, ()>) -> Self {
            Self {
                answer,
                prompts: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl TextGenerator for Scripted {
        async fn generate(&self, prompt: &str) -> Result<Option<String>, ServiceError> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            self.answer.clone().map_err(|_| ServiceError::Api {
                service: "gemini",
                status: 503,
                code: Some("UNAVAILABLE".to_string()),
                message: "overloaded".to_string(),
            })
        }
    }

    #[test]
    fn test_prompt_text_formatting() {
        let mut conv = Conversation::new(20, false);
        conv.push(Role::User, "hi".to_string());
        conv.push(Role::Assistant, "hello".to_string());
        let text = conv.prompt_text();
        assert!(text.starts_with("System: You are Gemini"));
        assert!(text.ends_with("User: hi\nAssistant: hello\n"));
    }

    #[tokio::test]
    async fn test_reply_is_trimmed_and_recorded() {
        let generator = Scripted::new(Ok(Some("  sure thing \n".to_string())));
        let mut conv = Conversation::default();
        let reply = conv.ask(&generator, "help?").await;
        assert_eq!(reply, "sure thing");
        assert_eq!(conv.len(), 3);
        assert_eq!(conv.turns()[1].role, Role::User);
        assert_eq!(conv.turns()[2].content, "sure thing");

        let prompts = generator.prompts.lock().unwrap();
        assert!(prompts[0].ends_with("User: help?\n"));
    }

    #[tokio::test]
    async fn test_failure_becomes_reply() {
        let generator = Scripted::new(Err(()));
        let mut conv = Conversation::default();
        let reply = conv.ask(&generator, "hello").await;
        assert!(reply.starts_with("Error generating response: "));
        assert!(reply.contains("overloaded"));
        assert_eq!(conv.turns().last().unwrap().role, Role::Assistant);
    }

    #[tokio::test]
    async fn test_no_candidates_reply() {
        let generator = Scripted::new(Ok(None));
        let mut conv = Conversation::default();
        assert_eq!(conv.ask(&generator, "hello").await, NO_CANDIDATES_REPLY);
    }

    #[tokio::test]
    async fn test_cap_evicts_system_turn() {
        let generator = Scripted::new(Ok(Some("ok".to_string())));
        let mut conv = Conversation::new(4, false);
        conv.ask(&generator, "one").await;
        assert_eq!(conv.len(), 3);
        assert_eq!(conv.turns()[0].role, Role::System);

        for i in 0..10 {
            conv.ask(&generator, &format!("turn {}", i)).await;
            assert!(conv.len() <= 4);
        }
        assert_eq!(conv.len(), 4);
        assert!(conv.turns().iter().all(|t| t.role != Role::System));
        assert_eq!(conv.turns()[2].content, "turn 9");
    }

    #[tokio::test]
    async fn test_pinned_system_turn_survives() {
        let generator = Scripted::new(Ok(Some("ok".to_string())));
        let mut conv = Conversation::new(4, true);
        for i in 0..10 {
            conv.ask(&generator, &format!("turn {}", i)).await;
        }
        assert_eq!(conv.len(), 4);
        assert_eq!(conv.turns()[0].role, Role::System);
        assert_eq!(conv.turns()[1].role, Role::Assistant);
        assert_eq!(conv.turns()[2].content, "turn 9");
    }
}
