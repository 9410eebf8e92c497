//! # Conversation Transcript
//!
//! Types and the reducer for the live conversation transcript. The engine
//! emits text increments; the rendering layer owns the message list and folds
//! each increment in with [`apply`].
//!
//! ## Merge Rules:
//! - **Assistant text** arrives as incremental tokens: while the assistant's
//!   turn is still open (it wrote the last message), each part is appended to
//!   that message. A new turn starts a new message.
//! - **User transcription** arrives as a running best-guess of the whole
//!   utterance: while the user's turn is still open, each update replaces the
//!   last message's text outright. It is never concatenated.

/// Who produced a transcript message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    /// Convert role to string for rendering.
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// One message in the conversation transcript.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptMessage {
    pub role: Role,
    pub text: String,
}

/// A text increment emitted by the session controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TranscriptEvent {
    /// Incremental assistant tokens; appended to an open assistant turn
    AssistantText(String),
    /// Running transcription of the user's speech; replaces an open user turn
    UserTranscription(String),
}

/// Fold one increment into the transcript.
///
/// ## Semantics:
/// - `AssistantText`: append to the last message if it is an assistant
///   message, else push a new assistant message.
/// - `UserTranscription`: replace the last message's text if it is a user
///   message, else push a new user message.
pub fn apply(messages: &mut Vec<TranscriptMessage>, event: TranscriptEvent) {
    match event {
        TranscriptEvent::AssistantText(text) => match messages.last_mut() {
            Some(last) if last.role == Role::Assistant => last.text.push_str(&text),
            _ => messages.push(TranscriptMessage {
                role: Role::Assistant,
                text,
            }),
        },
        TranscriptEvent::UserTranscription(text) => match messages.last_mut() {
            Some(last) if last.role == Role::User => last.text = text,
            _ => messages.push(TranscriptMessage {
                role: Role::User,
                text,
            }),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assistant_parts_merge_into_open_turn() {
        let mut messages = Vec::new();
        apply(&mut messages, TranscriptEvent::AssistantText("Hel".into()));
        apply(&mut messages, TranscriptEvent::AssistantText("lo".into()));

        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, Role::Assistant);
        assert_eq!(messages[0].text, "Hello");
    }

    #[test]
    fn test_user_transcription_replaces() {
        let mut messages = Vec::new();
        apply(&mut messages, TranscriptEvent::UserTranscription("he".into()));
        apply(
            &mut messages,
            TranscriptEvent::UserTranscription("hello".into()),
        );

        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, Role::User);
        assert_eq!(messages[0].text, "hello");
    }

    #[test]
    fn test_role_change_opens_new_message() {
        let mut messages = Vec::new();
        apply(
            &mut messages,
            TranscriptEvent::UserTranscription("hi there".into()),
        );
        apply(&mut messages, TranscriptEvent::AssistantText("Hey".into()));
        apply(&mut messages, TranscriptEvent::AssistantText("!".into()));
        apply(
            &mut messages,
            TranscriptEvent::UserTranscription("how".into()),
        );

        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].text, "hi there");
        assert_eq!(messages[1].text, "Hey!");
        assert_eq!(messages[2].role, Role::User);
        assert_eq!(messages[2].text, "how");
    }

    #[test]
    fn test_first_event_starts_transcript() {
        let mut messages = Vec::new();
        apply(&mut messages, TranscriptEvent::AssistantText("Hi".into()));
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, Role::Assistant);
    }
}
