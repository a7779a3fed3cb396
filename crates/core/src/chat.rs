use serde::{Deserialize, Serialize};

pub const ASR_SYSTEM_PROMPT: &str = "Perform ASR.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChatContent {
    Text(String),
    /// Encoded audio file bytes; decoding and resampling happen in the backend.
    Audio(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatTurn {
    pub role: Role,
    pub content: Vec<ChatContent>,
}

/// Structured turn sequence handed to a multimodal chat backend.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatState {
    turns: Vec<ChatTurn>,
    open: Option<ChatTurn>,
}

impl ChatState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a new turn, closing any turn left open.
    pub fn new_turn(&mut self, role: Role) -> &mut Self {
        self.end_turn();
        self.open = Some(ChatTurn {
            role,
            content: Vec::new(),
        });
        self
    }

    pub fn add_text(&mut self, text: impl Into<String>) -> &mut Self {
        self.push(ChatContent::Text(text.into()))
    }

    pub fn add_audio(&mut self, bytes: Vec<u8>) -> &mut Self {
        self.push(ChatContent::Audio(bytes))
    }

    pub fn end_turn(&mut self) -> &mut Self {
        if let Some(turn) = self.open.take() {
            self.turns.push(turn);
        }
        self
    }

    pub fn turns(&self) -> &[ChatTurn] {
        &self.turns
    }

    /// The turn still being written, normally the assistant turn to generate.
    pub fn open_turn(&self) -> Option<&ChatTurn> {
        self.open.as_ref()
    }

    pub fn has_audio(&self) -> bool {
        self.turns
            .iter()
            .chain(&self.open)
            .flat_map(|turn| &turn.content)
            .any(|part| matches!(part, ChatContent::Audio(_)))
    }

    fn push(&mut self, part: ChatContent) -> &mut Self {
        let turn = self.open.get_or_insert_with(|| ChatTurn {
            role: Role::User,
            content: Vec::new(),
        });
        turn.content.push(part);
        self
    }
}
