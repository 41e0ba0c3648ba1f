use huddle_types::models::{ReplyPreview, RosterMember};

use crate::attachment::{AttachmentCandidate, AttachmentPolicy, ValidatedAttachment};
use crate::config::ChatConfig;
use crate::error::ValidationError;
use crate::mention::{KeyOutcome, MentionKey, MentionPopup, MentionResolver};
use crate::message::{Draft, Message, excerpt};

const REPLY_EXCERPT_CHARS: usize = 120;

/// Draft state of one channel's input box.
#[derive(Debug, Clone)]
pub struct Composer {
    text: String,
    caret: usize,
    reply_to: Option<ReplyPreview>,
    attachment: Option<ValidatedAttachment>,
    policy: AttachmentPolicy,
    mentions: MentionResolver,
}

impl Composer {
    pub fn new(config: &ChatConfig) -> Self {
        Self {
            text: String::new(),
            caret: 0,
            reply_to: None,
            attachment: None,
            policy: AttachmentPolicy::new(config.max_attachment_bytes),
            mentions: MentionResolver::new(config.max_mention_candidates),
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn caret(&self) -> usize {
        self.caret
    }

    pub fn reply_to(&self) -> Option<&ReplyPreview> {
        self.reply_to.as_ref()
    }

    pub fn attachment(&self) -> Option<&ValidatedAttachment> {
        self.attachment.as_ref()
    }

    pub fn mention_popup(&self) -> Option<&MentionPopup> {
        self.mentions.popup()
    }

    /// `None` disables mentions for this composer.
    pub fn set_roster(&mut self, roster: Option<Vec<RosterMember>>) {
        self.mentions.set_roster(roster);
        self.mentions.update(&self.text, self.caret);
    }

    /// Take the new text and caret from the input box. Returns true when the
    /// text itself changed, i.e. the user is typing.
    pub fn input(&mut self, text: impl Into<String>, caret: usize) -> bool {
        let text = text.into();
        let changed = text != self.text;
        self.caret = caret.min(text.len());
        self.text = text;
        self.mentions.update(&self.text, self.caret);
        changed
    }

    /// Route a navigation key to the mention dropdown. A committed mention
    /// rewrites the draft.
    pub fn handle_key(&mut self, key: MentionKey) -> KeyOutcome {
        let outcome = self.mentions.handle_key(key, &self.text, self.caret);
        if let KeyOutcome::Committed(commit) = &outcome {
            self.text = commit.text.clone();
            self.caret = commit.caret;
        }
        outcome
    }

    /// Validate and stage a file. A rejected file leaves the current
    /// attachment untouched.
    pub fn attach(&mut self, candidate: AttachmentCandidate) -> Result<&ValidatedAttachment, ValidationError> {
        let validated = self.policy.validate(candidate)?;
        Ok(self.attachment.insert(validated))
    }

    pub fn remove_attachment(&mut self) -> Option<ValidatedAttachment> {
        self.attachment.take()
    }

    pub fn reply_to_message(&mut self, message: &Message) {
        let Some(id) = message.id.saved() else {
            return;
        };
        self.reply_to = Some(ReplyPreview {
            id,
            author_name: message.author_name.clone(),
            body_excerpt: excerpt(&message.summary(), REPLY_EXCERPT_CHARS),
        });
    }

    pub fn clear_reply(&mut self) {
        self.reply_to = None;
    }

    /// Hand the draft over for sending and reset the composer. An empty
    /// draft is rejected and nothing is cleared.
    pub fn take_draft(&mut self) -> Result<Draft, ValidationError> {
        let body = Some(self.text.trim())
            .filter(|body| !body.is_empty())
            .map(str::to_string);
        let draft = Draft {
            body,
            attachment: self.attachment.clone(),
            reply_to: self.reply_to.clone(),
        };
        if !draft.is_sendable() {
            return Err(ValidationError::EmptyMessage);
        }

        self.text.clear();
        self.caret = 0;
        self.attachment = None;
        self.reply_to = None;
        self.mentions.update("", 0);
        Ok(draft)
    }

    /// Put a draft back, e.g. after a failed send was pulled for editing.
    pub fn restore(&mut self, draft: Draft) {
        self.text = draft.body.unwrap_or_default();
        self.caret = self.text.len();
        self.attachment = draft.attachment;
        self.reply_to = draft.reply_to;
        self.mentions.update(&self.text, self.caret);
    }
}
