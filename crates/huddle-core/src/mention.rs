//! "@mention" detection, candidate filtering and draft rewriting.
//!
//! All offsets are byte offsets into the draft, clamped to char boundaries.
//! The popup is described by a logical anchor (offset of the `@`); turning that
//! into screen coordinates is left to the presentation layer.

use huddle_types::models::RosterMember;

/// The `@query` run that ends at the caret.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MentionQuery {
    /// Offset of the `@`.
    pub anchor: usize,
    /// Offset just past the run (the caret).
    pub end: usize,
    /// Text after the `@`, possibly empty.
    pub query: String,
}

/// Find the active mention trigger: scan back from the caret to the previous
/// whitespace (or start of text) and require that run to begin with `@`.
pub fn active_query(text: &str, caret: usize) -> Option<MentionQuery> {
    let caret = clamp_to_char_boundary(text, caret);
    let before_caret = &text[..caret];

    let start = before_caret
        .char_indices()
        .rfind(|(_, c)| c.is_whitespace())
        .map(|(idx, c)| idx + c.len_utf8())
        .unwrap_or(0);

    let query = before_caret[start..].strip_prefix('@')?;
    Some(MentionQuery {
        anchor: start,
        end: caret,
        query: query.to_string(),
    })
}

/// Roster members whose name contains `query` (case-insensitive), in roster
/// order, at most `limit` of them.
pub fn filter_candidates(roster: &[RosterMember], query: &str, limit: usize) -> Vec<RosterMember> {
    let needle = query.to_lowercase();
    roster
        .iter()
        .filter(|member| member.name.to_lowercase().contains(&needle))
        .take(limit)
        .cloned()
        .collect()
}

/// Replace the `@query` run with `@<name> ` and return the new text and caret.
pub fn apply_mention(text: &str, query: &MentionQuery, name: &str) -> (String, usize) {
    let anchor = clamp_to_char_boundary(text, query.anchor);
    let end = clamp_to_char_boundary(text, query.end).max(anchor);

    let mut new_text = String::with_capacity(text.len() - (end - anchor) + name.len() + 2);
    new_text.push_str(&text[..anchor]);
    new_text.push('@');
    new_text.push_str(name);
    new_text.push(' ');
    new_text.push_str(&text[end..]);

    let caret = anchor + 1 + name.len() + 1;
    (new_text, caret)
}

fn clamp_to_char_boundary(text: &str, pos: usize) -> usize {
    let mut pos = pos.min(text.len());
    while !text.is_char_boundary(pos) {
        pos -= 1;
    }
    pos
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MentionKey {
    Up,
    Down,
    Enter,
    Tab,
    Escape,
}

/// Open dropdown state. An empty `candidates` list is the "no results" state.
#[derive(Debug, Clone, PartialEq)]
pub struct MentionPopup {
    pub anchor: usize,
    pub query: String,
    pub candidates: Vec<RosterMember>,
    pub highlighted: usize,
}

impl MentionPopup {
    pub fn highlighted_member(&self) -> Option<&RosterMember> {
        self.candidates.get(self.highlighted)
    }

    pub fn has_results(&self) -> bool {
        !self.candidates.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MentionCommit {
    pub text: String,
    pub caret: usize,
    pub member: RosterMember,
}

#[derive(Debug, Clone, PartialEq)]
pub enum KeyOutcome {
    /// Not for the dropdown; the composer handles it as usual.
    Ignored,
    Handled,
    Committed(MentionCommit),
}

/// Dropdown state machine driven by the composer.
#[derive(Debug, Clone)]
pub struct MentionResolver {
    roster: Option<Vec<RosterMember>>,
    limit: usize,
    popup: Option<MentionPopup>,
    /// Anchor of a trigger the user escaped; it stays closed until that
    /// trigger is gone.
    dismissed_anchor: Option<usize>,
}

impl MentionResolver {
    pub fn new(limit: usize) -> Self {
        Self {
            roster: None,
            limit,
            popup: None,
            dismissed_anchor: None,
        }
    }

    /// `None` means the roster could not be loaded; mentions are disabled.
    pub fn set_roster(&mut self, roster: Option<Vec<RosterMember>>) {
        self.roster = roster;
        if self.roster.is_none() {
            self.popup = None;
        }
    }

    pub fn is_available(&self) -> bool {
        self.roster.is_some()
    }

    pub fn popup(&self) -> Option<&MentionPopup> {
        self.popup.as_ref()
    }

    /// Recompute the dropdown after the draft or caret changed.
    pub fn update(&mut self, text: &str, caret: usize) -> Option<&MentionPopup> {
        let Some(roster) = self.roster.as_deref() else {
            self.popup = None;
            return None;
        };

        let Some(query) = active_query(text, caret) else {
            self.popup = None;
            self.dismissed_anchor = None;
            return None;
        };

        if self.dismissed_anchor == Some(query.anchor) {
            self.popup = None;
            return None;
        }
        self.dismissed_anchor = None;

        let candidates = filter_candidates(roster, &query.query, self.limit);

        // Keep the highlight on the same member when they are still listed
        let previous = self
            .popup
            .as_ref()
            .filter(|popup| popup.anchor == query.anchor)
            .and_then(|popup| popup.highlighted_member())
            .map(|member| member.id);
        let highlighted = previous
            .and_then(|id| candidates.iter().position(|member| member.id == id))
            .unwrap_or(0);

        self.popup = Some(MentionPopup {
            anchor: query.anchor,
            query: query.query,
            candidates,
            highlighted,
        });
        self.popup.as_ref()
    }

    pub fn handle_key(&mut self, key: MentionKey, text: &str, caret: usize) -> KeyOutcome {
        let Some(popup) = self.popup.as_mut() else {
            return KeyOutcome::Ignored;
        };
        let len = popup.candidates.len();

        match key {
            MentionKey::Down => {
                if len > 0 {
                    popup.highlighted = (popup.highlighted + 1) % len;
                }
                KeyOutcome::Handled
            }
            MentionKey::Up => {
                if len > 0 {
                    popup.highlighted = (popup.highlighted + len - 1) % len;
                }
                KeyOutcome::Handled
            }
            MentionKey::Enter | MentionKey::Tab => {
                let Some(member) = popup.highlighted_member().cloned() else {
                    return KeyOutcome::Ignored;
                };
                let query = MentionQuery {
                    anchor: popup.anchor,
                    end: caret,
                    query: popup.query.clone(),
                };
                let (text, caret) = apply_mention(text, &query, &member.name);
                self.popup = None;
                KeyOutcome::Committed(MentionCommit {
                    text,
                    caret,
                    member,
                })
            }
            MentionKey::Escape => {
                self.dismissed_anchor = Some(popup.anchor);
                self.popup = None;
                KeyOutcome::Handled
            }
        }
    }
}
