//! Done sequences: trailing patterns of event kinds that end a task.
//!
//! A sequence is written as comma-joined single-letter codes, e.g. `"T,A"`
//! for "the LLM emitted a call, then the agent handled it".

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::TaskError;

/// Kind of one recorded turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    /// LLM turn without calls
    Llm,
    /// LLM turn with one or more calls
    ToolCall,
    /// Agent handled the pending turn
    AgentHandled,
    User,
    SubTask,
}

impl EventKind {
    pub fn code(&self) -> char {
        match self {
            EventKind::Llm => 'L',
            EventKind::ToolCall => 'T',
            EventKind::AgentHandled => 'A',
            EventKind::User => 'U',
            EventKind::SubTask => 'S',
        }
    }

    pub fn from_code(code: char) -> Option<Self> {
        match code.to_ascii_uppercase() {
            'L' => Some(EventKind::Llm),
            'T' => Some(EventKind::ToolCall),
            'A' => Some(EventKind::AgentHandled),
            'U' => Some(EventKind::User),
            'S' => Some(EventKind::SubTask),
            _ => None,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// A pattern matched against the tail of a task's event history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DoneSequence(Vec<EventKind>);

impl DoneSequence {
    pub fn new(kinds: Vec<EventKind>) -> Self {
        Self(kinds)
    }

    pub fn kinds(&self) -> &[EventKind] {
        &self.0
    }

    /// Exact suffix match. An empty sequence never matches.
    pub fn matches(&self, events: &[EventKind]) -> bool {
        !self.0.is_empty() && events.ends_with(&self.0)
    }
}

impl FromStr for DoneSequence {
    type Err = TaskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || TaskError::InvalidDoneSequence(s.to_string());
        let kinds = s
            .split(',')
            .map(|token| {
                let mut chars = token.trim().chars();
                match (chars.next(), chars.next()) {
                    (Some(c), None) => EventKind::from_code(c).ok_or_else(invalid),
                    _ => Err(invalid()),
                }
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self(kinds))
    }
}

impl fmt::Display for DoneSequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let codes: Vec<String> = self.0.iter().map(|k| k.code().to_string()).collect();
        write!(f, "{}", codes.join(","))
    }
}

/// The first of `sequences` matching the tail of `events`.
pub fn first_match<'a>(sequences: &'a [DoneSequence], events: &[EventKind]) -> Option<&'a DoneSequence> {
    sequences.iter().find(|seq| seq.matches(events))
}

#[cfg(test)]
mod tests {
    use super::*;
    use EventKind::*;

    #[test]
    fn test_parse_and_display() {
        let seq: DoneSequence = "T, A".parse().unwrap();
        assert_eq!(seq.kinds(), &[ToolCall, AgentHandled]);
        assert_eq!(seq.to_string(), "T,A");
        assert!("T,AA".parse::<DoneSequence>().is_err());
        assert!("X".parse::<DoneSequence>().is_err());
        assert!("".parse::<DoneSequence>().is_err());
    }

    #[test]
    fn test_suffix_match_only_at_the_end() {
        let seq: DoneSequence = "T,A".parse().unwrap();
        assert!(!seq.matches(&[Llm]));
        assert!(!seq.matches(&[Llm, ToolCall]));
        assert!(seq.matches(&[Llm, ToolCall, AgentHandled]));
        assert!(!seq.matches(&[ToolCall, AgentHandled, Llm]));
    }

    #[test]
    fn test_first_match_order() {
        let seqs: Vec<DoneSequence> = ["U", "A"].iter().map(|s| s.parse().unwrap()).collect();
        assert_eq!(first_match(&seqs, &[Llm, AgentHandled]), Some(&seqs[1]));
        assert_eq!(first_match(&seqs, &[Llm]), None);
        assert!(!DoneSequence::new(Vec::new()).matches(&[Llm]));
    }
}
