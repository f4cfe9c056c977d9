//! Content-based routing of messages into destination folders.

use regex::Regex;

use crate::email::MessageHeaders;

/// One routing rule. Absent predicates match everything; present ones must
/// match the whole field.
#[derive(Debug, Clone)]
pub struct FilterRule {
    pub folder: String,
    subject: Option<Regex>,
    sender: Option<Regex>,
    recipient: Option<Regex>,
}

impl FilterRule {
    pub fn new(
        folder: impl Into<String>,
        subject: Option<&str>,
        sender: Option<&str>,
        recipient: Option<&str>,
    ) -> Result<Self, regex::Error> {
        Ok(Self {
            folder: folder.into(),
            subject: subject.map(full_match).transpose()?,
            sender: sender.map(full_match).transpose()?,
            recipient: recipient.map(full_match).transpose()?,
        })
    }

    pub fn matches(&self, headers: &MessageHeaders) -> bool {
        if let Some(subject) = &self.subject {
            if !subject.is_match(&headers.subject) {
                return false;
            }
        }
        if let Some(sender) = &self.sender {
            let any = headers
                .from
                .iter()
                .any(|a| a.match_forms().iter().any(|form| sender.is_match(form)));
            if !any {
                return false;
            }
        }
        if let Some(recipient) = &self.recipient {
            let any = headers
                .recipients
                .iter()
                .any(|a| a.match_forms().iter().any(|form| recipient.is_match(form)));
            if !any {
                return false;
            }
        }
        true
    }
}

pub(crate) fn full_match(pattern: &str) -> Result<Regex, regex::Error> {
    Regex::new(&format!("^(?:{})$", pattern))
}

/// Picks the destination folder for a message. Every matching rule overrides
/// the previous result, so the last match wins.
pub fn resolve_folder<'a>(default_folder: &'a str, rules: &'a [FilterRule], headers: &MessageHeaders) -> &'a str {
    rules
        .iter()
        .filter(|rule| rule.matches(headers))
        .last()
        .map(|rule| rule.folder.as_str())
        .unwrap_or(default_folder)
}
