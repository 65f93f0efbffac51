//! Free-text plan request parsing.
//!
//! Requests arrive as spoken or typed text ("add task titled \"Write docs\"
//! high priority #docs"). Extraction is keyword and pattern based.

use std::collections::BTreeSet;

use regex::Regex;

use super::model::{PlanItem, PlanPriority};
use crate::error::PlanError;

/// Fields extracted from a plan update request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanRequest {
    pub title: String,
    pub description: Option<String>,
    pub priority: Option<PlanPriority>,
    pub tags: BTreeSet<String>,
}

impl PlanRequest {
    /// Build the plan item this request describes.
    pub fn into_item(self) -> PlanItem {
        let mut item = PlanItem::new(self.title).with_tags(self.tags);
        if let Some(description) = self.description {
            item = item.with_description(description);
        }
        if let Some(priority) = self.priority {
            item = item.with_priority(priority);
        }
        item
    }
}

/// Which report a plan query asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanQuery {
    Status,
    Priority,
    Summary,
    Listing,
}

impl PlanQuery {
    /// Classify query text by keyword.
    pub fn classify(text: &str) -> Self {
        let lower = text.to_lowercase();
        if lower.contains("status") || lower.contains("progress") {
            Self::Status
        } else if lower.contains("priorit") || lower.contains("urgent") {
            Self::Priority
        } else if lower.contains("summary") || lower.contains("overview") {
            Self::Summary
        } else {
            Self::Listing
        }
    }
}

/// Compiled extraction patterns.
pub struct PlanParser {
    titled: Regex,
    title_field: Regex,
    quoted: Regex,
    command: Regex,
    description_quoted: Regex,
    description_field: Regex,
    priority_before: Regex,
    priority_after: Regex,
    hashtag: Regex,
    clause: Regex,
}

impl PlanParser {
    pub fn new() -> Result<Self, PlanError> {
        Ok(Self {
            titled: Regex::new(r#"(?i)\b(?:titled|called|named)\s+(?:"([^"]+)"|'([^']+)')"#)?,
            title_field: Regex::new(r#"(?i)\btitle\s*[:=]\s*"?([^"\n,;#]+)"?"#)?,
            quoted: Regex::new(r#""([^"]+)""#)?,
            command: Regex::new(
                r"(?i)\b(?:add|create|new|make)\s+(?:a\s+|an\s+|new\s+)*(?:task|item|todo|step)\b\s*(?::|to|for)?\s*(.+)",
            )?,
            description_quoted: Regex::new(
                r#"(?i)\b(?:description|described as|details?)\s*[:=]?\s*"([^"]+)""#,
            )?,
            description_field: Regex::new(r"(?i)\b(?:description|details?)\s*[:=]\s*([^\n#]+)")?,
            priority_before: Regex::new(
                r"(?i)\b(critical|urgent|blocker|high|important|medium|normal|low|minor)[\s-]+priority\b",
            )?,
            priority_after: Regex::new(
                r"(?i)\bpriority\s*(?:[:=]|is|of)?\s*(critical|urgent|blocker|high|important|medium|normal|low|minor)\b",
            )?,
            hashtag: Regex::new(r"#([A-Za-z0-9][A-Za-z0-9_\-]*)")?,
            clause: Regex::new(r"(?i)\n|#|\.\s| with\s| description| priority")?,
        })
    }

    /// Extract a plan request. Fails when no title can be found.
    pub fn parse(&self, text: &str) -> Result<PlanRequest, PlanError> {
        let title = self
            .title(text)
            .ok_or_else(|| PlanError::Unparseable(format!("no title found in {text:?}")))?;

        Ok(PlanRequest {
            title,
            description: self.description(text),
            priority: self.priority(text),
            tags: self.tags(text),
        })
    }

    fn title(&self, text: &str) -> Option<String> {
        if let Some(caps) = self.titled.captures(text) {
            return caps.get(1).or(caps.get(2)).map(|m| m.as_str().trim().to_string());
        }
        if let Some(caps) = self.title_field.captures(text) {
            return non_empty(caps[1].trim());
        }
        // A quoted description is not a title.
        let description_span = self.description_quoted.find(text).map(|m| m.range());
        for caps in self.quoted.captures_iter(text) {
            let Some(whole) = caps.get(0) else {
                continue;
            };
            if description_span
                .as_ref()
                .is_some_and(|span| span.contains(&whole.start()))
            {
                continue;
            }
            if let Some(title) = non_empty(caps[1].trim()) {
                return Some(title);
            }
        }
        let caps = self.command.captures(text)?;
        let mut raw = &caps[1];
        if let Some(m) = self.priority_before.find(raw) {
            raw = &raw[..m.start()];
        }
        non_empty(self.clip_title(raw))
    }

    /// Cut a free-form title at the first trailing clause.
    fn clip_title<'a>(&self, raw: &'a str) -> &'a str {
        let end = self.clause.find(raw).map_or(raw.len(), |m| m.start());
        raw[..end].trim().trim_end_matches(['.', ',', ';', ':'])
    }

    fn description(&self, text: &str) -> Option<String> {
        if let Some(caps) = self.description_quoted.captures(text) {
            return non_empty(caps[1].trim());
        }
        self.description_field
            .captures(text)
            .and_then(|caps| non_empty(caps[1].trim()))
    }

    fn priority(&self, text: &str) -> Option<PlanPriority> {
        self.priority_before
            .captures(text)
            .or_else(|| self.priority_after.captures(text))
            .and_then(|caps| PlanPriority::from_word(&caps[1]))
    }

    fn tags(&self, text: &str) -> BTreeSet<String> {
        self.hashtag
            .captures_iter(text)
            .map(|caps| caps[1].to_lowercase())
            .collect()
    }
}

fn non_empty(s: &str) -> Option<String> {
    let s = s.trim();
    (!s.is_empty()).then(|| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parser() -> PlanParser {
        PlanParser::new().unwrap()
    }

    #[test]
    fn titled_quote() {
        let request = parser().parse(r#"add task titled "Write docs""#).unwrap();
        assert_eq!(request.title, "Write docs");
        assert_eq!(request.description, None);
        assert_eq!(request.priority, None);
        assert!(request.tags.is_empty());
    }

    #[test]
    fn title_field_with_priority_and_tags() {
        let request = parser()
            .parse("title: Fix login bug, high priority #auth #Backend")
            .unwrap();
        assert_eq!(request.title, "Fix login bug");
        assert_eq!(request.priority, Some(PlanPriority::High));
        let tags: Vec<_> = request.tags.iter().map(String::as_str).collect();
        assert_eq!(tags, vec!["auth", "backend"]);
    }

    #[test]
    fn quoted_description_is_not_the_title() {
        let request = parser()
            .parse(r#"create item description: "update every page" titled "Docs pass""#)
            .unwrap();
        assert_eq!(request.title, "Docs pass");
        assert_eq!(request.description.as_deref(), Some("update every page"));
    }

    #[test]
    fn bare_command_text_becomes_title() {
        let request = parser()
            .parse("please add a task to refactor the router with tests #cleanup")
            .unwrap();
        assert_eq!(request.title, "refactor the router");
        assert!(request.tags.contains("cleanup"));
    }

    #[test]
    fn non_ascii_titles_are_clipped_on_char_boundaries() {
        let request = parser().parse("add task İİİİ with tests").unwrap();
        assert_eq!(request.title, "İİİİ");

        let request = parser().parse("add task İİİİİİİİ with xéé").unwrap();
        assert_eq!(request.title, "İİİİİİİİ");

        let request = parser().parse("add task \u{212A}elvin sensor WITH care").unwrap();
        assert_eq!(request.title, "\u{212A}elvin sensor");
    }

    #[test]
    fn priority_after_keyword() {
        let request = parser().parse(r#"new task "Rotate keys" priority: urgent"#).unwrap();
        assert_eq!(request.priority, Some(PlanPriority::Critical));
    }

    #[test]
    fn no_title_is_an_error() {
        let err = parser().parse("what is going on").unwrap_err();
        assert!(matches!(err, PlanError::Unparseable(_)));
    }

    #[test]
    fn request_builds_item() {
        let item = parser()
            .parse(r#"add task titled "Ship it" critical priority #release"#)
            .unwrap()
            .into_item();
        assert_eq!(item.title, "Ship it");
        assert_eq!(item.priority, PlanPriority::Critical);
        assert!(item.tags.contains("release"));
    }

    #[test]
    fn query_classification() {
        assert_eq!(PlanQuery::classify("what's the status?"), PlanQuery::Status);
        assert_eq!(PlanQuery::classify("show priorities"), PlanQuery::Priority);
        assert_eq!(PlanQuery::classify("give me a summary"), PlanQuery::Summary);
        assert_eq!(PlanQuery::classify("show the plan"), PlanQuery::Listing);
    }
}
