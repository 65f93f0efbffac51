//! Plain-text plan reports returned to the conversation layer.

use std::fmt::Write;

use super::model::{PlanCounts, PlanItem, PlanPriority, PlanStatus};

/// Items sorted by priority rank, oldest first within a rank.
fn by_priority<'a>(items: impl IntoIterator<Item = &'a PlanItem>) -> Vec<&'a PlanItem> {
    let mut sorted: Vec<&PlanItem> = items.into_iter().collect();
    sorted.sort_by(|a, b| {
        a.priority
            .rank()
            .cmp(&b.priority.rank())
            .then(a.created_at.cmp(&b.created_at))
    });
    sorted
}

fn item_line(out: &mut String, item: &PlanItem) {
    let _ = write!(out, "- [{}] {} ({})", item.priority, item.title, item.short_id());
    if !item.tags.is_empty() {
        let tags: Vec<String> = item.tags.iter().map(|t| format!("#{t}")).collect();
        let _ = write!(out, " {}", tags.join(" "));
    }
    out.push('\n');
}

/// Full listing grouped by status and sorted by priority within each group.
pub fn listing(items: &[PlanItem]) -> String {
    if items.is_empty() {
        return "The plan is empty.".to_string();
    }
    let mut out = format!("# Plan ({} items)\n", items.len());
    for status in PlanStatus::REPORT_ORDER {
        let group = by_priority(items.iter().filter(|i| i.status() == status));
        if group.is_empty() {
            continue;
        }
        let _ = write!(out, "\n## {} ({})\n", status.label(), group.len());
        for item in group {
            item_line(&mut out, item);
            if !item.description.is_empty() {
                let _ = writeln!(out, "  {}", item.description);
            }
        }
    }
    out.trim_end().to_string()
}

/// Counts per status plus the active items.
pub fn status_report(items: &[PlanItem]) -> String {
    let counts = PlanCounts::from_items(items);
    let mut out = format!("Plan status: {} items\n", counts.total());
    for status in PlanStatus::REPORT_ORDER {
        let _ = writeln!(out, "- {}: {}", status.label(), counts.get(status));
    }
    for status in [PlanStatus::InProgress, PlanStatus::Blocked] {
        let group = by_priority(items.iter().filter(|i| i.status() == status));
        if group.is_empty() {
            continue;
        }
        let _ = write!(out, "\n{}:\n", status.label());
        for item in group {
            item_line(&mut out, item);
        }
    }
    out.trim_end().to_string()
}

/// Open items grouped by priority, most important first.
pub fn priority_report(items: &[PlanItem]) -> String {
    let open: Vec<&PlanItem> = items.iter().filter(|i| !i.status().is_closed()).collect();
    if open.is_empty() {
        return "No open plan items.".to_string();
    }
    let mut out = String::from("Open items by priority:\n");
    for priority in PlanPriority::ALL {
        let group: Vec<&PlanItem> = by_priority(open.iter().copied().filter(|i| i.priority == priority));
        if group.is_empty() {
            continue;
        }
        let _ = write!(out, "\n{} ({}):\n", priority, group.len());
        for item in group {
            let _ = writeln!(out, "- {} [{}] ({})", item.title, item.status(), item.short_id());
        }
    }
    out.trim_end().to_string()
}

/// One-paragraph summary with the next item to pick up.
pub fn summary(items: &[PlanItem]) -> String {
    let counts = PlanCounts::from_items(items);
    if counts.total() == 0 {
        return "The plan is empty.".to_string();
    }
    let mut out = format!(
        "{} items: {} pending, {} in progress, {} blocked, {} completed, {} cancelled.",
        counts.total(),
        counts.pending,
        counts.in_progress,
        counts.blocked,
        counts.completed,
        counts.cancelled,
    );
    let next = by_priority(items.iter().filter(|i| i.status() == PlanStatus::Pending))
        .into_iter()
        .next();
    if let Some(next) = next {
        let _ = write!(out, " Next up: {} ({} priority).", next.title, next.priority);
    }
    out
}

/// Project context followed by the current plan summary.
pub fn project_context(context: &str, items: &[PlanItem]) -> String {
    let mut out = String::new();
    if !context.trim().is_empty() {
        out.push_str(context.trim());
        out.push_str("\n\n");
    }
    out.push_str("## Current Plan\n");
    out.push_str(&summary(items));
    out
}
