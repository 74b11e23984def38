//! Parse a reviewer's markdown output into a structured verdict.

use regex::Regex;
use std::sync::OnceLock;

use crate::crew::model::{ReviewVerdict, Verdict};

fn verdict_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?im)^#*\s*\**Verdict\**:?\s*\**\s*(SHIP|NEEDS_WORK|MAJOR_RETHINK)\**\s*$")
            .expect("valid regex")
    })
}

/// Extract the verdict keyword, the summary paragraph between it and the
/// next heading, and bulleted Issues/Suggestions sections.
///
/// Malformed input defaults to NEEDS_WORK with empty issues so work
/// continues under a safe assumption.
pub fn parse_verdict(markdown: &str) -> ReviewVerdict {
    let Some(captures) = verdict_re().captures(markdown) else {
        return ReviewVerdict {
            verdict: Verdict::NeedsWork,
            summary: String::new(),
            issues: vec![],
            suggestions: vec![],
        };
    };
    let verdict = match &captures[1] {
        "SHIP" => Verdict::Ship,
        "MAJOR_RETHINK" => Verdict::MajorRethink,
        _ => Verdict::NeedsWork,
    };

    let after = &markdown[captures.get(0).map(|m| m.end()).unwrap_or(0)..];
    let summary = after
        .lines()
        .take_while(|line| !line.trim_start().starts_with('#'))
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('-') && !line.starts_with('*'))
        .collect::<Vec<_>>()
        .join(" ");

    ReviewVerdict {
        verdict,
        summary,
        issues: bullets_under(markdown, "Issues"),
        suggestions: bullets_under(markdown, "Suggestions"),
    }
}

/// Collect `- ` / `* ` bullets under a `## <heading>` or `<heading>:` line,
/// stopping at the next heading.
fn bullets_under(markdown: &str, heading: &str) -> Vec<String> {
    let mut in_section = false;
    let mut bullets = Vec::new();
    for line in markdown.lines() {
        let trimmed = line.trim();
        let is_heading = trimmed.starts_with('#')
            || (trimmed.ends_with(':') && !trimmed.starts_with('-') && !trimmed.starts_with('*'));
        if is_heading {
            let label = trimmed.trim_start_matches('#').trim().trim_end_matches(':');
            in_section = label.eq_ignore_ascii_case(heading);
            continue;
        }
        if in_section {
            if let Some(item) = trimmed.strip_prefix("- ").or_else(|| trimmed.strip_prefix("* ")) {
                bullets.push(item.trim().to_string());
            }
        }
    }
    bullets
}
