//! Source locators: Drive id extraction, candidate download URLs, input list parsing.

use std::sync::LazyLock;

use regex::Regex;

use crate::models::SourceItem;

/// Link shapes a Drive file id can be recovered from.
static DRIVE_ID_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"^https://drive\.google\.com/file/d/([^/?&#]+)",
        r"^https://drive\.google\.com/open\?id=([^/?&#]+)",
        r"^https://docs\.google\.com/file/d/([^/?&#]+)",
    ]
    .iter()
    .filter_map(|p| Regex::new(p).ok())
    .collect()
});

/// Extract the Drive file id from a share link.
pub fn extract_drive_id(url: &str) -> Option<String> {
    let url = url.trim();
    DRIVE_ID_PATTERNS
        .iter()
        .find_map(|re| re.captures(url))
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
        .filter(|id| !id.is_empty())
}

/// Equivalent download endpoints for one file, in priority order.
/// The second one carries the confirmation parameter that large files need.
pub fn candidate_urls(drive_id: &str) -> Vec<String> {
    vec![
        format!("https://drive.google.com/uc?id={}&export=download", drive_id),
        format!(
            "https://drive.google.com/uc?export=download&id={}&confirm=t",
            drive_id
        ),
    ]
}

/// Canonical share link for a Drive file id.
pub fn view_url(drive_id: &str) -> String {
    format!("https://drive.google.com/file/d/{}/view", drive_id)
}

/// Parse the input list: one locator per line, surrounding whitespace trimmed,
/// blank lines ignored.
pub fn parse_url_list(text: &str) -> Vec<SourceItem> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(SourceItem::from_locator)
        .collect()
}
