//! Context assembly: turning cached page snapshots into the text block given
//! to the model alongside the user's prompt.
//!
//! Output is deterministic for a given input; pages are never re-sorted.

use chrono::{DateTime, Utc};

/// Placeholder block used when a requested page has no cached snapshot.
pub const NO_CONTENT_PLACEHOLDER: &str = "No content available for this page.";

/// Section separator between pages in a multi-page context.
const PAGE_DELIMITER: &str = "\n\n---\n\n";

/// One page's contribution to the assembled context.
#[derive(Debug, Clone)]
pub struct ContextPage {
    pub url: String,
    pub title: String,
    pub content: String,
    pub last_updated: Option<DateTime<Utc>>,
}

impl ContextPage {
    /// Placeholder entry for a page that was never scraped or already evicted.
    pub fn placeholder(page_id: u64) -> Self {
        Self {
            url: String::new(),
            title: format!("Page {}", page_id),
            content: NO_CONTENT_PLACEHOLDER.to_string(),
            last_updated: None,
        }
    }
}

/// Assemble the context block for one or more pages, preserving input order.
pub fn assemble(pages: &[ContextPage]) -> String {
    match pages {
        [] => String::new(),
        [page] => format!("Context from {}:\n\n{}", display_title(page), page.content),
        many => {
            let titles: Vec<&str> = many.iter().map(|p| display_title(p)).collect();
            let mut out = format!(
                "Context from {} pages: {}\n\n",
                many.len(),
                titles.join(", ")
            );
            let sections: Vec<String> = many
                .iter()
                .enumerate()
                .map(|(i, page)| {
                    let mut section = format!("[{}] {}\n", i + 1, display_title(page));
                    if !page.url.is_empty() {
                        section.push_str(&format!("URL: {}\n", page.url));
                    }
                    if let Some(updated) = page.last_updated {
                        section.push_str(&format!(
                            "Last updated: {}\n",
                            updated.format("%Y-%m-%d %H:%M:%S UTC")
                        ));
                    }
                    section.push('\n');
                    section.push_str(&page.content);
                    section
                })
                .collect();
            out.push_str(&sections.join(PAGE_DELIMITER));
            out
        }
    }
}

fn display_title(page: &ContextPage) -> &str {
    if page.title.is_empty() {
        if page.url.is_empty() {
            "Untitled page"
        } else {
            &page.url
        }
    } else {
        &page.title
    }
}
