//! Turn raw provider output into one final answer string.
//!
//! Citation stripping is a best-effort heuristic: providers that cite
//! sources tend to put the source list in the first paragraph and mark the
//! answer with `[^N^][N]` pairs.

use std::sync::LazyLock;

use futures::StreamExt;
use regex::Regex;

use crate::provider::{ProviderError, ProviderOutput};

static CITATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[\^[0-9]+\^\]\[[0-9]+\]")
        .unwrap_or_else(|e| panic!("invalid citation regex: {e}"))
});

/// Concatenate provider output into one string, fragments in arrival order.
///
/// Yields to the scheduler between fragments so a long stream stays
/// cancellable. The first stream error aborts collection.
pub async fn collect_text(output: ProviderOutput) -> Result<String, ProviderError> {
    match output {
        ProviderOutput::Text(text) => Ok(text),
        ProviderOutput::Stream(mut stream) => {
            let mut text = String::new();
            while let Some(fragment) = stream.next().await {
                text.push_str(&fragment?);
                tokio::task::yield_now().await;
            }
            Ok(text)
        }
    }
}

/// Whether `text` contains a `[^N^][N]` citation marker.
pub fn has_citations(text: &str) -> bool {
    CITATION.is_match(text)
}

/// Drop the leading source list and citation markers; always trims.
///
/// Only acts when a marker is present: the first paragraph is discarded
/// (if there is more than one), and markers are removed from the first
/// remaining paragraph.
pub fn strip_citations(text: &str) -> String {
    if !has_citations(text) {
        return text.trim().to_string();
    }

    let paragraphs: Vec<&str> = text.split("\n\n").collect();
    let answer = if paragraphs.len() > 1 {
        paragraphs[1]
    } else {
        paragraphs[0]
    };

    CITATION.replace_all(answer, "").trim().to_string()
}
