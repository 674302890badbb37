//! Conversation title derivation from the user's first question.
//!
//! Clients run the same heuristic locally for optimistic rendering, so the
//! steps here must stay in lockstep with them: strip markdown markers,
//! collapse whitespace, drop leading filler words, clamp to ten words and
//! sixty characters.
//!
//! ```rust
//! use rrelay::derive_title;
//!
//! assert_eq!(derive_title("## okay, what is **Rust**?"), "What is Rust?");
//! ```

/// Placeholder set at conversation creation, replaced by the first derived
/// title.
pub const DEFAULT_TITLE: &str = "New chat";

const MAX_WORDS: usize = 10;
const MAX_CHARS: usize = 60;

const FILLER_WORDS: &[&str] = &[
    "okay",
    "ok",
    "sure",
    "certainly",
    "well",
    "so",
    "alright",
    "yes",
];

/// True when a conversation still carries no real title.
pub fn needs_title(current: &str) -> bool {
    let trimmed = current.trim();
    trimmed.is_empty() || trimmed == DEFAULT_TITLE
}

pub fn derive_title(prompt: &str) -> String {
    let mut words: Vec<String> = prompt
        .split_whitespace()
        .map(strip_markers)
        .filter(|word| !word.is_empty())
        .collect();

    while let Some(first) = words.first() {
        let bare = first.trim_end_matches([',', ':', '.', '!']).to_lowercase();
        if FILLER_WORDS.contains(&bare.as_str()) {
            words.remove(0);
        } else {
            break;
        }
    }

    words.truncate(MAX_WORDS);
    let mut title = words.join(" ");

    if title.chars().count() > MAX_CHARS {
        title = title.chars().take(MAX_CHARS).collect::<String>();
        title = title.trim_end().to_string();
        title.push('…');
    }

    capitalize_first(&title)
}

/// Strips markdown heading/list/emphasis markers from one word. Underscores
/// stay inside words so identifiers survive; asterisks and backticks never
/// appear mid-word legitimately in a prompt.
fn strip_markers(word: &str) -> String {
    let word = word.trim_start_matches(['#', '-', '>']);
    let word = word.trim_matches('_');
    word.chars().filter(|c| !matches!(c, '*' | '`')).collect()
}

fn capitalize_first(text: &str) -> String {
    let mut chars = text.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn markdown_markers_are_stripped() {
        assert_eq!(
            derive_title("# How do *generics* work in `Rust`?"),
            "How do generics work in Rust?"
        );
    }

    #[test]
    fn leading_filler_words_are_dropped() {
        assert_eq!(derive_title("okay, so explain lifetimes"), "Explain lifetimes");
        assert_eq!(derive_title("Sure! help me"), "Help me");
    }

    #[test]
    fn long_prompts_are_clamped_to_ten_words() {
        let prompt = "one two three four five six seven eight nine ten eleven twelve";
        assert_eq!(derive_title(prompt), "One two three four five six seven eight nine ten");
    }

    #[test]
    fn very_long_titles_are_truncated_with_an_ellipsis() {
        let prompt = "pneumonoultramicroscopicsilicovolcanoconiosis antidisestablishmentarianism floccinaucinihilipilification";
        let title = derive_title(prompt);
        assert!(title.chars().count() <= MAX_CHARS + 1);
        assert!(title.ends_with('…'));
    }

    #[test]
    fn whitespace_is_collapsed() {
        assert_eq!(derive_title("  what \n\n is    this  "), "What is this");
    }

    #[test]
    fn placeholder_and_empty_titles_need_replacement() {
        assert!(needs_title(""));
        assert!(needs_title("  "));
        assert!(needs_title("New chat"));
        assert!(!needs_title("Borrow checker basics"));
    }
}
