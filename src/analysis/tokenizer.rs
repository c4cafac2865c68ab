use unicode_segmentation::UnicodeSegmentation;

/// Splits field content into terms.
///
/// `search_mode = true` favours recall (finer-grained extra terms); `false` yields
/// precision-oriented tokens only.
pub trait Tokenizer: Send + Sync {
    fn split(&self, content: &str, search_mode: bool) -> Vec<String>;

    fn name(&self) -> &str;
}

/// Unicode word tokenizer (UAX #29) with lowercasing.
///
/// Ideographic scripts come out of word segmentation one character per word; in
/// search mode adjacent ideographs are additionally emitted as bigrams.
#[derive(Clone)]
pub struct StandardTokenizer {
    pub lowercase: bool,
    pub max_token_length: usize,
}

impl Default for StandardTokenizer {
    fn default() -> Self {
        StandardTokenizer {
            lowercase: true,
            max_token_length: 255,
        }
    }
}

impl Tokenizer for StandardTokenizer {
    fn split(&self, content: &str, search_mode: bool) -> Vec<String> {
        let text = if self.lowercase {
            content.to_lowercase()
        } else {
            content.to_string()
        };

        let mut terms = Vec::new();
        let mut prev_ideograph: Option<(usize, &str)> = None;

        for (offset, word) in text.unicode_word_indices() {
            if word.len() > self.max_token_length {
                prev_ideograph = None;
                continue;
            }
            terms.push(word.to_string());

            if !search_mode {
                continue;
            }
            if is_single_ideograph(word) {
                if let Some((prev_offset, prev)) = prev_ideograph {
                    if prev_offset + prev.len() == offset {
                        terms.push(format!("{}{}", prev, word));
                    }
                }
                prev_ideograph = Some((offset, word));
            } else {
                prev_ideograph = None;
            }
        }

        terms
    }

    fn name(&self) -> &str {
        "standard"
    }
}

fn is_single_ideograph(word: &str) -> bool {
    let mut chars = word.chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) => is_ideograph(c),
        _ => false,
    }
}

fn is_ideograph(c: char) -> bool {
    matches!(c as u32,
        0x3400..=0x4DBF      // CJK extension A
        | 0x4E00..=0x9FFF    // CJK unified ideographs
        | 0xF900..=0xFAFF    // compatibility ideographs
        | 0x3040..=0x30FF    // hiragana, katakana
        | 0xAC00..=0xD7AF    // hangul syllables
        | 0x20000..=0x2FA1F) // supplementary ideographic planes
}
