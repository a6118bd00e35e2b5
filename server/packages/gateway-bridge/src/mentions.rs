use regex::Regex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MentionMatch {
    pub collaborator: String,
    pub message: String,
}

/// Finds `@<id>` references to registered collaborators.
///
/// Tokens are case-sensitive and must stand alone: not preceded by a word
/// character or `@`, not followed by a word character. The directed message
/// of a mention runs up to the next mention token (or the end of the text).
#[derive(Debug, Clone)]
pub struct MentionDetector {
    pattern: Option<Regex>,
}

impl MentionDetector {
    pub fn new<I, S>(collaborators: I) -> Result<Self, regex::Error>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut ids: Vec<String> = collaborators
            .into_iter()
            .map(|id| id.as_ref().trim().to_string())
            .filter(|id| !id.is_empty())
            .collect();
        if ids.is_empty() {
            return Ok(Self { pattern: None });
        }
        // Longest first so `@code-reviewer` never matches a shorter `code`.
        ids.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        ids.dedup();

        let alternation = ids
            .iter()
            .map(|id| regex::escape(id))
            .collect::<Vec<_>>()
            .join("|");
        let pattern = Regex::new(&format!(r"(?:^|[^\w@])@({alternation})(?:$|[^\w])"))?;
        Ok(Self {
            pattern: Some(pattern),
        })
    }

    pub fn detect(&self, text: &str) -> Vec<MentionMatch> {
        let Some(pattern) = &self.pattern else {
            return Vec::new();
        };

        let mut tokens: Vec<(usize, usize, &str)> = Vec::new();
        let mut offset = 0;
        while offset < text.len() {
            let Some(captures) = pattern.captures_at(text, offset) else {
                break;
            };
            let Some(id) = captures.get(1) else {
                break;
            };
            // Token starts at the `@` in front of the id.
            tokens.push((id.start() - 1, id.end(), id.as_str()));
            // The trailing delimiter may be the prefix of the next token.
            offset = id.end();
        }

        tokens
            .iter()
            .enumerate()
            .filter_map(|(index, (_, end, id))| {
                let stop = tokens
                    .get(index + 1)
                    .map(|(next_start, _, _)| *next_start)
                    .unwrap_or(text.len());
                let message = text[*end..stop].trim();
                if message.is_empty() {
                    None
                } else {
                    Some(MentionMatch {
                        collaborator: id.to_string(),
                        message: message.to_string(),
                    })
                }
            })
            .collect()
    }
}
