use serde::{Deserialize, Serialize};

/// A retrieved passage cited in support of an answer.
///
/// `nip` is the backend's distance score in `0..=1`; lower means more
/// relevant. Unknown keys in the payload are ignored and missing numeric
/// keys default to zero.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeSeed {
    #[serde(default)]
    pub content: String,
    #[serde(default, alias = "source", skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub nip: f64,
    #[serde(default)]
    pub tokens: u32,
}

impl KnowledgeSeed {
    pub fn new(content: impl Into<String>, nip: f64) -> Self {
        Self {
            content: content.into(),
            title: None,
            id: None,
            nip,
            tokens: 0,
        }
    }

    /// Label shown next to a citation: title, then id, then a fallback.
    pub fn label(&self) -> &str {
        self.title
            .as_deref()
            .or(self.id.as_deref())
            .unwrap_or("untitled source")
    }
}

/// Most relevant first. The list stored on a session keeps backend order;
/// this is for presentation.
pub fn by_relevance(seeds: &[KnowledgeSeed]) -> Vec<&KnowledgeSeed> {
    let mut sorted: Vec<&KnowledgeSeed> = seeds.iter().collect();
    sorted.sort_by(|a, b| a.nip.total_cmp(&b.nip));
    sorted
}
