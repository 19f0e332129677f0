//! arXiv paper metadata and summary prompt construction.

use chrono::{DateTime, Utc};

use crate::llm::{LlmClient, Message};

/// Metadata for one arXiv paper, as parsed from the export API's Atom feed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ArxivPaper {
    /// arXiv identifier with any version suffix stripped (e.g. `2401.12345`).
    pub id: String,
    pub title: String,
    /// The abstract.
    pub summary: String,
    pub authors: Vec<String>,
    pub published: Option<DateTime<Utc>>,
    pub primary_category: Option<String>,
    pub pdf_url: Option<String>,
}

impl ArxivPaper {
    /// Abstract page URL for this paper.
    pub fn abs_url(&self) -> String {
        format!("https://arxiv.org/abs/{}", self.id)
    }

    /// Build the conversation asking for a short summary in `lang`.
    pub fn tldr_messages(&self, lang: &str) -> Vec<Message> {
        vec![
            Message::system(format!(
                "You summarize academic papers. Reply with a two to three sentence \
                 TLDR in {lang}, no preamble."
            )),
            Message::user(format!(
                "Title: {}\n\nAbstract: {}",
                self.title, self.summary
            )),
        ]
    }

    /// Generate a TLDR for this paper in the client's configured language.
    /// Returns an empty string if generation fails.
    pub async fn tldr(&self, llm: &mut LlmClient) -> String {
        let messages = self.tldr_messages(llm.lang());
        llm.generate_or_empty(&messages).await
    }
}
