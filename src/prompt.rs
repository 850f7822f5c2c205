//! Conversation assembly for the completion model.

use code_analyzer_core::models::{ChatMessage, RelatedDocument};

const INSTRUCTIONS: [&str; 3] = [
    "You are a friendly, helpful software assistant. Your goal is to help users understand the code within a Git repository.",
    "You should respond in short paragraphs, using Markdown formatting for any blocks of code, separated with two newlines to keep your responses easily readable.",
    "Whenever possible, use code examples derived from the documentation provided.",
];

const CONTEXT_HEADER: &str =
    "Here are the files from the Git repository that are relevant to the user's question:";

/// `File: <key>` followed by the document's content.
pub fn render_document(doc: &RelatedDocument) -> String {
    format!("File: {}\n{}", doc.key, doc.content)
}

/// Fixed instructions, then the retrieved files in the given order, then
/// the user's query.
pub fn compose(documents: &[RelatedDocument], query: &str) -> Vec<ChatMessage> {
    let mut context = CONTEXT_HEADER.to_string();
    if !documents.is_empty() {
        let rendered: Vec<String> = documents.iter().map(render_document).collect();
        context.push_str("\n\n");
        context.push_str(&rendered.join("\n\n"));
    }

    let mut conversation: Vec<ChatMessage> =
        INSTRUCTIONS.iter().map(|s| ChatMessage::system(*s)).collect();
    conversation.push(ChatMessage::system(context));
    conversation.push(ChatMessage::user(query));
    conversation
}
