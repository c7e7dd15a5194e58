//! Prompts for statement extraction and Q/A generation.
//!
//! Each stage sends a single user message. The extraction prompt embeds the
//! caller's schema verbatim; the Q/A prompts end in `Question:` / `Answer:`
//! so [`crate::pipeline::postprocess::clean_generated_text`] knows which
//! echoed label to strip.

/// Optional system message for the extraction call.
pub const EXTRACTION_SYSTEM_PROMPT: &str = "You extract factual statements from documents. \
Respond with a JSON array only, no commentary.";

/// Build the extraction prompt for one chunk.
pub fn extraction_prompt(schema_json: &str, text: &str, pages: &[u32]) -> String {
    let pages = pages
        .iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "Extract factual statements from the following text according to this schema:\n\n\
         {schema_json}\n\n\
         The text comes from page(s) {pages} of the document.\n\n\
         Text:\n{text}\n\n\
         Return a JSON array of objects that follow the schema.\n\
         Each statement should be a clear, concise factual statement from the text.\n\
         When a statement comes from specific pages, give them in a \"pages\" array."
    )
}

/// Ask for a question whose answer is the statement.
pub fn question_prompt(statement: &str) -> String {
    format!(
        "Generate a clear, specific question that would have the following statement as its answer. \
         The question should be detailed enough that this statement would be the expected answer. \
         Do not include the answer in your response, only the question.\n\n\
         Statement: {statement}\n\n\
         Question:"
    )
}

/// Ask for an answer grounded only in the statement.
pub fn answer_prompt(statement: &str, question: &str) -> String {
    format!(
        "Given the following statement and question, provide a clear, concise answer \
         based only on the information in the statement. Do not add any information \
         that is not present in the statement.\n\n\
         Statement: {statement}\n\n\
         Question: {question}\n\n\
         Answer:"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extraction_prompt_embeds_schema_and_pages() {
        let p = extraction_prompt("{\"type\":\"object\"}", "Some text.", &[3, 4]);
        assert!(p.contains("{\"type\":\"object\"}"));
        assert!(p.contains("page(s) 3, 4"));
        assert!(p.contains("Text:\nSome text."));
    }

    #[test]
    fn qa_prompts_end_with_their_label() {
        assert!(question_prompt("S").ends_with("Question:"));
        let a = answer_prompt("S", "Q?");
        assert!(a.contains("Question: Q?"));
        assert!(a.ends_with("Answer:"));
    }
}
