//! Prompt assembly.
//!
//! A turn is sent to the model as one user message: a fixed instruction,
//! the retrieved context, the question, and an answer marker. Inputs are
//! embedded verbatim; window limits are handled upstream and by the runtime.

/// Fixed directive placed before the context.
pub const INSTRUCTION: &str = "You are a helpful assistant. Answer the question using ONLY the \
information in the context below. Be concise. Cite the source document your answer comes from. \
If the context does not contain the answer, say that you do not know.";

pub const CONTEXT_LABEL: &str = "CONTEXT:";
pub const QUESTION_LABEL: &str = "QUESTION:";
pub const ANSWER_MARKER: &str = "ANSWER:";

/// Build the prompt for one turn.
pub fn build_prompt(context: &str, query: &str) -> String {
    let mut prompt = String::with_capacity(
        INSTRUCTION.len() + context.len() + query.len() + 64,
    );
    prompt.push_str(INSTRUCTION);
    prompt.push_str("\n\n");
    prompt.push_str(CONTEXT_LABEL);
    prompt.push('\n');
    prompt.push_str(context);
    prompt.push_str("\n\n");
    prompt.push_str(QUESTION_LABEL);
    prompt.push('\n');
    prompt.push_str(query);
    prompt.push_str("\n\n");
    prompt.push_str(ANSWER_MARKER);
    prompt
}

/// Sections recovered from a prompt built by [`build_prompt`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptSections<'a> {
    pub context: &'a str,
    pub query: &'a str,
}

/// Split a prompt back into its context and question.
///
/// Returns `None` for text that does not carry the fixed instruction and
/// answer marker. The last question label wins, so a context that itself
/// mentions the label is still recovered intact. The split is ambiguous when
/// the question contains the label too: everything before its last occurrence
/// is then reported as context.
pub fn parse_prompt(prompt: &str) -> Option<PromptSections<'_>> {
    let head = format!("{INSTRUCTION}\n\n{CONTEXT_LABEL}\n");
    let body = prompt.strip_prefix(head.as_str())?;
    let body = body.strip_suffix(&format!("\n\n{ANSWER_MARKER}"))?;
    let split = format!("\n\n{QUESTION_LABEL}\n");
    let at = body.rfind(split.as_str())?;
    Some(PromptSections {
        context: &body[..at],
        query: &body[at + split.len()..],
    })
}
