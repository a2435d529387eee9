//! Composite prompt assembly for `/api/generate`.

/// Build the single prompt string submitted to the model: the optional
/// system preamble, then (when non-empty) the retrieved context in a fenced
/// block, then the user prompt.
pub fn build_prompt(prompt: &str, system: Option<&str>, context: Option<&str>) -> String {
    let mut parts: Vec<String> = Vec::new();
    if let Some(system) = system {
        let system = system.trim();
        if !system.is_empty() {
            parts.push(system.to_string());
        }
    }
    if let Some(context) = context {
        let context = context.trim();
        if !context.is_empty() {
            parts.push(format!("Relevant context:\n```\n{context}\n```"));
        }
    }
    parts.push(prompt.trim().to_string());
    parts.join("\n\n")
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::build_prompt;

    #[test]
    fn plain_prompt_passes_through() {
        assert_eq!(build_prompt("hi there", None, None), "hi there");
    }

    #[test]
    fn system_preamble_comes_first() {
        let prompt = build_prompt("question", Some("You are terse."), None);
        assert_eq!(prompt, "You are terse.\n\nquestion");
    }

    #[test]
    fn context_is_fenced_and_labeled() {
        let prompt = build_prompt("question", None, Some("fact one\nfact two"));
        assert_eq!(
            prompt,
            "Relevant context:\n```\nfact one\nfact two\n```\n\nquestion"
        );
    }

    #[test]
    fn blank_context_is_skipped() {
        assert_eq!(build_prompt("question", None, Some("   \n")), "question");
    }

    #[test]
    fn all_three_sections_in_order() {
        let prompt = build_prompt("q", Some("sys"), Some("ctx"));
        assert_eq!(prompt, "sys\n\nRelevant context:\n```\nctx\n```\n\nq");
    }
}
