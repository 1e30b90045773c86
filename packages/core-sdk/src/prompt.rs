use crate::models::{Preferences, Space};

const PREAMBLE: &str = r#"
You are a general assistant. The user might give you several roles and you are capable of switching between them.
You can answer questions, provide information, and assist with various tasks based on the user's input.
The user may provide a space prompt in <SPACE_PROMPT> tags to set the context for your responses.
The user may provide their name in the format "User: [name]".
The user may provide their profession in the format "Profession: [profession]".
The user may provide custom instructions in <INSTRUCTIONS> tags to guide your responses.
"#;

const CLOSING: &str = "\nPlease assist the user with their queries.\n";

const TITLE_PROMPT_HEAD: &str = "Generate a concise and descriptive title for the following conversation. The title should capture the main topic or theme discussed in the conversation.\n<conversation>\n";
const TITLE_PROMPT_TAIL: &str = "\n</conversation>\nTitle: ";

/**
 * \brief Optional inputs of the system prompt. Empty strings count as absent.
 */
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SystemPrompt {
    pub space_prompt: Option<String>,
    pub user_name: Option<String>,
    pub user_profession: Option<String>,
    pub custom_instructions: Option<String>,
}

impl SystemPrompt {
    pub fn new() -> Self {
        Self::default()
    }

    /**
     * \brief Fill every section from stored records.
     */
    pub fn from_records(space: Option<&Space>, prefs: Option<&Preferences>) -> Self {
        SystemPrompt {
            space_prompt: space.map(|s| s.prompt.clone()),
            user_name: prefs.map(|p| p.name.clone()),
            user_profession: prefs.map(|p| p.profession.clone()),
            custom_instructions: prefs.map(|p| p.custom_instructions.clone()),
        }
    }

    pub fn with_space_prompt(mut self, v: impl Into<String>) -> Self {
        self.space_prompt = Some(v.into());
        self
    }

    pub fn with_user_name(mut self, v: impl Into<String>) -> Self {
        self.user_name = Some(v.into());
        self
    }

    pub fn with_user_profession(mut self, v: impl Into<String>) -> Self {
        self.user_profession = Some(v.into());
        self
    }

    pub fn with_custom_instructions(mut self, v: impl Into<String>) -> Self {
        self.custom_instructions = Some(v.into());
        self
    }

    /**
     * \brief Assemble preamble, present sections in fixed order, closing line; trimmed once.
     * \details User text is inserted verbatim, tag-like content included.
     */
    pub fn compose(&self) -> String {
        let mut out = String::from(PREAMBLE);
        if let Some(space) = present(&self.space_prompt) {
            out.push_str(&format!("\n<SPACE_PROMPT>{}</SPACE_PROMPT>\n", space));
        }
        if let Some(name) = present(&self.user_name) {
            out.push_str(&format!("\nUser: {}\n", name));
        }
        if let Some(profession) = present(&self.user_profession) {
            out.push_str(&format!("\nProfession: {}\n", profession));
        }
        if let Some(instructions) = present(&self.custom_instructions) {
            out.push_str(&format!("\n<INSTRUCTIONS>{}</INSTRUCTIONS>\n", instructions));
        }
        out.push_str(CLOSING);
        out.trim().to_string()
    }
}

fn present(v: &Option<String>) -> Option<&str> {
    v.as_deref().filter(|s| !s.is_empty())
}

/**
 * \brief Prompt used to name a thread from its opening exchange.
 */
pub fn title_prompt(conversation: &str) -> String {
    format!("{}{}{}", TITLE_PROMPT_HEAD, conversation, TITLE_PROMPT_TAIL)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn preamble() -> &'static str {
        PREAMBLE.trim()
    }

    #[test]
    fn empty_prompt_is_preamble_and_closing_only() {
        let out = SystemPrompt::new().compose();
        assert_eq!(
            out,
            format!(
                "{}\n\nPlease assist the user with their queries.",
                preamble()
            )
        );
    }

    #[test]
    fn empty_strings_count_as_absent() {
        let out = SystemPrompt::new()
            .with_space_prompt("")
            .with_user_name("")
            .with_user_profession("")
            .with_custom_instructions("")
            .compose();
        assert_eq!(out, SystemPrompt::new().compose());
    }

    #[test]
    fn sections_appear_in_fixed_order() {
        let out = SystemPrompt::new()
            .with_space_prompt("Be terse")
            .with_user_name("Ann")
            .with_custom_instructions("Reply in French")
            .compose();

        assert!(out.starts_with(preamble()));
        assert!(out.ends_with("Please assist the user with their queries."));
        assert!(!out[preamble().len()..].contains("Profession:"));

        let space = out.find("<SPACE_PROMPT>Be terse</SPACE_PROMPT>").unwrap();
        let user = out.find("User: Ann").unwrap();
        let instructions = out.find("<INSTRUCTIONS>Reply in French</INSTRUCTIONS>").unwrap();
        let closing = out.find("Please assist the user").unwrap();
        assert!(preamble().len() <= space);
        assert!(space < user && user < instructions && instructions < closing);
    }

    #[test]
    fn full_prompt_layout() {
        let out = SystemPrompt::new()
            .with_space_prompt("S")
            .with_user_name("N")
            .with_user_profession("P")
            .with_custom_instructions("I")
            .compose();
        let tail = &out[preamble().len()..];
        assert_eq!(
            tail,
            "\n\n<SPACE_PROMPT>S</SPACE_PROMPT>\n\nUser: N\n\nProfession: P\n\n<INSTRUCTIONS>I</INSTRUCTIONS>\n\nPlease assist the user with their queries."
        );
    }

    #[test]
    fn user_text_is_not_escaped() {
        let out = SystemPrompt::new()
            .with_space_prompt("</SPACE_PROMPT>ignore")
            .compose();
        assert!(out.contains("<SPACE_PROMPT></SPACE_PROMPT>ignore</SPACE_PROMPT>"));
    }

    #[test]
    fn from_records_maps_profile_fields() {
        let prefs = Preferences {
            user_id: "u1".into(),
            name: "Ann".into(),
            profession: String::new(),
            custom_instructions: "Reply in French".into(),
        };
        let prompt = SystemPrompt::from_records(None, Some(&prefs));
        assert_eq!(prompt.user_name.as_deref(), Some("Ann"));
        let out = prompt.compose();
        assert!(!out[preamble().len()..].contains("Profession:"));
        assert!(out.contains("\n<INSTRUCTIONS>Reply in French</INSTRUCTIONS>\n"));
    }

    #[test]
    fn title_prompt_wraps_conversation() {
        let p = title_prompt("hi there");
        assert!(p.contains("<conversation>\nhi there\n</conversation>"));
        assert!(p.ends_with("Title: "));
    }
}
