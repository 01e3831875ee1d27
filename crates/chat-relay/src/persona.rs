//! Built-in personas: role keys mapped to system-prompt text
//!
//! The registry is built once at startup from [`DEFAULT_PERSONAS`] and is
//! read-only afterwards. Key order follows the static table.

/// Persona used when a chat turn names no role
pub const DEFAULT_PERSONA_KEY: &str = "chatgpt";

/// Static persona table, in the order reported to clients
pub const DEFAULT_PERSONAS: &[(&str, &str)] = &[
    (
        "chatgpt",
        "You are ChatGPT, a large language model trained by OpenAI. Follow the user's instructions carefully. Respond using markdown.",
    ),
    (
        "translator",
        r#"I want you to act as a translator. I will speak to you in any language and you will detect the language, translate it and answer in the corrected and improved version of my text. Keep the meaning the same, but make it more literary. Only reply with the correction and the improvements, nothing else, no explanations."#,
    ),
    (
        "programmer",
        r#"You are an expert software engineer. Answer with working, idiomatic code and a short explanation. When the question is ambiguous, state the assumption you made before answering."#,
    ),
    (
        "writer",
        r#"I want you to act as a writing assistant. Improve the clarity, structure and tone of the text I give you while keeping my voice. Point out anything that reads awkwardly."#,
    ),
    (
        "interviewer",
        r#"I want you to act as an interviewer. I will be the candidate and you will ask me the interview questions for the position I name. Ask one question at a time and wait for my answer. Do not write explanations."#,
    ),
];

/// A single registered persona
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Persona {
    pub key: String,
    pub prompt_text: String,
}

/// Read-only key → system-prompt lookup
#[derive(Debug, Clone)]
pub struct PersonaRegistry {
    entries: Vec<Persona>,
}

impl PersonaRegistry {
    /// Build a registry from `(key, prompt)` pairs, keeping their order
    ///
    /// A repeated key keeps its first position and takes the last prompt.
    pub fn from_entries<I, K, V>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut registry: Vec<Persona> = Vec::new();
        for (key, prompt) in entries {
            let key = key.into();
            let prompt_text = prompt.into();
            match registry.iter_mut().find(|p| p.key == key) {
                Some(existing) => existing.prompt_text = prompt_text,
                None => registry.push(Persona { key, prompt_text }),
            }
        }
        Self { entries: registry }
    }

    /// Look up the prompt text for a role key
    pub fn lookup(&self, key: &str) -> Option<&str> {
        if key.trim().is_empty() {
            return None;
        }
        self.entries
            .iter()
            .find(|p| p.key == key)
            .map(|p| p.prompt_text.as_str())
    }

    /// Registered keys in table order
    pub fn list_keys(&self) -> Vec<String> {
        self.entries.iter().map(|p| p.key.clone()).collect()
    }

    /// Resolve the system message for a chat turn
    ///
    /// A registered key yields its prompt. An unregistered, non-blank key is
    /// used verbatim as the system message. No key (or a blank one) falls back
    /// to the default persona.
    pub fn resolve(&self, key: Option<&str>) -> String {
        match key.filter(|k| !k.trim().is_empty()) {
            Some(key) => self
                .lookup(key)
                .map(str::to_string)
                .unwrap_or_else(|| key.to_string()),
            None => self
                .lookup(DEFAULT_PERSONA_KEY)
                .unwrap_or_default()
                .to_string(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for PersonaRegistry {
    fn default() -> Self {
        Self::from_entries(DEFAULT_PERSONAS.iter().copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_registry_contains_chatgpt_first() {
        let registry = PersonaRegistry::default();
        let keys = registry.list_keys();
        assert_eq!(keys[0], "chatgpt");
        assert_eq!(keys.len(), DEFAULT_PERSONAS.len());
    }

    #[test]
    fn test_lookup_known_and_unknown() {
        let registry = PersonaRegistry::default();
        assert!(registry.lookup("translator").unwrap().contains("translator"));
        assert_eq!(registry.lookup("nope"), None);
        assert_eq!(registry.lookup(""), None);
    }

    #[test]
    fn test_resolve_registered_key() {
        let registry = PersonaRegistry::from_entries([("pirate", "Talk like a pirate.")]);
        assert_eq!(registry.resolve(Some("pirate")), "Talk like a pirate.");
    }

    #[test]
    fn test_resolve_unknown_key_is_literal() {
        let registry = PersonaRegistry::default();
        assert_eq!(
            registry.resolve(Some("You are a terse assistant.")),
            "You are a terse assistant."
        );
    }

    #[test]
    fn test_resolve_missing_or_blank_key_uses_default() {
        let registry = PersonaRegistry::default();
        let default = registry.lookup(DEFAULT_PERSONA_KEY).unwrap().to_string();
        assert_eq!(registry.resolve(None), default);
        assert_eq!(registry.resolve(Some("  ")), default);
    }

    #[test]
    fn test_list_keys_preserves_insertion_order() {
        let registry = PersonaRegistry::from_entries([("b", "2"), ("a", "1"), ("c", "3"), ("a", "4")]);
        assert_eq!(registry.list_keys(), vec!["b", "a", "c"]);
        assert_eq!(registry.lookup("a"), Some("4"));
        assert_eq!(registry.len(), 3);
    }
}
