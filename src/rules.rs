use crate::adapter::AgentType;
use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Payload sent back to the terminal when a rule matches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RuleResponse {
    /// Literal text, submitted with Enter.
    Text(String),
    /// Key-sequence directive, e.g. ["Down", "Enter"].
    Keys(Vec<String>),
}

/// A pattern/response pair auto-answering a recurring interactive prompt.
/// Immutable once pushed to a session; more rules can be appended after
/// spawn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoResponseRule {
    pub pattern: String,
    pub category: String,
    pub response: RuleResponse,
    pub description: String,
    pub safe: bool,
}

impl AutoResponseRule {
    pub fn new(
        pattern: impl Into<String>,
        category: impl Into<String>,
        response: RuleResponse,
        description: impl Into<String>,
        safe: bool,
    ) -> Self {
        Self {
            pattern: pattern.into(),
            category: category.into(),
            response,
            description: description.into(),
            safe,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CompiledRule {
    pub rule: AutoResponseRule,
    pub regex: Regex,
}

impl CompiledRule {
    pub fn compile(rule: AutoResponseRule) -> Result<Self> {
        let regex = Regex::new(&rule.pattern)
            .with_context(|| format!("Failed to compile rule with pattern: {}", rule.pattern))?;
        Ok(Self { rule, regex })
    }
}

/// First matching rule wins; rules are evaluated in push order.
pub fn find_match<'a>(text: &str, rules: &'a [CompiledRule]) -> Option<&'a CompiledRule> {
    rules.iter().find(|rule| rule.regex.is_match(text))
}

/// Default rules for an agent type. These need runtime values (the API key)
/// that are not available when the adapters are built, so they are assembled
/// per spawn and pushed after the spawn call returns.
pub fn default_rules(agent_type: AgentType, gemini_api_key: Option<&str>) -> Vec<AutoResponseRule> {
    match agent_type {
        AgentType::Shell | AgentType::Claude | AgentType::Codex => Vec::new(),
        AgentType::Aider => vec![AutoResponseRule::new(
            r"(?i)add .* to \.gitignore.*\(y\)es/\(n\)o",
            "confirmation",
            RuleResponse::Text("y".to_string()),
            "Confirm aider's offer to add its files to .gitignore",
            true,
        )],
        AgentType::Gemini => match gemini_api_key {
            Some(key) => vec![
                AutoResponseRule::new(
                    r"(?i)how would you like to authenticate",
                    "auth",
                    RuleResponse::Keys(vec!["Down".to_string(), "Enter".to_string()]),
                    "Select 'Use an API key' in the gemini auth menu",
                    true,
                ),
                AutoResponseRule::new(
                    r"(?i)enter your api key",
                    "auth",
                    RuleResponse::Text(key.to_string()),
                    "Supply the configured Gemini API key",
                    false,
                ),
            ],
            None => vec![AutoResponseRule::new(
                r"(?i)how would you like to authenticate",
                "auth",
                RuleResponse::Keys(vec!["Enter".to_string()]),
                "Select browser login in the gemini auth menu",
                true,
            )],
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gemini_rule_count_depends_on_key() {
        assert_eq!(default_rules(AgentType::Gemini, Some("AIza-test")).len(), 2);
        assert_eq!(default_rules(AgentType::Gemini, None).len(), 1);
    }

    #[test]
    fn gemini_key_rule_carries_the_key() {
        let rules = default_rules(AgentType::Gemini, Some("AIza-test"));
        assert_eq!(
            rules[1].response,
            RuleResponse::Text("AIza-test".to_string())
        );
        assert!(!rules[1].safe);
    }

    #[test]
    fn shell_has_no_default_rules() {
        assert!(default_rules(AgentType::Shell, None).is_empty());
        assert!(default_rules(AgentType::Shell, Some("key")).is_empty());
    }

    #[test]
    fn aider_gitignore_rule_matches_prompt() {
        let rules: Vec<CompiledRule> = default_rules(AgentType::Aider, None)
            .into_iter()
            .map(|rule| CompiledRule::compile(rule).unwrap())
            .collect();
        assert_eq!(rules.len(), 1);

        let matched = find_match("Add .aider* to .gitignore (Y)es/(N)o", &rules);
        assert!(matched.is_some());
        assert_eq!(
            matched.unwrap().rule.response,
            RuleResponse::Text("y".to_string())
        );
        assert!(find_match("unrelated output", &rules).is_none());
    }

    #[test]
    fn first_match_wins() {
        let rules = vec![
            CompiledRule::compile(AutoResponseRule::new(
                "continue",
                "confirmation",
                RuleResponse::Text("yes".to_string()),
                "first",
                true,
            ))
            .unwrap(),
            CompiledRule::compile(AutoResponseRule::new(
                "continue\\?",
                "confirmation",
                RuleResponse::Text("no".to_string()),
                "second",
                true,
            ))
            .unwrap(),
        ];
        let matched = find_match("continue?", &rules).unwrap();
        assert_eq!(matched.rule.description, "first");
    }

    #[test]
    fn invalid_pattern_fails_compilation() {
        let result = CompiledRule::compile(AutoResponseRule::new(
            "[invalid",
            "confirmation",
            RuleResponse::Text("y".to_string()),
            "broken",
            true,
        ));
        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("Failed to compile rule with pattern"));
    }
}
