//! Role-tagged prompt templates.
//!
//! A [`PromptTemplate`] is a list of `(role, template)` pairs rendered with
//! `{name}` placeholders. `{{` and `}}` produce literal braces, which keeps
//! JSON examples inside prompts intact. Partial variables (typically parser
//! format instructions) are bound at build time; the remaining variables are
//! supplied per call.

use std::collections::{BTreeSet, HashMap};

use crate::{
    backend::{ChatMessage, Role},
    error::Result,
    exec_ctx::ExecCtx,
    stage::{BoxFut, Stage},
    PipelineError,
};

/// Per-call template variables.
pub type Vars = HashMap<String, String>;

/// Build a [`Vars`] map from pairs.
///
/// ```
/// let vars = llm_runnables::prompt::vars([("topic", "rust")]);
/// assert_eq!(vars["topic"], "rust");
/// ```
pub fn vars<I, K, V>(pairs: I) -> Vars
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<String>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}

/// Segment of a parsed template.
#[derive(Debug, Clone, PartialEq)]
enum Piece {
    Text(String),
    Var(String),
}

fn parse_template(template: &str) -> Result<Vec<Piece>> {
    let mut pieces = Vec::new();
    let mut text = String::new();
    let mut chars = template.chars().peekable();

    while let Some(ch) = chars.next() {
        match ch {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                text.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                text.push('}');
            }
            '{' => {
                let mut name = String::new();
                loop {
                    match chars.next() {
                        Some('}') => break,
                        Some(c) => name.push(c),
                        None => {
                            return Err(PipelineError::InvalidConfig(format!(
                                "unclosed placeholder in template: {{{}",
                                name
                            )))
                        }
                    }
                }
                let name = name.trim().to_string();
                if name.is_empty() {
                    return Err(PipelineError::InvalidConfig(
                        "empty placeholder {} in template".into(),
                    ));
                }
                if !text.is_empty() {
                    pieces.push(Piece::Text(std::mem::take(&mut text)));
                }
                pieces.push(Piece::Var(name));
            }
            c => text.push(c),
        }
    }
    if !text.is_empty() {
        pieces.push(Piece::Text(text));
    }
    Ok(pieces)
}

/// Render a single template string against `vars`.
///
/// # Example
///
/// ```
/// use llm_runnables::prompt::{render, vars};
///
/// let out = render("Hello {name}, JSON: {{\"k\": 1}}", &vars([("name", "Alice")])).unwrap();
/// assert_eq!(out, r#"Hello Alice, JSON: {"k": 1}"#);
/// ```
pub fn render(template: &str, vars: &Vars) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    for piece in parse_template(template)? {
        match piece {
            Piece::Text(t) => out.push_str(&t),
            Piece::Var(name) => match vars.get(&name) {
                Some(value) => out.push_str(value),
                None => {
                    return Err(PipelineError::InvalidConfig(format!(
                        "missing template variable '{}'",
                        name
                    )))
                }
            },
        }
    }
    Ok(out)
}

/// A chat prompt: role-tagged message templates plus optional few-shot pairs.
///
/// As a stage it maps [`Vars`] (or a bare `String`, bound to `{input}`) to the
/// rendered message list.
///
/// # Example
///
/// ```
/// use llm_runnables::prompt::PromptTemplate;
///
/// let prompt = PromptTemplate::new("names")
///     .system("You are a helpful assistant.\n{format_instructions}")
///     .user("Suggest names for {count} twins.")
///     .partial("format_instructions", "Reply in JSON.");
/// assert_eq!(prompt.input_variables(), vec!["count"]);
/// ```
#[derive(Debug, Clone)]
pub struct PromptTemplate {
    name: String,
    messages: Vec<(Role, String)>,
    examples: Vec<(String, String)>,
    partials: Vars,
}

impl PromptTemplate {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            messages: Vec::new(),
            examples: Vec::new(),
            partials: Vars::new(),
        }
    }

    /// Shorthand for a single user message template.
    pub fn from_template(name: impl Into<String>, template: impl Into<String>) -> Self {
        Self::new(name).user(template)
    }

    pub fn message(mut self, role: Role, template: impl Into<String>) -> Self {
        self.messages.push((role, template.into()));
        self
    }

    pub fn system(self, template: impl Into<String>) -> Self {
        self.message(Role::System, template)
    }

    pub fn user(self, template: impl Into<String>) -> Self {
        self.message(Role::User, template)
    }

    pub fn assistant(self, template: impl Into<String>) -> Self {
        self.message(Role::Assistant, template)
    }

    /// Add a few-shot example, rendered as a user/assistant exchange right
    /// after the leading system messages. Examples are literal text.
    pub fn example(mut self, input: impl Into<String>, output: impl Into<String>) -> Self {
        self.examples.push((input.into(), output.into()));
        self
    }

    /// Bind a variable once, at build time.
    pub fn partial(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.partials.insert(key.into(), value.into());
        self
    }

    /// Variables a caller still has to supply, sorted.
    pub fn input_variables(&self) -> Vec<String> {
        let mut names = BTreeSet::new();
        for (_, template) in &self.messages {
            if let Ok(pieces) = parse_template(template) {
                for piece in pieces {
                    if let Piece::Var(name) = piece {
                        if !self.partials.contains_key(&name) {
                            names.insert(name);
                        }
                    }
                }
            }
        }
        names.into_iter().collect()
    }

    /// Render into a message list.
    pub fn format(&self, vars: &Vars) -> Result<Vec<ChatMessage>> {
        self.format_with_history(vars, &[])
    }

    /// Render, splicing prior conversation turns in before the final message.
    ///
    /// When the template has no message after its leading system block, the
    /// examples and the history go at the end instead.
    pub fn format_with_history(
        &self,
        vars: &Vars,
        history: &[ChatMessage],
    ) -> Result<Vec<ChatMessage>> {
        let mut merged = self.partials.clone();
        merged.extend(vars.iter().map(|(k, v)| (k.clone(), v.clone())));

        let total = self.messages.len();
        let leading_system = self
            .messages
            .iter()
            .take_while(|(role, _)| *role == Role::System)
            .count();
        let history_at = if leading_system == total { total } else { total - 1 };

        let mut out = Vec::with_capacity(total + self.examples.len() * 2 + history.len());
        for i in 0..=total {
            if i == leading_system {
                for (input, output) in &self.examples {
                    out.push(ChatMessage::user(input.clone()));
                    out.push(ChatMessage::assistant(output.clone()));
                }
            }
            if i == history_at {
                out.extend(history.iter().cloned());
            }
            if let Some((role, template)) = self.messages.get(i) {
                out.push(ChatMessage::new(*role, render(template, &merged)?));
            }
        }
        Ok(out)
    }
}

impl Stage<Vars> for PromptTemplate {
    type Output = Vec<ChatMessage>;

    fn name(&self) -> &str {
        &self.name
    }

    fn invoke<'a>(&'a self, _ctx: &'a ExecCtx, input: Vars) -> BoxFut<'a, Result<Vec<ChatMessage>>>
    where
        Vars: 'a,
    {
        let result = self.format(&input);
        Box::pin(async move { result })
    }
}

impl Stage<String> for PromptTemplate {
    type Output = Vec<ChatMessage>;

    fn name(&self) -> &str {
        &self.name
    }

    fn invoke<'a>(&'a self, _ctx: &'a ExecCtx, input: String) -> BoxFut<'a, Result<Vec<ChatMessage>>>
    where
        String: 'a,
    {
        let result = self.format(&vars([("input", input)]));
        Box::pin(async move { result })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_basic() {
        let out = render("Hello {name}, process {input}", &vars([("name", "Alice"), ("input", "data")]))
            .unwrap();
        assert_eq!(out, "Hello Alice, process data");
    }

    #[test]
    fn test_render_escaped_braces() {
        let out = render("Output format: {{\"result\": {{\"value\": 42}}}}", &Vars::new()).unwrap();
        assert_eq!(out, r#"Output format: {"result": {"value": 42}}"#);
    }

    #[test]
    fn test_render_missing_variable() {
        let err = render("Hi {who}", &Vars::new()).unwrap_err();
        assert!(err.to_string().contains("'who'"));
    }

    #[test]
    fn test_render_value_braces_not_reinterpreted() {
        let out = render("{a}", &vars([("a", "{b}")])).unwrap();
        assert_eq!(out, "{b}");
    }

    #[test]
    fn test_unclosed_placeholder() {
        assert!(matches!(
            render("oops {name", &Vars::new()),
            Err(PipelineError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_partials_and_input_variables() {
        let prompt = PromptTemplate::new("p")
            .system("Rules: {format_instructions}")
            .user("Topic: {topic} for {audience}")
            .partial("format_instructions", "JSON only");
        assert_eq!(prompt.input_variables(), vec!["audience", "topic"]);

        let msgs = prompt
            .format(&vars([("topic", "tides"), ("audience", "kids")]))
            .unwrap();
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].role, Role::System);
        assert_eq!(msgs[0].content, "Rules: JSON only");
        assert_eq!(msgs[1].content, "Topic: tides for kids");
    }

    #[test]
    fn test_few_shot_examples_follow_system() {
        let prompt = PromptTemplate::new("antonyms")
            .system("Give the antonym.")
            .example("happy", "sad")
            .example("tall", "short")
            .user("{input}");
        let msgs = prompt.format(&vars([("input", "big")])).unwrap();
        let roles: Vec<Role> = msgs.iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            vec![Role::System, Role::User, Role::Assistant, Role::User, Role::Assistant, Role::User]
        );
        assert_eq!(msgs[2].content, "sad");
        assert_eq!(msgs[5].content, "big");
    }

    #[test]
    fn test_history_precedes_last_message() {
        let prompt = PromptTemplate::new("chat").system("Be brief.").user("{input}");
        let history = vec![ChatMessage::user("Hi, I'm Sam"), ChatMessage::assistant("Hello Sam")];
        let msgs = prompt
            .format_with_history(&vars([("input", "What's my name?")]), &history)
            .unwrap();
        assert_eq!(msgs.len(), 4);
        assert_eq!(msgs[1].content, "Hi, I'm Sam");
        assert_eq!(msgs[3].content, "What's my name?");
    }

    #[test]
    fn test_system_only_template_keeps_examples_and_history() {
        let prompt = PromptTemplate::new("persona")
            .system("You translate {lang}.")
            .example("cat", "chat");
        let history = vec![ChatMessage::user("dog")];
        let msgs = prompt
            .format_with_history(&vars([("lang", "English to French")]), &history)
            .unwrap();
        let contents: Vec<&str> = msgs.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["You translate English to French.", "cat", "chat", "dog"]);
    }

    #[test]
    fn test_empty_template_still_carries_history() {
        let history = vec![ChatMessage::user("Hi"), ChatMessage::assistant("Hello")];
        let msgs = PromptTemplate::new("empty")
            .format_with_history(&Vars::new(), &history)
            .unwrap();
        assert_eq!(msgs, history);
    }

    #[tokio::test]
    async fn test_string_input_binds_input_variable() {
        let ctx = crate::exec_ctx::mock_ctx(crate::backend::MockBackend::fixed("unused"));
        let prompt = PromptTemplate::from_template("t", "Summarize: {input}");
        let msgs = Stage::<String>::invoke(&prompt, &ctx, "tides".to_string())
            .await
            .unwrap();
        assert_eq!(msgs[0].content, "Summarize: tides");
    }
}
