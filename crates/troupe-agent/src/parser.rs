//! Agent output parsing and classification.
//!
//! Model output is decoded strictly as JSON first. If that fails, one
//! relaxed grammar is tried: JSON plus unquoted identifier keys,
//! single-quoted strings, trailing commas, and a single surrounding
//! markdown fence. Anything the relaxed grammar cannot consume in full
//! is unparsable; no partial objects are ever produced.

use serde::Deserialize;
use serde_json::{Map, Number, Value};

use troupe_core::error::{Result, TroupeError};

/// Action name an agent uses to reason with itself.
pub const SELF_QUESTION_ACTION: &str = "self_question";

/// The fields an agent is asked to emit. Unknown fields are ignored.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentOutput {
    #[serde(default)]
    pub thought: Option<Value>,
    #[serde(default)]
    pub action: Option<Value>,
    #[serde(default)]
    pub action_input: Option<Value>,
    #[serde(default)]
    pub observation: Option<Value>,
    #[serde(default)]
    pub is_final_answer_ready: Option<Value>,
    #[serde(default)]
    pub final_answer: Option<Value>,
}

/// What the agent did in one iteration.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentStep {
    /// Neither strict nor relaxed decoding produced an object.
    Unparsable,
    FinalAnswer { answer: String },
    /// Reasoning step without a question attached.
    Thought { thought: String },
    /// The agent poses itself a question to answer next.
    SelfQuestion { question: String },
    ToolAction { tool: String, input: Value },
    Observation { observation: String },
    /// Parsed, but matches no known shape.
    Anomalous,
}

/// Decode raw model output into an [`AgentOutput`].
pub fn parse_output(raw: &str) -> Result<AgentOutput> {
    let value = match serde_json::from_str::<Value>(raw.trim()) {
        Ok(value @ Value::Object(_)) => value,
        _ => relaxed(strip_fence(raw))?,
    };
    if !value.is_object() {
        return Err(TroupeError::Parse("top-level value is not an object".into()));
    }
    Ok(serde_json::from_value(value)?)
}

/// Parse and classify in one step.
pub fn classify(raw: &str) -> AgentStep {
    match parse_output(raw) {
        Ok(output) => output.step(),
        Err(_) => AgentStep::Unparsable,
    }
}

impl AgentOutput {
    /// Classify by priority: final answer, thought, self-question,
    /// tool action, observation, anomalous.
    pub fn step(&self) -> AgentStep {
        if let Some(answer) = present(&self.final_answer) {
            return AgentStep::FinalAnswer {
                answer: stringify(answer),
            };
        }

        let action = present(&self.action).map(stringify);
        let thought = present(&self.thought).map(stringify);
        let action_input = present(&self.action_input);

        if action.as_deref() == Some(SELF_QUESTION_ACTION) {
            return match (thought, action_input) {
                (Some(thought), None) => AgentStep::Thought { thought },
                (thought, input) => match input
                    .map(question_text)
                    .filter(|q| !q.is_empty())
                    .or(thought)
                {
                    Some(question) => AgentStep::SelfQuestion { question },
                    None => AgentStep::Anomalous,
                },
            };
        }

        if let Some(tool) = action {
            return AgentStep::ToolAction {
                tool,
                input: self.action_input.clone().unwrap_or(Value::Null),
            };
        }

        if let Some(observation) = present(&self.observation) {
            return AgentStep::Observation {
                observation: stringify(observation),
            };
        }

        AgentStep::Anomalous
    }
}

fn present(field: &Option<Value>) -> Option<&Value> {
    field.as_ref().filter(|v| !v.is_null())
}

/// Strings verbatim, everything else as compact JSON.
pub fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// `{"question": "..."}` or any single string value; otherwise the JSON.
fn question_text(input: &Value) -> String {
    match input {
        Value::Object(map) if map.is_empty() => String::new(),
        Value::Object(map) => map
            .get("question")
            .or_else(|| if map.len() == 1 { map.values().next() } else { None })
            .map(stringify)
            .unwrap_or_else(|| input.to_string()),
        other => stringify(other),
    }
}

/// Remove one surrounding ```` ``` ```` fence, with or without a language tag.
fn strip_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let Some(body) = rest.strip_suffix("```") else {
        return trimmed;
    };
    match body.find('\n') {
        Some(nl) if body[..nl].trim().chars().all(|c| c.is_ascii_alphanumeric()) => {
            body[nl + 1..].trim()
        }
        _ => body.trim(),
    }
}

fn relaxed(input: &str) -> Result<Value> {
    let mut parser = Relaxed {
        chars: input.chars().collect(),
        pos: 0,
        depth: 0,
    };
    parser.skip_ws();
    let value = parser.value()?;
    parser.skip_ws();
    if parser.pos != parser.chars.len() {
        return Err(parser.error("trailing characters"));
    }
    Ok(value)
}

/// Same nesting limit as serde_json.
const MAX_DEPTH: usize = 128;

/// Recursive-descent parser for the relaxed grammar.
struct Relaxed {
    chars: Vec<char>,
    pos: usize,
    depth: usize,
}

impl Relaxed {
    fn error(&self, what: &str) -> TroupeError {
        TroupeError::Parse(format!("{what} at offset {}", self.pos))
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += 1;
        Some(c)
    }

    fn expect(&mut self, want: char) -> Result<()> {
        match self.bump() {
            Some(c) if c == want => Ok(()),
            _ => Err(self.error(&format!("expected '{want}'"))),
        }
    }

    fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(c) if c.is_whitespace()) {
            self.pos += 1;
        }
    }

    fn value(&mut self) -> Result<Value> {
        match self.peek() {
            Some('{') => self.nested(Self::object),
            Some('[') => self.nested(Self::array),
            Some(q @ ('"' | '\'')) => self.string(q).map(Value::String),
            Some(c) if c == '-' || c.is_ascii_digit() => self.number(),
            Some(c) if is_ident_start(c) => match self.ident().as_str() {
                "true" => Ok(Value::Bool(true)),
                "false" => Ok(Value::Bool(false)),
                "null" => Ok(Value::Null),
                _ => Err(self.error("bare word is not a value")),
            },
            _ => Err(self.error("expected a value")),
        }
    }

    fn nested(&mut self, parse: fn(&mut Self) -> Result<Value>) -> Result<Value> {
        if self.depth >= MAX_DEPTH {
            return Err(self.error("nesting too deep"));
        }
        self.depth += 1;
        let value = parse(self);
        self.depth -= 1;
        value
    }

    fn object(&mut self) -> Result<Value> {
        self.expect('{')?;
        let mut map = Map::new();
        loop {
            self.skip_ws();
            if self.peek() == Some('}') {
                self.pos += 1;
                return Ok(Value::Object(map));
            }
            let key = match self.peek() {
                Some(q @ ('"' | '\'')) => self.string(q)?,
                Some(c) if is_ident_start(c) => self.ident(),
                _ => return Err(self.error("expected a key")),
            };
            self.skip_ws();
            self.expect(':')?;
            self.skip_ws();
            let value = self.value()?;
            map.insert(key, value);
            self.skip_ws();
            match self.bump() {
                Some(',') => continue,
                Some('}') => return Ok(Value::Object(map)),
                _ => return Err(self.error("expected ',' or '}'")),
            }
        }
    }

    fn array(&mut self) -> Result<Value> {
        self.expect('[')?;
        let mut items = Vec::new();
        loop {
            self.skip_ws();
            if self.peek() == Some(']') {
                self.pos += 1;
                return Ok(Value::Array(items));
            }
            items.push(self.value()?);
            self.skip_ws();
            match self.bump() {
                Some(',') => continue,
                Some(']') => return Ok(Value::Array(items)),
                _ => return Err(self.error("expected ',' or ']'")),
            }
        }
    }

    fn string(&mut self, quote: char) -> Result<String> {
        self.expect(quote)?;
        let mut out = String::new();
        loop {
            match self.bump() {
                None => return Err(self.error("unterminated string")),
                Some(c) if c == quote => return Ok(out),
                Some('\\') => {
                    let escaped = match self.bump() {
                        Some('n') => '\n',
                        Some('t') => '\t',
                        Some('r') => '\r',
                        Some('b') => '\u{8}',
                        Some('f') => '\u{c}',
                        Some('u') => self.unicode_escape()?,
                        Some(c @ ('"' | '\'' | '\\' | '/')) => c,
                        _ => return Err(self.error("invalid escape")),
                    };
                    out.push(escaped);
                }
                Some(c) => out.push(c),
            }
        }
    }

    fn unicode_escape(&mut self) -> Result<char> {
        let high = self.hex4()?;
        if !(0xD800..0xDC00).contains(&high) {
            return char::from_u32(high).ok_or_else(|| self.error("invalid code point"));
        }
        // Surrogate pair
        if self.bump() != Some('\\') || self.bump() != Some('u') {
            return Err(self.error("unpaired surrogate"));
        }
        let low = self.hex4()?;
        if !(0xDC00..0xE000).contains(&low) {
            return Err(self.error("invalid low surrogate"));
        }
        let code = 0x10000 + ((high - 0xD800) << 10) + (low - 0xDC00);
        char::from_u32(code).ok_or_else(|| self.error("invalid code point"))
    }

    fn hex4(&mut self) -> Result<u32> {
        let mut code = 0;
        for _ in 0..4 {
            let digit = self
                .bump()
                .and_then(|c| c.to_digit(16))
                .ok_or_else(|| self.error("invalid unicode escape"))?;
            code = code * 16 + digit;
        }
        Ok(code)
    }

    fn number(&mut self) -> Result<Value> {
        let start = self.pos;
        while matches!(self.peek(), Some(c) if c.is_ascii_digit() || matches!(c, '-' | '+' | '.' | 'e' | 'E'))
        {
            self.pos += 1;
        }
        let text: String = self.chars[start..self.pos].iter().collect();
        match serde_json::from_str::<Number>(&text) {
            Ok(n) => Ok(Value::Number(n)),
            Err(_) => Err(self.error("invalid number")),
        }
    }

    fn ident(&mut self) -> String {
        let start = self.pos;
        while matches!(self.peek(), Some(c) if c.is_alphanumeric() || c == '_' || c == '$') {
            self.pos += 1;
        }
        self.chars[start..self.pos].iter().collect()
    }
}

fn is_ident_start(c: char) -> bool {
    c.is_alphabetic() || c == '_' || c == '$'
}
