//! The tokenizer worker thread.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::mpsc as std_mpsc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use log::{debug, warn};
use syntect::parsing::{
    ParseState, Scope, ScopeStack, SyntaxDefinition, SyntaxReference, SyntaxSet,
};
use syntect::util::LinesWithEndings;
use tokio::sync::mpsc;

use super::job::{GrammarMap, ScopedToken, TokenizeJob, TokenizeResult};
use super::message::{InboundMessage, OutboundMessage, OutboundPayload, ReplyPayload};
use crate::theme::{ThemeRegistry, compute_style_for_scopes};

/// Handle to a running worker thread.
///
/// Dropping the handle closes the inbox; the thread exits after finishing
/// the message it is working on.
pub(crate) struct WorkerHandle {
    pub(crate) generation: u64,
    inbox: std_mpsc::Sender<OutboundMessage>,
    _thread: JoinHandle<()>,
}

impl WorkerHandle {
    pub(crate) fn spawn(
        generation: u64,
        themes: Arc<ThemeRegistry>,
        replies: mpsc::UnboundedSender<InboundMessage>,
    ) -> std::io::Result<Self> {
        let (inbox, rx) = std_mpsc::channel();
        let thread = std::thread::Builder::new()
            .name(format!("tincture-tokenizer-{generation}"))
            .spawn(move || worker_loop(rx, replies, themes))?;

        Ok(Self {
            generation,
            inbox,
            _thread: thread,
        })
    }

    /// Hand a message to the worker. Gives the message back if the worker is gone.
    pub(crate) fn send(&self, message: OutboundMessage) -> Result<(), OutboundMessage> {
        self.inbox.send(message).map_err(|e| e.0)
    }
}

fn worker_loop(
    inbox: std_mpsc::Receiver<OutboundMessage>,
    replies: mpsc::UnboundedSender<InboundMessage>,
    themes: Arc<ThemeRegistry>,
) {
    let mut tokenizer = Tokenizer::new(themes);

    while let Ok(OutboundMessage { id, payload }) = inbox.recv() {
        let op = payload.op();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| tokenizer.handle(payload)));

        let reply = match outcome {
            Ok(Ok(payload)) => InboundMessage::Ok { id, op, payload },
            Ok(Err(error)) => InboundMessage::Error { id, op, error },
            Err(panic) => {
                let error = panic_message(panic.as_ref());
                let _ = replies.send(InboundMessage::Fatal { error });
                return;
            }
        };

        if replies.send(reply).is_err() {
            debug!(
                target: "tincture::tokenize::worker",
                "Reply channel closed, worker exiting"
            );
            return;
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "worker panicked".to_string()
    }
}

/// Worker-side state: the syntax set and the registered grammar ids.
pub(crate) struct Tokenizer {
    syntax_set: SyntaxSet,
    /// Registered grammar id -> syntax name inside `syntax_set`.
    grammar_names: HashMap<String, String>,
    themes: Arc<ThemeRegistry>,
}

impl Tokenizer {
    pub(crate) fn new(themes: Arc<ThemeRegistry>) -> Self {
        Self {
            syntax_set: SyntaxSet::load_defaults_newlines(),
            grammar_names: HashMap::new(),
            themes,
        }
    }

    fn handle(&mut self, payload: OutboundPayload) -> Result<ReplyPayload, String> {
        match payload {
            OutboundPayload::Init(grammars) => self
                .register_grammars(grammars)
                .map(|grammar_count| ReplyPayload::Initialized { grammar_count }),
            OutboundPayload::Tokenize(job) => self.tokenize(job).map(ReplyPayload::Tokenized),
            #[cfg(test)]
            OutboundPayload::Crash => panic!("simulated worker crash"),
        }
    }

    /// Replace the registered grammars. All-or-nothing: a bad grammar leaves
    /// the previous set in place.
    pub(crate) fn register_grammars(&mut self, grammars: GrammarMap) -> Result<usize, String> {
        let mut entries: Vec<(String, String)> = grammars.into_iter().collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));

        let mut builder = SyntaxSet::load_defaults_newlines().into_builder();
        let mut names = HashMap::with_capacity(entries.len());
        for (id, source) in entries {
            let definition = SyntaxDefinition::load_from_str(&source, true, Some(&id))
                .map_err(|e| format!("grammar '{id}': {e:?}"))?;
            names.insert(id, definition.name.clone());
            builder.add(definition);
        }

        self.syntax_set = builder.build();
        self.grammar_names = names;
        debug!(
            target: "tincture::tokenize::worker",
            "Registered {} grammars",
            self.grammar_names.len()
        );
        Ok(self.grammar_names.len())
    }

    /// Registered id first, then scope name (`source.rust`), then syntect's
    /// token lookup (extension or name).
    fn find_syntax(&self, grammar_id: &str) -> Option<&SyntaxReference> {
        self.grammar_names
            .get(grammar_id)
            .and_then(|name| self.syntax_set.find_syntax_by_name(name))
            .or_else(|| {
                Scope::new(grammar_id)
                    .ok()
                    .and_then(|scope| self.syntax_set.find_syntax_by_scope(scope))
            })
            .or_else(|| self.syntax_set.find_syntax_by_token(grammar_id))
    }

    pub(crate) fn tokenize(&self, job: TokenizeJob) -> Result<TokenizeResult, String> {
        let syntax = self
            .find_syntax(&job.grammar_id)
            .ok_or_else(|| format!("unknown grammar '{}'", job.grammar_id))?;
        let theme = match job.theme_id.as_deref() {
            Some(id) => Some(
                self.themes
                    .get(id)
                    .ok_or_else(|| format!("unknown theme '{id}'"))?,
            ),
            None => None,
        };
        let deadline = job
            .time_limit_ms
            .map(|millis| Instant::now() + Duration::from_millis(millis));

        let mut state = ParseState::new(syntax);
        let mut stack = ScopeStack::new();
        let mut lines = Vec::new();
        let mut truncated = false;

        for line in LinesWithEndings::from(&job.source) {
            let text_len = line.trim_end_matches(['\r', '\n']).len();

            if !truncated && deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                warn!(
                    target: "tincture::tokenize::worker",
                    "Time limit reached for '{}' after {} lines",
                    job.grammar_id,
                    lines.len()
                );
                truncated = true;
            }
            if truncated {
                let mut tokens = Vec::new();
                push_token(&mut tokens, line, 0, text_len, &[]);
                lines.push(tokens);
                continue;
            }

            let ops = state
                .parse_line(line, &self.syntax_set)
                .map_err(|e| format!("parse error on line {}: {e:?}", lines.len() + 1))?;

            let mut tokens = Vec::new();
            let mut cursor = 0;
            for (offset, op) in ops {
                let end = offset.min(text_len);
                if end > cursor {
                    push_token(&mut tokens, line, cursor, end, &scope_names(&stack));
                    cursor = end;
                }
                stack
                    .apply(&op)
                    .map_err(|e| format!("scope stack error: {e:?}"))?;
            }
            push_token(&mut tokens, line, cursor, text_len, &scope_names(&stack));
            lines.push(tokens);
        }

        let mut result = TokenizeResult {
            lines,
            truncated,
            ..TokenizeResult::default()
        };

        if let Some(theme) = theme {
            let mut index: HashMap<String, usize> = HashMap::new();
            for token in result.lines.iter_mut().flatten() {
                let Some(color) = compute_style_for_scopes(&token.scopes, &theme).color else {
                    continue;
                };
                let color_map = &mut result.color_map;
                let slot = *index.entry(color).or_insert_with_key(|color| {
                    color_map.push(color.clone());
                    color_map.len() - 1
                });
                token.color = Some(slot);
            }
            result.base_color = Some(theme.base_color().to_string());
        }

        Ok(result)
    }
}

fn scope_names(stack: &ScopeStack) -> Vec<String> {
    stack
        .as_slice()
        .iter()
        .map(|scope| scope.build_string())
        .collect()
}

fn push_token(tokens: &mut Vec<ScopedToken>, line: &str, start: usize, end: usize, scopes: &[String]) {
    if end <= start {
        return;
    }
    tokens.push(ScopedToken {
        content: line[start..end].to_string(),
        start,
        end,
        scopes: scopes.to_vec(),
        color: None,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::theme::{RawSettings, RawTheme, RawTokenColor, ScopeField, Theme};

    const TOY_GRAMMAR: &str = r#"%YAML 1.2
---
name: Toy
file_extensions: [toy]
scope: source.toy
contexts:
  main:
    - match: '\b(let|fn)\b'
      scope: keyword.declaration.toy
    - match: '"'
      push: string
    - match: '\d+'
      scope: constant.numeric.toy
  string:
    - meta_scope: string.quoted.double.toy
    - match: '"'
      pop: true
"#;

    fn tokenizer() -> Tokenizer {
        Tokenizer::new(Arc::new(ThemeRegistry::new()))
    }

    #[test]
    fn default_syntaxes_resolve_by_token() {
        let tokenizer = tokenizer();
        let result = tokenizer
            .tokenize(TokenizeJob::new("rs", "fn main() {}\n"))
            .unwrap();

        assert_eq!(result.lines.len(), 1);
        let first = &result.lines[0][0];
        assert_eq!(first.scopes.first().map(String::as_str), Some("source.rust"));
        let text: String = result.lines[0].iter().map(|t| t.content.as_str()).collect();
        assert_eq!(text, "fn main() {}");
    }

    #[test]
    fn registered_grammar_scopes_tokens() {
        let mut tokenizer = tokenizer();
        let grammars = GrammarMap::from([("toy".to_string(), TOY_GRAMMAR.to_string())]);
        assert_eq!(tokenizer.register_grammars(grammars), Ok(1));

        let result = tokenizer
            .tokenize(TokenizeJob::new("toy", "let x = \"hi\" 42"))
            .unwrap();
        let tokens = &result.lines[0];

        assert_eq!(tokens[0].content, "let");
        assert_eq!(tokens[0].scopes, vec!["source.toy", "keyword.declaration.toy"]);
        let number = tokens.iter().find(|t| t.content == "42").unwrap();
        assert_eq!(number.scopes, vec!["source.toy", "constant.numeric.toy"]);
        assert!(
            tokens
                .iter()
                .any(|t| t.scopes.contains(&"string.quoted.double.toy".to_string()))
        );
    }

    #[test]
    fn bad_grammar_keeps_previous_registration() {
        let mut tokenizer = tokenizer();
        let good = GrammarMap::from([("toy".to_string(), TOY_GRAMMAR.to_string())]);
        tokenizer.register_grammars(good).unwrap();

        let bad = GrammarMap::from([("broken".to_string(), "not: [valid".to_string())]);
        assert!(tokenizer.register_grammars(bad).is_err());
        assert!(tokenizer.tokenize(TokenizeJob::new("toy", "let")).is_ok());
    }

    #[test]
    fn unknown_grammar_is_a_job_error() {
        let err = tokenizer()
            .tokenize(TokenizeJob::new("no-such-grammar", "x"))
            .unwrap_err();
        assert!(err.contains("no-such-grammar"));
    }

    #[test]
    fn offsets_exclude_line_terminators() {
        let result = tokenizer()
            .tokenize(TokenizeJob::new("rs", "let a = 1;\r\n\nlet b = 2;"))
            .unwrap();
        assert_eq!(result.lines.len(), 3);
        assert!(result.lines[1].is_empty());
        let last = result.lines[0].last().unwrap();
        assert_eq!(last.end, "let a = 1;".len());
    }

    #[test]
    fn zero_time_limit_emits_unscoped_lines() {
        let result = tokenizer()
            .tokenize(TokenizeJob::new("rs", "fn a() {}\nfn b() {}\n").with_time_limit(0))
            .unwrap();
        assert!(result.truncated);
        assert_eq!(result.lines.len(), 2);
        assert!(result.lines.iter().flatten().all(|t| t.scopes.is_empty()));
        assert_eq!(result.lines[1][0].content, "fn b() {}");
    }

    #[test]
    fn theme_job_fills_color_map() {
        let themes = Arc::new(ThemeRegistry::new());
        themes.register(
            "toy-theme",
            Theme::new(RawTheme {
                colors: [("editor.foreground".to_string(), "#DDDDDD".to_string())].into(),
                token_colors: vec![RawTokenColor {
                    scope: Some(ScopeField::One("keyword".into())),
                    settings: RawSettings {
                        foreground: Some("#FF0000".into()),
                        ..Default::default()
                    },
                    ..Default::default()
                }],
                ..Default::default()
            }),
        );
        let mut tokenizer = Tokenizer::new(themes);
        tokenizer
            .register_grammars(GrammarMap::from([(
                "toy".to_string(),
                TOY_GRAMMAR.to_string(),
            )]))
            .unwrap();

        let result = tokenizer
            .tokenize(TokenizeJob::new("toy", "let 1").with_theme("toy-theme"))
            .unwrap();

        assert_eq!(result.base_color.as_deref(), Some("#DDDDDD"));
        let keyword = &result.lines[0][0];
        assert_eq!(result.color_map[keyword.color.unwrap()], "#FF0000");
        let number = result.lines[0].iter().find(|t| t.content == "1").unwrap();
        assert_eq!(result.color_map[number.color.unwrap()], "#DDDDDD");
        assert_eq!(result.color_map.len(), 2);
    }

    #[test]
    fn unknown_theme_is_a_job_error() {
        let err = tokenizer()
            .tokenize(TokenizeJob::new("rs", "fn").with_theme("missing"))
            .unwrap_err();
        assert!(err.contains("missing"));
    }
}
