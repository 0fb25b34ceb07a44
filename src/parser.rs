use thiserror::Error;

pub const MAXARGS: usize = 128;

/// Input redirection for one pipeline stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputRedirect {
    /// `< file`
    File(String),
    /// `<< delim` — the body is collected by the interactive loop after
    /// parsing, reading lines until the delimiter.
    HereDoc { delimiter: String, body: String },
    /// `<<< word`
    HereString(String),
}

/// Output redirection for one pipeline stage (`> file` or `>> file`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputRedirect {
    pub path: String,
    pub append: bool,
}

/// One stage of a pipeline: argv plus redirections and per-invocation
/// environment assignments. Immutable once handed to the executor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SimpleCommand {
    pub argv: Vec<String>,
    pub stdin: Option<InputRedirect>,
    pub stdout: Option<OutputRedirect>,
    /// Leading `NAME=value` assignments, applied only for this invocation.
    pub assignments: Vec<(String, String)>,
    /// Names from `assignments` exported to the child's environment.
    /// Command-prefix assignments are all exported, POSIX-style.
    pub exported: Vec<String>,
}

impl SimpleCommand {
    pub fn display(&self) -> String {
        self.argv.join(" ")
    }
}

/// Operator trailing a pipeline, deciding whether the next one runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlOp {
    None,
    And,
    Or,
    Sequence,
}

/// An ordered list of stages connected by pipes, plus the trailing control
/// operator and the background flag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pipeline {
    pub stages: Vec<SimpleCommand>,
    pub op: ControlOp,
    pub background: bool,
}

impl Pipeline {
    /// Display string for job status lines: stage argvs joined with `| `.
    pub fn display(&self) -> String {
        self.stages
            .iter()
            .map(SimpleCommand::display)
            .collect::<Vec<_>>()
            .join(" | ")
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("syntax error near `{0}'")]
    Unexpected(String),
    #[error("missing {0} after `{1}'")]
    MissingOperand(&'static str, String),
    #[error("unterminated quote")]
    UnterminatedQuote,
    #[error("too many arguments")]
    TooManyArgs,
}

/// Parses a command line into a sequence of pipelines. Handles quoting,
/// the redirection operators, `|`, `&&`, `||`, `;` and `&`, and leading
/// `NAME=value` assignments. Word expansion is out of scope; tokens are
/// passed through literally.
pub fn parse_line(line: &str) -> Result<Vec<Pipeline>, ParseError> {
    let tokens = tokenize(line)?;
    if tokens.is_empty() {
        return Ok(Vec::new());
    }

    let mut pipelines = Vec::new();
    let mut pipeline = Pipeline {
        stages: Vec::new(),
        op: ControlOp::None,
        background: false,
    };
    let mut stage = SimpleCommand::default();
    let mut iter = tokens.into_iter().peekable();

    // Closes the current stage, erroring on an empty one.
    fn finish_stage(
        pipeline: &mut Pipeline,
        stage: &mut SimpleCommand,
        after: &str,
    ) -> Result<(), ParseError> {
        if stage.argv.is_empty() && stage.assignments.is_empty() {
            return Err(ParseError::Unexpected(after.to_string()));
        }
        pipeline.stages.push(std::mem::take(stage));
        Ok(())
    }

    fn finish_pipeline(
        pipelines: &mut Vec<Pipeline>,
        pipeline: &mut Pipeline,
        stage: &mut SimpleCommand,
        op: ControlOp,
        background: bool,
        token: &str,
    ) -> Result<(), ParseError> {
        finish_stage(pipeline, stage, token)?;
        pipeline.op = op;
        pipeline.background = background;
        pipelines.push(std::mem::replace(
            pipeline,
            Pipeline { stages: Vec::new(), op: ControlOp::None, background: false },
        ));
        Ok(())
    }

    while let Some(token) = iter.next() {
        match token.text.as_str() {
            "<" if !token.quoted => {
                let file = next_word(&mut iter, "input file", &token)?;
                stage.stdin = Some(InputRedirect::File(file));
            }
            "<<" if !token.quoted => {
                let delimiter = next_word(&mut iter, "here-document delimiter", &token)?;
                stage.stdin = Some(InputRedirect::HereDoc { delimiter, body: String::new() });
            }
            "<<<" if !token.quoted => {
                let word = next_word(&mut iter, "here-string word", &token)?;
                stage.stdin = Some(InputRedirect::HereString(word));
            }
            ">" | ">>" if !token.quoted => {
                let append = token.text == ">>";
                let path = next_word(&mut iter, "output file", &token)?;
                stage.stdout = Some(OutputRedirect { path, append });
            }
            "|" if !token.quoted => {
                finish_stage(&mut pipeline, &mut stage, "|")?;
            }
            "&&" if !token.quoted => {
                finish_pipeline(&mut pipelines, &mut pipeline, &mut stage, ControlOp::And, false, "&&")?;
            }
            "||" if !token.quoted => {
                finish_pipeline(&mut pipelines, &mut pipeline, &mut stage, ControlOp::Or, false, "||")?;
            }
            ";" if !token.quoted => {
                finish_pipeline(&mut pipelines, &mut pipeline, &mut stage, ControlOp::Sequence, false, ";")?;
            }
            "&" if !token.quoted => {
                finish_pipeline(&mut pipelines, &mut pipeline, &mut stage, ControlOp::Sequence, true, "&")?;
            }
            _ => {
                if stage.argv.is_empty() && !token.quoted {
                    if let Some((name, value)) = split_assignment(&token.text) {
                        stage.assignments.push((name.to_string(), value.to_string()));
                        stage.exported.push(name.to_string());
                        continue;
                    }
                }
                if stage.argv.len() >= MAXARGS - 1 {
                    return Err(ParseError::TooManyArgs);
                }
                stage.argv.push(token.text);
            }
        }
    }

    if !stage.argv.is_empty() || !stage.assignments.is_empty() || !pipeline.stages.is_empty() {
        finish_stage(&mut pipeline, &mut stage, "newline")?;
        pipelines.push(pipeline);
    }
    Ok(pipelines)
}

fn next_word(
    iter: &mut std::iter::Peekable<std::vec::IntoIter<Token>>,
    what: &'static str,
    after: &Token,
) -> Result<String, ParseError> {
    match iter.next() {
        Some(t) if t.quoted || !is_operator(&t.text) => Ok(t.text),
        _ => Err(ParseError::MissingOperand(what, after.text.clone())),
    }
}

/// `NAME=value` with a valid variable name on the left.
fn split_assignment(word: &str) -> Option<(&str, &str)> {
    let eq = word.find('=')?;
    let name = &word[..eq];
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return None,
    }
    if chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        Some((name, &word[eq + 1..]))
    } else {
        None
    }
}

fn is_operator(s: &str) -> bool {
    matches!(s, "<" | ">" | ">>" | "<<" | "<<<" | "|" | "||" | "&" | "&&" | ";")
}

/// A token plus whether any part of it was quoted, so quoted operators
/// (`'|'`) are treated as ordinary words.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub text: String,
    pub quoted: bool,
}

/// Splits a command line into tokens. Single and double quotes group text
/// (including embedded in a larger word, as in `a"b c"`); the operators
/// `< > >> << <<< | || & && ;` self-delimit. A `#` outside quotes starts
/// a comment.
pub fn tokenize(input: &str) -> Result<Vec<Token>, ParseError> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&ch) = chars.peek() {
        if ch.is_whitespace() {
            chars.next();
            continue;
        }
        if ch == '#' {
            break;
        }
        if is_operator_start(ch) {
            tokens.push(Token { text: read_operator(&mut chars), quoted: false });
            continue;
        }

        let mut text = String::new();
        let mut quoted = false;
        while let Some(&c) = chars.peek() {
            if c.is_whitespace() || is_operator_start(c) {
                break;
            }
            if c == '\'' || c == '"' {
                let quote = c;
                chars.next();
                quoted = true;
                let mut closed = false;
                for inner in chars.by_ref() {
                    if inner == quote {
                        closed = true;
                        break;
                    }
                    text.push(inner);
                }
                if !closed {
                    return Err(ParseError::UnterminatedQuote);
                }
            } else {
                text.push(c);
                chars.next();
            }
        }
        tokens.push(Token { text, quoted });
    }
    Ok(tokens)
}

fn is_operator_start(c: char) -> bool {
    matches!(c, '<' | '>' | '|' | '&' | ';')
}

fn read_operator(chars: &mut std::iter::Peekable<std::str::Chars>) -> String {
    let first = chars.next().unwrap();
    let mut op = first.to_string();
    match first {
        '>' => {
            if chars.peek() == Some(&'>') {
                chars.next();
                op.push('>');
            }
        }
        '<' => {
            if chars.peek() == Some(&'<') {
                chars.next();
                op.push('<');
                if chars.peek() == Some(&'<') {
                    chars.next();
                    op.push('<');
                }
            }
        }
        '|' => {
            if chars.peek() == Some(&'|') {
                chars.next();
                op.push('|');
            }
        }
        '&' => {
            if chars.peek() == Some(&'&') {
                chars.next();
                op.push('&');
            }
        }
        _ => {}
    }
    op
}
