use itertools::Itertools;
use std::{borrow::Cow, fmt};

/// characters that never need quoting in a POSIX shell word
fn is_safe(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '/' | ':' | ',' | '=' | '@' | '%' | '+')
}

/// Quote `value` so the remote shell sees it as exactly one literal word
pub fn quote(value: &str) -> Cow<'_, str> {
    if value.is_empty() {
        Cow::Borrowed("''")
    } else if value.chars().all(is_safe) {
        Cow::Borrowed(value)
    } else {
        Cow::Owned(format!("'{}'", value.replace('\'', r"'\''")))
    }
}

/// Part of a single shell word
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fragment {
    /// untrusted text, quoted on render
    Literal(String),
    /// trusted template text emitted as-is so the job shell expands it at run time
    Expand(&'static str),
    /// same as `Expand`, for expansions composed from trusted constants
    ExpandOwned(String),
    /// the double-quoted stdout of a command, `"$(...)"`
    Substitute(ShellCommand),
}

/// One shell word, built from fragments that are concatenated without separators
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Word(Vec<Fragment>);

impl Word {
    pub fn literal(value: impl Into<String>) -> Self {
        Self(vec![Fragment::Literal(value.into())])
    }

    pub fn expand(template: &'static str) -> Self {
        Self(vec![Fragment::Expand(template)])
    }

    pub fn fragments(fragments: Vec<Fragment>) -> Self {
        Self(fragments)
    }

    /// join several words into one, separated by `separator` (e.g. bind lists)
    pub fn joined(words: Vec<Word>, separator: &'static str) -> Self {
        let mut fragments = Vec::new();

        for (index, word) in words.into_iter().enumerate() {
            if index > 0 {
                fragments.push(Fragment::Expand(separator));
            }
            fragments.extend(word.0);
        }

        Self(fragments)
    }
}

impl fmt::Display for Word {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for fragment in &self.0 {
            match fragment {
                Fragment::Literal(value) => f.write_str(&quote(value))?,
                Fragment::Expand(template) => f.write_str(template)?,
                Fragment::ExpandOwned(template) => f.write_str(template)?,
                Fragment::Substitute(command) => write!(f, "\"$({command})\"")?,
            }
        }

        Ok(())
    }
}

/// A program and its words, possibly piped into further programs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellCommand {
    words: Vec<Word>,
}

impl ShellCommand {
    pub fn new(program: &'static str) -> Self {
        Self {
            words: vec![Word::expand(program)],
        }
    }

    /// `name=value` as a command of its own
    pub fn assign(name: &'static str, value: Word) -> Self {
        let mut word = vec![Fragment::Expand(name), Fragment::Expand("=")];
        word.extend(value.0);

        Self {
            words: vec![Word(word)],
        }
    }

    pub fn arg(mut self, value: impl Into<String>) -> Self {
        self.words.push(Word::literal(value));
        self
    }

    /// a fixed flag from the template, never user input
    pub fn flag(mut self, flag: &'static str) -> Self {
        self.words.push(Word::expand(flag));
        self
    }

    pub fn flag_if(self, condition: bool, flag: &'static str) -> Self {
        if condition {
            self.flag(flag)
        } else {
            self
        }
    }

    pub fn word(mut self, word: Word) -> Self {
        self.words.push(word);
        self
    }

    pub fn option(self, flag: &'static str, value: Word) -> Self {
        self.flag(flag).word(value)
    }

    /// feed this command's stdout into `next`
    pub fn pipe(mut self, next: ShellCommand) -> Self {
        self.words.push(Word::expand("|"));
        self.words.extend(next.words);
        self
    }

    /// run `next` only if this command succeeded, within the same step
    pub fn and(mut self, next: ShellCommand) -> Self {
        self.words.push(Word::expand("&&"));
        self.words.extend(next.words);
        self
    }

    pub fn render(&self) -> String {
        self.words.iter().join(" ")
    }
}

impl fmt::Display for ShellCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

/// Commands run one after another, each only if the previous one succeeded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandChain(Vec<ShellCommand>);

impl CommandChain {
    pub fn new(first: ShellCommand) -> Self {
        Self(vec![first])
    }

    pub fn then(mut self, next: ShellCommand) -> Self {
        self.0.push(next);
        self
    }

    pub fn steps(&self) -> &[ShellCommand] {
        &self.0
    }

    pub fn render(&self) -> String {
        self.0.iter().map(ShellCommand::render).join(" \\\n    && ")
    }
}
